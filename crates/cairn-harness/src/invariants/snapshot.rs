//! Observable state snapshots for invariant checking.
//!
//! Snapshots capture what every simulated device has persisted at one point
//! in time. Invariants operate on snapshots rather than live stores so a
//! check sees one consistent view.

use cairn_core::ObliviousChannelRecord;
use cairn_proto::{DeviceUid, Identity};

/// Snapshot of every simulated device.
#[derive(Debug, Clone, Default)]
pub struct SystemSnapshot {
    /// Per-device snapshots
    pub devices: Vec<DeviceSnapshot>,
}

impl SystemSnapshot {
    /// Snapshot with no devices.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Snapshot of the given devices.
    pub fn from_devices(devices: Vec<DeviceSnapshot>) -> Self {
        Self { devices }
    }

    /// Device snapshot by identity and device uid.
    pub fn device(&self, identity: &Identity, device: &DeviceUid) -> Option<&DeviceSnapshot> {
        self.devices.iter().find(|d| d.identity == *identity && d.device == *device)
    }
}

/// Persisted state of one device.
#[derive(Debug, Clone)]
pub struct DeviceSnapshot {
    /// Owned identity
    pub identity: Identity,
    /// Device uid
    pub device: DeviceUid,
    /// Oblivious channels held by this device
    pub channels: Vec<ChannelSnapshot>,
    /// Protocol instances still stored
    pub live_instances: usize,
}

impl DeviceSnapshot {
    /// Device with no channels and no instances.
    pub fn new(identity: Identity, device: DeviceUid) -> Self {
        Self { identity, device, channels: Vec::new(), live_instances: 0 }
    }

    /// Channel to a remote device, if held.
    pub fn channel_to(&self, identity: &Identity, device: &DeviceUid) -> Option<&ChannelSnapshot> {
        self.channels
            .iter()
            .find(|c| c.remote_identity == *identity && c.remote_device == *device)
    }
}

/// One oblivious channel as seen from its holder.
#[derive(Debug, Clone)]
pub struct ChannelSnapshot {
    /// Identity at the other end
    pub remote_identity: Identity,
    /// Device at the other end
    pub remote_device: DeviceUid,
    /// Stored record
    pub record: ObliviousChannelRecord,
}
