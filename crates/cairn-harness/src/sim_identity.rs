//! In-memory identity service.

#![allow(clippy::disallowed_types, reason = "Synchronous locking operations only")]

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex},
};

use cairn_core::{IdentityError, IdentityService};
use cairn_proto::{DeviceUid, Identity};

#[derive(Default)]
struct IdentityBook {
    /// Owned identity -> device this service runs on
    current: HashMap<Identity, DeviceUid>,
    /// Owned identity -> other devices learned through channel creation
    remote: HashMap<Identity, BTreeSet<DeviceUid>>,
    capabilities: HashMap<(Identity, DeviceUid), Vec<String>>,
    unavailable: bool,
}

/// Identity service for one simulated device.
///
/// Clones share state, so a test keeps a handle to inspect what the engine
/// recorded.
#[derive(Clone, Default)]
pub struct SimIdentityService {
    book: Arc<Mutex<IdentityBook>>,
}

impl SimIdentityService {
    /// Service with no owned identities.
    pub fn new() -> Self {
        Self::default()
    }

    /// Own `identity` on `device`.
    #[allow(clippy::expect_used)]
    pub fn add_owned_identity(&self, identity: Identity, device: DeviceUid) {
        self.book.lock().expect("identity mutex poisoned").current.insert(identity, device);
    }

    /// Remote devices recorded for `identity`, sorted.
    #[allow(clippy::expect_used)]
    pub fn remote_devices(&self, identity: &Identity) -> Vec<DeviceUid> {
        let book = self.book.lock().expect("identity mutex poisoned");
        book.remote.get(identity).map(|devices| devices.iter().copied().collect()).unwrap_or_default()
    }

    /// Capabilities stored for a remote device, if any.
    #[allow(clippy::expect_used)]
    pub fn capabilities(&self, identity: &Identity, device: &DeviceUid) -> Option<Vec<String>> {
        let book = self.book.lock().expect("identity mutex poisoned");
        book.capabilities.get(&(*identity, *device)).cloned()
    }

    /// Forget what was learned about a remote device's capabilities, so the
    /// next discovery round includes it again.
    #[allow(clippy::expect_used)]
    pub fn forget_capabilities(&self, identity: &Identity, device: &DeviceUid) {
        self.book.lock().expect("identity mutex poisoned").capabilities.remove(&(*identity, *device));
    }

    /// Make every call fail with `Unavailable` (or recover).
    #[allow(clippy::expect_used)]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.book.lock().expect("identity mutex poisoned").unavailable = unavailable;
    }

    #[allow(clippy::expect_used)]
    fn with_book<T>(
        &self,
        f: impl FnOnce(&mut IdentityBook) -> Result<T, IdentityError>,
    ) -> Result<T, IdentityError> {
        let mut book = self.book.lock().expect("identity mutex poisoned");
        if book.unavailable {
            return Err(IdentityError::Unavailable("simulated outage".to_string()));
        }
        f(&mut book)
    }
}

impl IdentityService for SimIdentityService {
    fn current_device_uid(&self, owned_identity: &Identity) -> Result<DeviceUid, IdentityError> {
        self.with_book(|book| {
            book.current
                .get(owned_identity)
                .copied()
                .ok_or(IdentityError::UnknownOwnedIdentity(*owned_identity))
        })
    }

    fn add_remote_device(
        &self,
        owned_identity: &Identity,
        device: &DeviceUid,
    ) -> Result<(), IdentityError> {
        self.with_book(|book| {
            if !book.current.contains_key(owned_identity) {
                return Err(IdentityError::UnknownOwnedIdentity(*owned_identity));
            }
            book.remote.entry(*owned_identity).or_default().insert(*device);
            Ok(())
        })
    }

    fn devices_needing_capability_discovery(
        &self,
        owned_identity: &Identity,
    ) -> Result<Vec<DeviceUid>, IdentityError> {
        self.with_book(|book| {
            let devices = book
                .remote
                .get(owned_identity)
                .into_iter()
                .flatten()
                .filter(|device| !book.capabilities.contains_key(&(*owned_identity, **device)))
                .copied()
                .collect();
            Ok(devices)
        })
    }

    fn set_device_capabilities(
        &self,
        owned_identity: &Identity,
        device: &DeviceUid,
        capabilities: &[String],
    ) -> Result<(), IdentityError> {
        self.with_book(|book| {
            book.capabilities.insert((*owned_identity, *device), capabilities.to_vec());
            Ok(())
        })
    }
}
