//! Store-and-forward relay between simulated devices.
//!
//! Envelopes wait in the relay until the test pulls them. Depending on the
//! [`FaultConfig`], the relay hands them out of order, repeats them or loses
//! them, all driven by a seeded RNG so a failing run can be replayed.

use cairn_proto::{ChannelEnvelope, DeviceUid, Identity, Route};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Network misbehaviour to simulate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaultConfig {
    /// Deliver in random order instead of FIFO
    pub reorder: bool,
    /// Probability that a delivered envelope stays queued for a second
    /// delivery
    pub duplicate_rate: f64,
    /// Probability that a pulled envelope is lost
    pub drop_rate: f64,
}

impl FaultConfig {
    /// In-order, exactly-once delivery.
    pub const fn reliable() -> Self {
        Self { reorder: false, duplicate_rate: 0.0, drop_rate: 0.0 }
    }

    /// Random order and duplicates, nothing lost.
    pub const fn unordered_with_duplicates(duplicate_rate: f64) -> Self {
        Self { reorder: true, duplicate_rate, drop_rate: 0.0 }
    }
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self::reliable()
    }
}

/// An envelope on its way to one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlight {
    /// Index of the receiving device in the simulation
    pub to: usize,
    /// Encoded envelope
    pub bytes: Vec<u8>,
}

/// Relay queue.
pub struct SimRelay {
    faults: FaultConfig,
    rng: ChaCha8Rng,
    queue: Vec<InFlight>,
    dropped: usize,
    duplicated: usize,
}

impl SimRelay {
    /// Empty relay.
    pub fn new(seed: u64, faults: FaultConfig) -> Self {
        Self {
            faults,
            rng: ChaCha8Rng::seed_from_u64(seed),
            queue: Vec::new(),
            dropped: 0,
            duplicated: 0,
        }
    }

    /// Change the faults applied from the next pull on.
    pub fn set_faults(&mut self, faults: FaultConfig) {
        self.faults = faults;
    }

    /// Queue `bytes` for device `to`.
    pub fn push(&mut self, to: usize, bytes: Vec<u8>) {
        self.queue.push(InFlight { to, bytes });
    }

    /// Next envelope to deliver, after faults were applied.
    pub fn pull(&mut self) -> Option<InFlight> {
        loop {
            if self.queue.is_empty() {
                return None;
            }

            let index =
                if self.faults.reorder { self.rng.gen_range(0..self.queue.len()) } else { 0 };
            let next = self.queue.remove(index);

            if self.faults.drop_rate > 0.0 && self.rng.gen_bool(self.faults.drop_rate) {
                self.dropped += 1;
                tracing::trace!(to = next.to, "relay dropped envelope");
                continue;
            }

            if self.faults.duplicate_rate > 0.0 && self.rng.gen_bool(self.faults.duplicate_rate) {
                self.duplicated += 1;
                self.queue.push(next.clone());
            }

            return Some(next);
        }
    }

    /// Envelopes still queued.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Envelopes lost so far.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Envelopes delivered twice so far.
    pub fn duplicated(&self) -> usize {
        self.duplicated
    }
}

/// Devices an envelope is for, as `(identity, device)` filters.
///
/// `None` as the device means every device of the identity.
pub fn route_targets(envelope: &ChannelEnvelope) -> Vec<(Identity, Option<DeviceUid>)> {
    match &envelope.route {
        Route::Local { .. } => Vec::new(),
        Route::Asymmetric { to_identity, to_devices, .. } if to_devices.is_empty() => {
            vec![(*to_identity, None)]
        },
        Route::Asymmetric { to_identity, to_devices, .. } => {
            to_devices.iter().map(|device| (*to_identity, Some(*device))).collect()
        },
        Route::Oblivious { to_identity, to_device, .. } => vec![(*to_identity, Some(*to_device))],
    }
}
