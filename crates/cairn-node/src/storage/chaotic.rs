//! Chaotic storage wrapper for fault injection testing
//!
//! Randomly fails reads and commits to check that the engine cancels or
//! retries cleanly and never leaves a half-applied step behind. An injected
//! commit failure happens before the inner store is touched, so a failed
//! commit is always a no-op.

#![allow(clippy::disallowed_types, reason = "Synchronous fault state only")]

use std::sync::{Arc, Mutex};

use cairn_core::{
    ChannelKey, InstanceKey, ObliviousChannelRecord, OutboundRecord, Storage, StorageError,
    StoredInstance, WriteSet,
};
use cairn_proto::{DeviceUid, Identity, Uid};

/// Store wrapper that fails operations at random with `StorageError::Io`.
///
/// Every clone shares one failure sequence, so two engines over clones of the
/// same chaotic store see a single reproducible stream of faults.
#[derive(Clone)]
pub struct ChaoticStorage<S: Storage> {
    inner: S,
    /// Probability that an operation fails, in [0.0, 1.0]
    failure_rate: f64,
    chaos: Arc<Mutex<Chaos>>,
}

/// Shared fault state: a SplitMix64 stream and counters.
struct Chaos {
    state: u64,
    operations: usize,
    failures: usize,
}

impl Chaos {
    /// Next value in [0.0, 1.0)
    fn next_unit(&mut self) -> f64 {
        self.state = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^= z >> 31;
        (z >> 11) as f64 / (1u64 << 53) as f64
    }
}

impl<S: Storage> ChaoticStorage<S> {
    /// Wrap `inner` with a fixed default seed.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, 0xC0FF_EE00_D15E_A5E5)
    }

    /// Wrap `inner`; the same seed injects the same failures.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
        );

        let chaos = Chaos { state: seed, operations: 0, failures: 0 };
        Self { inner, failure_rate, chaos: Arc::new(Mutex::new(chaos)) }
    }

    /// The wrapped store, for checking what actually landed.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Operations attempted so far, across all clones.
    #[allow(clippy::expect_used)]
    pub fn operation_count(&self) -> usize {
        self.chaos.lock().expect("chaos mutex poisoned").operations
    }

    /// Operations failed on purpose so far, across all clones.
    #[allow(clippy::expect_used)]
    pub fn injected_failures(&self) -> usize {
        self.chaos.lock().expect("chaos mutex poisoned").failures
    }

    /// Count the operation and decide whether it fails.
    #[allow(clippy::expect_used)]
    fn chaos(&self) -> Result<(), StorageError> {
        let mut chaos = self.chaos.lock().expect("chaos mutex poisoned");
        chaos.operations += 1;
        if chaos.next_unit() < self.failure_rate {
            chaos.failures += 1;
            tracing::trace!(operation = chaos.operations, "injecting storage failure");
            return Err(StorageError::Io("chaotic failure injection".to_string()));
        }
        Ok(())
    }
}

impl<S: Storage> Storage for ChaoticStorage<S> {
    fn load_instance(&self, key: &InstanceKey) -> Result<Option<StoredInstance>, StorageError> {
        self.chaos()?;
        self.inner.load_instance(key)
    }

    fn list_instances(&self, owned_identity: &Identity) -> Result<Vec<InstanceKey>, StorageError> {
        self.chaos()?;
        self.inner.list_instances(owned_identity)
    }

    fn replay_signature_exists(
        &self,
        owned_identity: &Identity,
        signature: &[u8],
    ) -> Result<bool, StorageError> {
        self.chaos()?;
        self.inner.replay_signature_exists(owned_identity, signature)
    }

    fn owned_device_instances(
        &self,
        owned_identity: &Identity,
        remote_device: &DeviceUid,
    ) -> Result<Vec<Uid>, StorageError> {
        self.chaos()?;
        self.inner.owned_device_instances(owned_identity, remote_device)
    }

    fn load_channel(&self, key: &ChannelKey) -> Result<Option<ObliviousChannelRecord>, StorageError> {
        self.chaos()?;
        self.inner.load_channel(key)
    }

    fn pending_outbound(&self) -> Result<Vec<OutboundRecord>, StorageError> {
        self.chaos()?;
        self.inner.pending_outbound()
    }

    fn commit(&self, writes: &WriteSet) -> Result<(), StorageError> {
        self.chaos()?;
        self.inner.commit(writes)
    }

    fn remove_outbound(&self, message_id: &Uid) -> Result<bool, StorageError> {
        self.chaos()?;
        self.inner.remove_outbound(message_id)
    }
}
