#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use cairn_proto::{DeviceUid, Identity, Uid};

use super::{
    ChannelKey, InstanceKey, ObliviousChannelRecord, OutboundRecord, Storage, StorageError,
    StoredInstance, WriteOp, WriteSet,
};

/// In-memory storage implementation for testing and simulation
///
/// All state is wrapped in Arc<Mutex<>> to allow Clone and concurrent access.
/// A commit holds the lock for its whole validate-then-apply pass, which is
/// what makes it atomic. Uses `lock().expect()` which will panic if the mutex
/// is poisoned - acceptable for test code.
#[derive(Clone)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryStorageInner>>,
}

#[derive(Default)]
struct MemoryStorageInner {
    instances: HashMap<InstanceKey, StoredInstance>,

    /// Replay guard: (owned identity, signature bytes)
    signatures: HashSet<(Identity, Vec<u8>)>,

    /// (owned identity, instance uid) -> remote device
    owned_device_instances: HashMap<(Identity, Uid), DeviceUid>,

    channels: HashMap<ChannelKey, ObliviousChannelRecord>,

    /// Outbox in enqueue order
    outbox: Vec<OutboundRecord>,
}

impl MemoryStorageInner {
    fn revision(&self, key: &InstanceKey) -> u64 {
        self.instances.get(key).map_or(0, |instance| instance.revision)
    }

    /// Check every precondition in `writes` without mutating anything.
    fn validate(&self, writes: &WriteSet) -> Result<(), StorageError> {
        let mut revisions: HashMap<InstanceKey, u64> = HashMap::new();
        let mut signatures: HashSet<(&Identity, &[u8])> = HashSet::new();

        for op in writes.ops() {
            match op {
                WriteOp::PutInstance { key, expected_revision, .. } => {
                    let current = revisions.get(key).copied().unwrap_or_else(|| self.revision(key));
                    if current != *expected_revision {
                        return Err(StorageError::Conflict {
                            expected: *expected_revision,
                            got: current,
                        });
                    }
                    revisions.insert(*key, expected_revision + 1);
                },
                WriteOp::DeleteInstance { key, expected_revision } => {
                    if let Some(expected) = expected_revision {
                        let current =
                            revisions.get(key).copied().unwrap_or_else(|| self.revision(key));
                        if current != *expected {
                            return Err(StorageError::Conflict { expected: *expected, got: current });
                        }
                    }
                    revisions.insert(*key, 0);
                },
                WriteOp::InsertReplaySignature { owned_identity, signature } => {
                    let stored =
                        self.signatures.contains(&(*owned_identity, signature.clone()));
                    if stored || !signatures.insert((owned_identity, signature.as_slice())) {
                        return Err(StorageError::DuplicateSignature);
                    }
                },
                WriteOp::PutOwnedDeviceInstance(_)
                | WriteOp::DeleteOwnedDeviceInstance { .. }
                | WriteOp::PutChannel { .. }
                | WriteOp::DeleteChannel(_)
                | WriteOp::EnqueueOutbound(_)
                | WriteOp::RemoveOutbound(_) => {},
            }
        }

        Ok(())
    }

    fn apply(&mut self, op: &WriteOp) {
        match op {
            WriteOp::PutInstance { key, expected_revision, state } => {
                self.instances.insert(
                    *key,
                    StoredInstance { revision: expected_revision + 1, state: state.clone() },
                );
            },
            WriteOp::DeleteInstance { key, .. } => {
                self.instances.remove(key);
            },
            WriteOp::InsertReplaySignature { owned_identity, signature } => {
                self.signatures.insert((*owned_identity, signature.clone()));
            },
            WriteOp::PutOwnedDeviceInstance(record) => {
                self.owned_device_instances
                    .insert((record.owned_identity, record.instance_uid), record.remote_device);
            },
            WriteOp::DeleteOwnedDeviceInstance { owned_identity, instance_uid } => {
                self.owned_device_instances.remove(&(*owned_identity, *instance_uid));
            },
            WriteOp::PutChannel { key, record } => {
                self.channels.insert(*key, record.clone());
            },
            WriteOp::DeleteChannel(key) => {
                self.channels.remove(key);
            },
            WriteOp::EnqueueOutbound(record) => {
                if !self.outbox.iter().any(|queued| queued.message_id() == record.message_id()) {
                    self.outbox.push(record.clone());
                }
            },
            WriteOp::RemoveOutbound(message_id) => {
                self.outbox.retain(|queued| queued.message_id() != *message_id);
            },
        }
    }
}

impl MemoryStorage {
    /// Create a new empty `MemoryStorage`
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(MemoryStorageInner::default())) }
    }

    /// Number of live protocol instances across all identities.
    ///
    /// Useful for debugging and testing.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned (a thread panicked while
    /// holding the lock). This is acceptable for test/simulation code.
    #[allow(clippy::expect_used)]
    pub fn instance_count(&self) -> usize {
        self.inner.lock().expect("Mutex poisoned").instances.len()
    }

    /// Number of oblivious channels across all identities.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    pub fn channel_count(&self) -> usize {
        self.inner.lock().expect("Mutex poisoned").channels.len()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    #[allow(clippy::expect_used)]
    fn load_instance(&self, key: &InstanceKey) -> Result<Option<StoredInstance>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner.instances.get(key).cloned())
    }

    #[allow(clippy::expect_used)]
    fn list_instances(&self, owned_identity: &Identity) -> Result<Vec<InstanceKey>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner.instances.keys().filter(|key| key.owned_identity == *owned_identity).copied().collect())
    }

    #[allow(clippy::expect_used)]
    fn replay_signature_exists(
        &self,
        owned_identity: &Identity,
        signature: &[u8],
    ) -> Result<bool, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner.signatures.contains(&(*owned_identity, signature.to_vec())))
    }

    #[allow(clippy::expect_used)]
    fn owned_device_instances(
        &self,
        owned_identity: &Identity,
        remote_device: &DeviceUid,
    ) -> Result<Vec<Uid>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        let mut uids: Vec<Uid> = inner
            .owned_device_instances
            .iter()
            .filter(|((owned, _), device)| owned == owned_identity && *device == remote_device)
            .map(|((_, uid), _)| *uid)
            .collect();
        uids.sort();
        Ok(uids)
    }

    #[allow(clippy::expect_used)]
    fn load_channel(&self, key: &ChannelKey) -> Result<Option<ObliviousChannelRecord>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner.channels.get(key).cloned())
    }

    #[allow(clippy::expect_used)]
    fn pending_outbound(&self) -> Result<Vec<OutboundRecord>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner.outbox.clone())
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. This is acceptable for test
    /// code.
    #[allow(clippy::expect_used)]
    fn commit(&self, writes: &WriteSet) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");

        inner.validate(writes)?;
        for op in writes.ops() {
            inner.apply(op);
        }

        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn remove_outbound(&self, message_id: &Uid) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");
        let before = inner.outbox.len();
        inner.outbox.retain(|queued| queued.message_id() != *message_id);
        Ok(inner.outbox.len() != before)
    }
}

#[cfg(test)]
mod tests {
    use cairn_crypto::Seed;
    use cairn_proto::{ChannelEnvelope, EnvelopeBody, ProtocolId, Route};

    use super::*;
    use crate::store::OwnedDeviceInstanceRecord;

    fn identity() -> Identity {
        Identity::from_bytes([1u8; 32])
    }

    fn key(uid: u8) -> InstanceKey {
        InstanceKey {
            owned_identity: identity(),
            protocol_id: ProtocolId::FullRatchet,
            instance_uid: Uid::from_bytes([uid; 32]),
        }
    }

    fn put(key: InstanceKey, expected_revision: u64, state: &[u8]) -> WriteOp {
        WriteOp::PutInstance { key, expected_revision, state: state.to_vec() }
    }

    fn outbound(id: u8) -> OutboundRecord {
        OutboundRecord {
            envelope: ChannelEnvelope {
                message_id: Uid::from_bytes([id; 32]),
                route: Route::Local { identity: identity() },
                body: EnvelopeBody::Cleartext(vec![id]),
            },
        }
    }

    fn commit(storage: &MemoryStorage, ops: Vec<WriteOp>) -> Result<(), StorageError> {
        let mut writes = WriteSet::new();
        for op in ops {
            writes.push(op);
        }
        storage.commit(&writes)
    }

    #[test]
    fn revision_increments_on_every_save() {
        let storage = MemoryStorage::new();
        commit(&storage, vec![put(key(1), 0, b"a")]).unwrap();
        commit(&storage, vec![put(key(1), 1, b"b")]).unwrap();

        let stored = storage.load_instance(&key(1)).unwrap().unwrap();
        assert_eq!(stored.revision, 2);
        assert_eq!(stored.state, b"b");
    }

    #[test]
    fn stale_revision_conflicts() {
        let storage = MemoryStorage::new();
        commit(&storage, vec![put(key(1), 0, b"a")]).unwrap();

        let result = commit(&storage, vec![put(key(1), 0, b"b")]);
        assert_eq!(result, Err(StorageError::Conflict { expected: 0, got: 1 }));
    }

    #[test]
    fn failed_commit_writes_nothing() {
        let storage = MemoryStorage::new();
        commit(&storage, vec![WriteOp::InsertReplaySignature {
            owned_identity: identity(),
            signature: vec![9; 96],
        }])
        .unwrap();

        let result = commit(&storage, vec![
            put(key(2), 0, b"a"),
            WriteOp::EnqueueOutbound(outbound(5)),
            WriteOp::InsertReplaySignature { owned_identity: identity(), signature: vec![9; 96] },
        ]);

        assert_eq!(result, Err(StorageError::DuplicateSignature));
        assert_eq!(storage.load_instance(&key(2)).unwrap(), None);
        assert!(storage.pending_outbound().unwrap().is_empty());
    }

    #[test]
    fn duplicate_signature_within_one_set_is_rejected() {
        let storage = MemoryStorage::new();
        let insert =
            WriteOp::InsertReplaySignature { owned_identity: identity(), signature: vec![3; 96] };
        let result = commit(&storage, vec![insert.clone(), insert]);
        assert_eq!(result, Err(StorageError::DuplicateSignature));
        assert!(!storage.replay_signature_exists(&identity(), &[3; 96]).unwrap());
    }

    #[test]
    fn unconditional_delete_ignores_revision() {
        let storage = MemoryStorage::new();
        commit(&storage, vec![put(key(1), 0, b"a")]).unwrap();
        commit(&storage, vec![WriteOp::DeleteInstance { key: key(1), expected_revision: None }])
            .unwrap();
        assert_eq!(storage.instance_count(), 0);
    }

    #[test]
    fn outbox_keeps_enqueue_order() {
        let storage = MemoryStorage::new();
        commit(&storage, vec![
            WriteOp::EnqueueOutbound(outbound(3)),
            WriteOp::EnqueueOutbound(outbound(1)),
            WriteOp::EnqueueOutbound(outbound(2)),
        ])
        .unwrap();

        let ids: Vec<Uid> =
            storage.pending_outbound().unwrap().iter().map(OutboundRecord::message_id).collect();
        assert_eq!(ids, vec![
            Uid::from_bytes([3; 32]),
            Uid::from_bytes([1; 32]),
            Uid::from_bytes([2; 32])
        ]);

        assert!(storage.remove_outbound(&Uid::from_bytes([1; 32])).unwrap());
        assert!(!storage.remove_outbound(&Uid::from_bytes([1; 32])).unwrap());
        assert_eq!(storage.pending_outbound().unwrap().len(), 2);
    }

    #[test]
    fn owned_device_index_filters_by_device() {
        let storage = MemoryStorage::new();
        let device_a = DeviceUid::from_bytes([0xAA; 32]);
        let device_b = DeviceUid::from_bytes([0xBB; 32]);
        commit(&storage, vec![
            WriteOp::PutOwnedDeviceInstance(OwnedDeviceInstanceRecord {
                owned_identity: identity(),
                instance_uid: Uid::from_bytes([1; 32]),
                remote_device: device_a,
            }),
            WriteOp::PutOwnedDeviceInstance(OwnedDeviceInstanceRecord {
                owned_identity: identity(),
                instance_uid: Uid::from_bytes([2; 32]),
                remote_device: device_b,
            }),
        ])
        .unwrap();

        assert_eq!(storage.owned_device_instances(&identity(), &device_a).unwrap(), vec![
            Uid::from_bytes([1; 32])
        ]);
    }

    #[test]
    fn channel_put_and_delete() {
        let storage = MemoryStorage::new();
        let channel = ChannelKey {
            owned_identity: identity(),
            remote_identity: identity(),
            remote_device: DeviceUid::from_bytes([7; 32]),
        };
        let record = ObliviousChannelRecord {
            local_device: DeviceUid::from_bytes([6; 32]),
            suite_version: 0,
            confirmed: false,
            send_seed: Seed::from_bytes([1; 32]),
            send_generation: 0,
            receive_seed: Seed::from_bytes([2; 32]),
            previous_receive_seed: None,
        };

        commit(&storage, vec![WriteOp::PutChannel { key: channel, record: record.clone() }])
            .unwrap();
        assert_eq!(storage.load_channel(&channel).unwrap(), Some(record));

        commit(&storage, vec![WriteOp::DeleteChannel(channel)]).unwrap();
        assert_eq!(storage.load_channel(&channel).unwrap(), None);
        assert_eq!(storage.channel_count(), 0);
    }
}
