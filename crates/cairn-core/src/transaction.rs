//! Step-scoped transactions.
//!
//! A [`Transaction`] collects every write a step makes into a [`WriteSet`]
//! and serves reads through an overlay, so a step sees its own writes before
//! they are committed. Nothing reaches the store until the dispatcher commits
//! the set; a failed step simply drops the transaction.
//!
//! The channel operations here are the only way a protocol touches
//! oblivious channels or sends anything.

use std::collections::{HashMap, HashSet};

use cairn_crypto::Seed;
use cairn_proto::{
    ChannelEnvelope, DeviceUid, EnvelopeBody, Identity, ProtocolId, ProtocolMessage, Route, Uid,
};

use crate::{
    channel::{ChannelDescriptor, new_channel_record, seal_oblivious},
    env::Environment,
    error::ChannelError,
    store::{
        ChannelKey, InstanceKey, ObliviousChannelRecord, OutboundRecord, OwnedDeviceInstanceRecord,
        Storage, StorageError, WriteOp, WriteSet,
    },
};

/// Writes of one step, with read-your-writes semantics.
pub struct Transaction<'a, E: Environment, S: Storage> {
    env: &'a E,
    storage: &'a S,
    owned_identity: Identity,
    current_device: DeviceUid,
    writes: WriteSet,

    /// `None` marks a channel deleted in this transaction
    channels: HashMap<ChannelKey, Option<ObliviousChannelRecord>>,

    /// Replay signatures recorded in this transaction
    signatures: HashSet<Vec<u8>>,

    /// `None` marks an index entry deleted in this transaction
    device_index: HashMap<Uid, Option<DeviceUid>>,

    /// Envelopes queued in this transaction, in post order
    outbound: Vec<OutboundRecord>,
}

impl<'a, E: Environment, S: Storage> Transaction<'a, E, S> {
    /// Start a transaction for `owned_identity` running on `current_device`.
    pub fn new(env: &'a E, storage: &'a S, owned_identity: Identity, current_device: DeviceUid) -> Self {
        Self {
            env,
            storage,
            owned_identity,
            current_device,
            writes: WriteSet::new(),
            channels: HashMap::new(),
            signatures: HashSet::new(),
            device_index: HashMap::new(),
            outbound: Vec::new(),
        }
    }

    /// Owned identity this transaction writes for.
    pub fn owned_identity(&self) -> Identity {
        self.owned_identity
    }

    /// Device the engine runs on.
    pub fn current_device(&self) -> DeviceUid {
        self.current_device
    }

    /// Split into the write set and the envelopes it enqueues.
    pub fn into_parts(self) -> (WriteSet, Vec<OutboundRecord>) {
        (self.writes, self.outbound)
    }

    /// Record a consumed signature in the replay guard.
    ///
    /// The store enforces uniqueness again at commit, so a concurrent step
    /// recording the same signature loses there.
    ///
    /// # Errors
    ///
    /// - `DuplicateSignature` if the signature was already recorded
    pub fn record_signature(&mut self, signature: &[u8]) -> Result<(), StorageError> {
        if self.signatures.contains(signature)
            || self.storage.replay_signature_exists(&self.owned_identity, signature)?
        {
            return Err(StorageError::DuplicateSignature);
        }

        self.signatures.insert(signature.to_vec());
        self.writes.push(WriteOp::InsertReplaySignature {
            owned_identity: self.owned_identity,
            signature: signature.to_vec(),
        });
        Ok(())
    }

    /// Channel-creation instances indexed for `remote_device`.
    pub fn owned_device_instances(&self, remote_device: &DeviceUid) -> Result<Vec<Uid>, StorageError> {
        let mut uids: Vec<Uid> = self
            .storage
            .owned_device_instances(&self.owned_identity, remote_device)?
            .into_iter()
            .filter(|uid| !matches!(self.device_index.get(uid), Some(None)))
            .collect();

        for (uid, device) in &self.device_index {
            if device.as_ref() == Some(remote_device) && !uids.contains(uid) {
                uids.push(*uid);
            }
        }

        uids.sort();
        Ok(uids)
    }

    /// Index `instance_uid` as the live instance for `remote_device`.
    pub fn put_owned_device_instance(&mut self, instance_uid: Uid, remote_device: DeviceUid) {
        self.device_index.insert(instance_uid, Some(remote_device));
        self.writes.push(WriteOp::PutOwnedDeviceInstance(OwnedDeviceInstanceRecord {
            owned_identity: self.owned_identity,
            instance_uid,
            remote_device,
        }));
    }

    /// Remove every index entry for `remote_device` and return the instance
    /// uids that were indexed.
    pub fn delete_owned_device_instances(
        &mut self,
        remote_device: &DeviceUid,
    ) -> Result<Vec<Uid>, StorageError> {
        let uids = self.owned_device_instances(remote_device)?;
        for uid in &uids {
            self.device_index.insert(*uid, None);
            self.writes.push(WriteOp::DeleteOwnedDeviceInstance {
                owned_identity: self.owned_identity,
                instance_uid: *uid,
            });
        }
        Ok(uids)
    }

    /// Delete another protocol instance unconditionally.
    pub fn abort_instance(&mut self, protocol_id: ProtocolId, instance_uid: Uid) {
        self.writes.push(WriteOp::DeleteInstance {
            key: InstanceKey { owned_identity: self.owned_identity, protocol_id, instance_uid },
            expected_revision: None,
        });
    }

    fn channel_key(&self, remote_identity: Identity, remote_device: DeviceUid) -> ChannelKey {
        ChannelKey { owned_identity: self.owned_identity, remote_identity, remote_device }
    }

    fn load_channel(&self, key: &ChannelKey) -> Result<Option<ObliviousChannelRecord>, StorageError> {
        match self.channels.get(key) {
            Some(overlay) => Ok(overlay.clone()),
            None => self.storage.load_channel(key),
        }
    }

    fn put_channel(&mut self, key: ChannelKey, record: ObliviousChannelRecord) {
        self.channels.insert(key, Some(record.clone()));
        self.writes.push(WriteOp::PutChannel { key, record });
    }

    fn existing_channel(
        &self,
        remote_identity: Identity,
        remote_device: DeviceUid,
    ) -> Result<(ChannelKey, ObliviousChannelRecord), ChannelError> {
        let key = self.channel_key(remote_identity, remote_device);
        let record = self
            .load_channel(&key)?
            .ok_or(ChannelError::NoSuchChannel { remote_identity, remote_device })?;
        Ok((key, record))
    }

    /// Whether an oblivious channel with the remote device exists.
    pub fn channel_exists(
        &self,
        remote_identity: Identity,
        remote_device: DeviceUid,
    ) -> Result<bool, ChannelError> {
        let key = self.channel_key(remote_identity, remote_device);
        Ok(self.load_channel(&key)?.is_some())
    }

    /// Create an unconfirmed oblivious channel keyed by `seed`.
    ///
    /// # Errors
    ///
    /// - `AlreadyExists` if a channel with the remote device exists
    pub fn create_oblivious_channel(
        &mut self,
        remote_identity: Identity,
        remote_device: DeviceUid,
        seed: &Seed,
        suite_version: u64,
    ) -> Result<(), ChannelError> {
        let key = self.channel_key(remote_identity, remote_device);
        if self.load_channel(&key)?.is_some() {
            return Err(ChannelError::AlreadyExists { remote_identity, remote_device });
        }

        let record = new_channel_record(seed, self.current_device, &remote_device, suite_version);
        self.put_channel(key, record);
        Ok(())
    }

    /// Mark a channel as confirmed by both ends.
    pub fn confirm_oblivious_channel(
        &mut self,
        remote_identity: Identity,
        remote_device: DeviceUid,
    ) -> Result<(), ChannelError> {
        let (key, mut record) = self.existing_channel(remote_identity, remote_device)?;
        record.confirmed = true;
        self.put_channel(key, record);
        Ok(())
    }

    /// Delete a channel. Deleting a missing channel is a no-op.
    pub fn delete_oblivious_channel(&mut self, remote_identity: Identity, remote_device: DeviceUid) {
        let key = self.channel_key(remote_identity, remote_device);
        self.channels.insert(key, None);
        self.writes.push(WriteOp::DeleteChannel(key));
    }

    /// Replace the send seed with the one derived from `seed` for this
    /// device and restart the send generation.
    pub fn update_send_seed(
        &mut self,
        remote_identity: Identity,
        remote_device: DeviceUid,
        seed: &Seed,
    ) -> Result<(), ChannelError> {
        let (key, mut record) = self.existing_channel(remote_identity, remote_device)?;
        record.send_seed = seed.directional(record.local_device.as_bytes());
        record.send_generation = 0;
        self.put_channel(key, record);
        Ok(())
    }

    /// Replace the receive seed with the one derived from `seed` for the
    /// remote device, keeping the old one for messages in flight.
    pub fn update_receive_seed(
        &mut self,
        remote_identity: Identity,
        remote_device: DeviceUid,
        seed: &Seed,
    ) -> Result<(), ChannelError> {
        let (key, mut record) = self.existing_channel(remote_identity, remote_device)?;
        let fresh = seed.directional(remote_device.as_bytes());
        record.previous_receive_seed = Some(std::mem::replace(&mut record.receive_seed, fresh));
        self.put_channel(key, record);
        Ok(())
    }

    /// Queue `message` for delivery on `channel`.
    ///
    /// Returns one message id per envelope: one for local and asymmetric
    /// channels, one per device for oblivious channels.
    ///
    /// # Errors
    ///
    /// - `NoSuchChannel` if an oblivious recipient has no channel
    /// - `NotConfirmed` if `necessarily_confirmed` is set and the channel is
    ///   not confirmed
    /// - `NoRecipients` for an oblivious post without devices
    pub fn post_message(
        &mut self,
        message: &ProtocolMessage,
        channel: &ChannelDescriptor,
    ) -> Result<Vec<Uid>, ChannelError> {
        let payload = message.to_bytes()?;

        let envelopes = match channel {
            ChannelDescriptor::Local => vec![(
                Route::Local { identity: self.owned_identity },
                EnvelopeBody::Cleartext(payload),
            )],

            ChannelDescriptor::Asymmetric { to_identity, to_devices } => vec![(
                Route::Asymmetric {
                    to_identity: *to_identity,
                    to_devices: to_devices.clone(),
                    from_identity: self.owned_identity,
                },
                EnvelopeBody::Cleartext(payload),
            )],

            ChannelDescriptor::Oblivious { to_identity, to_devices, necessarily_confirmed } => {
                if to_devices.is_empty() {
                    return Err(ChannelError::NoRecipients);
                }

                let mut envelopes = Vec::with_capacity(to_devices.len());
                for device in to_devices {
                    let (key, mut record) = self.existing_channel(*to_identity, *device)?;
                    if *necessarily_confirmed && !record.confirmed {
                        return Err(ChannelError::NotConfirmed {
                            remote_identity: *to_identity,
                            remote_device: *device,
                        });
                    }

                    let body = seal_oblivious(&mut record, &key, &payload, self.env.random_array());
                    let route = Route::Oblivious {
                        to_identity: *to_identity,
                        to_device: *device,
                        from_identity: self.owned_identity,
                        from_device: record.local_device,
                    };
                    self.put_channel(key, record);
                    envelopes.push((route, body));
                }
                envelopes
            },
        };

        let mut message_ids = Vec::with_capacity(envelopes.len());
        for (route, body) in envelopes {
            let message_id = self.env.random_uid();
            let record = OutboundRecord { envelope: ChannelEnvelope { message_id, route, body } };
            self.writes.push(WriteOp::EnqueueOutbound(record.clone()));
            self.outbound.push(record);
            message_ids.push(message_id);
        }

        Ok(message_ids)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::store::MemoryStorage;

    const OWNED: Identity = Identity::from_bytes([1u8; 32]);
    const LOCAL: DeviceUid = DeviceUid::from_bytes([0x11; 32]);
    const REMOTE: DeviceUid = DeviceUid::from_bytes([0xAA; 32]);

    #[derive(Clone)]
    struct FixedEnv(Instant);

    impl Environment for FixedEnv {
        type Instant = Instant;

        fn now(&self) -> Instant {
            self.0
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            buffer.fill(7);
        }
    }

    fn message() -> ProtocolMessage {
        ProtocolMessage {
            protocol_id: ProtocolId::FullRatchet,
            instance_uid: Uid::from_bytes([3u8; 32]),
            kind: 4,
            fields: Vec::new(),
        }
    }

    #[test]
    fn created_channel_is_visible_before_commit() {
        let env = FixedEnv(Instant::now());
        let storage = MemoryStorage::new();
        let mut tx = Transaction::new(&env, &storage, OWNED, LOCAL);

        tx.create_oblivious_channel(OWNED, REMOTE, &Seed::from_bytes([5u8; 32]), 0).unwrap();

        assert!(tx.channel_exists(OWNED, REMOTE).unwrap());
        assert_eq!(storage.channel_count(), 0);
        assert!(matches!(
            tx.create_oblivious_channel(OWNED, REMOTE, &Seed::from_bytes([6u8; 32]), 0),
            Err(ChannelError::AlreadyExists { .. })
        ));

        let (writes, _) = tx.into_parts();
        storage.commit(&writes).unwrap();
        assert_eq!(storage.channel_count(), 1);
    }

    #[test]
    fn confirmed_post_needs_a_confirmed_channel() {
        let env = FixedEnv(Instant::now());
        let storage = MemoryStorage::new();
        let mut tx = Transaction::new(&env, &storage, OWNED, LOCAL);
        let confirmed = ChannelDescriptor::oblivious_to(OWNED, REMOTE, true);

        assert!(matches!(
            tx.post_message(&message(), &confirmed),
            Err(ChannelError::NoSuchChannel { .. })
        ));

        tx.create_oblivious_channel(OWNED, REMOTE, &Seed::from_bytes([5u8; 32]), 0).unwrap();
        assert!(matches!(
            tx.post_message(&message(), &confirmed),
            Err(ChannelError::NotConfirmed { .. })
        ));
        assert_eq!(
            tx.post_message(&message(), &ChannelDescriptor::oblivious_to(OWNED, REMOTE, false))
                .unwrap()
                .len(),
            1
        );

        tx.confirm_oblivious_channel(OWNED, REMOTE).unwrap();
        tx.post_message(&message(), &confirmed).unwrap();

        let (_, outbound) = tx.into_parts();
        assert_eq!(outbound.len(), 2);
        assert!(outbound.iter().all(|record| !record.is_local()));
    }

    #[test]
    fn send_seed_update_resets_the_generation() {
        let env = FixedEnv(Instant::now());
        let storage = MemoryStorage::new();
        let mut tx = Transaction::new(&env, &storage, OWNED, LOCAL);
        tx.create_oblivious_channel(OWNED, REMOTE, &Seed::from_bytes([5u8; 32]), 0).unwrap();
        let channel = ChannelDescriptor::oblivious_to(OWNED, REMOTE, false);

        tx.post_message(&message(), &channel).unwrap();
        tx.post_message(&message(), &channel).unwrap();
        tx.update_send_seed(OWNED, REMOTE, &Seed::from_bytes([8u8; 32])).unwrap();

        let (writes, _) = tx.into_parts();
        storage.commit(&writes).unwrap();
        let key = ChannelKey { owned_identity: OWNED, remote_identity: OWNED, remote_device: REMOTE };
        let record = storage.load_channel(&key).unwrap().unwrap();
        assert_eq!(record.send_generation, 0);
        assert_eq!(record.send_seed, Seed::from_bytes([8u8; 32]).directional(LOCAL.as_bytes()));
    }

    #[test]
    fn receive_seed_update_keeps_the_previous_seed() {
        let env = FixedEnv(Instant::now());
        let storage = MemoryStorage::new();
        let mut tx = Transaction::new(&env, &storage, OWNED, LOCAL);
        let first = Seed::from_bytes([5u8; 32]);
        tx.create_oblivious_channel(OWNED, REMOTE, &first, 0).unwrap();
        tx.update_receive_seed(OWNED, REMOTE, &Seed::from_bytes([9u8; 32])).unwrap();

        let (writes, _) = tx.into_parts();
        storage.commit(&writes).unwrap();
        let key = ChannelKey { owned_identity: OWNED, remote_identity: OWNED, remote_device: REMOTE };
        let record = storage.load_channel(&key).unwrap().unwrap();
        assert_eq!(record.previous_receive_seed, Some(first.directional(REMOTE.as_bytes())));
        assert_eq!(record.receive_seed, Seed::from_bytes([9u8; 32]).directional(REMOTE.as_bytes()));
    }

    #[test]
    fn signature_is_recorded_once_per_transaction_and_store() {
        let env = FixedEnv(Instant::now());
        let storage = MemoryStorage::new();

        let mut tx = Transaction::new(&env, &storage, OWNED, LOCAL);
        tx.record_signature(b"ping").unwrap();
        assert_eq!(tx.record_signature(b"ping"), Err(StorageError::DuplicateSignature));
        let (writes, _) = tx.into_parts();
        storage.commit(&writes).unwrap();

        let mut again = Transaction::new(&env, &storage, OWNED, LOCAL);
        assert_eq!(again.record_signature(b"ping"), Err(StorageError::DuplicateSignature));
        assert!(again.into_parts().0.is_empty());
    }

    #[test]
    fn deleted_owned_device_instances_disappear_from_the_overlay() {
        let env = FixedEnv(Instant::now());
        let storage = MemoryStorage::new();
        let mut tx = Transaction::new(&env, &storage, OWNED, LOCAL);
        let uid = Uid::from_bytes([4u8; 32]);

        tx.put_owned_device_instance(uid, REMOTE);
        assert_eq!(tx.owned_device_instances(&REMOTE).unwrap(), vec![uid]);
        assert_eq!(tx.delete_owned_device_instances(&REMOTE).unwrap(), vec![uid]);
        assert!(tx.owned_device_instances(&REMOTE).unwrap().is_empty());
    }

    #[test]
    fn local_post_is_cleartext_to_the_owned_identity() {
        let env = FixedEnv(Instant::now());
        let storage = MemoryStorage::new();
        let mut tx = Transaction::new(&env, &storage, OWNED, LOCAL);

        tx.post_message(&message(), &ChannelDescriptor::Local).unwrap();

        let (_, outbound) = tx.into_parts();
        assert!(outbound[0].is_local());
        assert!(matches!(outbound[0].envelope.body, EnvelopeBody::Cleartext(_)));
    }
}
