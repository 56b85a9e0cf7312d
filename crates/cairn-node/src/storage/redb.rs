//! Redb-backed durable storage implementation.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety. A
//! [`WriteSet`] is validated and applied inside a single write transaction;
//! any failed check returns before `commit`, which aborts the transaction and
//! leaves the database untouched.

use std::{path::Path, sync::Arc};

use cairn_core::{
    ChannelKey, InstanceKey, ObliviousChannelRecord, OutboundRecord, Storage, StorageError,
    StoredInstance, WriteOp, WriteSet,
};
use cairn_proto::{DeviceUid, ID_SIZE, Identity, ProtocolId, Uid};
use redb::{Database, ReadableTable, Table, TableDefinition};

/// Table: instances
/// Key: owned identity [32] ‖ protocol id (u64 BE) [8] ‖ instance uid [32]
/// Value: revision (u64 BE) [8] ‖ encoded state
const INSTANCES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("instances");

/// Table: replay_signatures
/// Key: owned identity [32] ‖ signature bytes
/// Value: empty
const REPLAY_SIGNATURES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("replay_signatures");

/// Table: owned_device_instances
/// Key: owned identity [32] ‖ instance uid [32]
/// Value: remote device uid [32]
const OWNED_DEVICE_INSTANCES: TableDefinition<&[u8], &[u8]> =
    TableDefinition::new("owned_device_instances");

/// Table: channels
/// Key: owned identity [32] ‖ remote identity [32] ‖ remote device [32]
/// Value: CBOR-encoded ObliviousChannelRecord
const CHANNELS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("channels");

/// Table: outbox
/// Key: enqueue sequence (u64 BE) [8]
/// Value: CBOR-encoded OutboundRecord
const OUTBOX: TableDefinition<&[u8], &[u8]> = TableDefinition::new("outbox");

/// Table: outbox_index
/// Key: message id [32]
/// Value: enqueue sequence (u64 BE) [8]
const OUTBOX_INDEX: TableDefinition<&[u8], &[u8]> = TableDefinition::new("outbox_index");

type BytesTable<'txn> = Table<'txn, &'static [u8], &'static [u8]>;

const INSTANCE_KEY_SIZE: usize = ID_SIZE + 8 + ID_SIZE;

/// Durable storage backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    /// Open or create a Redb database at the given path.
    ///
    /// Creates every table that does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(io_err)?;

        let txn = db.begin_write().map_err(io_err)?;
        {
            let _ = txn.open_table(INSTANCES).map_err(io_err)?;
            let _ = txn.open_table(REPLAY_SIGNATURES).map_err(io_err)?;
            let _ = txn.open_table(OWNED_DEVICE_INSTANCES).map_err(io_err)?;
            let _ = txn.open_table(CHANNELS).map_err(io_err)?;
            let _ = txn.open_table(OUTBOX).map_err(io_err)?;
            let _ = txn.open_table(OUTBOX_INDEX).map_err(io_err)?;
        }
        txn.commit().map_err(io_err)?;

        Ok(Self { db: Arc::new(db) })
    }
}

impl Storage for RedbStorage {
    fn load_instance(&self, key: &InstanceKey) -> Result<Option<StoredInstance>, StorageError> {
        let txn = self.db.begin_read().map_err(io_err)?;
        let table = txn.open_table(INSTANCES).map_err(io_err)?;

        match table.get(encode_instance_key(key).as_slice()).map_err(io_err)? {
            Some(value) => {
                let (revision, state) = split_instance_value(value.value())?;
                Ok(Some(StoredInstance { revision, state: state.to_vec() }))
            },
            None => Ok(None),
        }
    }

    fn list_instances(&self, owned_identity: &Identity) -> Result<Vec<InstanceKey>, StorageError> {
        let txn = self.db.begin_read().map_err(io_err)?;
        let table = txn.open_table(INSTANCES).map_err(io_err)?;

        let (start, end) = prefix_bounds::<INSTANCE_KEY_SIZE>(owned_identity.as_bytes());
        let mut keys = Vec::new();
        for result in table.range(start.as_slice()..=end.as_slice()).map_err(io_err)? {
            let (key, _) = result.map_err(io_err)?;
            keys.push(decode_instance_key(key.value())?);
        }

        Ok(keys)
    }

    fn replay_signature_exists(
        &self,
        owned_identity: &Identity,
        signature: &[u8],
    ) -> Result<bool, StorageError> {
        let txn = self.db.begin_read().map_err(io_err)?;
        let table = txn.open_table(REPLAY_SIGNATURES).map_err(io_err)?;

        let key = encode_signature_key(owned_identity, signature);
        Ok(table.get(key.as_slice()).map_err(io_err)?.is_some())
    }

    fn owned_device_instances(
        &self,
        owned_identity: &Identity,
        remote_device: &DeviceUid,
    ) -> Result<Vec<Uid>, StorageError> {
        let txn = self.db.begin_read().map_err(io_err)?;
        let table = txn.open_table(OWNED_DEVICE_INSTANCES).map_err(io_err)?;

        let (start, end) = prefix_bounds::<{ 2 * ID_SIZE }>(owned_identity.as_bytes());
        let mut uids = Vec::new();
        for result in table.range(start.as_slice()..=end.as_slice()).map_err(io_err)? {
            let (key, value) = result.map_err(io_err)?;
            if value.value() == remote_device.as_bytes().as_slice() {
                uids.push(Uid::from_slice(&key.value()[ID_SIZE..])?);
            }
        }

        Ok(uids)
    }

    fn load_channel(&self, key: &ChannelKey) -> Result<Option<ObliviousChannelRecord>, StorageError> {
        let txn = self.db.begin_read().map_err(io_err)?;
        let table = txn.open_table(CHANNELS).map_err(io_err)?;

        match table.get(encode_channel_key(key).as_slice()).map_err(io_err)? {
            Some(value) => {
                let record: ObliviousChannelRecord = ciborium::from_reader(value.value())
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                Ok(Some(record))
            },
            None => Ok(None),
        }
    }

    fn pending_outbound(&self) -> Result<Vec<OutboundRecord>, StorageError> {
        let txn = self.db.begin_read().map_err(io_err)?;
        let table = txn.open_table(OUTBOX).map_err(io_err)?;

        let mut records = Vec::new();
        for result in table.iter().map_err(io_err)? {
            let (_, value) = result.map_err(io_err)?;
            let record: OutboundRecord = ciborium::from_reader(value.value())
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            records.push(record);
        }

        Ok(records)
    }

    fn commit(&self, writes: &WriteSet) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(io_err)?;

        {
            let mut instances = txn.open_table(INSTANCES).map_err(io_err)?;
            let mut signatures = txn.open_table(REPLAY_SIGNATURES).map_err(io_err)?;
            let mut owned_devices = txn.open_table(OWNED_DEVICE_INSTANCES).map_err(io_err)?;
            let mut channels = txn.open_table(CHANNELS).map_err(io_err)?;
            let mut outbox = txn.open_table(OUTBOX).map_err(io_err)?;
            let mut outbox_index = txn.open_table(OUTBOX_INDEX).map_err(io_err)?;

            let mut next_sequence = next_outbox_sequence(&outbox)?;

            // Returning early drops `txn` without committing, which aborts it.
            for op in writes.ops() {
                match op {
                    WriteOp::PutInstance { key, expected_revision, state } => {
                        let key = encode_instance_key(key);
                        let current = stored_revision(&instances, &key)?;
                        if current != *expected_revision {
                            return Err(StorageError::Conflict {
                                expected: *expected_revision,
                                got: current,
                            });
                        }

                        let mut value = Vec::with_capacity(8 + state.len());
                        value.extend_from_slice(&(expected_revision + 1).to_be_bytes());
                        value.extend_from_slice(state);
                        instances.insert(key.as_slice(), value.as_slice()).map_err(io_err)?;
                    },

                    WriteOp::DeleteInstance { key, expected_revision } => {
                        let key = encode_instance_key(key);
                        if let Some(expected) = expected_revision {
                            let current = stored_revision(&instances, &key)?;
                            if current != *expected {
                                return Err(StorageError::Conflict {
                                    expected: *expected,
                                    got: current,
                                });
                            }
                        }
                        instances.remove(key.as_slice()).map_err(io_err)?;
                    },

                    WriteOp::InsertReplaySignature { owned_identity, signature } => {
                        let key = encode_signature_key(owned_identity, signature);
                        if signatures.get(key.as_slice()).map_err(io_err)?.is_some() {
                            return Err(StorageError::DuplicateSignature);
                        }
                        let empty: &[u8] = &[];
                        signatures.insert(key.as_slice(), empty).map_err(io_err)?;
                    },

                    WriteOp::PutOwnedDeviceInstance(record) => {
                        let key = encode_owned_device_key(&record.owned_identity, &record.instance_uid);
                        owned_devices
                            .insert(key.as_slice(), record.remote_device.as_bytes().as_slice())
                            .map_err(io_err)?;
                    },

                    WriteOp::DeleteOwnedDeviceInstance { owned_identity, instance_uid } => {
                        let key = encode_owned_device_key(owned_identity, instance_uid);
                        owned_devices.remove(key.as_slice()).map_err(io_err)?;
                    },

                    WriteOp::PutChannel { key, record } => {
                        let mut bytes = Vec::new();
                        ciborium::into_writer(record, &mut bytes)
                            .map_err(|e| StorageError::Serialization(e.to_string()))?;
                        channels
                            .insert(encode_channel_key(key).as_slice(), bytes.as_slice())
                            .map_err(io_err)?;
                    },

                    WriteOp::DeleteChannel(key) => {
                        channels.remove(encode_channel_key(key).as_slice()).map_err(io_err)?;
                    },

                    WriteOp::EnqueueOutbound(record) => {
                        let id = record.message_id();
                        if outbox_index.get(id.as_bytes().as_slice()).map_err(io_err)?.is_some() {
                            continue;
                        }

                        let mut bytes = Vec::new();
                        ciborium::into_writer(record, &mut bytes)
                            .map_err(|e| StorageError::Serialization(e.to_string()))?;

                        let sequence = next_sequence.to_be_bytes();
                        next_sequence += 1;
                        outbox.insert(sequence.as_slice(), bytes.as_slice()).map_err(io_err)?;
                        outbox_index
                            .insert(id.as_bytes().as_slice(), sequence.as_slice())
                            .map_err(io_err)?;
                    },

                    WriteOp::RemoveOutbound(message_id) => {
                        remove_outbox_entry(&mut outbox, &mut outbox_index, message_id)?;
                    },
                }
            }
        }

        txn.commit().map_err(io_err)?;

        Ok(())
    }

    fn remove_outbound(&self, message_id: &Uid) -> Result<bool, StorageError> {
        let txn = self.db.begin_write().map_err(io_err)?;

        let removed = {
            let mut outbox = txn.open_table(OUTBOX).map_err(io_err)?;
            let mut outbox_index = txn.open_table(OUTBOX_INDEX).map_err(io_err)?;
            remove_outbox_entry(&mut outbox, &mut outbox_index, message_id)?
        };

        txn.commit().map_err(io_err)?;

        Ok(removed)
    }
}

fn io_err(err: impl ToString) -> StorageError {
    StorageError::Io(err.to_string())
}

/// Revision of the instance stored under `key`, 0 when absent.
fn stored_revision<T: ReadableTable<&'static [u8], &'static [u8]>>(
    table: &T,
    key: &[u8],
) -> Result<u64, StorageError> {
    match table.get(key).map_err(io_err)? {
        Some(value) => split_instance_value(value.value()).map(|(revision, _)| revision),
        None => Ok(0),
    }
}

/// Sequence number the next outbox entry gets.
fn next_outbox_sequence<T: ReadableTable<&'static [u8], &'static [u8]>>(
    table: &T,
) -> Result<u64, StorageError> {
    match table.last().map_err(io_err)? {
        Some((key, _)) => Ok(decode_u64(key.value(), "outbox key")? + 1),
        None => Ok(0),
    }
}

fn remove_outbox_entry(
    outbox: &mut BytesTable<'_>,
    outbox_index: &mut BytesTable<'_>,
    message_id: &Uid,
) -> Result<bool, StorageError> {
    let sequence = match outbox_index.remove(message_id.as_bytes().as_slice()).map_err(io_err)? {
        Some(sequence) => sequence.value().to_vec(),
        None => return Ok(false),
    };
    outbox.remove(sequence.as_slice()).map_err(io_err)?;
    Ok(true)
}

/// Encode an instance key.
///
/// Layout: [owned identity: 32][protocol id: 8 BE][instance uid: 32]. All
/// instances of one identity share a prefix, so they can be listed with a
/// range scan.
fn encode_instance_key(key: &InstanceKey) -> [u8; INSTANCE_KEY_SIZE] {
    let mut bytes = [0u8; INSTANCE_KEY_SIZE];
    bytes[..ID_SIZE].copy_from_slice(key.owned_identity.as_bytes());
    bytes[ID_SIZE..ID_SIZE + 8].copy_from_slice(&key.protocol_id.to_u64().to_be_bytes());
    bytes[ID_SIZE + 8..].copy_from_slice(key.instance_uid.as_bytes());
    bytes
}

fn decode_instance_key(bytes: &[u8]) -> Result<InstanceKey, StorageError> {
    if bytes.len() != INSTANCE_KEY_SIZE {
        return Err(StorageError::Serialization(format!(
            "instance key is {} bytes, expected {INSTANCE_KEY_SIZE}",
            bytes.len()
        )));
    }

    let raw_protocol = decode_u64(&bytes[ID_SIZE..ID_SIZE + 8], "protocol id")?;
    let protocol_id = ProtocolId::from_u64(raw_protocol).ok_or_else(|| {
        StorageError::Serialization(format!("unknown protocol id {raw_protocol}"))
    })?;

    Ok(InstanceKey {
        owned_identity: Identity::from_slice(&bytes[..ID_SIZE])?,
        protocol_id,
        instance_uid: Uid::from_slice(&bytes[ID_SIZE + 8..])?,
    })
}

/// Split an instance value into its revision and encoded state.
fn split_instance_value(bytes: &[u8]) -> Result<(u64, &[u8]), StorageError> {
    if bytes.len() < 8 {
        return Err(StorageError::Serialization("instance value too short".to_string()));
    }
    let (revision, state) = bytes.split_at(8);
    Ok((decode_u64(revision, "instance revision")?, state))
}

fn encode_signature_key(owned_identity: &Identity, signature: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(ID_SIZE + signature.len());
    key.extend_from_slice(owned_identity.as_bytes());
    key.extend_from_slice(signature);
    key
}

fn encode_owned_device_key(owned_identity: &Identity, instance_uid: &Uid) -> [u8; 2 * ID_SIZE] {
    let mut key = [0u8; 2 * ID_SIZE];
    key[..ID_SIZE].copy_from_slice(owned_identity.as_bytes());
    key[ID_SIZE..].copy_from_slice(instance_uid.as_bytes());
    key
}

fn encode_channel_key(key: &ChannelKey) -> [u8; 3 * ID_SIZE] {
    let mut bytes = [0u8; 3 * ID_SIZE];
    bytes[..ID_SIZE].copy_from_slice(key.owned_identity.as_bytes());
    bytes[ID_SIZE..2 * ID_SIZE].copy_from_slice(key.remote_identity.as_bytes());
    bytes[2 * ID_SIZE..].copy_from_slice(key.remote_device.as_bytes());
    bytes
}

/// Smallest and largest `N`-byte keys starting with `prefix`.
fn prefix_bounds<const N: usize>(prefix: &[u8; ID_SIZE]) -> ([u8; N], [u8; N]) {
    let mut start = [0u8; N];
    let mut end = [0xFFu8; N];
    start[..ID_SIZE].copy_from_slice(prefix);
    end[..ID_SIZE].copy_from_slice(prefix);
    (start, end)
}

fn decode_u64(bytes: &[u8], what: &str) -> Result<u64, StorageError> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StorageError::Serialization(format!("{what} is not 8 bytes")))?;
    Ok(u64::from_be_bytes(array))
}
