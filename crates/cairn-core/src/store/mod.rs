//! Storage abstraction for the handshake engine
//!
//! Trait-based abstraction for persisting protocol instances, the replay
//! guard, owned-device instance records, oblivious channels and the outbox.
//! The trait is synchronous (no async) to keep the engine sans-IO.
//!
//! Reads go straight to the store. Writes are collected by a
//! [`crate::Transaction`] into a [`WriteSet`] and applied by
//! [`Storage::commit`] all at once: either every operation in the set takes
//! effect or none does.

mod error;
mod memory;

use std::fmt;

use cairn_crypto::Seed;
use cairn_proto::{ChannelEnvelope, DeviceUid, Identity, ProtocolId, Route, Uid};
pub use error::StorageError;
pub use memory::MemoryStorage;
use serde::{Deserialize, Serialize};

/// Persistence key of a protocol instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceKey {
    /// Owned identity the instance runs for
    pub owned_identity: Identity,
    /// Protocol the instance runs
    pub protocol_id: ProtocolId,
    /// Instance uid carried by every message of the instance
    pub instance_uid: Uid,
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.owned_identity, self.protocol_id, self.instance_uid)
    }
}

/// A persisted protocol instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredInstance {
    /// Incremented on every save, starting at 1
    pub revision: u64,
    /// Wire-encoded protocol state
    pub state: Vec<u8>,
}

/// Key of an oblivious channel as seen from one owned identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelKey {
    /// Owned identity holding the channel
    pub owned_identity: Identity,
    /// Identity at the other end
    pub remote_identity: Identity,
    /// Device at the other end
    pub remote_device: DeviceUid,
}

/// Oblivious channel key material and status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObliviousChannelRecord {
    /// Current device of the owned identity
    pub local_device: DeviceUid,
    /// Crypto suite the channel was created with
    pub suite_version: u64,
    /// Whether both sides have acknowledged the channel
    pub confirmed: bool,
    /// Directional seed for messages we send
    pub send_seed: Seed,
    /// Generation of the next message key we seal with
    pub send_generation: u64,
    /// Directional seed for messages we receive
    pub receive_seed: Seed,
    /// Receive seed before the last ratchet, for messages already in flight
    pub previous_receive_seed: Option<Seed>,
}

/// Index entry tying a live channel-creation instance to a remote device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnedDeviceInstanceRecord {
    /// Owned identity
    pub owned_identity: Identity,
    /// Channel-creation instance
    pub instance_uid: Uid,
    /// Remote owned device the instance is establishing a channel with
    pub remote_device: DeviceUid,
}

/// An envelope waiting in the outbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundRecord {
    /// The sealed envelope
    pub envelope: ChannelEnvelope,
}

impl OutboundRecord {
    /// Identifier used to acknowledge delivery.
    pub fn message_id(&self) -> Uid {
        self.envelope.message_id
    }

    /// Whether the engine delivers this envelope to itself.
    pub fn is_local(&self) -> bool {
        matches!(self.envelope.route, Route::Local { .. })
    }
}

/// One write in a [`WriteSet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Save an instance. `expected_revision` is the revision that was loaded,
    /// 0 when the instance did not exist.
    PutInstance {
        /// Instance key
        key: InstanceKey,
        /// Revision the writer loaded
        expected_revision: u64,
        /// Encoded state
        state: Vec<u8>,
    },

    /// Delete an instance. `None` deletes unconditionally (aborting another
    /// instance); a missing instance is not an error.
    DeleteInstance {
        /// Instance key
        key: InstanceKey,
        /// Revision the writer loaded
        expected_revision: Option<u64>,
    },

    /// Insert into the replay guard; fails the commit if already present
    InsertReplaySignature {
        /// Owned identity the signature was received for
        owned_identity: Identity,
        /// Exact signature bytes
        signature: Vec<u8>,
    },

    /// Index a channel-creation instance by remote device
    PutOwnedDeviceInstance(OwnedDeviceInstanceRecord),

    /// Remove an owned-device instance index entry
    DeleteOwnedDeviceInstance {
        /// Owned identity
        owned_identity: Identity,
        /// Channel-creation instance
        instance_uid: Uid,
    },

    /// Create or replace an oblivious channel
    PutChannel {
        /// Channel key
        key: ChannelKey,
        /// New channel record
        record: ObliviousChannelRecord,
    },

    /// Delete an oblivious channel (missing is not an error)
    DeleteChannel(ChannelKey),

    /// Append an envelope to the outbox
    EnqueueOutbound(OutboundRecord),

    /// Drop an envelope from the outbox (missing is not an error)
    RemoveOutbound(Uid),
}

/// Ordered list of writes applied atomically by [`Storage::commit`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteSet {
    ops: Vec<WriteOp>,
}

impl WriteSet {
    /// Empty write set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a write.
    pub fn push(&mut self, op: WriteOp) {
        self.ops.push(op);
    }

    /// Writes in application order.
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Whether there is nothing to write.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of writes.
    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Storage abstraction for engine state
///
/// Must be Clone (can be shared by several engines), Send + Sync
/// (thread-safe), and synchronous (no async methods). Implementations
/// typically share internal state via Arc, so clones access the same
/// underlying storage.
///
/// # Panics
///
/// Implementations may panic if internal synchronization primitives are
/// poisoned (a thread panicked while holding a lock). Acceptable for
/// test/simulation code, but production implementations should handle poisoned
/// mutexes gracefully.
pub trait Storage: Clone + Send + Sync + 'static {
    /// Load a protocol instance. `None` if it does not exist.
    fn load_instance(&self, key: &InstanceKey) -> Result<Option<StoredInstance>, StorageError>;

    /// Keys of every live instance of an owned identity.
    ///
    /// Order is not guaranteed.
    fn list_instances(&self, owned_identity: &Identity) -> Result<Vec<InstanceKey>, StorageError>;

    /// Whether the replay guard holds `signature` for `owned_identity`.
    fn replay_signature_exists(
        &self,
        owned_identity: &Identity,
        signature: &[u8],
    ) -> Result<bool, StorageError>;

    /// Channel-creation instances indexed for `remote_device`.
    fn owned_device_instances(
        &self,
        owned_identity: &Identity,
        remote_device: &DeviceUid,
    ) -> Result<Vec<Uid>, StorageError>;

    /// Load an oblivious channel. `None` if it does not exist.
    fn load_channel(&self, key: &ChannelKey) -> Result<Option<ObliviousChannelRecord>, StorageError>;

    /// Every envelope in the outbox, in enqueue order.
    fn pending_outbound(&self) -> Result<Vec<OutboundRecord>, StorageError>;

    /// Apply a write set atomically.
    ///
    /// # Invariants
    ///
    /// - Pre: nothing
    /// - Post (Ok): every write took effect, in order
    /// - Post (Err): no write took effect
    ///
    /// # Errors
    ///
    /// - `Conflict` if an instance revision differs from the expected one
    /// - `DuplicateSignature` if a replay guard insert finds an existing entry
    fn commit(&self, writes: &WriteSet) -> Result<(), StorageError>;

    /// Remove an envelope from the outbox after delivery.
    ///
    /// Returns whether the envelope was present.
    fn remove_outbound(&self, message_id: &Uid) -> Result<bool, StorageError>;
}
