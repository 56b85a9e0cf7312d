//! Dispatcher behaviour of a single engine: what it refuses, what it drops
//! and how it commits.

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use cairn_core::{
    ChannelKey, DropReason, Engine, EngineAction, EngineConfig, EngineError, IdentityError,
    InstanceKey, KeyringChallengeService, MemoryStorage, ObliviousChannelRecord, OutboundRecord,
    Protocol, ProtocolOutcome, Storage, StorageError, StoredInstance, WriteSet,
    protocols::{
        FullRatchet,
        full_ratchet::{FullRatchetMessage, message_kind},
    },
};
use cairn_crypto::SigningSecret;
use cairn_harness::{SimEnv, SimIdentityService};
use cairn_proto::{
    ChannelEnvelope, DeviceUid, Encoded, EnvelopeBody, Identity, ProtocolId, ProtocolMessage,
    Route, Uid,
};
use proptest::prelude::*;

const DEVICE: DeviceUid = DeviceUid::from_bytes([0x11; 32]);
const OTHER_DEVICE: DeviceUid = DeviceUid::from_bytes([0xAA; 32]);

/// Store that reports a revision conflict for its first `conflicts` commits.
#[derive(Clone)]
struct ConflictingStorage {
    inner: MemoryStorage,
    conflicts: Arc<AtomicU32>,
    commits: Arc<AtomicU32>,
}

impl ConflictingStorage {
    fn new(conflicts: u32) -> Self {
        Self {
            inner: MemoryStorage::new(),
            conflicts: Arc::new(AtomicU32::new(conflicts)),
            commits: Arc::new(AtomicU32::new(0)),
        }
    }

    fn commits(&self) -> u32 {
        self.commits.load(Ordering::SeqCst)
    }
}

impl Storage for ConflictingStorage {
    fn load_instance(&self, key: &InstanceKey) -> Result<Option<StoredInstance>, StorageError> {
        self.inner.load_instance(key)
    }

    fn list_instances(&self, owned_identity: &Identity) -> Result<Vec<InstanceKey>, StorageError> {
        self.inner.list_instances(owned_identity)
    }

    fn replay_signature_exists(
        &self,
        owned_identity: &Identity,
        signature: &[u8],
    ) -> Result<bool, StorageError> {
        self.inner.replay_signature_exists(owned_identity, signature)
    }

    fn owned_device_instances(
        &self,
        owned_identity: &Identity,
        remote_device: &DeviceUid,
    ) -> Result<Vec<Uid>, StorageError> {
        self.inner.owned_device_instances(owned_identity, remote_device)
    }

    fn load_channel(&self, key: &ChannelKey) -> Result<Option<ObliviousChannelRecord>, StorageError> {
        self.inner.load_channel(key)
    }

    fn pending_outbound(&self) -> Result<Vec<OutboundRecord>, StorageError> {
        self.inner.pending_outbound()
    }

    fn commit(&self, writes: &WriteSet) -> Result<(), StorageError> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        let remaining = self.conflicts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.conflicts.store(remaining - 1, Ordering::SeqCst);
            return Err(StorageError::Conflict { expected: 0, got: 1 });
        }
        self.inner.commit(writes)
    }

    fn remove_outbound(&self, message_id: &Uid) -> Result<bool, StorageError> {
        self.inner.remove_outbound(message_id)
    }
}

type TestEngine<S> = Engine<SimEnv, S, SimIdentityService, KeyringChallengeService>;

fn engine<S: Storage>(storage: S) -> (TestEngine<S>, Identity, SimIdentityService) {
    let mut challenge = KeyringChallengeService::new();
    let identity = challenge.insert(SigningSecret::from_bytes([7; 32]));
    let identities = SimIdentityService::new();
    identities.add_owned_identity(identity, DEVICE);
    let engine =
        Engine::new(SimEnv::with_seed(42), storage, identities.clone(), challenge, EngineConfig::default());
    (engine, identity, identities)
}

fn cleartext_to(identity: Identity, message: &ProtocolMessage) -> ChannelEnvelope {
    ChannelEnvelope {
        message_id: Uid::from_bytes([3; 32]),
        route: Route::Asymmetric { to_identity: identity, to_devices: Vec::new(), from_identity: identity },
        body: EnvelopeBody::Cleartext(message.to_bytes().unwrap()),
    }
}

fn bob_ack() -> ProtocolMessage {
    FullRatchet::message(Uid::from_bytes([4; 32]), &FullRatchetMessage::BobAck { restart_counter: 1 })
}

fn dropped(actions: &[EngineAction]) -> Vec<DropReason> {
    actions
        .iter()
        .filter_map(|a| match a {
            EngineAction::MessageDropped { reason } => Some(reason.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn oversized_envelope_is_refused() {
    let (mut engine, _, _) = engine(MemoryStorage::new());
    let max = engine.config().max_envelope_size;

    let err = engine.receive(&vec![0; max + 1]).unwrap_err();
    assert!(matches!(err, EngineError::EnvelopeTooLarge { size, .. } if size == max + 1));
    assert!(!err.is_transient());
}

#[test]
fn unknown_message_kind_is_dropped() {
    let (mut engine, identity, _) = engine(MemoryStorage::new());
    let message = ProtocolMessage {
        protocol_id: ProtocolId::FullRatchet,
        instance_uid: Uid::from_bytes([4; 32]),
        kind: 99,
        fields: Vec::new(),
    };

    let actions = engine.receive_envelope(&cleartext_to(identity, &message)).unwrap();
    assert_eq!(dropped(&actions), vec![DropReason::UnknownMessageKind {
        protocol_id: ProtocolId::FullRatchet,
        kind: 99
    }]);
}

#[test]
fn message_without_step_is_dropped_and_nothing_stored() {
    let storage = MemoryStorage::new();
    let (mut engine, identity, _) = engine(storage.clone());

    let actions = engine.receive_envelope(&cleartext_to(identity, &bob_ack())).unwrap();

    assert_eq!(dropped(&actions), vec![DropReason::NoMatchingStep {
        protocol_id: ProtocolId::FullRatchet,
        state: 0,
        message: message_kind::BOB_ACK,
    }]);
    assert_eq!(storage.instance_count(), 0);
}

#[test]
fn identity_outage_is_transient() {
    let (mut engine, identity, identities) = engine(MemoryStorage::new());
    identities.set_unavailable(true);

    let err = engine.receive_envelope(&cleartext_to(identity, &bob_ack())).unwrap_err();
    assert!(matches!(err, EngineError::Identity(IdentityError::Unavailable(_))));
    assert!(err.is_transient());
}

#[test]
fn local_trigger_runs_to_completion_in_one_call() {
    let storage = MemoryStorage::new();
    let (mut engine, identity, _) = engine(storage.clone());

    let actions = engine.start_channel_creation(identity, OTHER_DEVICE).unwrap();

    let [EngineAction::Deliver { message_id, envelope }, EngineAction::ProtocolFinished { key, outcome }] =
        actions.as_slice()
    else {
        panic!("expected a ping and a finished instance, got {actions:?}");
    };
    assert_eq!(*outcome, ProtocolOutcome::Done);
    assert_eq!(key.protocol_id, ProtocolId::ChannelCreationWithOwnedDevice);
    assert!(matches!(
        &envelope.route,
        Route::Asymmetric { to_devices, .. } if to_devices == &vec![OTHER_DEVICE]
    ));

    let pending = storage.pending_outbound().unwrap();
    assert_eq!(pending.iter().map(OutboundRecord::message_id).collect::<Vec<_>>(), vec![*message_id]);
    assert!(engine.acknowledge_delivery(message_id).unwrap());
    assert!(!engine.acknowledge_delivery(message_id).unwrap());
    assert!(engine.pending_deliveries().unwrap().is_empty());
}

#[test]
fn revision_conflict_is_retried() {
    let storage = ConflictingStorage::new(1);
    let (mut engine, identity, _) = engine(storage.clone());

    let actions = engine.start_channel_creation(identity, OTHER_DEVICE).unwrap();

    assert_eq!(storage.commits(), 2);
    assert!(actions.iter().any(|a| matches!(a, EngineAction::Deliver { .. })));
}

#[test]
fn endless_conflicts_give_up() {
    let storage = ConflictingStorage::new(u32::MAX);
    let (mut engine, identity, _) = engine(storage.clone());

    let actions = engine.start_channel_creation(identity, OTHER_DEVICE).unwrap();

    assert_eq!(dropped(&actions), vec![DropReason::ConflictRetriesExhausted]);
    assert_eq!(storage.commits(), engine.config().max_commit_attempts);
    assert!(storage.inner.pending_outbound().unwrap().is_empty());
}

fn field() -> impl Strategy<Value = Encoded> {
    prop_oneof![
        any::<u64>().prop_map(|n| Encoded::Integer(n.into())),
        prop::collection::vec(any::<u8>(), 0..48).prop_map(Encoded::Bytes),
        any::<bool>().prop_map(Encoded::Bool),
    ]
}

proptest! {
    /// A cleartext message with arbitrary fields is dropped or cancelled
    /// without an error, and leaves neither a channel nor an instance.
    #[test]
    fn prop_arbitrary_fields_leave_no_trace(
        protocol in 1u64..=3,
        kind in 0u64..8,
        instance in any::<[u8; 32]>(),
        fields in prop::collection::vec(field(), 0..6),
    ) {
        let storage = MemoryStorage::new();
        let (mut engine, identity, _) = engine(storage.clone());
        let message = ProtocolMessage {
            protocol_id: ProtocolId::from_u64(protocol).unwrap(),
            instance_uid: Uid::from_bytes(instance),
            kind,
            fields,
        };

        let result = engine.receive_envelope(&cleartext_to(identity, &message));

        prop_assert!(result.is_ok(), "unexpected error: {result:?}");
        prop_assert_eq!(storage.channel_count(), 0);
        prop_assert_eq!(storage.instance_count(), 0);
    }
}
