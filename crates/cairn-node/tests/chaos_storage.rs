//! Chaos property tests for storage implementations and the node above them.
//!
//! These tests verify that:
//! - A commit wrapped in `ChaoticStorage` applies completely or not at all
//! - A handshake interrupted by storage failures never panics, and once the
//!   store recovers a fresh pairing request converges

use std::collections::VecDeque;

use cairn_core::{
    ChannelKey, EngineConfig, InstanceKey, KeyringChallengeService, MemoryStorage,
    ObliviousChannelRecord, OutboundRecord, Storage, WriteOp, WriteSet,
};
use cairn_crypto::SigningSecret;
use cairn_harness::{SimEnv, SimIdentityService};
use cairn_node::{ChaoticStorage, Node, NodeAction, NodeEvent, RedbStorage, StorageError};
use cairn_proto::{ChannelEnvelope, DeviceUid, EnvelopeBody, Identity, ProtocolId, Route, Uid};
use proptest::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;

const SIGNING_KEY: [u8; 32] = [7; 32];
const DEVICES: [DeviceUid; 2] =
    [DeviceUid::from_bytes([0x11; 32]), DeviceUid::from_bytes([0xAA; 32])];
const OWNER: Identity = Identity::from_bytes([1; 32]);

fn instance_key(slot: u8) -> InstanceKey {
    InstanceKey {
        owned_identity: OWNER,
        protocol_id: ProtocolId::FullRatchet,
        instance_uid: Uid::from_bytes([slot; 32]),
    }
}

/// A random write set that is valid against `mirror`.
fn random_write_set(rng: &mut ChaCha8Rng, mirror: &MemoryStorage) -> WriteSet {
    let mut writes = WriteSet::new();
    for _ in 0..rng.gen_range(1..5) {
        match rng.gen_range(0..3) {
            0 => {
                let key = instance_key(rng.gen_range(0..4));
                let revision = mirror.load_instance(&key).unwrap().map_or(0, |i| i.revision);
                writes.push(WriteOp::PutInstance {
                    key,
                    expected_revision: revision,
                    state: vec![rng.r#gen(); 8],
                });
            },
            1 => {
                let mut id = [0u8; 32];
                rng.fill(&mut id);
                let envelope = ChannelEnvelope {
                    message_id: Uid::from_bytes(id),
                    route: Route::Local { identity: OWNER },
                    body: EnvelopeBody::Cleartext(vec![1, 2, 3]),
                };
                writes.push(WriteOp::EnqueueOutbound(OutboundRecord { envelope }));
            },
            _ => {
                let mut signature = vec![0u8; 16];
                rng.fill(signature.as_mut_slice());
                writes.push(WriteOp::InsertReplaySignature { owned_identity: OWNER, signature });
            },
        }
    }
    writes
}

/// Observable contents of a store, for comparing against a mirror.
fn contents(storage: &impl Storage) -> (Vec<(InstanceKey, u64, Vec<u8>)>, Vec<Uid>) {
    let mut keys = storage.list_instances(&OWNER).unwrap();
    keys.sort();
    let instances = keys
        .into_iter()
        .map(|key| {
            let stored = storage.load_instance(&key).unwrap().unwrap();
            (key, stored.revision, stored.state)
        })
        .collect();
    let outbox = storage.pending_outbound().unwrap().iter().map(OutboundRecord::message_id).collect();
    (instances, outbox)
}

fn check_atomic_commits<S: Storage>(storage: &ChaoticStorage<S>, seed: u64, rounds: usize) {
    let mirror = MemoryStorage::new();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut signatures = Vec::new();

    for _ in 0..rounds {
        let writes = random_write_set(&mut rng, &mirror);
        match storage.commit(&writes) {
            Ok(()) => {
                mirror.commit(&writes).unwrap();
                for op in writes.ops() {
                    if let WriteOp::InsertReplaySignature { signature, .. } = op {
                        signatures.push(signature.clone());
                    }
                }
            },
            Err(StorageError::Io(_)) => {},
            Err(e) => panic!("Unexpected error: {e:?}"),
        }

        // ORACLE: the inner store holds exactly the successful commits
        assert_eq!(contents(storage.inner()), contents(&mirror));
    }

    for signature in &signatures {
        assert!(storage.inner().replay_signature_exists(&OWNER, signature).unwrap());
    }
}

#[test]
fn prop_memory_commits_are_all_or_nothing() {
    proptest!(|(
        failure_rate in 0.0..0.8,
        seed in any::<u64>(),
        rounds in 10usize..60,
    )| {
        let storage = ChaoticStorage::with_seed(MemoryStorage::new(), failure_rate, seed);
        check_atomic_commits(&storage, seed, rounds);
    });
}

#[test]
fn prop_redb_commits_are_all_or_nothing() {
    proptest!(ProptestConfig::with_cases(16), |(
        failure_rate in 0.0..0.8,
        seed in any::<u64>(),
    )| {
        let dir = tempdir().unwrap();
        let inner = RedbStorage::open(dir.path().join("chaos.redb")).unwrap();
        let storage = ChaoticStorage::with_seed(inner, failure_rate, seed);
        check_atomic_commits(&storage, seed, 30);
    });
}

#[test]
fn conflicting_write_set_leaves_store_untouched() {
    let storage = ChaoticStorage::new(MemoryStorage::new(), 0.0);
    let mut first = WriteSet::new();
    first.push(WriteOp::PutInstance { key: instance_key(1), expected_revision: 0, state: vec![1] });
    storage.commit(&first).unwrap();

    // Valid enqueue followed by a stale revision: nothing may land.
    let mut stale = WriteSet::new();
    stale.push(WriteOp::EnqueueOutbound(OutboundRecord {
        envelope: ChannelEnvelope {
            message_id: Uid::from_bytes([9; 32]),
            route: Route::Local { identity: OWNER },
            body: EnvelopeBody::Cleartext(vec![]),
        },
    }));
    stale.push(WriteOp::PutInstance { key: instance_key(1), expected_revision: 0, state: vec![2] });

    assert!(matches!(storage.commit(&stale), Err(StorageError::Conflict { expected: 0, got: 1 })));
    assert!(storage.inner().pending_outbound().unwrap().is_empty());
    assert_eq!(storage.inner().load_instance(&instance_key(1)).unwrap().unwrap().state, vec![1]);
}

type ChaoticNode =
    Node<SimEnv, ChaoticStorage<MemoryStorage>, SimIdentityService, KeyringChallengeService>;
type PlainNode = Node<SimEnv, MemoryStorage, SimIdentityService, KeyringChallengeService>;

fn challenge() -> KeyringChallengeService {
    let mut challenge = KeyringChallengeService::new();
    challenge.insert(SigningSecret::from_bytes(SIGNING_KEY));
    challenge
}

fn identity() -> Identity {
    challenge().insert(SigningSecret::from_bytes(SIGNING_KEY))
}

fn identities(index: usize) -> SimIdentityService {
    let service = SimIdentityService::new();
    service.add_owned_identity(identity(), DEVICES[index]);
    service
}

fn channel(storage: &MemoryStorage, remote: usize) -> Option<ObliviousChannelRecord> {
    let key = ChannelKey {
        owned_identity: identity(),
        remote_identity: identity(),
        remote_device: DEVICES[remote],
    };
    storage.load_channel(&key).unwrap()
}

/// Run `event` on a chaotic node. Storage failures are transient and the
/// event is given up, as a transport would drop an undeliverable envelope.
fn chaotic_event(node: &mut ChaoticNode, event: NodeEvent) -> Vec<NodeAction> {
    match node.process_event(event) {
        Ok(actions) => actions,
        Err(err) => {
            assert!(err.is_transient(), "unexpected permanent error: {err}");
            Vec::new()
        },
    }
}

#[test]
fn prop_handshake_under_storage_chaos() {
    proptest!(ProptestConfig::with_cases(32), |(
        failure_rate in 0.0..0.3,
        seed in any::<u64>(),
    )| {
        let stores = [MemoryStorage::new(), MemoryStorage::new()];
        let ids = [identities(0), identities(1)];

        // Phase 1: pair with a failing store. Anything may be lost, nothing
        // may panic.
        {
            let mut nodes: [ChaoticNode; 2] = [0, 1].map(|i| {
                Node::new(
                    SimEnv::with_seed(seed.wrapping_add(i as u64)),
                    ChaoticStorage::with_seed(stores[i].clone(), failure_rate, seed ^ i as u64),
                    ids[i].clone(),
                    challenge(),
                    EngineConfig::default(),
                )
            });

            let request = NodeEvent::ChannelCreationRequested {
                owned_identity: identity(),
                remote_device: DEVICES[1],
            };
            let mut queue = VecDeque::from([(0, chaotic_event(&mut nodes[0], request))]);
            let mut steps = 0;
            while let Some((sender, actions)) = queue.pop_front() {
                steps += 1;
                prop_assert!(steps < 1_000, "handshake did not settle");
                for action in actions {
                    if let NodeAction::SendEnvelope { message_id, bytes, .. } = action {
                        chaotic_event(&mut nodes[sender], NodeEvent::DeliveryConfirmed { message_id });
                        let receiver = 1 - sender;
                        let out = chaotic_event(&mut nodes[receiver], NodeEvent::EnvelopeReceived { bytes });
                        queue.push_back((receiver, out));
                    }
                }
            }
        }

        // Phase 2: the store recovered. A new request must converge.
        let mut nodes: [PlainNode; 2] = [0, 1].map(|i| {
            Node::new(
                SimEnv::with_seed(seed.wrapping_add(100 + i as u64)),
                stores[i].clone(),
                ids[i].clone(),
                challenge(),
                EngineConfig::default(),
            )
        });
        let actions = nodes[0]
            .process_event(NodeEvent::ChannelCreationRequested {
                owned_identity: identity(),
                remote_device: DEVICES[1],
            })
            .unwrap();
        let mut queue = VecDeque::from([(0, actions)]);
        while let Some((sender, actions)) = queue.pop_front() {
            for action in actions {
                if let NodeAction::SendEnvelope { message_id, bytes, .. } = action {
                    nodes[sender].process_event(NodeEvent::DeliveryConfirmed { message_id }).unwrap();
                    let receiver = 1 - sender;
                    let out = nodes[receiver].process_event(NodeEvent::EnvelopeReceived { bytes }).unwrap();
                    queue.push_back((receiver, out));
                }
            }
        }

        let at_low = channel(&stores[0], 1);
        let at_high = channel(&stores[1], 0);
        prop_assert!(at_low.as_ref().is_some_and(|c| c.confirmed));
        prop_assert!(at_high.as_ref().is_some_and(|c| c.confirmed));
        let (at_low, at_high) = (at_low.unwrap(), at_high.unwrap());
        prop_assert_eq!(&at_low.send_seed, &at_high.receive_seed);
        prop_assert_eq!(&at_low.receive_seed, &at_high.send_seed);
    });
}
