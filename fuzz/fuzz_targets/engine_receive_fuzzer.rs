//! Fuzz target for the engine's receive path
//!
//! Feeds arbitrary relay bytes to an engine with one owned identity. Most
//! inputs fail envelope decoding; the structured half builds a valid
//! envelope around arbitrary protocol message fields so the dispatcher,
//! the step matcher and every step's field decoding get exercised.
//!
//! # Invariants
//!
//! - `receive` never panics
//! - A malformed envelope never creates a channel

#![no_main]

use arbitrary::Arbitrary;
use cairn_core::{Engine, EngineConfig, KeyringChallengeService, MemoryStorage};
use cairn_crypto::SigningSecret;
use cairn_harness::{SimEnv, SimIdentityService};
use cairn_proto::{
    ChannelEnvelope, DeviceUid, Encoded, EnvelopeBody, Identity, ProtocolId, ProtocolMessage,
    Route, Uid,
};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
enum Input {
    Raw(Vec<u8>),
    Message { protocol: u8, instance: [u8; 32], kind: u8, fields: Vec<Field> },
}

#[derive(Debug, Arbitrary)]
enum Field {
    Integer(u64),
    Bytes(Vec<u8>),
    Bool(bool),
}

impl Field {
    fn encode(&self) -> Encoded {
        match self {
            Self::Integer(n) => Encoded::Integer((*n).into()),
            Self::Bytes(b) => Encoded::Bytes(b.clone()),
            Self::Bool(b) => Encoded::Bool(*b),
        }
    }
}

fn envelope(identity: Identity, protocol: u8, instance: [u8; 32], kind: u8, fields: &[Field]) -> Option<Vec<u8>> {
    let protocol_id = ProtocolId::from_u64(u64::from(protocol % 3) + 1)?;
    let message = ProtocolMessage {
        protocol_id,
        instance_uid: Uid::from_bytes(instance),
        kind: u64::from(kind % 8),
        fields: fields.iter().map(Field::encode).collect(),
    };
    let envelope = ChannelEnvelope {
        message_id: Uid::from_bytes([1; 32]),
        route: Route::Asymmetric { to_identity: identity, to_devices: Vec::new(), from_identity: identity },
        body: EnvelopeBody::Cleartext(message.to_bytes().ok()?),
    };
    envelope.to_bytes().ok()
}

fuzz_target!(|input: Input| {
    let mut challenge = KeyringChallengeService::new();
    let identity = challenge.insert(SigningSecret::from_bytes([7; 32]));
    let identities = SimIdentityService::new();
    identities.add_owned_identity(identity, DeviceUid::from_bytes([0x11; 32]));
    let storage = MemoryStorage::new();
    let mut engine =
        Engine::new(SimEnv::with_seed(0), storage.clone(), identities, challenge, EngineConfig::default());

    let bytes = match input {
        Input::Raw(bytes) => bytes,
        Input::Message { protocol, instance, kind, fields } => {
            match envelope(identity, protocol, instance, kind, &fields) {
                Some(bytes) => bytes,
                None => return,
            }
        },
    };

    let _ = engine.receive(&bytes);
    assert_eq!(storage.channel_count(), 0);
});
