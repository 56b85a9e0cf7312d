//! Full ratchet: renew the seed of an existing oblivious channel.
//!
//! Alice is the device that starts the ratchet, Bob the one that answers.
//! Both run two key encapsulations, one under each side's fresh ephemeral
//! key, and derive the new seed from the two encapsulated keys:
//!
//! ```text
//! Alice                                        Bob
//!   │ AliceEphemeralKey(pk_a, counter)           │
//!   │───────────────────────────────────────────▶│ k1 → pk_a
//!   │       BobEphemeralKeyAndK1(pk_b, c1, counter)
//!   │◀───────────────────────────────────────────│
//!   │ k2 → pk_b, seed = H(k1, k2)                │
//!   │ AliceK2(c2, counter, pk_b)                 │
//!   │───────────────────────────────────────────▶│ seed = H(k1, k2)
//!   │                           BobAck(counter)  │ receive seed := seed
//!   │◀───────────────────────────────────────────│
//!   │ send seed := seed                          │
//! ```
//!
//! Only the Alice-to-Bob direction is renewed. Bob switches its receive seed
//! first and keeps the old one, so anything Alice sealed before the switch
//! still opens.
//!
//! Every message travels on the oblivious channel being ratcheted and the
//! instance uid is a digest of both identities and devices, so a resend by
//! Alice lands on Bob's existing instance. A reply only counts for the
//! attempt whose nonce it carries, and k2 names the key of Bob's it was made
//! for, so late copies from another attempt never reach a decapsulation.

use cairn_crypto::{
    KemCiphertext, KemPublicKey, KemSecretKey, Seed, SymmetricKey, domain_digest,
    generate_keypair, kem_decrypt, kem_encrypt,
};
use cairn_proto::{
    DeviceUid, Encoded, FieldReader, FieldWriter, Identity, ProtocolId, Uid, WireError,
};

use super::{
    answers_attempt, fresh_restart_counter, read_ciphertext, read_public_key, read_secret_key,
    read_seed, read_symmetric_key, supersedes_attempt, write_secret_key,
};
use crate::{
    channel::ChannelDescriptor,
    env::Environment,
    error::StepError,
    registry::{
        OriginRule, Protocol, ProtocolMessageBody, ProtocolState, StepContext, StepDescriptor,
        Transition,
    },
    services::{ChallengeService, IdentityService},
    store::Storage,
};

const INSTANCE_UID_DOMAIN: &[u8] = b"cairnFullRatchetInstanceV1";

/// State kind discriminators
pub mod state_kind {
    /// [`super::FullRatchetState::Initial`]
    pub const INITIAL: u64 = 0;
    /// [`super::FullRatchetState::AliceWaitingForK1`]
    pub const ALICE_WAITING_FOR_K1: u64 = 1;
    /// [`super::FullRatchetState::AliceWaitingForAck`]
    pub const ALICE_WAITING_FOR_ACK: u64 = 2;
    /// [`super::FullRatchetState::BobWaitingForK2`]
    pub const BOB_WAITING_FOR_K2: u64 = 3;
    /// [`super::FullRatchetState::Done`]
    pub const DONE: u64 = 4;
    /// [`super::FullRatchetState::Cancelled`]
    pub const CANCELLED: u64 = 5;
}

/// Message kind discriminators
pub mod message_kind {
    /// [`super::FullRatchetMessage::Initial`]
    pub const INITIAL: u64 = 0;
    /// [`super::FullRatchetMessage::AliceEphemeralKey`]
    pub const ALICE_EPHEMERAL_KEY: u64 = 1;
    /// [`super::FullRatchetMessage::BobEphemeralKeyAndK1`]
    pub const BOB_EPHEMERAL_KEY_AND_K1: u64 = 2;
    /// [`super::FullRatchetMessage::AliceK2`]
    pub const ALICE_K2: u64 = 3;
    /// [`super::FullRatchetMessage::BobAck`]
    pub const BOB_ACK: u64 = 4;
}

/// Instance uid shared by both ends of a ratchet between two devices.
pub fn ratchet_instance_uid(
    alice_identity: &Identity,
    bob_identity: &Identity,
    alice_device: &DeviceUid,
    bob_device: &DeviceUid,
) -> Uid {
    Uid::from_bytes(domain_digest(INSTANCE_UID_DOMAIN, &[
        alice_identity.as_bytes(),
        bob_identity.as_bytes(),
        alice_device.as_bytes(),
        bob_device.as_bytes(),
    ]))
}

/// Full ratchet protocol states.
#[derive(Debug, Default)]
pub enum FullRatchetState {
    /// No round in progress
    #[default]
    Initial,

    /// Alice sent her ephemeral key
    AliceWaitingForK1 {
        /// Bob's identity
        contact_identity: Identity,
        /// Bob's device
        contact_device: DeviceUid,
        /// Alice's ephemeral secret, consumed on k1
        ephemeral_secret: KemSecretKey,
        /// Counter of this attempt
        restart_counter: u64,
    },

    /// Alice derived the new seed and sent k2
    AliceWaitingForAck {
        /// Bob's identity
        contact_identity: Identity,
        /// Bob's device
        contact_device: DeviceUid,
        /// New channel seed, applied on Bob's ack
        seed: Seed,
        /// Counter of this attempt
        restart_counter: u64,
    },

    /// Bob sent his ephemeral key and k1
    BobWaitingForK2 {
        /// Alice's identity
        contact_identity: Identity,
        /// Alice's device
        contact_device: DeviceUid,
        /// Bob's ephemeral secret, consumed on k2
        ephemeral_secret: KemSecretKey,
        /// Key Bob encapsulated to Alice
        k1: SymmetricKey,
        /// Counter of this attempt
        restart_counter: u64,
    },

    /// Seed renewed
    Done,

    /// Aborted
    Cancelled,
}

impl ProtocolState for FullRatchetState {
    fn kind(&self) -> u64 {
        match self {
            Self::Initial => state_kind::INITIAL,
            Self::AliceWaitingForK1 { .. } => state_kind::ALICE_WAITING_FOR_K1,
            Self::AliceWaitingForAck { .. } => state_kind::ALICE_WAITING_FOR_ACK,
            Self::BobWaitingForK2 { .. } => state_kind::BOB_WAITING_FOR_K2,
            Self::Done => state_kind::DONE,
            Self::Cancelled => state_kind::CANCELLED,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }

    fn peer(&self, _owned_identity: &Identity) -> Option<(Identity, DeviceUid)> {
        match self {
            Self::AliceWaitingForK1 { contact_identity, contact_device, .. }
            | Self::AliceWaitingForAck { contact_identity, contact_device, .. }
            | Self::BobWaitingForK2 { contact_identity, contact_device, .. } => {
                Some((*contact_identity, *contact_device))
            },
            Self::Initial | Self::Done | Self::Cancelled => None,
        }
    }

    fn encode_fields(&self) -> Vec<Encoded> {
        match self {
            Self::Initial | Self::Done | Self::Cancelled => Vec::new(),
            Self::AliceWaitingForK1 {
                contact_identity,
                contact_device,
                ephemeral_secret,
                restart_counter,
            } => write_secret_key(
                FieldWriter::new().push(contact_identity).push(contact_device),
                ephemeral_secret,
            )
            .push(restart_counter)
            .finish(),
            Self::AliceWaitingForAck { contact_identity, contact_device, seed, restart_counter } => {
                FieldWriter::new()
                    .push(contact_identity)
                    .push(contact_device)
                    .bytes(seed.as_bytes())
                    .push(restart_counter)
                    .finish()
            },
            Self::BobWaitingForK2 {
                contact_identity,
                contact_device,
                ephemeral_secret,
                k1,
                restart_counter,
            } => write_secret_key(
                FieldWriter::new().push(contact_identity).push(contact_device),
                ephemeral_secret,
            )
            .bytes(k1.as_bytes())
            .push(restart_counter)
            .finish(),
        }
    }

    fn decode_fields(kind: u64, fields: &[Encoded]) -> Result<Self, WireError> {
        let mut reader = FieldReader::new(fields, "full ratchet state");
        let state = match kind {
            state_kind::INITIAL => Self::Initial,
            state_kind::ALICE_WAITING_FOR_K1 => Self::AliceWaitingForK1 {
                contact_identity: reader.read()?,
                contact_device: reader.read()?,
                ephemeral_secret: read_secret_key(&mut reader)?,
                restart_counter: reader.read()?,
            },
            state_kind::ALICE_WAITING_FOR_ACK => Self::AliceWaitingForAck {
                contact_identity: reader.read()?,
                contact_device: reader.read()?,
                seed: read_seed(&mut reader)?,
                restart_counter: reader.read()?,
            },
            state_kind::BOB_WAITING_FOR_K2 => Self::BobWaitingForK2 {
                contact_identity: reader.read()?,
                contact_device: reader.read()?,
                ephemeral_secret: read_secret_key(&mut reader)?,
                k1: read_symmetric_key(&mut reader)?,
                restart_counter: reader.read()?,
            },
            state_kind::DONE => Self::Done,
            state_kind::CANCELLED => Self::Cancelled,
            other => return Err(WireError::UnknownKind { context: "full ratchet state", kind: other }),
        };
        Ok(state)
    }
}

/// Full ratchet protocol messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FullRatchetMessage {
    /// Local trigger: start or resend a ratchet with a contact device
    Initial {
        /// Contact identity
        contact_identity: Identity,
        /// Contact device
        contact_device: DeviceUid,
    },

    /// Alice's ephemeral public key
    AliceEphemeralKey {
        /// Alice's ephemeral public key
        public_key: KemPublicKey,
        /// Counter of this attempt
        restart_counter: u64,
    },

    /// Bob's ephemeral public key and k1 encapsulated to Alice
    BobEphemeralKeyAndK1 {
        /// Bob's ephemeral public key
        public_key: KemPublicKey,
        /// k1 ciphertext
        c1: KemCiphertext,
        /// Counter echoed from Alice
        restart_counter: u64,
    },

    /// k2 encapsulated to Bob
    AliceK2 {
        /// k2 ciphertext
        c2: KemCiphertext,
        /// Counter of this attempt
        restart_counter: u64,
        /// Bob's ephemeral key that `c2` was encapsulated to
        responder_key: KemPublicKey,
    },

    /// Bob switched his receive seed
    BobAck {
        /// Counter echoed from Alice
        restart_counter: u64,
    },
}

impl ProtocolMessageBody for FullRatchetMessage {
    fn kind(&self) -> u64 {
        match self {
            Self::Initial { .. } => message_kind::INITIAL,
            Self::AliceEphemeralKey { .. } => message_kind::ALICE_EPHEMERAL_KEY,
            Self::BobEphemeralKeyAndK1 { .. } => message_kind::BOB_EPHEMERAL_KEY_AND_K1,
            Self::AliceK2 { .. } => message_kind::ALICE_K2,
            Self::BobAck { .. } => message_kind::BOB_ACK,
        }
    }

    fn encode_fields(&self) -> Vec<Encoded> {
        let writer = FieldWriter::new();
        match self {
            Self::Initial { contact_identity, contact_device } => {
                writer.push(contact_identity).push(contact_device)
            },
            Self::AliceEphemeralKey { public_key, restart_counter } => {
                writer.bytes(public_key.as_bytes()).push(restart_counter)
            },
            Self::BobEphemeralKeyAndK1 { public_key, c1, restart_counter } => {
                writer.bytes(public_key.as_bytes()).bytes(c1.as_bytes()).push(restart_counter)
            },
            Self::AliceK2 { c2, restart_counter, responder_key } => {
                writer.bytes(c2.as_bytes()).push(restart_counter).bytes(responder_key.as_bytes())
            },
            Self::BobAck { restart_counter } => writer.push(restart_counter),
        }
        .finish()
    }

    fn decode_fields(kind: u64, fields: &[Encoded]) -> Result<Option<Self>, WireError> {
        let mut reader = FieldReader::new(fields, "full ratchet message");
        let message = match kind {
            message_kind::INITIAL => Self::Initial {
                contact_identity: reader.read()?,
                contact_device: reader.read()?,
            },
            message_kind::ALICE_EPHEMERAL_KEY => Self::AliceEphemeralKey {
                public_key: read_public_key(&mut reader)?,
                restart_counter: reader.read()?,
            },
            message_kind::BOB_EPHEMERAL_KEY_AND_K1 => Self::BobEphemeralKeyAndK1 {
                public_key: read_public_key(&mut reader)?,
                c1: read_ciphertext(&mut reader)?,
                restart_counter: reader.read()?,
            },
            message_kind::ALICE_K2 => Self::AliceK2 {
                c2: read_ciphertext(&mut reader)?,
                restart_counter: reader.read()?,
                responder_key: read_public_key(&mut reader)?,
            },
            message_kind::BOB_ACK => Self::BobAck { restart_counter: reader.read()? },
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}

/// Full ratchet steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullRatchetStep {
    /// Alice: start a round, or restart one with a bumped counter
    AliceSendEphemeralKey,
    /// Bob: answer a (possibly restarted) round with k1
    BobSendEphemeralKeyAndK1,
    /// Alice: recover k1, send k2, derive the seed
    AliceRecoverK1AndSendK2,
    /// Bob: recover k2, switch the receive seed, ack
    BobRecoverK2AndSendAck,
    /// Alice: switch the send seed
    AliceUpdateSendSeed,
}

/// Full ratchet protocol (id 2).
#[derive(Debug)]
pub struct FullRatchet;

impl Protocol for FullRatchet {
    const ID: ProtocolId = ProtocolId::FullRatchet;
    const STEPS: &'static [StepDescriptor<FullRatchetStep>] = &[
        StepDescriptor {
            step: FullRatchetStep::AliceSendEphemeralKey,
            state: state_kind::INITIAL,
            message: message_kind::INITIAL,
            origin: OriginRule::Local,
        },
        StepDescriptor {
            step: FullRatchetStep::AliceSendEphemeralKey,
            state: state_kind::ALICE_WAITING_FOR_K1,
            message: message_kind::INITIAL,
            origin: OriginRule::Local,
        },
        StepDescriptor {
            step: FullRatchetStep::AliceSendEphemeralKey,
            state: state_kind::ALICE_WAITING_FOR_ACK,
            message: message_kind::INITIAL,
            origin: OriginRule::Local,
        },
        StepDescriptor {
            step: FullRatchetStep::BobSendEphemeralKeyAndK1,
            state: state_kind::INITIAL,
            message: message_kind::ALICE_EPHEMERAL_KEY,
            origin: OriginRule::AnyOblivious,
        },
        StepDescriptor {
            step: FullRatchetStep::BobSendEphemeralKeyAndK1,
            state: state_kind::BOB_WAITING_FOR_K2,
            message: message_kind::ALICE_EPHEMERAL_KEY,
            origin: OriginRule::ObliviousWithPeer,
        },
        StepDescriptor {
            step: FullRatchetStep::AliceRecoverK1AndSendK2,
            state: state_kind::ALICE_WAITING_FOR_K1,
            message: message_kind::BOB_EPHEMERAL_KEY_AND_K1,
            origin: OriginRule::ObliviousWithPeer,
        },
        StepDescriptor {
            step: FullRatchetStep::BobRecoverK2AndSendAck,
            state: state_kind::BOB_WAITING_FOR_K2,
            message: message_kind::ALICE_K2,
            origin: OriginRule::ObliviousWithPeer,
        },
        StepDescriptor {
            step: FullRatchetStep::AliceUpdateSendSeed,
            state: state_kind::ALICE_WAITING_FOR_ACK,
            message: message_kind::BOB_ACK,
            origin: OriginRule::ObliviousWithPeer,
        },
    ];

    type Message = FullRatchetMessage;
    type State = FullRatchetState;
    type Step = FullRatchetStep;

    fn execute<E, S, I, C>(
        step: FullRatchetStep,
        ctx: &mut StepContext<'_, E, S, I, C>,
        state: FullRatchetState,
        message: FullRatchetMessage,
    ) -> Result<Transition<FullRatchetState>, StepError>
    where
        E: Environment,
        S: Storage,
        I: IdentityService,
        C: ChallengeService,
    {
        use FullRatchetMessage as M;
        use FullRatchetState as St;
        use FullRatchetStep as Step;

        match (step, state, message) {
            (
                Step::AliceSendEphemeralKey,
                state,
                M::Initial { contact_identity, contact_device },
            ) => alice_send_ephemeral_key(ctx, state, contact_identity, contact_device),

            (
                Step::BobSendEphemeralKeyAndK1,
                state,
                M::AliceEphemeralKey { public_key, restart_counter },
            ) => bob_send_ephemeral_key_and_k1(ctx, state, &public_key, restart_counter),

            (
                Step::AliceRecoverK1AndSendK2,
                St::AliceWaitingForK1 {
                    contact_identity,
                    contact_device,
                    ephemeral_secret,
                    restart_counter,
                },
                M::BobEphemeralKeyAndK1 { public_key, c1, restart_counter: received },
            ) => {
                if !answers_attempt(restart_counter, received) {
                    return Ok(Transition::Unchanged);
                }

                let k1 = kem_decrypt(&c1, &ephemeral_secret)?;
                drop(ephemeral_secret);
                let (c2, k2) = kem_encrypt(&public_key, ctx.env.random_array())?;
                let seed = Seed::from_keys(&[&k1, &k2]);

                ctx.post::<FullRatchet>(
                    &M::AliceK2 { c2, restart_counter, responder_key: public_key },
                    &ChannelDescriptor::oblivious_to(contact_identity, contact_device, true),
                )?;

                Ok(Transition::Advance(St::AliceWaitingForAck {
                    contact_identity,
                    contact_device,
                    seed,
                    restart_counter,
                }))
            },

            (
                Step::BobRecoverK2AndSendAck,
                St::BobWaitingForK2 {
                    contact_identity,
                    contact_device,
                    ephemeral_secret,
                    k1,
                    restart_counter,
                },
                M::AliceK2 { c2, restart_counter: received, responder_key },
            ) => {
                // A k2 made for another of Bob's ephemeral keys would decapsulate
                // to garbage rather than fail.
                if !answers_attempt(restart_counter, received)
                    || responder_key != ephemeral_secret.public_key()
                {
                    return Ok(Transition::Unchanged);
                }

                let k2 = kem_decrypt(&c2, &ephemeral_secret)?;
                drop(ephemeral_secret);
                let seed = Seed::from_keys(&[&k1, &k2]);

                ctx.tx.update_receive_seed(contact_identity, contact_device, &seed)?;
                ctx.post::<FullRatchet>(
                    &M::BobAck { restart_counter },
                    &ChannelDescriptor::oblivious_to(contact_identity, contact_device, true),
                )?;

                tracing::info!(
                    contact = %contact_identity,
                    device = %contact_device,
                    "receive seed renewed"
                );
                Ok(Transition::Advance(St::Done))
            },

            (
                Step::AliceUpdateSendSeed,
                St::AliceWaitingForAck { contact_identity, contact_device, seed, restart_counter },
                M::BobAck { restart_counter: received },
            ) => {
                if !answers_attempt(restart_counter, received) {
                    return Ok(Transition::Unchanged);
                }

                ctx.tx.update_send_seed(contact_identity, contact_device, &seed)?;

                tracing::info!(
                    contact = %contact_identity,
                    device = %contact_device,
                    "send seed renewed"
                );
                Ok(Transition::Advance(St::Done))
            },

            (_, state, message) => {
                Err(StepError::UnexpectedInput { state: state.kind(), message: message.kind() })
            },
        }
    }
}

fn alice_send_ephemeral_key<E, S, I, C>(
    ctx: &mut StepContext<'_, E, S, I, C>,
    state: FullRatchetState,
    contact_identity: Identity,
    contact_device: DeviceUid,
) -> Result<Transition<FullRatchetState>, StepError>
where
    E: Environment,
    S: Storage,
{
    let expected_uid = ratchet_instance_uid(
        &ctx.owned_identity(),
        &contact_identity,
        &ctx.current_device(),
        &contact_device,
    );
    if ctx.instance_uid != expected_uid {
        tracing::warn!(instance = %ctx.instance_uid, "ratchet started with a foreign instance uid");
        return Ok(Transition::Cancelled);
    }

    let restart_counter = match state {
        FullRatchetState::Initial => fresh_restart_counter(ctx.env),
        FullRatchetState::AliceWaitingForK1 {
            contact_identity: stored_identity,
            contact_device: stored_device,
            restart_counter,
            ..
        }
        | FullRatchetState::AliceWaitingForAck {
            contact_identity: stored_identity,
            contact_device: stored_device,
            restart_counter,
            ..
        } => {
            if (stored_identity, stored_device) != (contact_identity, contact_device) {
                tracing::warn!(instance = %ctx.instance_uid, "ratchet resend for another contact");
                return Ok(Transition::Cancelled);
            }
            restart_counter + 1
        },
        other => {
            return Err(StepError::UnexpectedInput {
                state: other.kind(),
                message: message_kind::INITIAL,
            });
        },
    };

    let (ephemeral_secret, public_key) = generate_keypair(ctx.env.random_array());
    ctx.post::<FullRatchet>(
        &FullRatchetMessage::AliceEphemeralKey { public_key, restart_counter },
        &ChannelDescriptor::oblivious_to(contact_identity, contact_device, true),
    )?;

    Ok(Transition::Advance(FullRatchetState::AliceWaitingForK1 {
        contact_identity,
        contact_device,
        ephemeral_secret,
        restart_counter,
    }))
}

fn bob_send_ephemeral_key_and_k1<E, S, I, C>(
    ctx: &mut StepContext<'_, E, S, I, C>,
    state: FullRatchetState,
    alice_public_key: &KemPublicKey,
    restart_counter: u64,
) -> Result<Transition<FullRatchetState>, StepError>
where
    E: Environment,
    S: Storage,
{
    if let FullRatchetState::BobWaitingForK2 { restart_counter: stored, .. } = &state {
        if !supersedes_attempt(*stored, restart_counter) {
            return Ok(Transition::Unchanged);
        }
    }
    drop(state);

    let Some((contact_identity, contact_device)) = ctx.oblivious_origin() else {
        return Ok(Transition::Cancelled);
    };

    let expected_uid = ratchet_instance_uid(
        &contact_identity,
        &ctx.owned_identity(),
        &contact_device,
        &ctx.current_device(),
    );
    if ctx.instance_uid != expected_uid {
        tracing::warn!(instance = %ctx.instance_uid, "ratchet instance uid does not match the channel");
        return Ok(Transition::Cancelled);
    }

    let (ephemeral_secret, public_key) = generate_keypair(ctx.env.random_array());
    let (c1, k1) = kem_encrypt(alice_public_key, ctx.env.random_array())?;

    ctx.post::<FullRatchet>(
        &FullRatchetMessage::BobEphemeralKeyAndK1 { public_key, c1, restart_counter },
        &ChannelDescriptor::oblivious_to(contact_identity, contact_device, true),
    )?;

    Ok(Transition::Advance(FullRatchetState::BobWaitingForK2 {
        contact_identity,
        contact_device,
        ephemeral_secret,
        k1,
        restart_counter,
    }))
}
