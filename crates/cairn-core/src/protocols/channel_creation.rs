//! Channel creation between two devices of the same identity.
//!
//! Both devices hold the identity's signing key, so each proves membership by
//! signing a challenge that binds its own device uid, the recipient's device
//! uid and the identity. Pings travel on the asymmetric channel; the
//! oblivious channel only exists once both KEM keys have been recovered.
//!
//! ```text
//! A (larger uid)                                B (smaller uid)
//!   │ Ping(sig_a)                                 │
//!   │────────────────────────────────────────────▶│ initiator
//!   │        AliceIdentityAndEphemeralKey(sig_b, pk_b, counter)
//!   │◀────────────────────────────────────────────│
//!   │ BobEphemeralKeyAndK1(pk_a, c1, counter)      │
//!   │────────────────────────────────────────────▶│ create channel
//!   │                              K2(c2, counter) │
//!   │◀────────────────────────────────────────────│
//!   │ create channel                              │
//!   │ FirstAck(counter)             [oblivious]    │
//!   │────────────────────────────────────────────▶│ confirm
//!   │                    SecondAck(counter) [oblivious]
//!   │◀────────────────────────────────────────────│
//!   │ confirm                                     │
//! ```
//!
//! A ping received by the device with the smaller uid starts the exchange;
//! the device with the larger uid answers a ping with a ping of its own and
//! forgets about it. When both devices ping at once, only the larger one's
//! ping gets an ephemeral key back, so the two attempts collapse into one.
//!
//! Every ping first clears what a previous attempt left behind: the channel
//! with the remote device and any instance indexed for it. A handshake that
//! would create a channel that already exists tears it down and starts over
//! with a fresh ping instead.

use cairn_crypto::{
    CHALLENGE_RESPONSE_SIZE, KemCiphertext, KemPublicKey, KemSecretKey, Seed, SymmetricKey,
    generate_keypair, kem_decrypt, kem_encrypt,
};
use cairn_proto::{DeviceUid, Encoded, FieldReader, FieldWriter, Identity, ProtocolId, WireError};

use super::{
    device_capabilities::{DeviceCapabilities, DeviceCapabilitiesMessage},
    fresh_restart_counter, read_ciphertext, read_public_key, read_secret_key, read_symmetric_key,
    write_secret_key,
};
use crate::{
    channel::ChannelDescriptor,
    env::Environment,
    error::StepError,
    registry::{
        OriginRule, Protocol, ProtocolMessageBody, ProtocolState, StepContext, StepDescriptor,
        Transition,
    },
    services::{ChallengeService, IdentityService, channel_creation_challenge},
    store::{Storage, StorageError},
};

/// State kind discriminators
pub mod state_kind {
    /// [`super::ChannelCreationState::Initial`]
    pub const INITIAL: u64 = 0;
    /// [`super::ChannelCreationState::PingSent`]
    pub const PING_SENT: u64 = 1;
    /// [`super::ChannelCreationState::WaitingForK1`]
    pub const WAITING_FOR_K1: u64 = 2;
    /// [`super::ChannelCreationState::WaitingForK2`]
    pub const WAITING_FOR_K2: u64 = 3;
    /// [`super::ChannelCreationState::WaitForFirstAck`]
    pub const WAIT_FOR_FIRST_ACK: u64 = 4;
    /// [`super::ChannelCreationState::WaitForSecondAck`]
    pub const WAIT_FOR_SECOND_ACK: u64 = 5;
    /// [`super::ChannelCreationState::ChannelConfirmed`]
    pub const CHANNEL_CONFIRMED: u64 = 6;
    /// [`super::ChannelCreationState::Cancelled`]
    pub const CANCELLED: u64 = 7;
}

/// Message kind discriminators
pub mod message_kind {
    /// [`super::ChannelCreationMessage::Initial`]
    pub const INITIAL: u64 = 0;
    /// [`super::ChannelCreationMessage::Ping`]
    pub const PING: u64 = 1;
    /// [`super::ChannelCreationMessage::AliceIdentityAndEphemeralKey`]
    pub const ALICE_IDENTITY_AND_EPHEMERAL_KEY: u64 = 2;
    /// [`super::ChannelCreationMessage::BobEphemeralKeyAndK1`]
    pub const BOB_EPHEMERAL_KEY_AND_K1: u64 = 3;
    /// [`super::ChannelCreationMessage::K2`]
    pub const K2: u64 = 4;
    /// [`super::ChannelCreationMessage::FirstAck`]
    pub const FIRST_ACK: u64 = 5;
    /// [`super::ChannelCreationMessage::SecondAck`]
    pub const SECOND_ACK: u64 = 6;
}

/// Channel creation states.
#[derive(Debug, Default)]
pub enum ChannelCreationState {
    /// Nothing sent or received yet
    #[default]
    Initial,

    /// Answered with a ping; the other device drives the exchange
    PingSent,

    /// Initiator sent its ephemeral key
    WaitingForK1 {
        /// Other device
        remote_device: DeviceUid,
        /// Initiator's ephemeral secret
        ephemeral_secret: KemSecretKey,
        /// Counter of this attempt
        restart_counter: u64,
    },

    /// Responder sent its ephemeral key and k1
    WaitingForK2 {
        /// Other device
        remote_device: DeviceUid,
        /// Responder's ephemeral secret
        ephemeral_secret: KemSecretKey,
        /// Key the responder encapsulated
        k1: SymmetricKey,
        /// Counter of this attempt
        restart_counter: u64,
    },

    /// Initiator created the channel and sent k2
    WaitForFirstAck {
        /// Other device
        remote_device: DeviceUid,
        /// Counter of this attempt
        restart_counter: u64,
    },

    /// Responder created the channel and sent the first ack
    WaitForSecondAck {
        /// Other device
        remote_device: DeviceUid,
        /// Counter of this attempt
        restart_counter: u64,
    },

    /// Channel confirmed on this side
    ChannelConfirmed,

    /// Aborted
    Cancelled,
}

impl ChannelCreationState {
    fn remote_device(&self) -> Option<DeviceUid> {
        match self {
            Self::WaitingForK1 { remote_device, .. }
            | Self::WaitingForK2 { remote_device, .. }
            | Self::WaitForFirstAck { remote_device, .. }
            | Self::WaitForSecondAck { remote_device, .. } => Some(*remote_device),
            Self::Initial | Self::PingSent | Self::ChannelConfirmed | Self::Cancelled => None,
        }
    }
}

impl ProtocolState for ChannelCreationState {
    fn kind(&self) -> u64 {
        match self {
            Self::Initial => state_kind::INITIAL,
            Self::PingSent => state_kind::PING_SENT,
            Self::WaitingForK1 { .. } => state_kind::WAITING_FOR_K1,
            Self::WaitingForK2 { .. } => state_kind::WAITING_FOR_K2,
            Self::WaitForFirstAck { .. } => state_kind::WAIT_FOR_FIRST_ACK,
            Self::WaitForSecondAck { .. } => state_kind::WAIT_FOR_SECOND_ACK,
            Self::ChannelConfirmed => state_kind::CHANNEL_CONFIRMED,
            Self::Cancelled => state_kind::CANCELLED,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::PingSent | Self::ChannelConfirmed | Self::Cancelled)
    }

    fn peer(&self, owned_identity: &Identity) -> Option<(Identity, DeviceUid)> {
        self.remote_device().map(|device| (*owned_identity, device))
    }

    fn encode_fields(&self) -> Vec<Encoded> {
        match self {
            Self::Initial | Self::PingSent | Self::ChannelConfirmed | Self::Cancelled => Vec::new(),
            Self::WaitingForK1 { remote_device, ephemeral_secret, restart_counter } => {
                write_secret_key(FieldWriter::new().push(remote_device), ephemeral_secret)
                    .push(restart_counter)
                    .finish()
            },
            Self::WaitingForK2 { remote_device, ephemeral_secret, k1, restart_counter } => {
                write_secret_key(FieldWriter::new().push(remote_device), ephemeral_secret)
                    .bytes(k1.as_bytes())
                    .push(restart_counter)
                    .finish()
            },
            Self::WaitForFirstAck { remote_device, restart_counter }
            | Self::WaitForSecondAck { remote_device, restart_counter } => {
                FieldWriter::new().push(remote_device).push(restart_counter).finish()
            },
        }
    }

    fn decode_fields(kind: u64, fields: &[Encoded]) -> Result<Self, WireError> {
        let mut reader = FieldReader::new(fields, "channel creation state");
        let state = match kind {
            state_kind::INITIAL => Self::Initial,
            state_kind::PING_SENT => Self::PingSent,
            state_kind::WAITING_FOR_K1 => Self::WaitingForK1 {
                remote_device: reader.read()?,
                ephemeral_secret: read_secret_key(&mut reader)?,
                restart_counter: reader.read()?,
            },
            state_kind::WAITING_FOR_K2 => Self::WaitingForK2 {
                remote_device: reader.read()?,
                ephemeral_secret: read_secret_key(&mut reader)?,
                k1: read_symmetric_key(&mut reader)?,
                restart_counter: reader.read()?,
            },
            state_kind::WAIT_FOR_FIRST_ACK => Self::WaitForFirstAck {
                remote_device: reader.read()?,
                restart_counter: reader.read()?,
            },
            state_kind::WAIT_FOR_SECOND_ACK => Self::WaitForSecondAck {
                remote_device: reader.read()?,
                restart_counter: reader.read()?,
            },
            state_kind::CHANNEL_CONFIRMED => Self::ChannelConfirmed,
            state_kind::CANCELLED => Self::Cancelled,
            other => {
                return Err(WireError::UnknownKind { context: "channel creation state", kind: other });
            },
        };
        Ok(state)
    }
}

/// Channel creation messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelCreationMessage {
    /// Local trigger: ping another device of the owned identity
    Initial {
        /// Device to ping
        remote_device: DeviceUid,
    },

    /// Signed ping
    Ping {
        /// Sender device
        device: DeviceUid,
        /// Challenge response over (sender, recipient, identity)
        signature: Vec<u8>,
    },

    /// Initiator's signed ping with its ephemeral key
    AliceIdentityAndEphemeralKey {
        /// Sender device
        device: DeviceUid,
        /// Challenge response over (sender, recipient, identity)
        signature: Vec<u8>,
        /// Initiator's ephemeral public key
        public_key: KemPublicKey,
        /// Counter of this attempt
        restart_counter: u64,
    },

    /// Responder's ephemeral key and k1
    BobEphemeralKeyAndK1 {
        /// Responder's ephemeral public key
        public_key: KemPublicKey,
        /// k1 ciphertext
        c1: KemCiphertext,
        /// Counter echoed from the initiator
        restart_counter: u64,
    },

    /// k2 encapsulated to the responder
    K2 {
        /// k2 ciphertext
        c2: KemCiphertext,
        /// Counter of this attempt
        restart_counter: u64,
    },

    /// Responder holds the channel
    FirstAck {
        /// Counter of this attempt
        restart_counter: u64,
    },

    /// Initiator confirmed the channel
    SecondAck {
        /// Counter of this attempt
        restart_counter: u64,
    },
}

impl ProtocolMessageBody for ChannelCreationMessage {
    fn kind(&self) -> u64 {
        match self {
            Self::Initial { .. } => message_kind::INITIAL,
            Self::Ping { .. } => message_kind::PING,
            Self::AliceIdentityAndEphemeralKey { .. } => {
                message_kind::ALICE_IDENTITY_AND_EPHEMERAL_KEY
            },
            Self::BobEphemeralKeyAndK1 { .. } => message_kind::BOB_EPHEMERAL_KEY_AND_K1,
            Self::K2 { .. } => message_kind::K2,
            Self::FirstAck { .. } => message_kind::FIRST_ACK,
            Self::SecondAck { .. } => message_kind::SECOND_ACK,
        }
    }

    fn encode_fields(&self) -> Vec<Encoded> {
        let writer = FieldWriter::new();
        match self {
            Self::Initial { remote_device } => writer.push(remote_device),
            Self::Ping { device, signature } => writer.push(device).bytes(signature),
            Self::AliceIdentityAndEphemeralKey { device, signature, public_key, restart_counter } => {
                writer
                    .push(device)
                    .bytes(signature)
                    .bytes(public_key.as_bytes())
                    .push(restart_counter)
            },
            Self::BobEphemeralKeyAndK1 { public_key, c1, restart_counter } => {
                writer.bytes(public_key.as_bytes()).bytes(c1.as_bytes()).push(restart_counter)
            },
            Self::K2 { c2, restart_counter } => writer.bytes(c2.as_bytes()).push(restart_counter),
            Self::FirstAck { restart_counter } | Self::SecondAck { restart_counter } => {
                writer.push(restart_counter)
            },
        }
        .finish()
    }

    fn decode_fields(kind: u64, fields: &[Encoded]) -> Result<Option<Self>, WireError> {
        let mut reader = FieldReader::new(fields, "channel creation message");
        let message = match kind {
            message_kind::INITIAL => Self::Initial { remote_device: reader.read()? },
            message_kind::PING => Self::Ping {
                device: reader.read()?,
                signature: read_signature(&mut reader)?,
            },
            message_kind::ALICE_IDENTITY_AND_EPHEMERAL_KEY => Self::AliceIdentityAndEphemeralKey {
                device: reader.read()?,
                signature: read_signature(&mut reader)?,
                public_key: read_public_key(&mut reader)?,
                restart_counter: reader.read()?,
            },
            message_kind::BOB_EPHEMERAL_KEY_AND_K1 => Self::BobEphemeralKeyAndK1 {
                public_key: read_public_key(&mut reader)?,
                c1: read_ciphertext(&mut reader)?,
                restart_counter: reader.read()?,
            },
            message_kind::K2 => Self::K2 {
                c2: read_ciphertext(&mut reader)?,
                restart_counter: reader.read()?,
            },
            message_kind::FIRST_ACK => Self::FirstAck { restart_counter: reader.read()? },
            message_kind::SECOND_ACK => Self::SecondAck { restart_counter: reader.read()? },
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}

fn read_signature(reader: &mut FieldReader<'_>) -> Result<Vec<u8>, WireError> {
    Ok(reader.array::<CHALLENGE_RESPONSE_SIZE>()?.to_vec())
}

/// Channel creation steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelCreationStep {
    /// Clear leftovers and ping the remote device
    SendPing,
    /// Check a ping and either ping back or start the key exchange
    SendPingOrEphemeralKey,
    /// Check the initiator's ping and answer with k1
    SendEphemeralKeyAndK1,
    /// Recover k1, create the channel, send k2
    RecoverK1AndSendK2,
    /// Recover k2, create the channel, send the first ack
    RecoverK2AndSendFirstAck,
    /// Confirm the channel and send the second ack
    ConfirmChannelAndSendSecondAck,
    /// Confirm the channel
    ConfirmChannel,
}

/// Owned-device channel creation protocol (id 1).
#[derive(Debug)]
pub struct ChannelCreationWithOwnedDevice;

impl Protocol for ChannelCreationWithOwnedDevice {
    const ID: ProtocolId = ProtocolId::ChannelCreationWithOwnedDevice;
    const STEPS: &'static [StepDescriptor<ChannelCreationStep>] = &[
        StepDescriptor {
            step: ChannelCreationStep::SendPing,
            state: state_kind::INITIAL,
            message: message_kind::INITIAL,
            origin: OriginRule::Local,
        },
        StepDescriptor {
            step: ChannelCreationStep::SendPingOrEphemeralKey,
            state: state_kind::INITIAL,
            message: message_kind::PING,
            origin: OriginRule::Asymmetric,
        },
        StepDescriptor {
            step: ChannelCreationStep::SendEphemeralKeyAndK1,
            state: state_kind::INITIAL,
            message: message_kind::ALICE_IDENTITY_AND_EPHEMERAL_KEY,
            origin: OriginRule::Asymmetric,
        },
        StepDescriptor {
            step: ChannelCreationStep::RecoverK1AndSendK2,
            state: state_kind::WAITING_FOR_K1,
            message: message_kind::BOB_EPHEMERAL_KEY_AND_K1,
            origin: OriginRule::Asymmetric,
        },
        StepDescriptor {
            step: ChannelCreationStep::RecoverK2AndSendFirstAck,
            state: state_kind::WAITING_FOR_K2,
            message: message_kind::K2,
            origin: OriginRule::Asymmetric,
        },
        StepDescriptor {
            step: ChannelCreationStep::ConfirmChannelAndSendSecondAck,
            state: state_kind::WAIT_FOR_FIRST_ACK,
            message: message_kind::FIRST_ACK,
            origin: OriginRule::ObliviousWithPeer,
        },
        StepDescriptor {
            step: ChannelCreationStep::ConfirmChannel,
            state: state_kind::WAIT_FOR_SECOND_ACK,
            message: message_kind::SECOND_ACK,
            origin: OriginRule::ObliviousWithPeer,
        },
    ];

    type Message = ChannelCreationMessage;
    type State = ChannelCreationState;
    type Step = ChannelCreationStep;

    fn execute<E, S, I, C>(
        step: ChannelCreationStep,
        ctx: &mut StepContext<'_, E, S, I, C>,
        state: ChannelCreationState,
        message: ChannelCreationMessage,
    ) -> Result<Transition<ChannelCreationState>, StepError>
    where
        E: Environment,
        S: Storage,
        I: IdentityService,
        C: ChallengeService,
    {
        use ChannelCreationMessage as M;
        use ChannelCreationState as St;
        use ChannelCreationStep as Step;

        match (step, state, message) {
            (Step::SendPing, St::Initial, M::Initial { remote_device }) => {
                send_ping(ctx, remote_device)
            },

            (Step::SendPingOrEphemeralKey, St::Initial, M::Ping { device, signature }) => {
                send_ping_or_ephemeral_key(ctx, device, &signature)
            },

            (
                Step::SendEphemeralKeyAndK1,
                St::Initial,
                M::AliceIdentityAndEphemeralKey { device, signature, public_key, restart_counter },
            ) => send_ephemeral_key_and_k1(ctx, device, &signature, &public_key, restart_counter),

            (
                Step::RecoverK1AndSendK2,
                St::WaitingForK1 { remote_device, ephemeral_secret, restart_counter },
                M::BobEphemeralKeyAndK1 { public_key, c1, restart_counter: received },
            ) => {
                if received != restart_counter {
                    return Ok(Transition::Unchanged);
                }

                let k1 = kem_decrypt(&c1, &ephemeral_secret)?;
                drop(ephemeral_secret);
                let (c2, k2) = kem_encrypt(&public_key, ctx.env.random_array())?;
                let seed = Seed::from_keys(&[&k1, &k2]);

                if !create_channel(ctx, remote_device, &seed)? {
                    return restart(ctx, remote_device);
                }

                let owned = ctx.owned_identity();
                ctx.post::<Self>(
                    &M::K2 { c2, restart_counter },
                    &ChannelDescriptor::asymmetric_to(owned, remote_device),
                )?;
                Ok(Transition::Advance(St::WaitForFirstAck { remote_device, restart_counter }))
            },

            (
                Step::RecoverK2AndSendFirstAck,
                St::WaitingForK2 { remote_device, ephemeral_secret, k1, restart_counter },
                M::K2 { c2, restart_counter: received },
            ) => {
                if received != restart_counter {
                    return Ok(Transition::Unchanged);
                }

                let k2 = kem_decrypt(&c2, &ephemeral_secret)?;
                drop(ephemeral_secret);
                let seed = Seed::from_keys(&[&k1, &k2]);

                if !create_channel(ctx, remote_device, &seed)? {
                    return restart(ctx, remote_device);
                }

                let owned = ctx.owned_identity();
                ctx.post::<Self>(
                    &M::FirstAck { restart_counter },
                    &ChannelDescriptor::oblivious_to(owned, remote_device, false),
                )?;
                Ok(Transition::Advance(St::WaitForSecondAck { remote_device, restart_counter }))
            },

            (
                Step::ConfirmChannelAndSendSecondAck,
                St::WaitForFirstAck { remote_device, restart_counter },
                M::FirstAck { restart_counter: received },
            ) => {
                if received != restart_counter {
                    return Ok(Transition::Unchanged);
                }

                let owned = ctx.owned_identity();
                confirm_channel(ctx, remote_device)?;
                ctx.post::<Self>(
                    &M::SecondAck { restart_counter },
                    &ChannelDescriptor::oblivious_to(owned, remote_device, true),
                )?;
                announce_capabilities(ctx, remote_device);
                Ok(Transition::Advance(St::ChannelConfirmed))
            },

            (
                Step::ConfirmChannel,
                St::WaitForSecondAck { remote_device, restart_counter },
                M::SecondAck { restart_counter: received },
            ) => {
                if received != restart_counter {
                    return Ok(Transition::Unchanged);
                }

                confirm_channel(ctx, remote_device)?;
                announce_capabilities(ctx, remote_device);
                Ok(Transition::Advance(St::ChannelConfirmed))
            },

            (_, state, message) => {
                Err(StepError::UnexpectedInput { state: state.kind(), message: message.kind() })
            },
        }
    }
}

/// Delete the channel with `remote_device` and every instance indexed for
/// it, except the running one.
fn clear_previous_attempts<E, S, I, C>(
    ctx: &mut StepContext<'_, E, S, I, C>,
    remote_device: DeviceUid,
) -> Result<(), StorageError>
where
    E: Environment,
    S: Storage,
{
    let owned = ctx.owned_identity();
    for uid in ctx.tx.delete_owned_device_instances(&remote_device)? {
        if uid != ctx.instance_uid {
            tracing::debug!(instance = %uid, "aborting previous channel creation");
            ctx.tx.abort_instance(ChannelCreationWithOwnedDevice::ID, uid);
        }
    }
    ctx.tx.delete_oblivious_channel(owned, remote_device);
    Ok(())
}

/// Sign the ping challenge for `remote_device`.
fn sign_ping<E, S, I, C>(
    ctx: &StepContext<'_, E, S, I, C>,
    remote_device: &DeviceUid,
) -> Result<Vec<u8>, StepError>
where
    E: Environment,
    S: Storage,
    C: ChallengeService,
{
    let owned = ctx.owned_identity();
    let challenge = channel_creation_challenge(&ctx.current_device(), remote_device, &owned);
    let response = ctx.challenge.solve(&challenge, &owned, ctx.env.random_array())?;
    Ok(response.to_vec())
}

/// Check a signature received from `remote_device` and consume it.
fn check_ping<E, S, I, C>(
    ctx: &mut StepContext<'_, E, S, I, C>,
    remote_device: &DeviceUid,
    signature: &[u8],
) -> Result<(), StepError>
where
    E: Environment,
    S: Storage,
    C: ChallengeService,
{
    let owned = ctx.owned_identity();
    let challenge = channel_creation_challenge(remote_device, &ctx.current_device(), &owned);
    if !ctx.challenge.verify(signature, &challenge, &owned) {
        return Err(StepError::InvalidSignature);
    }
    ctx.tx.record_signature(signature)?;
    Ok(())
}

fn send_ping<E, S, I, C>(
    ctx: &mut StepContext<'_, E, S, I, C>,
    remote_device: DeviceUid,
) -> Result<Transition<ChannelCreationState>, StepError>
where
    E: Environment,
    S: Storage,
    C: ChallengeService,
{
    let current = ctx.current_device();
    if remote_device == current {
        tracing::warn!(instance = %ctx.instance_uid, "refusing to ping the current device");
        return Ok(Transition::Cancelled);
    }

    clear_previous_attempts(ctx, remote_device)?;

    let owned = ctx.owned_identity();
    let signature = sign_ping(ctx, &remote_device)?;
    ctx.post::<ChannelCreationWithOwnedDevice>(
        &ChannelCreationMessage::Ping { device: current, signature },
        &ChannelDescriptor::asymmetric_to(owned, remote_device),
    )?;
    Ok(Transition::Advance(ChannelCreationState::PingSent))
}

fn send_ping_or_ephemeral_key<E, S, I, C>(
    ctx: &mut StepContext<'_, E, S, I, C>,
    remote_device: DeviceUid,
    signature: &[u8],
) -> Result<Transition<ChannelCreationState>, StepError>
where
    E: Environment,
    S: Storage,
    C: ChallengeService,
{
    let current = ctx.current_device();
    if remote_device == current {
        tracing::warn!(instance = %ctx.instance_uid, "ping claims to come from the current device");
        return Ok(Transition::Cancelled);
    }

    check_ping(ctx, &remote_device, signature)?;
    clear_previous_attempts(ctx, remote_device)?;

    let owned = ctx.owned_identity();
    let reply_signature = sign_ping(ctx, &remote_device)?;
    let channel = ChannelDescriptor::asymmetric_to(owned, remote_device);

    if current >= remote_device {
        tracing::debug!(remote = %remote_device, "larger device uid, pinging back");
        ctx.post::<ChannelCreationWithOwnedDevice>(
            &ChannelCreationMessage::Ping { device: current, signature: reply_signature },
            &channel,
        )?;
        return Ok(Transition::Advance(ChannelCreationState::PingSent));
    }

    ctx.tx.put_owned_device_instance(ctx.instance_uid, remote_device);
    let restart_counter = fresh_restart_counter(ctx.env);
    let (ephemeral_secret, public_key) = generate_keypair(ctx.env.random_array());

    ctx.post::<ChannelCreationWithOwnedDevice>(
        &ChannelCreationMessage::AliceIdentityAndEphemeralKey {
            device: current,
            signature: reply_signature,
            public_key,
            restart_counter,
        },
        &channel,
    )?;
    Ok(Transition::Advance(ChannelCreationState::WaitingForK1 {
        remote_device,
        ephemeral_secret,
        restart_counter,
    }))
}

fn send_ephemeral_key_and_k1<E, S, I, C>(
    ctx: &mut StepContext<'_, E, S, I, C>,
    remote_device: DeviceUid,
    signature: &[u8],
    alice_public_key: &KemPublicKey,
    restart_counter: u64,
) -> Result<Transition<ChannelCreationState>, StepError>
where
    E: Environment,
    S: Storage,
    C: ChallengeService,
{
    if remote_device == ctx.current_device() {
        tracing::warn!(instance = %ctx.instance_uid, "ephemeral key claims to come from the current device");
        return Ok(Transition::Cancelled);
    }

    check_ping(ctx, &remote_device, signature)?;

    if !ctx.tx.owned_device_instances(&remote_device)?.is_empty() {
        tracing::info!(remote = %remote_device, "concurrent channel creation, restarting");
        return restart(ctx, remote_device);
    }

    ctx.tx.put_owned_device_instance(ctx.instance_uid, remote_device);
    let (ephemeral_secret, public_key) = generate_keypair(ctx.env.random_array());
    let (c1, k1) = kem_encrypt(alice_public_key, ctx.env.random_array())?;

    let owned = ctx.owned_identity();
    ctx.post::<ChannelCreationWithOwnedDevice>(
        &ChannelCreationMessage::BobEphemeralKeyAndK1 { public_key, c1, restart_counter },
        &ChannelDescriptor::asymmetric_to(owned, remote_device),
    )?;
    Ok(Transition::Advance(ChannelCreationState::WaitingForK2 {
        remote_device,
        ephemeral_secret,
        k1,
        restart_counter,
    }))
}

/// Register the remote device and create the channel keyed by `seed`.
///
/// Returns `false` without creating anything if a channel already exists.
fn create_channel<E, S, I, C>(
    ctx: &mut StepContext<'_, E, S, I, C>,
    remote_device: DeviceUid,
    seed: &Seed,
) -> Result<bool, StepError>
where
    E: Environment,
    S: Storage,
    I: IdentityService,
{
    let owned = ctx.owned_identity();
    if let Err(err) = ctx.identity.add_remote_device(&owned, &remote_device) {
        tracing::warn!(remote = %remote_device, error = %err, "could not record remote device");
    }

    if ctx.tx.channel_exists(owned, remote_device)? {
        tracing::info!(remote = %remote_device, "channel already exists, restarting");
        return Ok(false);
    }

    ctx.tx.create_oblivious_channel(owned, remote_device, seed, ctx.config.crypto_suite_version)?;
    Ok(true)
}

/// Drop everything between this device and `remote_device` and ping again
/// from a fresh instance.
fn restart<E, S, I, C>(
    ctx: &mut StepContext<'_, E, S, I, C>,
    remote_device: DeviceUid,
) -> Result<Transition<ChannelCreationState>, StepError>
where
    E: Environment,
    S: Storage,
{
    clear_previous_attempts(ctx, remote_device)?;
    ctx.start_local::<ChannelCreationWithOwnedDevice>(&ChannelCreationMessage::Initial {
        remote_device,
    })?;
    Ok(Transition::Cancelled)
}

fn confirm_channel<E, S, I, C>(
    ctx: &mut StepContext<'_, E, S, I, C>,
    remote_device: DeviceUid,
) -> Result<(), StepError>
where
    E: Environment,
    S: Storage,
{
    let owned = ctx.owned_identity();
    ctx.tx.confirm_oblivious_channel(owned, remote_device)?;
    ctx.tx.delete_owned_device_instances(&remote_device)?;
    tracing::info!(remote = %remote_device, "channel with owned device confirmed");
    Ok(())
}

/// Queue a capabilities announcement to `remote_device`. Failure does not
/// affect the handshake.
fn announce_capabilities<E, S, I, C>(
    ctx: &mut StepContext<'_, E, S, I, C>,
    remote_device: DeviceUid,
) where
    E: Environment,
    S: Storage,
{
    let announcement = DeviceCapabilitiesMessage::InitialSingleOwnedDevice { device: remote_device };
    if let Err(err) = ctx.start_local::<DeviceCapabilities>(&announcement) {
        tracing::warn!(remote = %remote_device, error = %err, "could not queue capabilities");
    }
}
