//! Protocol and step registry.
//!
//! A protocol is a tagged-union state, a tagged-union message and a static
//! table of [`StepDescriptor`]s. Each descriptor names the state kind and
//! message kind it accepts and the channel the message must have arrived on.
//! The dispatcher picks the first descriptor matching all three and calls
//! [`Protocol::execute`] with it; a message no descriptor accepts is dropped.
//!
//! ```text
//! (state kind, message kind, origin) ──STEPS──▶ Step ──execute──▶ Transition
//! ```

use std::fmt;

use cairn_proto::{
    DeviceUid, Encoded, Identity, ProtocolId, ProtocolMessage, Uid, WireError, decode_tagged,
    encode_tagged, from_bytes, to_bytes,
};

use crate::{
    channel::{ChannelDescriptor, ReceptionChannelInfo},
    config::EngineConfig,
    env::Environment,
    error::{ChannelError, StepError},
    services::{ChallengeService, IdentityService},
    store::Storage,
    transaction::Transaction,
};

/// Which channel a step accepts its message from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginRule {
    /// Loopback from this device
    Local,
    /// Unauthenticated bootstrap channel
    Asymmetric,
    /// Any oblivious channel, whatever the remote identity
    AnyOblivious,
    /// Any oblivious channel with another device of the owned identity
    AnyObliviousOfOwnedIdentity,
    /// The oblivious channel with the peer recorded in the current state
    ObliviousWithPeer,
}

impl OriginRule {
    /// Whether a message that arrived on `origin` satisfies this rule.
    ///
    /// `peer` is the (identity, device) the current state is talking to, if
    /// any.
    pub fn matches(
        self,
        origin: &ReceptionChannelInfo,
        owned_identity: &Identity,
        peer: Option<(Identity, DeviceUid)>,
    ) -> bool {
        match (self, origin) {
            (Self::Local, ReceptionChannelInfo::Local)
            | (Self::Asymmetric, ReceptionChannelInfo::Asymmetric)
            | (Self::AnyOblivious, ReceptionChannelInfo::Oblivious { .. }) => true,
            (Self::AnyObliviousOfOwnedIdentity, ReceptionChannelInfo::Oblivious {
                remote_identity,
                ..
            }) => remote_identity == owned_identity,
            (Self::ObliviousWithPeer, ReceptionChannelInfo::Oblivious {
                remote_identity,
                remote_device,
            }) => peer == Some((*remote_identity, *remote_device)),
            _ => false,
        }
    }
}

/// Result of a step.
#[derive(Debug)]
pub enum Transition<S> {
    /// Move to a new state; a terminal state deletes the instance
    Advance(S),
    /// Stale or duplicate message: discard every write of the step
    Unchanged,
    /// Abort: commit the step's writes and delete the instance
    Cancelled,
}

/// One row of a protocol's step table.
#[derive(Debug, Clone, Copy)]
pub struct StepDescriptor<T> {
    /// Step to run
    pub step: T,
    /// State kind the step starts from
    pub state: u64,
    /// Message kind the step consumes
    pub message: u64,
    /// Channel the message must have arrived on
    pub origin: OriginRule,
}

/// A protocol state.
pub trait ProtocolState: Sized + Default {
    /// Stable state kind discriminator.
    fn kind(&self) -> u64;

    /// Terminal states delete the instance when reached.
    fn is_terminal(&self) -> bool;

    /// Remote (identity, device) this state is bound to, if any.
    fn peer(&self, owned_identity: &Identity) -> Option<(Identity, DeviceUid)>;

    /// Ordered field list of the state, without the kind.
    fn encode_fields(&self) -> Vec<Encoded>;

    /// Rebuild a state from its kind and fields.
    fn decode_fields(kind: u64, fields: &[Encoded]) -> Result<Self, WireError>;

    /// Encode to stored bytes.
    fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        to_bytes(&encode_tagged(self.kind(), self.encode_fields()))
    }

    /// Decode from stored bytes.
    fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        let value = from_bytes(bytes)?;
        let (kind, fields) = decode_tagged(&value, "protocol state")?;
        Self::decode_fields(kind, fields)
    }
}

/// A protocol message body (the part after the core header).
pub trait ProtocolMessageBody: Sized {
    /// Stable message kind discriminator.
    fn kind(&self) -> u64;

    /// Ordered field list of the message.
    fn encode_fields(&self) -> Vec<Encoded>;

    /// Rebuild a message. `Ok(None)` for a kind this protocol does not
    /// define.
    fn decode_fields(kind: u64, fields: &[Encoded]) -> Result<Option<Self>, WireError>;
}

/// A protocol runnable by the engine.
pub trait Protocol: 'static {
    /// Wire identifier
    const ID: ProtocolId;

    /// Step identifiers
    type Step: Copy + fmt::Debug + 'static;

    /// State union
    type State: ProtocolState;

    /// Message union
    type Message: ProtocolMessageBody;

    /// Step table, searched in order
    const STEPS: &'static [StepDescriptor<Self::Step>];

    /// Run `step` against `state` and `message`.
    fn execute<E, S, I, C>(
        step: Self::Step,
        ctx: &mut StepContext<'_, E, S, I, C>,
        state: Self::State,
        message: Self::Message,
    ) -> Result<Transition<Self::State>, StepError>
    where
        E: Environment,
        S: Storage,
        I: IdentityService,
        C: ChallengeService;

    /// Wrap `message` in the core header for `instance_uid`.
    fn message(instance_uid: Uid, message: &Self::Message) -> ProtocolMessage {
        ProtocolMessage {
            protocol_id: Self::ID,
            instance_uid,
            kind: message.kind(),
            fields: message.encode_fields(),
        }
    }
}

/// Find the step accepting `message_kind` in `state` from `origin`.
pub fn resolve_step<P: Protocol>(
    state: &P::State,
    message_kind: u64,
    origin: &ReceptionChannelInfo,
    owned_identity: &Identity,
) -> Option<&'static StepDescriptor<P::Step>> {
    let state_kind = state.kind();
    let peer = state.peer(owned_identity);
    P::STEPS.iter().find(|descriptor| {
        descriptor.state == state_kind
            && descriptor.message == message_kind
            && descriptor.origin.matches(origin, owned_identity, peer)
    })
}

/// Everything a step may use.
pub struct StepContext<'a, E: Environment, S: Storage, I, C> {
    /// Randomness
    pub env: &'a E,
    /// Identity service
    pub identity: &'a I,
    /// Challenge service
    pub challenge: &'a C,
    /// Engine configuration
    pub config: &'a EngineConfig,
    /// Writes of this step
    pub tx: Transaction<'a, E, S>,
    /// Instance the step runs for
    pub instance_uid: Uid,
    /// How the message arrived
    pub origin: ReceptionChannelInfo,
}

impl<E: Environment, S: Storage, I, C> StepContext<'_, E, S, I, C> {
    /// Owned identity the step runs for.
    pub fn owned_identity(&self) -> Identity {
        self.tx.owned_identity()
    }

    /// Device the engine runs on.
    pub fn current_device(&self) -> DeviceUid {
        self.tx.current_device()
    }

    /// Remote end of the oblivious channel the message arrived on.
    pub fn oblivious_origin(&self) -> Option<(Identity, DeviceUid)> {
        match self.origin {
            ReceptionChannelInfo::Oblivious { remote_identity, remote_device } => {
                Some((remote_identity, remote_device))
            },
            ReceptionChannelInfo::Local | ReceptionChannelInfo::Asymmetric => None,
        }
    }

    /// Post a message of protocol `P` for this instance.
    pub fn post<P: Protocol>(
        &mut self,
        message: &P::Message,
        channel: &ChannelDescriptor,
    ) -> Result<Vec<Uid>, ChannelError> {
        self.tx.post_message(&P::message(self.instance_uid, message), channel)
    }

    /// Post the first message of a new instance of protocol `P` to this
    /// device.
    pub fn start_local<P: Protocol>(&mut self, message: &P::Message) -> Result<Uid, ChannelError> {
        let instance_uid = self.env.random_uid();
        self.tx.post_message(&P::message(instance_uid, message), &ChannelDescriptor::Local)?;
        Ok(instance_uid)
    }
}
