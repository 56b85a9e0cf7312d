//! Device capabilities: tell another device of the owned identity what this
//! device supports.
//!
//! A single message in each direction, sent over a confirmed channel. The
//! sending instance is started locally (after a channel confirmation or by
//! [`crate::Engine::discover_capabilities`]) and the receiving instance ends
//! as soon as it stored the list.

use cairn_proto::{DeviceUid, Encoded, FieldReader, FieldWriter, Identity, ProtocolId, WireError};

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

/// State kind discriminators
pub mod state_kind {
    /// [`super::DeviceCapabilitiesState::Initial`]
    pub const INITIAL: u64 = 0;
    /// [`super::DeviceCapabilitiesState::Done`]
    pub const DONE: u64 = 1;
}

/// Message kind discriminators
pub mod message_kind {
    /// [`super::DeviceCapabilitiesMessage::InitialSingleOwnedDevice`]
    pub const INITIAL_SINGLE_OWNED_DEVICE: u64 = 0;
    /// [`super::DeviceCapabilitiesMessage::OwnCapabilities`]
    pub const OWN_CAPABILITIES: u64 = 1;
}

/// Device capabilities states.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCapabilitiesState {
    /// Nothing exchanged
    #[default]
    Initial,
    /// Sent or stored
    Done,
}

impl ProtocolState for DeviceCapabilitiesState {
    fn kind(&self) -> u64 {
        match self {
            Self::Initial => state_kind::INITIAL,
            Self::Done => state_kind::DONE,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }

    fn peer(&self, _owned_identity: &Identity) -> Option<(Identity, DeviceUid)> {
        None
    }

    fn encode_fields(&self) -> Vec<Encoded> {
        Vec::new()
    }

    fn decode_fields(kind: u64, _fields: &[Encoded]) -> Result<Self, WireError> {
        match kind {
            state_kind::INITIAL => Ok(Self::Initial),
            state_kind::DONE => Ok(Self::Done),
            other => Err(WireError::UnknownKind { context: "device capabilities state", kind: other }),
        }
    }
}

/// Device capabilities messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCapabilitiesMessage {
    /// Local trigger: announce to one owned device
    InitialSingleOwnedDevice {
        /// Device to announce to
        device: DeviceUid,
    },

    /// Capabilities of the sending device
    OwnCapabilities {
        /// Capability names
        capabilities: Vec<String>,
    },
}

impl ProtocolMessageBody for DeviceCapabilitiesMessage {
    fn kind(&self) -> u64 {
        match self {
            Self::InitialSingleOwnedDevice { .. } => message_kind::INITIAL_SINGLE_OWNED_DEVICE,
            Self::OwnCapabilities { .. } => message_kind::OWN_CAPABILITIES,
        }
    }

    fn encode_fields(&self) -> Vec<Encoded> {
        match self {
            Self::InitialSingleOwnedDevice { device } => FieldWriter::new().push(device),
            Self::OwnCapabilities { capabilities } => FieldWriter::new().push(capabilities),
        }
        .finish()
    }

    fn decode_fields(kind: u64, fields: &[Encoded]) -> Result<Option<Self>, WireError> {
        let mut reader = FieldReader::new(fields, "device capabilities message");
        let message = match kind {
            message_kind::INITIAL_SINGLE_OWNED_DEVICE => {
                Self::InitialSingleOwnedDevice { device: reader.read()? }
            },
            message_kind::OWN_CAPABILITIES => Self::OwnCapabilities { capabilities: reader.read()? },
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}

/// Device capabilities steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCapabilitiesStep {
    /// Send this device's capabilities
    SendOwnCapabilities,
    /// Store a device's capabilities
    ProcessOwnCapabilities,
}

/// Device capabilities protocol (id 3).
#[derive(Debug)]
pub struct DeviceCapabilities;

impl Protocol for DeviceCapabilities {
    const ID: ProtocolId = ProtocolId::DeviceCapabilities;
    const STEPS: &'static [StepDescriptor<DeviceCapabilitiesStep>] = &[
        StepDescriptor {
            step: DeviceCapabilitiesStep::SendOwnCapabilities,
            state: state_kind::INITIAL,
            message: message_kind::INITIAL_SINGLE_OWNED_DEVICE,
            origin: OriginRule::Local,
        },
        StepDescriptor {
            step: DeviceCapabilitiesStep::ProcessOwnCapabilities,
            state: state_kind::INITIAL,
            message: message_kind::OWN_CAPABILITIES,
            origin: OriginRule::AnyObliviousOfOwnedIdentity,
        },
    ];

    type Message = DeviceCapabilitiesMessage;
    type State = DeviceCapabilitiesState;
    type Step = DeviceCapabilitiesStep;

    fn execute<E, S, I, C>(
        step: DeviceCapabilitiesStep,
        ctx: &mut StepContext<'_, E, S, I, C>,
        state: DeviceCapabilitiesState,
        message: DeviceCapabilitiesMessage,
    ) -> Result<Transition<DeviceCapabilitiesState>, StepError>
    where
        E: Environment,
        S: Storage,
        I: IdentityService,
        C: ChallengeService,
    {
        match (step, message) {
            (
                DeviceCapabilitiesStep::SendOwnCapabilities,
                DeviceCapabilitiesMessage::InitialSingleOwnedDevice { device },
            ) => {
                let owned = ctx.owned_identity();
                let capabilities = ctx.config.capabilities.clone();
                ctx.post::<Self>(
                    &DeviceCapabilitiesMessage::OwnCapabilities { capabilities },
                    &ChannelDescriptor::oblivious_to(owned, device, true),
                )?;
                Ok(Transition::Advance(DeviceCapabilitiesState::Done))
            },

            (
                DeviceCapabilitiesStep::ProcessOwnCapabilities,
                DeviceCapabilitiesMessage::OwnCapabilities { capabilities },
            ) => {
                let Some((_, device)) = ctx.oblivious_origin() else {
                    return Ok(Transition::Cancelled);
                };
                let owned = ctx.owned_identity();
                ctx.identity.set_device_capabilities(&owned, &device, &capabilities)?;
                tracing::debug!(device = %device, count = capabilities.len(), "device capabilities stored");
                Ok(Transition::Advance(DeviceCapabilitiesState::Done))
            },

            (_, message) => {
                Err(StepError::UnexpectedInput { state: state.kind(), message: message.kind() })
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_list_decodes() {
        let message = DeviceCapabilitiesMessage::OwnCapabilities {
            capabilities: vec!["webrtc".to_string(), "groups_v2".to_string()],
        };
        let decoded =
            DeviceCapabilitiesMessage::decode_fields(message.kind(), &message.encode_fields())
                .unwrap();
        assert_eq!(decoded, Some(message));
    }

    #[test]
    fn done_is_terminal() {
        assert!(DeviceCapabilitiesState::Done.is_terminal());
        assert!(!DeviceCapabilitiesState::Initial.is_terminal());
    }
}
