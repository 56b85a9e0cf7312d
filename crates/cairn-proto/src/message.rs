//! Protocol message core envelope.
//!
//! Every protocol message shares the same outer layout:
//!
//! ```text
//! [protocol_id: uint, instance_uid: bytes(32), kind: uint, [fields...]]
//! ```
//!
//! The engine routes on `protocol_id` and `instance_uid`; the protocol
//! itself interprets `kind` and `fields`.

use std::fmt;

use ciborium::value::Value;
use serde::{Deserialize, Serialize};

use crate::{
    encoding::{Decode, Encode, Encoded, FieldReader, from_bytes, to_bytes},
    errors::{Result, WireError},
    ids::Uid,
};

/// Stable protocol identifiers.
///
/// # Invariants
///
/// Discriminators are part of the wire format and must never be reused.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProtocolId {
    /// Channel creation between two devices of the same identity
    ChannelCreationWithOwnedDevice,
    /// Renewal of an existing channel's key material
    FullRatchet,
    /// One-shot announcement of a device's capabilities
    DeviceCapabilities,
}

impl ProtocolId {
    /// Wire discriminator.
    pub const fn to_u64(self) -> u64 {
        match self {
            Self::ChannelCreationWithOwnedDevice => 1,
            Self::FullRatchet => 2,
            Self::DeviceCapabilities => 3,
        }
    }

    /// Parse a wire discriminator.
    pub const fn from_u64(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::ChannelCreationWithOwnedDevice),
            2 => Some(Self::FullRatchet),
            3 => Some(Self::DeviceCapabilities),
            _ => None,
        }
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ChannelCreationWithOwnedDevice => "channel-creation-with-owned-device",
            Self::FullRatchet => "full-ratchet",
            Self::DeviceCapabilities => "device-capabilities",
        };
        f.write_str(name)
    }
}

/// A protocol message with its routing header and undecoded fields.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolMessage {
    /// Protocol the message belongs to
    pub protocol_id: ProtocolId,
    /// Protocol instance the message belongs to
    pub instance_uid: Uid,
    /// Protocol-specific message kind
    pub kind: u64,
    /// Protocol-specific fields
    pub fields: Vec<Encoded>,
}

impl ProtocolMessage {
    /// Encode to CBOR bytes.
    ///
    /// # Errors
    ///
    /// - `WireError::CborEncode` if serialization fails
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let value = Value::Array(vec![
            self.protocol_id.to_u64().encode(),
            self.instance_uid.encode(),
            self.kind.encode(),
            Value::Array(self.fields.clone()),
        ]);
        to_bytes(&value)
    }

    /// Decode from CBOR bytes.
    ///
    /// # Errors
    ///
    /// - `WireError::TooLarge`, `WireError::CborDecode` for invalid input
    /// - `WireError::UnknownKind` for an unknown protocol id
    /// - `WireError::UnexpectedType`/`MissingField` for a malformed header
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        const CONTEXT: &str = "protocol message";

        let value = from_bytes(bytes)?;
        let Value::Array(items) = &value else {
            return Err(WireError::UnexpectedType { context: CONTEXT, index: 0, expected: "array" });
        };

        let mut reader = FieldReader::new(items, CONTEXT);
        let protocol = reader.read::<u64>()?;
        let protocol_id = ProtocolId::from_u64(protocol)
            .ok_or(WireError::UnknownKind { context: "protocol", kind: protocol })?;
        let instance_uid = reader.read::<Uid>()?;
        let kind = reader.read::<u64>()?;
        let fields = match items.get(3) {
            Some(Value::Array(fields)) => fields.clone(),
            Some(_) => {
                return Err(WireError::UnexpectedType {
                    context: CONTEXT,
                    index: 3,
                    expected: "array",
                });
            },
            None => return Err(WireError::MissingField { context: CONTEXT, index: 3 }),
        };

        Ok(Self { protocol_id, instance_uid, kind, fields })
    }
}

impl Decode for ProtocolId {
    fn decode(encoded: &Encoded) -> Result<Self> {
        let value = u64::decode(encoded)?;
        Self::from_u64(value).ok_or(WireError::UnknownKind { context: "protocol", kind: value })
    }
}

impl Encode for ProtocolId {
    fn encode(&self) -> Encoded {
        self.to_u64().encode()
    }
}
