//! Cairn wire encoding.
//!
//! Everything the handshake engine puts on the wire or on disk is a
//! self-describing CBOR value. Protocol messages and protocol states are
//! ordered field lists whose first element is a stable integer discriminator
//! for the message or state kind:
//!
//! ```text
//! [kind: uint, field_0, field_1, ...]
//! ```
//!
//! Fields are integers, byte strings, text and nested lists. Decoders read
//! the fields they know and ignore any trailing ones, so a newer peer can
//! append fields without breaking an older one.
//!
//! Channel envelopes, which carry a serialized protocol message between
//! devices, are plain serde structs encoded with ciborium.
//!
//! # Security
//!
//! - Size Validation First: byte inputs are checked against
//!   [`MAX_ENCODED_SIZE`] before the CBOR parser sees them
//! - Bounded Nesting: ciborium limits recursion depth, so deeply nested input
//!   fails to decode instead of exhausting the stack

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod encoding;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod message;

pub use encoding::{
    Decode, Encode, Encoded, FieldReader, FieldWriter, MAX_ENCODED_SIZE, decode_tagged,
    encode_tagged, from_bytes, to_bytes,
};
pub use envelope::{ChannelEnvelope, EnvelopeBody, MAX_ENVELOPE_SIZE, Route};
pub use errors::{Result, WireError};
pub use ids::{DeviceUid, ID_SIZE, Identity, Uid};
pub use message::{ProtocolId, ProtocolMessage};
