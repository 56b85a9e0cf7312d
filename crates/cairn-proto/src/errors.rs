//! Wire encoding errors.

use thiserror::Error;

/// Result alias for wire operations.
pub type Result<T> = std::result::Result<T, WireError>;

/// Errors that can occur while encoding or decoding wire values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Input exceeds the maximum encoded size
    #[error("encoded value too large: {size} bytes (max {max})")]
    TooLarge {
        /// Actual size in bytes
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// CBOR serialization failed
    #[error("CBOR encode error: {0}")]
    CborEncode(String),

    /// CBOR deserialization failed
    #[error("CBOR decode error: {0}")]
    CborDecode(String),

    /// A field had the wrong CBOR type
    #[error("{context}: expected {expected} at field {index}")]
    UnexpectedType {
        /// What was being decoded
        context: &'static str,
        /// Index of the offending field
        index: usize,
        /// Expected field type
        expected: &'static str,
    },

    /// A required field was missing
    #[error("{context}: missing field {index}")]
    MissingField {
        /// What was being decoded
        context: &'static str,
        /// Index of the missing field
        index: usize,
    },

    /// A byte string had the wrong length
    #[error("{context}: expected {expected} bytes, got {got}")]
    InvalidLength {
        /// What was being decoded
        context: &'static str,
        /// Expected length
        expected: usize,
        /// Actual length
        got: usize,
    },

    /// Integer does not fit the target type
    #[error("{context}: integer out of range")]
    IntegerOutOfRange {
        /// What was being decoded
        context: &'static str,
    },

    /// Discriminator does not name a known kind
    #[error("unknown {context} kind {kind}")]
    UnknownKind {
        /// What was being decoded
        context: &'static str,
        /// The unrecognized discriminator
        kind: u64,
    },
}
