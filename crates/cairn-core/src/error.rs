//! Error types for the handshake engine.
//!
//! One enum per layer. Only [`EngineError`] ever leaves the engine: every
//! failure inside a protocol step becomes a [`StepError`], is logged, and
//! turns into a cancellation of that instance. Nothing is ever reported back
//! to the remote peer.

use cairn_crypto::CryptoError;
use cairn_proto::{DeviceUid, Identity, WireError};
use thiserror::Error;

use crate::store::StorageError;

/// Errors reported by an [`crate::IdentityService`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// The identity is not owned on this device
    #[error("unknown owned identity {0}")]
    UnknownOwnedIdentity(Identity),

    /// The identity store could not be reached
    #[error("identity service unavailable: {0}")]
    Unavailable(String),
}

/// Errors reported by a [`crate::ChallengeService`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChallengeError {
    /// No signing key is held for the identity
    #[error("no signing key for identity {0}")]
    NoSigningKey(Identity),
}

/// Errors from the channel abstraction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// No oblivious channel exists with the remote device
    #[error("no oblivious channel with {remote_identity}/{remote_device}")]
    NoSuchChannel {
        /// Remote identity
        remote_identity: Identity,
        /// Remote device
        remote_device: DeviceUid,
    },

    /// Channel exists but the post requires a confirmed one
    #[error("oblivious channel with {remote_identity}/{remote_device} is not confirmed")]
    NotConfirmed {
        /// Remote identity
        remote_identity: Identity,
        /// Remote device
        remote_device: DeviceUid,
    },

    /// Creating a channel that already exists
    #[error("oblivious channel with {remote_identity}/{remote_device} already exists")]
    AlreadyExists {
        /// Remote identity
        remote_identity: Identity,
        /// Remote device
        remote_device: DeviceUid,
    },

    /// Oblivious post without any recipient device
    #[error("oblivious post has no recipient device")]
    NoRecipients,

    /// Message could not be encoded
    #[error("encoding failed: {0}")]
    Wire(#[from] WireError),

    /// Underlying store failed
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Why a protocol step failed.
///
/// Any of these cancels the instance the step was running for.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StepError {
    /// Key encapsulation, decapsulation or derivation failed
    #[error("crypto failure: {0}")]
    Crypto(#[from] CryptoError),

    /// Message or persisted state is malformed
    #[error("malformed input: {0}")]
    Wire(#[from] WireError),

    /// Channel operation failed
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Identity service failed
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    /// Challenge could not be signed
    #[error("challenge error: {0}")]
    Challenge(#[from] ChallengeError),

    /// Store read failed, or the replay guard already holds a signature
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A challenge response did not verify
    #[error("invalid challenge response")]
    InvalidSignature,

    /// The step table routed a state/message pair the step cannot handle
    #[error("step cannot handle state kind {state} with message kind {message}")]
    UnexpectedInput {
        /// State kind
        state: u64,
        /// Message kind
        message: u64,
    },
}

/// Failures outside any protocol instance.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Inbound envelope exceeds the configured size limit
    #[error("envelope too large: {size} bytes (max {max})")]
    EnvelopeTooLarge {
        /// Actual size
        size: usize,
        /// Configured limit
        max: usize,
    },

    /// Inbound envelope or locally built message could not be coded
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Store failed outside a step (outbox reads, cancellation commits)
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Identity service failed outside a step
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),
}

impl EngineError {
    /// Returns true if this error is transient and may succeed on retry.
    ///
    /// Storage I/O failures and identity service outages are transient.
    /// Malformed or oversized envelopes never become valid.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Storage(err) => err.is_transient(),
            Self::Identity(IdentityError::Unavailable(_)) => true,
            Self::EnvelopeTooLarge { .. } | Self::Wire(_) | Self::Identity(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_io_is_transient() {
        assert!(EngineError::Storage(StorageError::Io("disk".to_string())).is_transient());
        assert!(
            EngineError::Storage(StorageError::Conflict { expected: 1, got: 2 }).is_transient()
        );
        assert!(EngineError::Identity(IdentityError::Unavailable("db".to_string())).is_transient());
    }

    #[test]
    fn malformed_input_is_fatal() {
        assert!(!EngineError::EnvelopeTooLarge { size: 10, max: 5 }.is_transient());
        assert!(
            !EngineError::Wire(WireError::CborDecode("eof".to_string())).is_transient()
        );
        assert!(!EngineError::Storage(StorageError::DuplicateSignature).is_transient());
        assert!(
            !EngineError::Identity(IdentityError::UnknownOwnedIdentity(Identity::from_bytes(
                [1u8; 32]
            )))
            .is_transient()
        );
    }
}
