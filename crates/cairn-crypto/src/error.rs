//! Error types for cryptographic operations.

use thiserror::Error;

/// Errors produced by the primitives in this crate.
///
/// None of these are transient. A failed decapsulation, decryption or
/// signature check means the input is wrong and retrying cannot help.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Public key is a low-order point (the shared secret would be all zero)
    #[error("invalid public key: {reason}")]
    InvalidPublicKey {
        /// Why the key was rejected
        reason: &'static str,
    },

    /// KEM ciphertext could not be decapsulated
    #[error("decapsulation failed: {reason}")]
    DecapsulationFailed {
        /// Why decapsulation failed
        reason: &'static str,
    },

    /// AEAD authentication failed (wrong key, tampered ciphertext or
    /// mismatched associated data)
    #[error("decryption failed: {reason}")]
    DecryptionFailed {
        /// Why decryption failed
        reason: String,
    },

    /// Byte slice has the wrong length for the expected type
    #[error("invalid length for {what}: expected {expected}, got {got}")]
    InvalidLength {
        /// Name of the value being parsed
        what: &'static str,
        /// Expected length in bytes
        expected: usize,
        /// Actual length in bytes
        got: usize,
    },
}
