//! Per-message keys for oblivious channels
//!
//! # Security Properties
//!
//! - Key Uniqueness: Each generation produces a unique message key
//! - Random Access: Keys are derived directly from (seed, generation), so a
//!   relay that reorders messages never makes one undecryptable
//! - Determinism: Same seed always produces same key sequence
//!
//! Forward secrecy is provided at a coarser grain by the full ratchet, which
//! replaces the seed itself.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::seed::Seed;

type HmacSha256 = Hmac<Sha256>;

/// Label for deriving a message key
const MESSAGE_LABEL: &[u8] = b"message";

/// A message key derived from a directional seed.
///
/// This key is used for a single message encryption/decryption.
/// It should be used immediately and then discarded.
pub struct MessageKey {
    /// The 32-byte symmetric key for XChaCha20-Poly1305
    key: [u8; 32],
    /// The generation this key was derived for
    generation: u64,
}

impl MessageKey {
    /// 32-byte symmetric key for XChaCha20-Poly1305 AEAD.
    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    /// Generation this key was derived for.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

// Implement Drop to zeroize key material
impl Drop for MessageKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Derive the message key for `generation` from a directional seed.
///
/// HMAC-SHA256(seed, "message" ‖ generation)
pub fn derive_message_key(seed: &Seed, generation: u64) -> MessageKey {
    let Ok(mut mac) = HmacSha256::new_from_slice(seed.as_bytes()) else {
        unreachable!("HMAC accepts keys of any length");
    };
    mac.update(MESSAGE_LABEL);
    mac.update(&generation.to_be_bytes());

    MessageKey { key: mac.finalize().into_bytes().into(), generation }
}
