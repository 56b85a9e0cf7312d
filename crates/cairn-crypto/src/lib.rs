//! Cairn Cryptographic Primitives
//!
//! Cryptographic building blocks for the Cairn handshake engine. Pure
//! functions with deterministic outputs. Callers provide random bytes for
//! deterministic testing.
//!
//! # Key Lifecycle
//!
//! Two devices negotiate a channel seed by running two key encapsulations,
//! one in each direction. The seed is split into one directional seed per
//! sending device, and every message on the channel is sealed under a key
//! derived from the directional seed and a generation number.
//!
//! ```text
//! Ephemeral X25519 key pair (per handshake round)
//!        │
//!        ▼
//! KEM encapsulation → k1, k2
//!        │
//!        ▼
//! HKDF(k1 ‖ k2) → Channel Seed
//!        │
//!        ▼
//! HKDF(seed, sender device) → Directional Seed
//!        │
//!        ▼
//! HMAC(directional seed, generation) → Message Key
//!        │
//!        ▼
//! AEAD Encryption → Ciphertext
//! ```
//!
//! # Security
//!
//! Ephemeral Secrets:
//! - KEM secret keys, KEM outputs and seeds are zeroized on drop
//! - KEM secret keys are not `Clone`; a consumed key cannot be reused
//! - Debug output of secret material is redacted
//!
//! Authenticity:
//! - XChaCha20-Poly1305 AEAD provides tamper-proof encryption
//! - Associated data binds a ciphertext to its sender and generation
//! - Challenge responses are Ed25519 signatures over a random padding and a
//!   domain-separated challenge, so two responses never repeat
//!
//! Renewal:
//! - A full ratchet replaces a directional seed with a fresh one derived from
//!   two new encapsulations; compromise of the old seed reveals nothing about
//!   the new one

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod aead;
mod challenge;
mod channel_keys;
mod error;
mod hash;
mod kem;
mod secret;
mod seed;

pub use aead::{NONCE_SIZE, SealedMessage, open, seal};
pub use challenge::{
    CHALLENGE_PADDING_SIZE, CHALLENGE_RESPONSE_SIZE, SigningSecret, check_challenge_response,
    solve_challenge,
};
pub use channel_keys::{MessageKey, derive_message_key};
pub use error::CryptoError;
pub use hash::domain_digest;
pub use kem::{
    KEM_CIPHERTEXT_SIZE, KEM_PUBLIC_KEY_SIZE, KemCiphertext, KemPublicKey, KemSecretKey,
    SymmetricKey, generate_keypair, kem_decrypt, kem_encrypt,
};
pub use secret::Secret;
pub use seed::{SEED_SIZE, Seed};
