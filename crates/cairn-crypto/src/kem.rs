//! Key encapsulation over X25519.
//!
//! The encapsulator generates a fresh X25519 key pair per call. The
//! ciphertext is the ephemeral public key, and the encapsulated key is
//! HKDF-SHA256 over the Diffie-Hellman output, bound to both public keys.
//!
//! All functions are pure; ephemeral randomness is provided by the caller.

use std::fmt;

use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::{error::CryptoError, secret::Secret};

/// Size of an encoded KEM public key (32 bytes)
pub const KEM_PUBLIC_KEY_SIZE: usize = 32;

/// Size of a KEM ciphertext (32 bytes, the ephemeral public key)
pub const KEM_CIPHERTEXT_SIZE: usize = 32;

/// Label bound into every encapsulated key
const KEM_LABEL: &[u8] = b"cairnKemV1";

/// Ephemeral KEM secret key.
///
/// Deliberately not `Clone`: a handshake round moves the key out of its
/// persisted state, uses it once and drops it. The underlying scalar is
/// zeroized on drop.
pub struct KemSecretKey(StaticSecret);

impl KemSecretKey {
    /// Rebuild a secret key from its 32 raw bytes (clamped on use).
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    /// Raw bytes for persistence.
    pub fn to_secret_bytes(&self) -> Secret<32> {
        Secret::from_bytes(self.0.to_bytes())
    }

    /// Public key matching this secret key.
    pub fn public_key(&self) -> KemPublicKey {
        KemPublicKey(PublicKey::from(&self.0).to_bytes())
    }
}

impl fmt::Debug for KemSecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KemSecretKey").field("value", &"***").finish()
    }
}

/// KEM public key (X25519 point).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct KemPublicKey([u8; KEM_PUBLIC_KEY_SIZE]);

impl KemPublicKey {
    /// Wrap raw public key bytes.
    pub fn from_bytes(bytes: [u8; KEM_PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse from a slice, checking the length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; KEM_PUBLIC_KEY_SIZE] =
            bytes.try_into().map_err(|_| CryptoError::InvalidLength {
                what: "KEM public key",
                expected: KEM_PUBLIC_KEY_SIZE,
                got: bytes.len(),
            })?;
        Ok(Self(array))
    }

    /// Borrow the raw bytes.
    pub fn as_bytes(&self) -> &[u8; KEM_PUBLIC_KEY_SIZE] {
        &self.0
    }
}

/// KEM ciphertext.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct KemCiphertext([u8; KEM_CIPHERTEXT_SIZE]);

impl KemCiphertext {
    /// Wrap raw ciphertext bytes.
    pub fn from_bytes(bytes: [u8; KEM_CIPHERTEXT_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse from a slice, checking the length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; KEM_CIPHERTEXT_SIZE] =
            bytes.try_into().map_err(|_| CryptoError::InvalidLength {
                what: "KEM ciphertext",
                expected: KEM_CIPHERTEXT_SIZE,
                got: bytes.len(),
            })?;
        Ok(Self(array))
    }

    /// Borrow the raw bytes.
    pub fn as_bytes(&self) -> &[u8; KEM_CIPHERTEXT_SIZE] {
        &self.0
    }
}

/// 32-byte symmetric key produced by encapsulation (k1 and k2).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymmetricKey(Secret<32>);

impl SymmetricKey {
    /// Wrap raw key bytes (used when loading persisted state).
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Secret::from_bytes(bytes))
    }

    /// Borrow the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

/// Generate an ephemeral key pair from 32 bytes of caller-provided entropy.
pub fn generate_keypair(random: [u8; 32]) -> (KemSecretKey, KemPublicKey) {
    let secret = KemSecretKey::from_bytes(random);
    let public = secret.public_key();
    (secret, public)
}

/// Encapsulate a fresh symmetric key to `recipient`.
///
/// # Errors
///
/// - `InvalidPublicKey`: the recipient key is a low-order point
pub fn kem_encrypt(
    recipient: &KemPublicKey,
    ephemeral_random: [u8; 32],
) -> Result<(KemCiphertext, SymmetricKey), CryptoError> {
    let ephemeral = StaticSecret::from(ephemeral_random);
    let ephemeral_public = PublicKey::from(&ephemeral);

    let shared = ephemeral.diffie_hellman(&PublicKey::from(recipient.0));
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidPublicKey { reason: "low-order point" });
    }

    let ciphertext = KemCiphertext(ephemeral_public.to_bytes());
    let key = derive_key(shared.as_bytes(), &ciphertext.0, &recipient.0);
    Ok((ciphertext, key))
}

/// Recover the symmetric key encapsulated in `ciphertext`.
///
/// A ciphertext produced for another recipient decapsulates to an unrelated
/// key; authenticity is provided by whatever the key protects.
///
/// # Errors
///
/// - `DecapsulationFailed`: the ciphertext is a low-order point
pub fn kem_decrypt(
    ciphertext: &KemCiphertext,
    secret_key: &KemSecretKey,
) -> Result<SymmetricKey, CryptoError> {
    let shared = secret_key.0.diffie_hellman(&PublicKey::from(ciphertext.0));
    if !shared.was_contributory() {
        return Err(CryptoError::DecapsulationFailed { reason: "low-order point" });
    }

    let recipient = PublicKey::from(&secret_key.0);
    Ok(derive_key(shared.as_bytes(), &ciphertext.0, recipient.as_bytes()))
}

/// HKDF-SHA256(dh, info = label ‖ ciphertext ‖ recipient public key)
fn derive_key(shared: &[u8; 32], ciphertext: &[u8; 32], recipient: &[u8; 32]) -> SymmetricKey {
    let hkdf = Hkdf::<Sha256>::new(None, shared);

    // Capacity: 10 (label) + 32 (ciphertext) + 32 (recipient) = 74
    let mut info = Vec::with_capacity(74);
    info.extend_from_slice(KEM_LABEL);
    info.extend_from_slice(ciphertext);
    info.extend_from_slice(recipient);

    let mut okm = [0u8; 32];
    let Ok(()) = hkdf.expand(&info, &mut okm) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };

    let key = SymmetricKey::from_bytes(okm);
    okm.zeroize();
    key
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let (secret, public) = generate_keypair([7u8; 32]);
        let (ciphertext, key) = kem_encrypt(&public, [9u8; 32]).unwrap();
        let recovered = kem_decrypt(&ciphertext, &secret).unwrap();
        assert_eq!(key, recovered);
    }

    #[test]
    fn wrong_secret_key_recovers_different_key() {
        let (_, public) = generate_keypair([7u8; 32]);
        let (other_secret, _) = generate_keypair([8u8; 32]);
        let (ciphertext, key) = kem_encrypt(&public, [9u8; 32]).unwrap();
        let recovered = kem_decrypt(&ciphertext, &other_secret).unwrap();
        assert_ne!(key, recovered);
    }

    #[test]
    fn low_order_public_key_is_rejected() {
        let zero = KemPublicKey::from_bytes([0u8; 32]);
        let result = kem_encrypt(&zero, [9u8; 32]);
        assert!(matches!(result, Err(CryptoError::InvalidPublicKey { .. })));
    }

    #[test]
    fn low_order_ciphertext_is_rejected() {
        let (secret, _) = generate_keypair([7u8; 32]);
        let result = kem_decrypt(&KemCiphertext::from_bytes([0u8; 32]), &secret);
        assert!(matches!(result, Err(CryptoError::DecapsulationFailed { .. })));
    }

    #[test]
    fn secret_key_survives_persistence() {
        let (secret, public) = generate_keypair([3u8; 32]);
        let restored = KemSecretKey::from_bytes(*secret.to_secret_bytes().as_bytes());
        assert_eq!(restored.public_key(), public);
    }

    #[test]
    fn from_slice_checks_length() {
        assert!(KemPublicKey::from_slice(&[0u8; 31]).is_err());
        assert!(KemCiphertext::from_slice(&[0u8; 33]).is_err());
        assert!(KemPublicKey::from_slice(&[1u8; 32]).is_ok());
    }

    proptest! {
        #[test]
        fn prop_encapsulated_key_is_recovered(
            recipient_seed in any::<[u8; 32]>(),
            ephemeral_seed in any::<[u8; 32]>(),
        ) {
            let (secret, public) = generate_keypair(recipient_seed);
            let (ciphertext, key) = kem_encrypt(&public, ephemeral_seed).unwrap();
            prop_assert_eq!(kem_decrypt(&ciphertext, &secret).unwrap(), key);
        }
    }
}
