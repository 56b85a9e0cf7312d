//! Message encryption using `XChaCha20-Poly1305`
//!
//! All functions are pure - the nonce must be provided by the caller.
//! This enables deterministic testing and keeps the engine action-based.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};

use crate::{channel_keys::MessageKey, error::CryptoError};

/// Size of the `XChaCha20` nonce (24 bytes)
pub const NONCE_SIZE: usize = 24;

/// Poly1305 tag size (16 bytes)
const POLY1305_TAG_SIZE: usize = 16;

/// A sealed message with the metadata needed to open it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedMessage {
    /// The generation of the message key
    pub generation: u64,
    /// The 24-byte `XChaCha20` nonce
    pub nonce: [u8; NONCE_SIZE],
    /// The ciphertext including 16-byte Poly1305 tag
    pub ciphertext: Vec<u8>,
}

impl SealedMessage {
    /// Plaintext length (ciphertext length minus authentication tag).
    pub fn plaintext_len(&self) -> usize {
        self.ciphertext.len().saturating_sub(POLY1305_TAG_SIZE)
    }
}

/// Encrypt `plaintext` under `message_key`, authenticating `aad`.
///
/// # Security
///
/// - Caller MUST provide a fresh random nonce in production
/// - Authenticated encryption prevents tampering with ciphertext and `aad`
pub fn seal(
    plaintext: &[u8],
    aad: &[u8],
    message_key: &MessageKey,
    nonce: [u8; NONCE_SIZE],
) -> SealedMessage {
    let cipher = XChaCha20Poly1305::new(message_key.key().into());

    let Ok(ciphertext) = cipher.encrypt(XNonce::from_slice(&nonce), Payload { msg: plaintext, aad })
    else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    SealedMessage { generation: message_key.generation(), nonce, ciphertext }
}

/// Decrypt a sealed message.
///
/// # Errors
///
/// - `DecryptionFailed`: generation mismatch, or the authentication tag does
///   not verify (wrong key, tampered ciphertext, or different `aad`)
pub fn open(
    sealed: &SealedMessage,
    aad: &[u8],
    message_key: &MessageKey,
) -> Result<Vec<u8>, CryptoError> {
    if message_key.generation() != sealed.generation {
        return Err(CryptoError::DecryptionFailed {
            reason: format!(
                "generation mismatch: key is {}, message is {}",
                message_key.generation(),
                sealed.generation
            ),
        });
    }

    let cipher = XChaCha20Poly1305::new(message_key.key().into());
    let nonce = XNonce::from_slice(&sealed.nonce);

    cipher.decrypt(nonce, Payload { msg: &sealed.ciphertext, aad }).map_err(|_| {
        CryptoError::DecryptionFailed { reason: "authentication failed".to_string() }
    })
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::{channel_keys::derive_message_key, seed::Seed};

    fn key(generation: u64) -> MessageKey {
        derive_message_key(&Seed::from_bytes([0x5Au8; 32]), generation)
    }

    #[test]
    fn seal_open_roundtrip() {
        let sealed = seal(b"Hello, World!", b"aad", &key(0), [0xAB; NONCE_SIZE]);
        let opened = open(&sealed, b"aad", &key(0)).unwrap();
        assert_eq!(opened, b"Hello, World!");
    }

    #[test]
    fn empty_message() {
        let sealed = seal(b"", b"", &key(0), [0; NONCE_SIZE]);
        assert_eq!(sealed.plaintext_len(), 0);
        assert_eq!(open(&sealed, b"", &key(0)).unwrap(), b"");
    }

    #[test]
    fn wrong_aad_fails() {
        let sealed = seal(b"payload", b"sender-a", &key(1), [1; NONCE_SIZE]);
        let result = open(&sealed, b"sender-b", &key(1));
        assert!(matches!(result, Err(CryptoError::DecryptionFailed { .. })));
    }

    #[test]
    fn wrong_generation_fails() {
        let sealed = seal(b"payload", b"", &key(1), [1; NONCE_SIZE]);
        let result = open(&sealed, b"", &key(2));
        assert!(matches!(result, Err(CryptoError::DecryptionFailed { .. })));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let mut sealed = seal(b"payload", b"", &key(1), [1; NONCE_SIZE]);
        sealed.ciphertext[0] ^= 0x01;
        assert!(open(&sealed, b"", &key(1)).is_err());
    }

    #[test]
    fn wrong_seed_fails() {
        let sealed = seal(b"payload", b"", &key(0), [1; NONCE_SIZE]);
        let other = derive_message_key(&Seed::from_bytes([0x11u8; 32]), 0);
        assert!(open(&sealed, b"", &other).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_seal_open_roundtrip(
            plaintext in proptest::collection::vec(any::<u8>(), 0..512),
            aad in proptest::collection::vec(any::<u8>(), 0..64),
            generation in any::<u64>(),
            nonce in any::<[u8; NONCE_SIZE]>(),
        ) {
            let message_key = key(generation);
            let sealed = seal(&plaintext, &aad, &message_key, nonce);
            prop_assert_eq!(sealed.plaintext_len(), plaintext.len());
            prop_assert_eq!(open(&sealed, &aad, &message_key).unwrap(), plaintext);
        }
    }
}
