//! Challenge responses signed with Ed25519.
//!
//! A response is `padding ‖ signature(prefix ‖ padding ‖ challenge)`. The
//! random padding makes every response to the same challenge unique, which
//! is what lets a receiver treat a repeated response as a replay.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};

/// Random padding prepended to every response (32 bytes)
pub const CHALLENGE_PADDING_SIZE: usize = 32;

/// Total response size: padding plus a 64-byte Ed25519 signature
pub const CHALLENGE_RESPONSE_SIZE: usize = CHALLENGE_PADDING_SIZE + 64;

/// Domain prefix for all signed challenges
const CHALLENGE_PREFIX: &[u8] = b"cairnChallengeV1";

/// Ed25519 signing key of an owned identity.
///
/// Zeroized on drop.
pub struct SigningSecret(SigningKey);

impl SigningSecret {
    /// Build from a 32-byte secret seed.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(SigningKey::from_bytes(&bytes))
    }

    /// 32-byte verifying key (the public identity).
    pub fn verifying_key(&self) -> [u8; 32] {
        self.0.verifying_key().to_bytes()
    }
}

impl fmt::Debug for SigningSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningSecret").field("verifying_key", &self.verifying_key()).finish()
    }
}

/// Sign `challenge` with a caller-provided random `padding`.
pub fn solve_challenge(
    challenge: &[u8],
    signing_secret: &SigningSecret,
    padding: [u8; CHALLENGE_PADDING_SIZE],
) -> [u8; CHALLENGE_RESPONSE_SIZE] {
    let signature = signing_secret.0.sign(&signed_bytes(challenge, &padding));

    let mut response = [0u8; CHALLENGE_RESPONSE_SIZE];
    response[..CHALLENGE_PADDING_SIZE].copy_from_slice(&padding);
    response[CHALLENGE_PADDING_SIZE..].copy_from_slice(&signature.to_bytes());
    response
}

/// Check a response produced by [`solve_challenge`].
///
/// Returns `false` for any malformed input: wrong length, invalid verifying
/// key, or a signature that does not verify.
pub fn check_challenge_response(response: &[u8], challenge: &[u8], verifying_key: &[u8; 32]) -> bool {
    if response.len() != CHALLENGE_RESPONSE_SIZE {
        return false;
    }

    let Ok(verifying_key) = VerifyingKey::from_bytes(verifying_key) else {
        return false;
    };

    let (padding, signature) = response.split_at(CHALLENGE_PADDING_SIZE);
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };

    verifying_key.verify_strict(&signed_bytes(challenge, padding), &signature).is_ok()
}

fn signed_bytes(challenge: &[u8], padding: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(CHALLENGE_PREFIX.len() + padding.len() + challenge.len());
    bytes.extend_from_slice(CHALLENGE_PREFIX);
    bytes.extend_from_slice(padding);
    bytes.extend_from_slice(challenge);
    bytes
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn valid_response_verifies() {
        let secret = SigningSecret::from_bytes([1u8; 32]);
        let response = solve_challenge(b"challenge", &secret, [2u8; 32]);
        assert!(check_challenge_response(&response, b"challenge", &secret.verifying_key()));
    }

    #[test]
    fn different_padding_gives_different_response() {
        let secret = SigningSecret::from_bytes([1u8; 32]);
        let a = solve_challenge(b"challenge", &secret, [2u8; 32]);
        let b = solve_challenge(b"challenge", &secret, [3u8; 32]);
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_challenge_fails() {
        let secret = SigningSecret::from_bytes([1u8; 32]);
        let response = solve_challenge(b"challenge", &secret, [2u8; 32]);
        assert!(!check_challenge_response(&response, b"other", &secret.verifying_key()));
    }

    #[test]
    fn wrong_identity_fails() {
        let secret = SigningSecret::from_bytes([1u8; 32]);
        let other = SigningSecret::from_bytes([9u8; 32]);
        let response = solve_challenge(b"challenge", &secret, [2u8; 32]);
        assert!(!check_challenge_response(&response, b"challenge", &other.verifying_key()));
    }

    #[test]
    fn truncated_response_fails() {
        let secret = SigningSecret::from_bytes([1u8; 32]);
        let response = solve_challenge(b"challenge", &secret, [2u8; 32]);
        assert!(!check_challenge_response(&response[..90], b"challenge", &secret.verifying_key()));
    }

    #[test]
    fn debug_hides_secret() {
        let secret = SigningSecret::from_bytes([0xEEu8; 32]);
        let printed = format!("{secret:?}");
        assert!(printed.contains("verifying_key"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_flipped_bit_is_rejected(
            seed in any::<[u8; 32]>(),
            padding in any::<[u8; 32]>(),
            index in 0usize..CHALLENGE_RESPONSE_SIZE,
        ) {
            let secret = SigningSecret::from_bytes(seed);
            let mut response = solve_challenge(b"challenge", &secret, padding);
            response[index] ^= 0x01;
            prop_assert!(!check_challenge_response(&response, b"challenge", &secret.verifying_key()));
        }
    }
}
