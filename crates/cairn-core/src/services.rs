//! Collaborators the engine consumes.
//!
//! The engine never owns identities or signing keys. It asks an
//! [`IdentityService`] which device it is running on and tells it about
//! remote devices it learned of, and it asks a [`ChallengeService`] to sign
//! and check channel-creation challenges.

use std::collections::HashMap;

use cairn_crypto::{
    CHALLENGE_PADDING_SIZE, CHALLENGE_RESPONSE_SIZE, SigningSecret, check_challenge_response,
    solve_challenge,
};
use cairn_proto::{DeviceUid, Identity};

use crate::error::{ChallengeError, IdentityError};

/// Domain prefix of the owned-device channel-creation challenge
const CHANNEL_CREATION_CHALLENGE_PREFIX: &[u8] = b"cairnChannelCreationWithOwnedDevice";

/// Identity bookkeeping owned by the surrounding system.
pub trait IdentityService {
    /// Device the engine runs on for `owned_identity`.
    ///
    /// # Errors
    ///
    /// - `UnknownOwnedIdentity` if the identity is not owned here
    fn current_device_uid(&self, owned_identity: &Identity) -> Result<DeviceUid, IdentityError>;

    /// Record `device` as another device of `owned_identity`. Idempotent.
    fn add_remote_device(
        &self,
        owned_identity: &Identity,
        device: &DeviceUid,
    ) -> Result<(), IdentityError>;

    /// Owned devices whose capabilities are not known yet.
    fn devices_needing_capability_discovery(
        &self,
        owned_identity: &Identity,
    ) -> Result<Vec<DeviceUid>, IdentityError>;

    /// Store the capabilities announced by another owned device.
    fn set_device_capabilities(
        &self,
        owned_identity: &Identity,
        device: &DeviceUid,
        capabilities: &[String],
    ) -> Result<(), IdentityError>;
}

/// Signs and verifies challenges on behalf of owned identities.
pub trait ChallengeService {
    /// Sign `challenge` as `identity`, mixing in a random `padding`.
    ///
    /// # Errors
    ///
    /// - `NoSigningKey` if no key is held for `identity`
    fn solve(
        &self,
        challenge: &[u8],
        identity: &Identity,
        padding: [u8; CHALLENGE_PADDING_SIZE],
    ) -> Result<[u8; CHALLENGE_RESPONSE_SIZE], ChallengeError>;

    /// Whether `response` is a valid response from `identity`.
    fn verify(&self, response: &[u8], challenge: &[u8], identity: &Identity) -> bool;
}

/// Challenge signed by `signer` when pinging `recipient`.
///
/// The device order makes a ping from A to B useless as a ping from B to A.
pub fn channel_creation_challenge(
    signer: &DeviceUid,
    recipient: &DeviceUid,
    identity: &Identity,
) -> Vec<u8> {
    let mut challenge = Vec::with_capacity(CHANNEL_CREATION_CHALLENGE_PREFIX.len() + 96);
    challenge.extend_from_slice(CHANNEL_CREATION_CHALLENGE_PREFIX);
    challenge.extend_from_slice(signer.as_bytes());
    challenge.extend_from_slice(recipient.as_bytes());
    challenge.extend_from_slice(identity.as_bytes());
    challenge
}

/// Ed25519 challenge service over an in-process keyring.
///
/// An [`Identity`] is the verifying key of its signing key, so verification
/// needs no keyring lookup.
#[derive(Debug, Default)]
pub struct KeyringChallengeService {
    keys: HashMap<Identity, SigningSecret>,
}

impl KeyringChallengeService {
    /// Empty keyring.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a signing key and return the identity it signs for.
    pub fn insert(&mut self, signing_secret: SigningSecret) -> Identity {
        let identity = Identity::from_bytes(signing_secret.verifying_key());
        self.keys.insert(identity, signing_secret);
        identity
    }
}

impl ChallengeService for KeyringChallengeService {
    fn solve(
        &self,
        challenge: &[u8],
        identity: &Identity,
        padding: [u8; CHALLENGE_PADDING_SIZE],
    ) -> Result<[u8; CHALLENGE_RESPONSE_SIZE], ChallengeError> {
        let key = self.keys.get(identity).ok_or(ChallengeError::NoSigningKey(*identity))?;
        Ok(solve_challenge(challenge, key, padding))
    }

    fn verify(&self, response: &[u8], challenge: &[u8], identity: &Identity) -> bool {
        check_challenge_response(response, challenge, identity.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyring_signs_for_inserted_identity() {
        let mut keyring = KeyringChallengeService::new();
        let identity = keyring.insert(SigningSecret::from_bytes([4u8; 32]));
        let a = DeviceUid::from_bytes([0xAA; 32]);
        let b = DeviceUid::from_bytes([0x11; 32]);

        let challenge = channel_creation_challenge(&a, &b, &identity);
        let response = keyring.solve(&challenge, &identity, [0u8; CHALLENGE_PADDING_SIZE]).unwrap();

        assert!(keyring.verify(&response, &challenge, &identity));
        let reversed = channel_creation_challenge(&b, &a, &identity);
        assert!(!keyring.verify(&response, &reversed, &identity));
    }

    #[test]
    fn unknown_identity_cannot_sign() {
        let keyring = KeyringChallengeService::new();
        let identity = Identity::from_bytes([1u8; 32]);
        assert_eq!(
            keyring.solve(b"challenge", &identity, [0u8; CHALLENGE_PADDING_SIZE]),
            Err(ChallengeError::NoSigningKey(identity))
        );
    }
}
