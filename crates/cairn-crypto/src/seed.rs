//! Channel seed derivation using HKDF

use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::{kem::SymmetricKey, secret::Secret};

/// Size of a channel seed (32 bytes)
pub const SEED_SIZE: usize = 32;

/// Label used when combining encapsulated keys into a seed
const SEED_LABEL: &[u8] = b"cairnSeedV1";

/// Label used for per-direction seeds
const DIRECTION_LABEL: &[u8] = b"cairnDirectionV1";

/// Shared channel seed.
///
/// Both ends of a handshake derive the same seed from the same ordered list
/// of encapsulated keys.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seed(Secret<SEED_SIZE>);

impl Seed {
    /// Wrap raw seed bytes (used when loading persisted state).
    pub fn from_bytes(bytes: [u8; SEED_SIZE]) -> Self {
        Self(Secret::from_bytes(bytes))
    }

    /// Borrow the raw seed bytes.
    pub fn as_bytes(&self) -> &[u8; SEED_SIZE] {
        self.0.as_bytes()
    }

    /// Derive a seed from an ordered list of keys.
    ///
    /// # Security
    ///
    /// - Order matters: `[k1, k2]` and `[k2, k1]` give different seeds
    /// - Deterministic: same inputs always produce same output
    pub fn from_keys(keys: &[&SymmetricKey]) -> Self {
        let mut ikm = Vec::with_capacity(keys.len() * 32);
        for key in keys {
            ikm.extend_from_slice(key.as_bytes());
        }

        let hkdf = Hkdf::<Sha256>::new(None, &ikm);
        ikm.zeroize();

        let mut seed = [0u8; SEED_SIZE];
        let Ok(()) = hkdf.expand(SEED_LABEL, &mut seed) else {
            unreachable!("32 bytes is a valid HKDF-SHA256 output length");
        };

        let result = Self::from_bytes(seed);
        seed.zeroize();
        result
    }

    /// Seed for messages sent by `sender_device`.
    ///
    /// Each side seals with the seed bound to its own device and opens with
    /// the seed bound to the remote device, so the two directions never share
    /// a key stream.
    pub fn directional(&self, sender_device: &[u8]) -> Self {
        let hkdf = Hkdf::<Sha256>::new(None, self.as_bytes());

        let mut info = Vec::with_capacity(DIRECTION_LABEL.len() + sender_device.len());
        info.extend_from_slice(DIRECTION_LABEL);
        info.extend_from_slice(sender_device);

        let mut seed = [0u8; SEED_SIZE];
        let Ok(()) = hkdf.expand(&info, &mut seed) else {
            unreachable!("32 bytes is a valid HKDF-SHA256 output length");
        };

        let result = Self::from_bytes(seed);
        seed.zeroize();
        result
    }
}
