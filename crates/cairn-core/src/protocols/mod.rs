//! The protocols the engine runs.
//!
//! | id | protocol | purpose |
//! |----|----------|---------|
//! | 1 | [`ChannelCreationWithOwnedDevice`] | first channel between two devices of one identity |
//! | 2 | [`FullRatchet`] | renew the seed of an existing channel |
//! | 3 | [`DeviceCapabilities`] | tell another owned device what this one supports |

pub mod channel_creation;
pub mod device_capabilities;
pub mod full_ratchet;

use cairn_crypto::{KemCiphertext, KemPublicKey, KemSecretKey, Seed, SymmetricKey};
use cairn_proto::{FieldReader, FieldWriter, WireError};
pub use channel_creation::ChannelCreationWithOwnedDevice;
pub use device_capabilities::DeviceCapabilities;
pub use full_ratchet::FullRatchet;

use crate::env::Environment;

/// Bits below the random nonce of a restart counter
const RESTART_NONCE_SHIFT: u32 = 23;

/// Fresh restart counter: a random 40-bit nonce shifted into the top bits.
///
/// Resends add one, so the low bits count attempts within one nonce.
pub fn fresh_restart_counter<E: Environment>(env: &E) -> u64 {
    (env.random_u64() >> 24) << RESTART_NONCE_SHIFT
}

/// Random nonce part of a restart counter.
pub fn restart_nonce(counter: u64) -> u64 {
    counter >> RESTART_NONCE_SHIFT
}

/// Whether a reply carrying `received` belongs to the attempt stored as
/// `stored`.
///
/// A reply from another round carries another nonce and is never accepted,
/// however its low bits compare.
pub fn answers_attempt(stored: u64, received: u64) -> bool {
    restart_nonce(received) == restart_nonce(stored) && received >= stored
}

/// Whether an initiator's `received` counter starts a newer attempt than the
/// one stored as `stored`.
pub fn supersedes_attempt(stored: u64, received: u64) -> bool {
    restart_nonce(received) != restart_nonce(stored) || received > stored
}

fn read_public_key(reader: &mut FieldReader<'_>) -> Result<KemPublicKey, WireError> {
    Ok(KemPublicKey::from_bytes(reader.array()?))
}

fn read_ciphertext(reader: &mut FieldReader<'_>) -> Result<KemCiphertext, WireError> {
    Ok(KemCiphertext::from_bytes(reader.array()?))
}

fn read_secret_key(reader: &mut FieldReader<'_>) -> Result<KemSecretKey, WireError> {
    Ok(KemSecretKey::from_bytes(reader.array()?))
}

fn read_symmetric_key(reader: &mut FieldReader<'_>) -> Result<SymmetricKey, WireError> {
    Ok(SymmetricKey::from_bytes(reader.array()?))
}

fn read_seed(reader: &mut FieldReader<'_>) -> Result<Seed, WireError> {
    Ok(Seed::from_bytes(reader.array()?))
}

fn write_secret_key(writer: FieldWriter, secret_key: &KemSecretKey) -> FieldWriter {
    writer.bytes(secret_key.to_secret_bytes().as_bytes())
}
