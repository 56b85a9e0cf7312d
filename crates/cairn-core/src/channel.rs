//! Channel abstraction: how messages leave and enter the engine.
//!
//! Outbound, a step names a [`ChannelDescriptor`] and the transaction turns
//! the message into one [`ChannelEnvelope`] per recipient device. Inbound,
//! [`open_envelope`] checks the addressing, opens sealed bodies and reports
//! the [`ReceptionChannelInfo`] the dispatcher matches origin rules against.
//!
//! # Oblivious sealing
//!
//! Each oblivious channel holds one directional seed per direction. A
//! message is sealed under `derive_message_key(send_seed, generation)` with
//! associated data binding the sender, the recipient and the generation:
//!
//! ```text
//! aad = label ‖ from_identity ‖ from_device ‖ to_identity ‖ to_device ‖ generation
//! ```
//!
//! The receiver derives the key from the generation on the envelope, so
//! out-of-order delivery needs no state. Opening tries the current receive
//! seed, then the one it replaced at the last ratchet.

use cairn_crypto::{NONCE_SIZE, SealedMessage, Seed, derive_message_key, open, seal};
use cairn_proto::{ChannelEnvelope, DeviceUid, EnvelopeBody, Identity, ProtocolMessage, Route};

use crate::{
    action::DropReason,
    error::{EngineError, IdentityError},
    services::IdentityService,
    store::{ChannelKey, ObliviousChannelRecord, Storage},
};

const AAD_LABEL: &[u8] = b"cairnObliviousV1";

/// Where an outbound message goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelDescriptor {
    /// Loopback to this device
    Local,

    /// Unauthenticated bootstrap delivery
    Asymmetric {
        /// Recipient identity
        to_identity: Identity,
        /// Recipient devices (empty means all)
        to_devices: Vec<DeviceUid>,
    },

    /// Sealed delivery over established channels, one envelope per device
    Oblivious {
        /// Recipient identity
        to_identity: Identity,
        /// Recipient devices
        to_devices: Vec<DeviceUid>,
        /// Refuse to send on a channel that is not confirmed yet
        necessarily_confirmed: bool,
    },
}

impl ChannelDescriptor {
    /// Asymmetric delivery to a single device.
    pub fn asymmetric_to(identity: Identity, device: DeviceUid) -> Self {
        Self::Asymmetric { to_identity: identity, to_devices: vec![device] }
    }

    /// Oblivious delivery to a single device.
    pub fn oblivious_to(identity: Identity, device: DeviceUid, necessarily_confirmed: bool) -> Self {
        Self::Oblivious { to_identity: identity, to_devices: vec![device], necessarily_confirmed }
    }
}

/// How an inbound message arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceptionChannelInfo {
    /// Loopback from this device
    Local,
    /// Unauthenticated bootstrap channel
    Asymmetric,
    /// Established channel with a specific remote device
    Oblivious {
        /// Remote identity
        remote_identity: Identity,
        /// Remote device
        remote_device: DeviceUid,
    },
}

/// An inbound envelope that passed addressing and decryption.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenedEnvelope {
    /// Owned identity the message is for
    pub owned_identity: Identity,
    /// How it arrived
    pub origin: ReceptionChannelInfo,
    /// The decoded message
    pub message: ProtocolMessage,
}

/// Associated data for a sealed oblivious body.
pub fn oblivious_aad(
    from_identity: &Identity,
    from_device: &DeviceUid,
    to_identity: &Identity,
    to_device: &DeviceUid,
    generation: u64,
) -> Vec<u8> {
    let mut aad = Vec::with_capacity(AAD_LABEL.len() + 4 * 32 + 8);
    aad.extend_from_slice(AAD_LABEL);
    aad.extend_from_slice(from_identity.as_bytes());
    aad.extend_from_slice(from_device.as_bytes());
    aad.extend_from_slice(to_identity.as_bytes());
    aad.extend_from_slice(to_device.as_bytes());
    aad.extend_from_slice(&generation.to_be_bytes());
    aad
}

/// Fresh channel record for a newly negotiated seed.
pub fn new_channel_record(
    seed: &Seed,
    local_device: DeviceUid,
    remote_device: &DeviceUid,
    suite_version: u64,
) -> ObliviousChannelRecord {
    ObliviousChannelRecord {
        local_device,
        suite_version,
        confirmed: false,
        send_seed: seed.directional(local_device.as_bytes()),
        send_generation: 0,
        receive_seed: seed.directional(remote_device.as_bytes()),
        previous_receive_seed: None,
    }
}

/// Seal `plaintext` on `record` and advance its send generation.
pub fn seal_oblivious(
    record: &mut ObliviousChannelRecord,
    key: &ChannelKey,
    plaintext: &[u8],
    nonce: [u8; NONCE_SIZE],
) -> EnvelopeBody {
    let generation = record.send_generation;
    let aad = oblivious_aad(
        &key.owned_identity,
        &record.local_device,
        &key.remote_identity,
        &key.remote_device,
        generation,
    );
    let message_key = derive_message_key(&record.send_seed, generation);
    let sealed = seal(plaintext, &aad, &message_key, nonce);
    record.send_generation += 1;

    EnvelopeBody::Sealed {
        generation: sealed.generation,
        nonce: sealed.nonce,
        ciphertext: sealed.ciphertext,
    }
}

/// Open a sealed body received on `record`. `None` if no receive seed fits.
pub fn open_oblivious(
    record: &ObliviousChannelRecord,
    key: &ChannelKey,
    sealed: &SealedMessage,
) -> Option<Vec<u8>> {
    let aad = oblivious_aad(
        &key.remote_identity,
        &key.remote_device,
        &key.owned_identity,
        &record.local_device,
        sealed.generation,
    );

    std::iter::once(&record.receive_seed)
        .chain(record.previous_receive_seed.as_ref())
        .find_map(|seed| open(sealed, &aad, &derive_message_key(seed, sealed.generation)).ok())
}

/// Current device of `identity`, or `None` when the identity is not owned.
fn owned_device<I: IdentityService>(
    identity_service: &I,
    identity: &Identity,
) -> Result<Option<DeviceUid>, EngineError> {
    match identity_service.current_device_uid(identity) {
        Ok(device) => Ok(Some(device)),
        Err(IdentityError::UnknownOwnedIdentity(_)) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Check addressing, open the body and decode the protocol message.
///
/// # Errors
///
/// - `EngineError::Storage` / `EngineError::Identity` if a collaborator fails.
///   Every problem with the envelope itself is a [`DropReason`].
pub fn open_envelope<S: Storage, I: IdentityService>(
    storage: &S,
    identity_service: &I,
    envelope: &ChannelEnvelope,
) -> Result<Result<OpenedEnvelope, DropReason>, EngineError> {
    let (owned_identity, origin, plaintext) = match (&envelope.route, &envelope.body) {
        (Route::Local { identity }, EnvelopeBody::Cleartext(bytes)) => {
            if owned_device(identity_service, identity)?.is_none() {
                return Ok(Err(DropReason::NotAddressedToUs));
            }
            (*identity, ReceptionChannelInfo::Local, bytes.clone())
        },

        (Route::Asymmetric { to_identity, to_devices, .. }, EnvelopeBody::Cleartext(bytes)) => {
            let Some(current) = owned_device(identity_service, to_identity)? else {
                return Ok(Err(DropReason::NotAddressedToUs));
            };
            if !to_devices.is_empty() && !to_devices.contains(&current) {
                return Ok(Err(DropReason::NotAddressedToUs));
            }
            (*to_identity, ReceptionChannelInfo::Asymmetric, bytes.clone())
        },

        (
            Route::Oblivious { to_identity, to_device, from_identity, from_device },
            EnvelopeBody::Sealed { generation, nonce, ciphertext },
        ) => {
            let Some(current) = owned_device(identity_service, to_identity)? else {
                return Ok(Err(DropReason::NotAddressedToUs));
            };
            if current != *to_device {
                return Ok(Err(DropReason::NotAddressedToUs));
            }

            let key = ChannelKey {
                owned_identity: *to_identity,
                remote_identity: *from_identity,
                remote_device: *from_device,
            };
            let Some(record) = storage.load_channel(&key)? else {
                return Ok(Err(DropReason::UnknownChannel));
            };

            let sealed = SealedMessage {
                generation: *generation,
                nonce: *nonce,
                ciphertext: ciphertext.clone(),
            };
            let Some(plaintext) = open_oblivious(&record, &key, &sealed) else {
                return Ok(Err(DropReason::Undecryptable));
            };

            let origin = ReceptionChannelInfo::Oblivious {
                remote_identity: *from_identity,
                remote_device: *from_device,
            };
            (*to_identity, origin, plaintext)
        },

        _ => return Ok(Err(DropReason::MalformedEnvelope)),
    };

    let Ok(message) = ProtocolMessage::from_bytes(&plaintext) else {
        return Ok(Err(DropReason::UndecodableMessage));
    };

    Ok(Ok(OpenedEnvelope { owned_identity, origin, message }))
}
