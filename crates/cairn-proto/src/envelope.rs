//! Channel envelopes: what actually travels between devices.
//!
//! An envelope pairs a [`Route`] with a body. Local and asymmetric routes
//! carry the encoded protocol message in cleartext; oblivious routes carry it
//! sealed under the channel's current send seed.

use serde::{Deserialize, Serialize};

use crate::{
    errors::{Result, WireError},
    ids::{DeviceUid, Identity, Uid},
};

/// Maximum size of an encoded envelope (64 KiB)
pub const MAX_ENVELOPE_SIZE: usize = 64 * 1024;

/// Addressing information for an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Route {
    /// Loopback to another protocol on the same device
    Local {
        /// Owned identity the message stays within
        identity: Identity,
    },

    /// Unauthenticated bootstrap delivery to an identity's devices
    Asymmetric {
        /// Recipient identity
        to_identity: Identity,
        /// Recipient devices (empty means every device of the identity)
        to_devices: Vec<DeviceUid>,
        /// Claimed sender identity (not authenticated)
        from_identity: Identity,
    },

    /// Authenticated delivery over an established channel
    Oblivious {
        /// Recipient identity
        to_identity: Identity,
        /// Recipient device
        to_device: DeviceUid,
        /// Sender identity
        from_identity: Identity,
        /// Sender device
        from_device: DeviceUid,
    },
}

/// Envelope payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeBody {
    /// Encoded protocol message in cleartext
    Cleartext(#[serde(with = "serde_bytes")] Vec<u8>),

    /// Encoded protocol message sealed with a channel message key
    Sealed {
        /// Generation of the message key
        generation: u64,
        /// AEAD nonce
        #[serde(with = "serde_bytes")]
        nonce: [u8; 24],
        /// Ciphertext including the authentication tag
        #[serde(with = "serde_bytes")]
        ciphertext: Vec<u8>,
    },
}

/// A message ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEnvelope {
    /// Identifier returned by `post_message`
    pub message_id: Uid,
    /// Where the message goes
    pub route: Route,
    /// What the message carries
    pub body: EnvelopeBody,
}

impl ChannelEnvelope {
    /// Encode to CBOR bytes.
    ///
    /// # Errors
    ///
    /// - `WireError::CborEncode` if serialization fails
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| WireError::CborEncode(e.to_string()))?;
        Ok(bytes)
    }

    /// Decode from CBOR bytes.
    ///
    /// # Errors
    ///
    /// - `WireError::TooLarge` if `bytes` exceeds [`MAX_ENVELOPE_SIZE`]
    /// - `WireError::CborDecode` if the bytes are not a valid envelope
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_ENVELOPE_SIZE {
            return Err(WireError::TooLarge { size: bytes.len(), max: MAX_ENVELOPE_SIZE });
        }
        ciborium::from_reader(bytes).map_err(|e| WireError::CborDecode(e.to_string()))
    }

    /// Recipient identity of this envelope.
    pub fn recipient(&self) -> &Identity {
        match &self.route {
            Route::Local { identity } => identity,
            Route::Asymmetric { to_identity, .. } | Route::Oblivious { to_identity, .. } => {
                to_identity
            },
        }
    }
}
