//! Identifiers used throughout the engine.
//!
//! All identifiers are 32-byte strings ordered lexicographically. The order
//! of [`DeviceUid`] is significant: it decides which device initiates when
//! two devices start a handshake at the same time.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, WireError};

/// Size of every identifier in bytes
pub const ID_SIZE: usize = 32;

fn parse_array(bytes: &[u8], context: &'static str) -> Result<[u8; ID_SIZE]> {
    bytes.try_into().map_err(|_| WireError::InvalidLength {
        context,
        expected: ID_SIZE,
        got: bytes.len(),
    })
}

fn write_short_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8; ID_SIZE]) -> fmt::Result {
    for byte in &bytes[..6] {
        write!(f, "{byte:02x}")?;
    }
    Ok(())
}

/// Random 32-byte identifier (protocol instances, messages).
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Uid(#[serde(with = "serde_bytes")] [u8; ID_SIZE]);

impl Uid {
    /// Wrap raw bytes.
    pub const fn from_bytes(bytes: [u8; ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse from a slice, checking the length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        parse_array(bytes, "uid").map(Self)
    }

    /// Borrow the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_short_hex(f, &self.0)
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uid({self})")
    }
}

/// Identifier of one device of an identity.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceUid(Uid);

impl DeviceUid {
    /// Wrap raw bytes.
    pub const fn from_bytes(bytes: [u8; ID_SIZE]) -> Self {
        Self(Uid::from_bytes(bytes))
    }

    /// Parse from a slice, checking the length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        parse_array(bytes, "device uid").map(Self::from_bytes)
    }

    /// Borrow the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; ID_SIZE] {
        self.0.as_bytes()
    }
}

impl fmt::Display for DeviceUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for DeviceUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceUid({})", self.0)
    }
}

/// Public identity: the 32-byte Ed25519 verifying key of a user.
///
/// All devices of a user share the same identity.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity(#[serde(with = "serde_bytes")] [u8; ID_SIZE]);

impl Identity {
    /// Wrap raw verifying key bytes.
    pub const fn from_bytes(bytes: [u8; ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse from a slice, checking the length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        parse_array(bytes, "identity").map(Self)
    }

    /// Borrow the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_short_hex(f, &self.0)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({self})")
    }
}
