//! Container for sensitive fixed-size byte strings.

use std::fmt;

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::ZeroizeOnDrop;

/// Sensitive bytes that are zeroized on drop.
///
/// Equality is constant-time and `Debug` never prints the value.
#[derive(Clone, Eq, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct Secret<const N: usize>(#[serde(with = "serde_bytes")] [u8; N]);

impl<const N: usize> Secret<N> {
    /// Wrap raw secret bytes.
    pub fn from_bytes(bytes: [u8; N]) -> Self {
        Self(bytes)
    }

    /// Borrow the secret bytes.
    pub fn as_bytes(&self) -> &[u8; N] {
        &self.0
    }
}

impl<const N: usize> PartialEq for Secret<N> {
    fn eq(&self, other: &Self) -> bool {
        bool::from(self.0.ct_eq(&other.0))
    }
}

impl<const N: usize> fmt::Debug for Secret<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret").field("value", &"***").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_is_redacted() {
        let secret = Secret::from_bytes([0x42u8; 4]);
        let printed = format!("{secret:?}");
        assert!(!printed.contains("42"));
        assert!(printed.contains("***"));
    }

    #[test]
    fn equality_compares_contents() {
        assert_eq!(Secret::from_bytes([1u8; 8]), Secret::from_bytes([1u8; 8]));
        assert_ne!(Secret::from_bytes([1u8; 8]), Secret::from_bytes([2u8; 8]));
    }
}
