//! Domain-separated SHA-256 digests.

use sha2::{Digest, Sha256};

/// SHA-256 over a domain label and a list of parts.
///
/// Every part is prefixed with its length (u32, big-endian) so that
/// `["ab", "c"]` and `["a", "bc"]` never collide.
pub fn domain_digest(domain: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update((domain.len() as u32).to_be_bytes());
    hasher.update(domain);
    for part in parts {
        hasher.update((part.len() as u32).to_be_bytes());
        hasher.update(part);
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_deterministic() {
        let a = domain_digest(b"label", &[b"one", b"two"]);
        let b = domain_digest(b"label", &[b"one", b"two"]);
        assert_eq!(a, b);
    }

    #[test]
    fn part_boundaries_matter() {
        let a = domain_digest(b"label", &[b"ab", b"c"]);
        let b = domain_digest(b"label", &[b"a", b"bc"]);
        assert_ne!(a, b);
    }

    #[test]
    fn domain_separates() {
        let a = domain_digest(b"one", &[b"x"]);
        let b = domain_digest(b"two", &[b"x"]);
        assert_ne!(a, b);
    }
}
