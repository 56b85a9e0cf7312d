//! Environment for real nodes.
//!
//! `SystemEnv` backs every ephemeral key, nonce, padding, restart counter and
//! instance uid a node generates with the OS cryptographic RNG, so
//! production handshakes are not reproducible.

use cairn_core::Environment;

/// Monotonic system clock and `getrandom` entropy.
///
/// Stateless; every clone draws from the same OS source.
///
/// # Panics
///
/// Panics if the OS RNG fails. A node without functioning randomness would
/// generate predictable KEM keys and restart counters.
#[derive(Clone, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// System environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = std::time::Instant;

    #[allow(clippy::disallowed_methods)]
    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer)
            .expect("invariant: OS RNG failure is unrecoverable - key material would be predictable");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    #[allow(clippy::disallowed_methods)]
    fn time_advances() {
        let env = SystemEnv::new();

        let t1 = env.now();
        std::thread::sleep(Duration::from_millis(10));
        let t2 = env.now();

        assert!(t2 > t1, "Time should advance");
    }

    #[test]
    fn uids_differ() {
        let env = SystemEnv::new();
        assert_ne!(env.random_uid(), env.random_uid());
    }

    #[test]
    fn random_u64_uses_full_width() {
        let env = SystemEnv::new();
        let any_high_bits = (0..16).any(|_| env.random_u64() > u64::from(u32::MAX));
        assert!(any_high_bits);
    }
}
