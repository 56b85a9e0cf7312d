//! Engine configuration.

use cairn_proto::MAX_ENVELOPE_SIZE;

/// Tunables for [`crate::Engine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// How many times a step is re-run after a revision conflict before the
    /// message is given up
    pub max_commit_attempts: u32,

    /// Crypto suite version recorded on newly created channels
    pub crypto_suite_version: u64,

    /// Capabilities this device announces to its other devices
    pub capabilities: Vec<String>,

    /// Largest inbound envelope accepted by [`crate::Engine::receive`]
    pub max_envelope_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_commit_attempts: 3,
            crypto_suite_version: 0,
            capabilities: Vec::new(),
            max_envelope_size: MAX_ENVELOPE_SIZE,
        }
    }
}
