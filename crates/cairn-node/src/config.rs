//! Node configuration.

use std::path::PathBuf;

use cairn_core::EngineConfig;

/// Configuration for [`crate::Node::open`].
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Path of the Redb database file
    pub database_path: PathBuf,
    /// Engine tunables
    pub engine: EngineConfig,
}

impl NodeConfig {
    /// Default engine settings over the database at `database_path`.
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self { database_path: database_path.into(), engine: EngineConfig::default() }
    }

    /// Replace the capabilities this device announces.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.engine.capabilities = capabilities;
        self
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::new("cairn.redb")
    }
}
