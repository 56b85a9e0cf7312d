//! Node error types.

use cairn_core::{EngineError, StorageError};
use cairn_proto::WireError;
use thiserror::Error;

/// Errors surfaced by [`crate::Node`].
///
/// Malformed inbound envelopes are not errors: the node logs and discards
/// them. What reaches the caller is either a store failure (usually
/// transient, retry the event) or a local request the engine refused.
#[derive(Error, Debug)]
pub enum NodeError {
    /// The database could not be opened
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The engine failed outside any protocol step
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// An outbound envelope could not be encoded
    #[error("encoding error: {0}")]
    Encoding(#[from] WireError),
}

impl NodeError {
    /// Returns true if re-submitting the same event may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Storage(err) => err.is_transient(),
            Self::Engine(err) => err.is_transient(),
            Self::Encoding(_) => false,
        }
    }
}
