//! Cairn production node.
//!
//! Production glue around [`cairn_core`]'s sans-IO engine: system time and
//! OS randomness, a durable Redb store, and a [`Node`] driver that turns
//! transport and user events into envelopes to send.
//!
//! # Components
//!
//! - [`Node`]: event/action driver over the engine
//! - [`RedbStorage`]: durable store with single-transaction commits
//! - [`ChaoticStorage`]: fault-injecting store wrapper for chaos tests
//! - [`SystemEnv`]: production environment (real time, crypto RNG)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod node;
pub mod storage;
mod system_env;

pub use config::NodeConfig;
pub use error::NodeError;
pub use node::{Node, NodeAction, NodeEvent, NodeStats};
pub use storage::{ChaoticStorage, MemoryStorage, RedbStorage, Storage, StorageError};
pub use system_env::SystemEnv;
