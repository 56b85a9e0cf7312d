//! Storage backends for a node.
//!
//! [`RedbStorage`] is the durable store a node runs on. [`ChaoticStorage`]
//! wraps any store and injects failures for chaos testing.

mod chaotic;
mod redb;

pub use cairn_core::{MemoryStorage, Storage, StorageError};
pub use chaotic::ChaoticStorage;

pub use self::redb::RedbStorage;
