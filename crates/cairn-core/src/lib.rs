//! Cairn handshake engine.
//!
//! A persistent, message-driven state machine runner for the protocols that
//! create and renew secure channels between devices. The engine is sans-IO:
//! it consumes envelopes and user actions and returns [`EngineAction`]s for
//! the caller to execute. Everything it needs from the outside world comes in
//! through traits:
//!
//! - [`Environment`]: time and randomness
//! - [`Storage`]: atomic persistence of instances, channels, the replay guard
//!   and the outbox
//! - [`IdentityService`] / [`ChallengeService`]: identity bookkeeping and
//!   challenge signatures
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │ Engine                                               │
//! │   open_envelope ─▶ resolve_step ─▶ Protocol::execute │
//! │                                       │              │
//! │                                  Transaction         │
//! │                                       │              │
//! │                              Storage::commit         │
//! └──────────────────────────────────────────────────────┘
//!                     │ EngineAction
//!                     ▼
//!              driver / transport
//! ```
//!
//! A protocol is a state enum, a message enum and a static step table (see
//! [`registry`]). Steps never write to the store directly: they record writes
//! in a [`Transaction`] that the dispatcher commits in one piece.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod action;
pub mod channel;
pub mod config;
pub mod engine;
pub mod env;
pub mod error;
pub mod protocols;
pub mod registry;
pub mod services;
pub mod store;
pub mod transaction;

pub use action::{DropReason, EngineAction, ProtocolOutcome};
pub use channel::{ChannelDescriptor, OpenedEnvelope, ReceptionChannelInfo};
pub use config::EngineConfig;
pub use engine::Engine;
pub use env::Environment;
pub use error::{ChallengeError, ChannelError, EngineError, IdentityError, StepError};
pub use protocols::{ChannelCreationWithOwnedDevice, DeviceCapabilities, FullRatchet};
pub use registry::{OriginRule, Protocol, StepDescriptor, Transition};
pub use services::{ChallengeService, IdentityService, KeyringChallengeService};
pub use store::{
    ChannelKey, InstanceKey, MemoryStorage, ObliviousChannelRecord, OutboundRecord,
    OwnedDeviceInstanceRecord, Storage, StorageError, StoredInstance, WriteOp, WriteSet,
};
pub use transaction::Transaction;
