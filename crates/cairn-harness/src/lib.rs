//! Deterministic simulation harness for the Cairn handshake engine.
//!
//! Runs several devices, each with a real [`cairn_core::Engine`], over a
//! seeded relay that can reorder, duplicate and lose envelopes. Every run is
//! reproducible from its seed.
//!
//! # Invariant Testing
//!
//! The `invariants` module checks properties of the whole system once the
//! relay is quiet: both ends of a channel agree on their seeds, channels are
//! mutual, and no protocol instance is left behind. Use
//! [`InvariantRegistry::standard()`] for the common set.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod invariants;
pub mod relay;
pub mod sim_env;
pub mod sim_identity;
pub mod simulation;

pub use invariants::{
    ChannelSnapshot, ChannelsAreMutual, DeviceSnapshot, Invariant, InvariantRegistry,
    InvariantResult, NoStrandedInstances, SeedsAgree, SystemSnapshot, Violation,
};
pub use relay::{FaultConfig, InFlight, SimRelay, route_targets};
pub use sim_env::{SimEnv, SimInstant};
pub use sim_identity::SimIdentityService;
pub use simulation::{FinishedInstance, SentMessage, SimDevice, SimEngine, Simulation};
