//! Invariant checking for deterministic simulation testing.
//!
//! Invariants are properties that must hold whenever the simulation is
//! quiescent, whatever order the relay delivered messages in. They verify
//! WHAT must be true, not specific scenarios.
//!
//! # Usage
//!
//! ```ignore
//! let registry = InvariantRegistry::standard();
//! sim.run_until_quiet(1_000);
//! registry.assert_all(&sim.snapshot(), "after pairing");
//! ```

mod checks;
mod snapshot;

use std::fmt;

use cairn_proto::DeviceUid;

pub use checks::{ChannelsAreMutual, NoStrandedInstances, SeedsAgree};
pub use snapshot::{ChannelSnapshot, DeviceSnapshot, SystemSnapshot};

/// Invariant check result.
pub type InvariantResult = Result<(), Violation>;

/// A broken invariant and the device it was found on.
#[derive(Debug, Clone)]
pub struct Violation {
    /// Name of the violated invariant
    pub invariant: &'static str,
    /// Device whose persisted state shows the violation, if one can be named
    pub device: Option<DeviceUid>,
    /// What went wrong
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.device {
            Some(device) => write!(f, "{} on {}: {}", self.invariant, device, self.message),
            None => write!(f, "{}: {}", self.invariant, self.message),
        }
    }
}

impl std::error::Error for Violation {}

/// An invariant that can be checked against system state.
pub trait Invariant: Send + Sync {
    /// Invariant name for error reporting.
    fn name(&self) -> &'static str;

    /// Check the invariant against a snapshot.
    fn check(&self, state: &SystemSnapshot) -> InvariantResult;
}

/// Registry of invariants to check.
pub struct InvariantRegistry {
    invariants: Vec<Box<dyn Invariant>>,
}

impl Default for InvariantRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InvariantRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self { invariants: Vec::new() }
    }

    /// Registry with the channel invariants.
    ///
    /// Includes:
    /// - [`SeedsAgree`]: both ends hold crossed directional seeds
    /// - [`ChannelsAreMutual`]: channels exist and are confirmed at both ends
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.add(SeedsAgree);
        registry.add(ChannelsAreMutual);
        registry
    }

    /// Add an invariant to the registry.
    pub fn add<I: Invariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    /// Check all invariants against the given state.
    ///
    /// Returns every violation found.
    pub fn check_all(&self, state: &SystemSnapshot) -> Result<(), Vec<Violation>> {
        let violations: Vec<_> =
            self.invariants.iter().filter_map(|inv| inv.check(state).err()).collect();

        if violations.is_empty() { Ok(()) } else { Err(violations) }
    }

    /// Check all invariants, panicking with every violation.
    ///
    /// # Panics
    ///
    /// Panics if any invariant is violated.
    #[allow(clippy::panic)]
    pub fn assert_all(&self, state: &SystemSnapshot, context: &str) {
        if let Err(violations) = self.check_all(state) {
            let messages: Vec<_> = violations.iter().map(ToString::to_string).collect();
            panic!("Invariant violation {context}:\n  {}", messages.join("\n  "));
        }
    }

    /// Number of registered invariants.
    pub fn len(&self) -> usize {
        self.invariants.len()
    }

    /// Check if registry is empty.
    pub fn is_empty(&self) -> bool {
        self.invariants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_registry_has_invariants() {
        assert_eq!(InvariantRegistry::standard().len(), 2);
    }

    #[test]
    fn empty_snapshot_passes_invariants() {
        let mut registry = InvariantRegistry::standard();
        registry.add(NoStrandedInstances);
        assert!(registry.check_all(&SystemSnapshot::empty()).is_ok());
    }
}
