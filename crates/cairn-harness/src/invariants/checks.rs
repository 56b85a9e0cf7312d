//! Standard invariant checks.
//!
//! All of them are meant for quiescent states: the relay is empty and no
//! handshake is mid-flight.

use super::{Invariant, InvariantResult, SystemSnapshot, Violation};

/// Both ends of a channel hold crossed directional seeds.
///
/// What one device sends with, the other receives with. A mismatch means
/// the handshake (or a ratchet) derived different secrets on each side.
pub struct SeedsAgree;

impl Invariant for SeedsAgree {
    fn name(&self) -> &'static str {
        "SeedsAgree"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for holder in &state.devices {
            for channel in &holder.channels {
                let Some(peer) = state.device(&channel.remote_identity, &channel.remote_device)
                else {
                    continue;
                };
                let Some(reverse) = peer.channel_to(&holder.identity, &holder.device) else {
                    continue;
                };

                if channel.record.send_seed != reverse.record.receive_seed
                    || channel.record.receive_seed != reverse.record.send_seed
                {
                    return Err(Violation {
                        invariant: self.name(),
                        device: Some(holder.device),
                        message: format!(
                            "device {} and device {} hold different seeds",
                            holder.device, peer.device
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// A channel exists at both ends or at neither, and both agree on whether it
/// is confirmed.
pub struct ChannelsAreMutual;

impl Invariant for ChannelsAreMutual {
    fn name(&self) -> &'static str {
        "ChannelsAreMutual"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for holder in &state.devices {
            for channel in &holder.channels {
                let Some(peer) = state.device(&channel.remote_identity, &channel.remote_device)
                else {
                    continue;
                };

                match peer.channel_to(&holder.identity, &holder.device) {
                    None => {
                        return Err(Violation {
                            invariant: self.name(),
                            device: Some(holder.device),
                            message: format!(
                                "device {} holds a channel to {} but not the other way",
                                holder.device, peer.device
                            ),
                        });
                    },
                    Some(reverse) if reverse.record.confirmed != channel.record.confirmed => {
                        return Err(Violation {
                            invariant: self.name(),
                            device: Some(holder.device),
                            message: format!(
                                "devices {} and {} disagree on confirmation",
                                holder.device, peer.device
                            ),
                        });
                    },
                    Some(_) => {},
                }
            }
        }
        Ok(())
    }
}

/// No protocol instance is left stored once everything settled.
///
/// Finished instances are deleted; a leftover one is a handshake that will
/// never complete.
pub struct NoStrandedInstances;

impl Invariant for NoStrandedInstances {
    fn name(&self) -> &'static str {
        "NoStrandedInstances"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        match state.devices.iter().find(|device| device.live_instances > 0) {
            Some(device) => Err(Violation {
                invariant: self.name(),
                device: Some(device.device),
                message: format!(
                    "device {} still stores {} instance(s)",
                    device.device, device.live_instances
                ),
            }),
            None => Ok(()),
        }
    }
}
