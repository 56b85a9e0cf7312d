//! Node driver.
//!
//! Wraps the sans-IO [`Engine`] with event/action types a transport runtime
//! can drive: bytes in, encoded envelopes out. The node decides which engine
//! failures the runtime has to see and which ones are just bad input from the
//! network.

use cairn_core::{
    ChallengeService, Engine, EngineAction, EngineConfig, Environment, IdentityService,
    InstanceKey, ProtocolOutcome, Storage,
};
use cairn_proto::{DeviceUid, Identity, Uid};

use crate::{NodeConfig, NodeError, RedbStorage, SystemEnv};

/// Events that the node processes.
///
/// These are produced by the external runtime (simulation or production).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// The node (re)started: resend what is still queued and finish local
    /// work interrupted by the last shutdown
    Started,

    /// An encoded envelope arrived from the transport
    EnvelopeReceived {
        /// Raw envelope bytes
        bytes: Vec<u8>,
    },

    /// Create a channel with another device of an owned identity
    ChannelCreationRequested {
        /// Owned identity
        owned_identity: Identity,
        /// Device to pair with
        remote_device: DeviceUid,
    },

    /// Renew the key material of an existing channel
    FullRatchetRequested {
        /// Owned identity
        owned_identity: Identity,
        /// Identity at the other end of the channel
        contact_identity: Identity,
        /// Device at the other end of the channel
        contact_device: DeviceUid,
    },

    /// Announce capabilities to every owned device that needs them
    CapabilityDiscoveryRequested {
        /// Owned identity
        owned_identity: Identity,
    },

    /// The transport took ownership of an envelope
    DeliveryConfirmed {
        /// Identifier from [`NodeAction::SendEnvelope`]
        message_id: Uid,
    },
}

/// Actions that the node produces.
///
/// These are executed by runtime-specific code (production or simulation).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeAction {
    /// Hand an encoded envelope to the transport, then report
    /// [`NodeEvent::DeliveryConfirmed`]
    SendEnvelope {
        /// Outbox identifier
        message_id: Uid,
        /// Identity the envelope is addressed to
        recipient: Identity,
        /// Encoded envelope
        bytes: Vec<u8>,
    },

    /// A protocol instance finished
    ProtocolFinished {
        /// The instance
        key: InstanceKey,
        /// How it finished
        outcome: ProtocolOutcome,
    },
}

/// Counters kept by a node since it was created.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NodeStats {
    /// Envelopes passed to the engine
    pub envelopes_received: u64,
    /// Envelopes refused before reaching any protocol (oversized, malformed)
    pub envelopes_rejected: u64,
    /// Messages the engine discarded without running a step
    pub messages_dropped: u64,
    /// Envelopes handed to the transport
    pub envelopes_sent: u64,
    /// Instances that reached a success state
    pub protocols_done: u64,
    /// Instances that were cancelled
    pub protocols_cancelled: u64,
}

/// Handshake node.
///
/// Generic over the same collaborators as the engine so tests can run it on
/// simulated time and in-memory or chaotic stores.
pub struct Node<E, S, I, C>
where
    E: Environment,
    S: Storage,
    I: IdentityService,
    C: ChallengeService,
{
    engine: Engine<E, S, I, C>,
    stats: NodeStats,
}

impl<I, C> Node<SystemEnv, RedbStorage, I, C>
where
    I: IdentityService,
    C: ChallengeService,
{
    /// Open the node's database and build a production node.
    ///
    /// Feed [`NodeEvent::Started`] next to resume work left by a previous
    /// run.
    ///
    /// # Errors
    ///
    /// - `Storage` if the database cannot be opened
    pub fn open(config: NodeConfig, identity: I, challenge: C) -> Result<Self, NodeError> {
        let storage = RedbStorage::open(&config.database_path)?;
        tracing::info!(path = %config.database_path.display(), "node database opened");
        Ok(Self::new(SystemEnv::new(), storage, identity, challenge, config.engine))
    }
}

impl<E, S, I, C> Node<E, S, I, C>
where
    E: Environment,
    S: Storage,
    I: IdentityService,
    C: ChallengeService,
{
    /// Create a node over an existing store.
    pub fn new(env: E, storage: S, identity: I, challenge: C, config: EngineConfig) -> Self {
        Self { engine: Engine::new(env, storage, identity, challenge, config), stats: NodeStats::default() }
    }

    /// The wrapped engine.
    pub fn engine(&self) -> &Engine<E, S, I, C> {
        &self.engine
    }

    /// Counters since creation.
    pub fn stats(&self) -> NodeStats {
        self.stats
    }

    /// Process one event.
    ///
    /// # Errors
    ///
    /// Store failures outside any protocol step and local requests the
    /// engine refused (unknown owned identity). Inbound envelopes that are
    /// oversized or undecodable are counted and discarded, not returned.
    pub fn process_event(&mut self, event: NodeEvent) -> Result<Vec<NodeAction>, NodeError> {
        let actions = match event {
            NodeEvent::Started => {
                // Snapshot the outbox before resuming so envelopes produced
                // by the resumed steps are not reported twice.
                let mut actions = self.engine.pending_deliveries()?;
                actions.extend(self.engine.resume()?);
                actions
            },

            NodeEvent::EnvelopeReceived { bytes } => match self.engine.receive(&bytes) {
                Ok(actions) => {
                    self.stats.envelopes_received += 1;
                    actions
                },
                Err(err) if !err.is_transient() => {
                    self.stats.envelopes_rejected += 1;
                    tracing::debug!(error = %err, size = bytes.len(), "inbound envelope rejected");
                    Vec::new()
                },
                Err(err) => return Err(err.into()),
            },

            NodeEvent::ChannelCreationRequested { owned_identity, remote_device } => {
                self.engine.start_channel_creation(owned_identity, remote_device)?
            },

            NodeEvent::FullRatchetRequested { owned_identity, contact_identity, contact_device } => {
                self.engine.start_full_ratchet(owned_identity, contact_identity, contact_device)?
            },

            NodeEvent::CapabilityDiscoveryRequested { owned_identity } => {
                self.engine.discover_capabilities(owned_identity)?
            },

            NodeEvent::DeliveryConfirmed { message_id } => {
                if !self.engine.acknowledge_delivery(&message_id)? {
                    tracing::debug!(message = %message_id, "delivery confirmed twice");
                }
                Vec::new()
            },
        };

        self.translate(actions)
    }

    fn translate(&mut self, actions: Vec<EngineAction>) -> Result<Vec<NodeAction>, NodeError> {
        let mut out = Vec::with_capacity(actions.len());
        for action in actions {
            match action {
                EngineAction::Deliver { message_id, envelope } => {
                    self.stats.envelopes_sent += 1;
                    out.push(NodeAction::SendEnvelope {
                        message_id,
                        recipient: *envelope.recipient(),
                        bytes: envelope.to_bytes()?,
                    });
                },
                EngineAction::ProtocolFinished { key, outcome } => {
                    match outcome {
                        ProtocolOutcome::Done => self.stats.protocols_done += 1,
                        ProtocolOutcome::Cancelled => self.stats.protocols_cancelled += 1,
                    }
                    out.push(NodeAction::ProtocolFinished { key, outcome });
                },
                EngineAction::MessageDropped { reason } => {
                    self.stats.messages_dropped += 1;
                    tracing::debug!(?reason, "message dropped");
                },
            }
        }
        Ok(out)
    }
}
