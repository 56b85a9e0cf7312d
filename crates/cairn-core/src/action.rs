//! What the engine asks its driver to do.

use cairn_proto::{ChannelEnvelope, ProtocolId, Uid};

use crate::store::InstanceKey;

/// Actions returned by every [`crate::Engine`] entry point.
///
/// The engine is sans-IO: it never delivers anything itself. Each action is
/// emitted only after the transaction that produced it committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineAction {
    /// Hand an envelope to the transport. Call
    /// [`crate::Engine::acknowledge_delivery`] once the transport owns it.
    Deliver {
        /// Outbox identifier
        message_id: Uid,
        /// Envelope to deliver
        envelope: ChannelEnvelope,
    },

    /// A protocol instance reached a terminal state
    ProtocolFinished {
        /// The instance that finished
        key: InstanceKey,
        /// How it finished
        outcome: ProtocolOutcome,
    },

    /// An inbound message was discarded without running any step
    MessageDropped {
        /// Why it was discarded
        reason: DropReason,
    },
}

/// How a protocol instance ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolOutcome {
    /// Reached a terminal success state
    Done,
    /// Aborted; the instance was deleted
    Cancelled,
}

/// Why an inbound message was discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Addressed to an identity or device that is not ours
    NotAddressedToUs,
    /// Envelope body does not match its route
    MalformedEnvelope,
    /// Oblivious envelope for a channel we do not hold
    UnknownChannel,
    /// No receive seed opens the envelope
    Undecryptable,
    /// Payload is not a protocol message
    UndecodableMessage,
    /// Message kind is not defined by its protocol
    UnknownMessageKind {
        /// Protocol of the message
        protocol_id: ProtocolId,
        /// Kind discriminator
        kind: u64,
    },
    /// No step accepts the message in the current state from this channel
    NoMatchingStep {
        /// Protocol of the message
        protocol_id: ProtocolId,
        /// Current state kind
        state: u64,
        /// Message kind
        message: u64,
    },
    /// The message was stale or duplicate and changed nothing
    Stale,
    /// Commit kept conflicting with a concurrent writer
    ConflictRetriesExhausted,
    /// The store failed while committing
    StorageFailure,
}
