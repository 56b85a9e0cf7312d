//! Step dispatcher.
//!
//! [`Engine`] is the sans-IO driver of every protocol instance. Each entry
//! point turns an event (an inbound envelope, a user action, a restart) into
//! zero or more committed steps and returns the [`EngineAction`]s those
//! steps produced.
//!
//! One message is handled as follows:
//!
//! ```text
//! envelope ─open─▶ (owned identity, origin, message)
//!          ─load─▶ state (Initial when absent)
//!          ─resolve─▶ step ─execute─▶ Transition + Transaction
//!          ─commit─▶ actions (Deliver / ProtocolFinished) + local loopback
//! ```
//!
//! # Invariants
//!
//! - Commit Before Effect: no envelope is handed out and no local message is
//!   processed before the transaction that produced it committed
//! - Failure Cancels: a failing step never leaves partial writes; the
//!   instance is deleted in a separate commit
//! - Bounded Retry: a revision conflict re-runs the whole step against fresh
//!   state at most `max_commit_attempts` times

use std::collections::VecDeque;

use cairn_proto::{
    ChannelEnvelope, DeviceUid, Identity, ProtocolId, ProtocolMessage, Route, Uid,
};

use crate::{
    action::{DropReason, EngineAction, ProtocolOutcome},
    channel::{OpenedEnvelope, ReceptionChannelInfo, open_envelope},
    config::EngineConfig,
    env::Environment,
    error::EngineError,
    protocols::{
        ChannelCreationWithOwnedDevice, DeviceCapabilities, FullRatchet,
        channel_creation::ChannelCreationMessage,
        device_capabilities::DeviceCapabilitiesMessage,
        full_ratchet::{FullRatchetMessage, ratchet_instance_uid},
    },
    registry::{
        Protocol, ProtocolMessageBody, ProtocolState, StepContext, Transition, resolve_step,
    },
    services::{ChallengeService, IdentityService},
    store::{ChannelKey, InstanceKey, OutboundRecord, Storage, StorageError, WriteOp, WriteSet},
    transaction::Transaction,
};

/// A step that ran (or failed) and is ready to commit, or a message that
/// will not run any step.
enum Prepared {
    Commit {
        revision: u64,
        writes: WriteSet,
        outbound: Vec<OutboundRecord>,
        outcome: Option<ProtocolOutcome>,
    },
    Drop(DropReason),
}

/// Persistent handshake engine.
///
/// Generic over the environment, the store and the two collaborator
/// services so simulation and production share every line of protocol
/// logic.
pub struct Engine<E, S, I, C>
where
    E: Environment,
    S: Storage,
    I: IdentityService,
    C: ChallengeService,
{
    env: E,
    storage: S,
    identity: I,
    challenge: C,
    config: EngineConfig,

    /// Committed local-loopback envelopes not processed yet
    local_queue: VecDeque<ChannelEnvelope>,
}

impl<E, S, I, C> Engine<E, S, I, C>
where
    E: Environment,
    S: Storage,
    I: IdentityService,
    C: ChallengeService,
{
    /// Create an engine over `storage`.
    ///
    /// Local messages left in the outbox by a previous run are not touched
    /// until [`Self::resume`] is called.
    pub fn new(env: E, storage: S, identity: I, challenge: C, config: EngineConfig) -> Self {
        Self { env, storage, identity, challenge, config, local_queue: VecDeque::new() }
    }

    /// Environment the engine runs in.
    pub fn env(&self) -> &E {
        &self.env
    }

    /// Underlying store.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Identity service.
    pub fn identity(&self) -> &I {
        &self.identity
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Handle an encoded inbound envelope.
    ///
    /// # Errors
    ///
    /// - `EnvelopeTooLarge` if `bytes` exceeds the configured limit
    /// - `Wire` if `bytes` is not an envelope
    /// - `Storage`/`Identity` if a collaborator fails outside any step
    pub fn receive(&mut self, bytes: &[u8]) -> Result<Vec<EngineAction>, EngineError> {
        if bytes.len() > self.config.max_envelope_size {
            return Err(EngineError::EnvelopeTooLarge {
                size: bytes.len(),
                max: self.config.max_envelope_size,
            });
        }

        let envelope = ChannelEnvelope::from_bytes(bytes)?;
        self.receive_envelope(&envelope)
    }

    /// Handle a decoded inbound envelope.
    ///
    /// # Errors
    ///
    /// - `Storage`/`Identity` if a collaborator fails outside any step
    pub fn receive_envelope(
        &mut self,
        envelope: &ChannelEnvelope,
    ) -> Result<Vec<EngineAction>, EngineError> {
        let mut actions = Vec::new();
        self.process_envelope(envelope, &mut actions)?;
        self.drain_local(&mut actions)?;
        Ok(actions)
    }

    /// Ping `remote_device`, another device of `owned_identity`, to create a
    /// channel with it.
    ///
    /// Calling this again restarts the handshake from scratch.
    ///
    /// # Errors
    ///
    /// - `Identity` if `owned_identity` is not owned here
    pub fn start_channel_creation(
        &mut self,
        owned_identity: Identity,
        remote_device: DeviceUid,
    ) -> Result<Vec<EngineAction>, EngineError> {
        let message = ChannelCreationWithOwnedDevice::message(
            self.env.random_uid(),
            &ChannelCreationMessage::Initial { remote_device },
        );
        self.run_local(owned_identity, message)
    }

    /// Start a full ratchet of the channel with a contact device, or resend
    /// the current attempt with a bumped counter.
    ///
    /// # Errors
    ///
    /// - `Identity` if `owned_identity` is not owned here
    pub fn start_full_ratchet(
        &mut self,
        owned_identity: Identity,
        contact_identity: Identity,
        contact_device: DeviceUid,
    ) -> Result<Vec<EngineAction>, EngineError> {
        let current = self.identity.current_device_uid(&owned_identity)?;
        let instance_uid =
            ratchet_instance_uid(&owned_identity, &contact_identity, &current, &contact_device);
        let message = FullRatchet::message(
            instance_uid,
            &FullRatchetMessage::Initial { contact_identity, contact_device },
        );
        self.run_local(owned_identity, message)
    }

    /// Announce this device's capabilities to every owned device that needs
    /// them and has a confirmed channel.
    ///
    /// # Errors
    ///
    /// - `Identity`/`Storage` if a collaborator fails
    pub fn discover_capabilities(
        &mut self,
        owned_identity: Identity,
    ) -> Result<Vec<EngineAction>, EngineError> {
        let mut actions = Vec::new();
        for device in self.identity.devices_needing_capability_discovery(&owned_identity)? {
            let key = ChannelKey {
                owned_identity,
                remote_identity: owned_identity,
                remote_device: device,
            };
            let confirmed =
                self.storage.load_channel(&key)?.is_some_and(|channel| channel.confirmed);
            if !confirmed {
                tracing::debug!(device = %device, "no confirmed channel, skipping capabilities");
                continue;
            }

            let message = DeviceCapabilities::message(
                self.env.random_uid(),
                &DeviceCapabilitiesMessage::InitialSingleOwnedDevice { device },
            );
            let opened =
                OpenedEnvelope { owned_identity, origin: ReceptionChannelInfo::Local, message };
            self.dispatch(&opened, None, &mut actions)?;
        }
        self.drain_local(&mut actions)?;
        Ok(actions)
    }

    /// Every remote envelope still in the outbox, for redelivery after a
    /// restart.
    ///
    /// # Errors
    ///
    /// - `Storage` if the outbox cannot be read
    pub fn pending_deliveries(&self) -> Result<Vec<EngineAction>, EngineError> {
        Ok(self
            .storage
            .pending_outbound()?
            .into_iter()
            .filter(|record| !record.is_local())
            .map(|record| EngineAction::Deliver {
                message_id: record.message_id(),
                envelope: record.envelope,
            })
            .collect())
    }

    /// The transport took ownership of `message_id`; drop it from the outbox.
    ///
    /// Returns whether the message was still queued.
    ///
    /// # Errors
    ///
    /// - `Storage` if the outbox cannot be written
    pub fn acknowledge_delivery(&mut self, message_id: &Uid) -> Result<bool, EngineError> {
        Ok(self.storage.remove_outbound(message_id)?)
    }

    /// Process local messages committed by a previous run but never
    /// handled.
    ///
    /// # Errors
    ///
    /// - `Storage`/`Identity` if a collaborator fails outside any step
    pub fn resume(&mut self) -> Result<Vec<EngineAction>, EngineError> {
        let pending: Vec<ChannelEnvelope> = self
            .storage
            .pending_outbound()?
            .into_iter()
            .filter(OutboundRecord::is_local)
            .map(|record| record.envelope)
            .collect();
        if !pending.is_empty() {
            tracing::info!(count = pending.len(), "resuming local messages");
        }
        self.local_queue.extend(pending);

        let mut actions = Vec::new();
        self.drain_local(&mut actions)?;
        Ok(actions)
    }

    fn run_local(
        &mut self,
        owned_identity: Identity,
        message: ProtocolMessage,
    ) -> Result<Vec<EngineAction>, EngineError> {
        let opened = OpenedEnvelope { owned_identity, origin: ReceptionChannelInfo::Local, message };
        let mut actions = Vec::new();
        self.dispatch(&opened, None, &mut actions)?;
        self.drain_local(&mut actions)?;
        Ok(actions)
    }

    fn drain_local(&mut self, actions: &mut Vec<EngineAction>) -> Result<(), EngineError> {
        while let Some(envelope) = self.local_queue.pop_front() {
            self.process_envelope(&envelope, actions)?;
        }
        Ok(())
    }

    fn process_envelope(
        &mut self,
        envelope: &ChannelEnvelope,
        actions: &mut Vec<EngineAction>,
    ) -> Result<(), EngineError> {
        let local_message_id =
            matches!(envelope.route, Route::Local { .. }).then_some(envelope.message_id);

        match open_envelope(&self.storage, &self.identity, envelope)? {
            Ok(opened) => self.dispatch(&opened, local_message_id, actions),
            Err(reason) => {
                match &reason {
                    DropReason::UnknownChannel | DropReason::Undecryptable => {
                        tracing::warn!(message = %envelope.message_id, reason = ?reason, "envelope dropped");
                    },
                    _ => {
                        tracing::debug!(message = %envelope.message_id, reason = ?reason, "envelope dropped");
                    },
                }
                self.drop_message(reason, local_message_id, actions)
            },
        }
    }

    fn dispatch(
        &mut self,
        opened: &OpenedEnvelope,
        local_message_id: Option<Uid>,
        actions: &mut Vec<EngineAction>,
    ) -> Result<(), EngineError> {
        match opened.message.protocol_id {
            ProtocolId::ChannelCreationWithOwnedDevice => {
                self.dispatch_protocol::<ChannelCreationWithOwnedDevice>(
                    opened,
                    local_message_id,
                    actions,
                )
            },
            ProtocolId::FullRatchet => {
                self.dispatch_protocol::<FullRatchet>(opened, local_message_id, actions)
            },
            ProtocolId::DeviceCapabilities => {
                self.dispatch_protocol::<DeviceCapabilities>(opened, local_message_id, actions)
            },
        }
    }

    fn dispatch_protocol<P: Protocol>(
        &mut self,
        opened: &OpenedEnvelope,
        local_message_id: Option<Uid>,
        actions: &mut Vec<EngineAction>,
    ) -> Result<(), EngineError> {
        let key = InstanceKey {
            owned_identity: opened.owned_identity,
            protocol_id: P::ID,
            instance_uid: opened.message.instance_uid,
        };
        let current_device = self.identity.current_device_uid(&key.owned_identity)?;

        for attempt in 1..=self.config.max_commit_attempts.max(1) {
            let (revision, writes, outbound, outcome) =
                match self.prepare::<P>(&key, current_device, opened, local_message_id)? {
                    Prepared::Commit { revision, writes, outbound, outcome } => {
                        (revision, writes, outbound, outcome)
                    },
                    Prepared::Drop(reason) => {
                        return self.drop_message(reason, local_message_id, actions);
                    },
                };

            match self.storage.commit(&writes) {
                Ok(()) => {
                    self.emit(&key, outbound, outcome, actions);
                    return Ok(());
                },
                Err(StorageError::Conflict { expected, got }) => {
                    tracing::debug!(
                        instance = %key,
                        attempt,
                        expected,
                        got,
                        "revision conflict, retrying step"
                    );
                },
                Err(StorageError::DuplicateSignature) => {
                    tracing::warn!(instance = %key, "replayed signature, cancelling");
                    return self.commit_cancellation(&key, revision, local_message_id, actions);
                },
                Err(err) => {
                    tracing::error!(instance = %key, error = %err, "commit failed");
                    return self.commit_cancellation(&key, revision, local_message_id, actions);
                },
            }
        }

        tracing::warn!(instance = %key, "giving up after repeated revision conflicts");
        actions.push(EngineAction::MessageDropped { reason: DropReason::ConflictRetriesExhausted });
        Ok(())
    }

    /// Load, resolve and execute one step without committing anything.
    fn prepare<P: Protocol>(
        &self,
        key: &InstanceKey,
        current_device: DeviceUid,
        opened: &OpenedEnvelope,
        local_message_id: Option<Uid>,
    ) -> Result<Prepared, EngineError> {
        let stored = self.storage.load_instance(key)?;
        let revision = stored.as_ref().map_or(0, |instance| instance.revision);

        let state = match stored {
            None => P::State::default(),
            Some(instance) => match P::State::from_bytes(&instance.state) {
                Ok(state) => state,
                Err(err) => {
                    tracing::warn!(instance = %key, error = %err, "undecodable state, cancelling");
                    return Ok(cancellation(key, revision, local_message_id));
                },
            },
        };

        let message = &opened.message;
        let body = match P::Message::decode_fields(message.kind, &message.fields) {
            Ok(Some(body)) => body,
            Ok(None) => {
                return Ok(Prepared::Drop(DropReason::UnknownMessageKind {
                    protocol_id: P::ID,
                    kind: message.kind,
                }));
            },
            Err(err) if revision > 0 => {
                tracing::warn!(instance = %key, error = %err, "malformed message, cancelling");
                return Ok(cancellation(key, revision, local_message_id));
            },
            Err(err) => {
                tracing::debug!(instance = %key, error = %err, "malformed message");
                return Ok(Prepared::Drop(DropReason::UndecodableMessage));
            },
        };

        let Some(descriptor) =
            resolve_step::<P>(&state, body.kind(), &opened.origin, &key.owned_identity)
        else {
            tracing::debug!(
                instance = %key,
                state = state.kind(),
                message = body.kind(),
                origin = ?opened.origin,
                "no matching step"
            );
            return Ok(Prepared::Drop(DropReason::NoMatchingStep {
                protocol_id: P::ID,
                state: state.kind(),
                message: body.kind(),
            }));
        };

        let mut ctx = StepContext {
            env: &self.env,
            identity: &self.identity,
            challenge: &self.challenge,
            config: &self.config,
            tx: Transaction::new(&self.env, &self.storage, key.owned_identity, current_device),
            instance_uid: key.instance_uid,
            origin: opened.origin,
        };

        let started = self.env.now();
        let result = P::execute(descriptor.step, &mut ctx, state, body);
        let elapsed = self.env.now() - started;
        let (mut writes, outbound) = ctx.tx.into_parts();

        let outcome = match result {
            Ok(Transition::Advance(next)) => {
                tracing::info!(
                    protocol = %P::ID,
                    instance = %key.instance_uid,
                    step = ?descriptor.step,
                    state = next.kind(),
                    elapsed_us = elapsed.as_micros() as u64,
                    "step executed"
                );
                if next.is_terminal() {
                    writes.push(WriteOp::DeleteInstance { key: *key, expected_revision: Some(revision) });
                    Some(ProtocolOutcome::Done)
                } else {
                    let encoded = match next.to_bytes() {
                        Ok(encoded) => encoded,
                        Err(err) => {
                            tracing::error!(instance = %key, error = %err, "state encoding failed");
                            return Ok(cancellation(key, revision, local_message_id));
                        },
                    };
                    writes.push(WriteOp::PutInstance {
                        key: *key,
                        expected_revision: revision,
                        state: encoded,
                    });
                    None
                }
            },
            Ok(Transition::Cancelled) => {
                tracing::warn!(
                    protocol = %P::ID,
                    instance = %key.instance_uid,
                    step = ?descriptor.step,
                    "instance cancelled"
                );
                writes.push(WriteOp::DeleteInstance { key: *key, expected_revision: Some(revision) });
                Some(ProtocolOutcome::Cancelled)
            },
            Ok(Transition::Unchanged) => {
                tracing::debug!(
                    protocol = %P::ID,
                    instance = %key.instance_uid,
                    step = ?descriptor.step,
                    "stale message absorbed"
                );
                return Ok(Prepared::Drop(DropReason::Stale));
            },
            Err(err) => {
                tracing::warn!(
                    protocol = %P::ID,
                    instance = %key.instance_uid,
                    step = ?descriptor.step,
                    error = %err,
                    "step failed, cancelling"
                );
                return Ok(cancellation(key, revision, local_message_id));
            },
        };

        if let Some(message_id) = local_message_id {
            writes.push(WriteOp::RemoveOutbound(message_id));
        }

        Ok(Prepared::Commit { revision, writes, outbound, outcome })
    }

    fn commit_cancellation(
        &mut self,
        key: &InstanceKey,
        revision: u64,
        local_message_id: Option<Uid>,
        actions: &mut Vec<EngineAction>,
    ) -> Result<(), EngineError> {
        let Prepared::Commit { writes, .. } = cancellation(key, revision, local_message_id) else {
            return Ok(());
        };

        match self.storage.commit(&writes) {
            Ok(()) => {
                actions.push(EngineAction::ProtocolFinished {
                    key: *key,
                    outcome: ProtocolOutcome::Cancelled,
                });
            },
            Err(err) => {
                tracing::error!(instance = %key, error = %err, "cancellation commit failed");
                actions.push(EngineAction::MessageDropped { reason: DropReason::StorageFailure });
            },
        }
        Ok(())
    }

    /// Discard a message. A local message is also removed from the outbox
    /// so [`Self::resume`] does not see it again.
    fn drop_message(
        &mut self,
        reason: DropReason,
        local_message_id: Option<Uid>,
        actions: &mut Vec<EngineAction>,
    ) -> Result<(), EngineError> {
        if let Some(message_id) = local_message_id {
            self.storage.remove_outbound(&message_id)?;
        }
        actions.push(EngineAction::MessageDropped { reason });
        Ok(())
    }

    fn emit(
        &mut self,
        key: &InstanceKey,
        outbound: Vec<OutboundRecord>,
        outcome: Option<ProtocolOutcome>,
        actions: &mut Vec<EngineAction>,
    ) {
        for record in outbound {
            if record.is_local() {
                self.local_queue.push_back(record.envelope);
            } else {
                actions.push(EngineAction::Deliver {
                    message_id: record.message_id(),
                    envelope: record.envelope,
                });
            }
        }

        if let Some(outcome) = outcome {
            actions.push(EngineAction::ProtocolFinished { key: *key, outcome });
        }
    }
}

/// Write set deleting the instance after a failure, with no other effect.
fn cancellation(key: &InstanceKey, revision: u64, local_message_id: Option<Uid>) -> Prepared {
    let mut writes = WriteSet::new();
    writes.push(WriteOp::DeleteInstance { key: *key, expected_revision: Some(revision) });
    if let Some(message_id) = local_message_id {
        writes.push(WriteOp::RemoveOutbound(message_id));
    }
    Prepared::Commit {
        revision,
        writes,
        outbound: Vec::new(),
        outcome: Some(ProtocolOutcome::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicU64, Ordering},
        },
        time::{Duration, Instant},
    };

    use cairn_crypto::SigningSecret;
    use cairn_proto::EnvelopeBody;

    use super::*;
    use crate::{
        error::IdentityError,
        services::KeyringChallengeService,
        store::MemoryStorage,
    };

    #[derive(Clone)]
    struct CountingEnv {
        counter: Arc<AtomicU64>,
        epoch: Instant,
    }

    impl CountingEnv {
        fn new() -> Self {
            Self { counter: Arc::new(AtomicU64::new(1)), epoch: Instant::now() }
        }
    }

    impl Environment for CountingEnv {
        type Instant = Duration;

        fn now(&self) -> Duration {
            self.epoch.elapsed()
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            for chunk in buffer.chunks_mut(8) {
                let value = self.counter.fetch_add(1, Ordering::Relaxed).to_be_bytes();
                chunk.copy_from_slice(&value[..chunk.len()]);
            }
        }
    }

    struct SingleDevice {
        identity: Identity,
        device: DeviceUid,
    }

    impl IdentityService for SingleDevice {
        fn current_device_uid(&self, owned_identity: &Identity) -> Result<DeviceUid, IdentityError> {
            if *owned_identity == self.identity {
                Ok(self.device)
            } else {
                Err(IdentityError::UnknownOwnedIdentity(*owned_identity))
            }
        }

        fn add_remote_device(&self, _: &Identity, _: &DeviceUid) -> Result<(), IdentityError> {
            Ok(())
        }

        fn devices_needing_capability_discovery(
            &self,
            _: &Identity,
        ) -> Result<Vec<DeviceUid>, IdentityError> {
            Ok(Vec::new())
        }

        fn set_device_capabilities(
            &self,
            _: &Identity,
            _: &DeviceUid,
            _: &[String],
        ) -> Result<(), IdentityError> {
            Ok(())
        }
    }

    type TestEngine = Engine<CountingEnv, MemoryStorage, SingleDevice, KeyringChallengeService>;

    fn engine() -> (TestEngine, Identity) {
        let mut keyring = KeyringChallengeService::new();
        let identity = keyring.insert(SigningSecret::from_bytes([5u8; 32]));
        let device = DeviceUid::from_bytes([0xAA; 32]);
        let engine = Engine::new(
            CountingEnv::new(),
            MemoryStorage::new(),
            SingleDevice { identity, device },
            keyring,
            EngineConfig::default(),
        );
        (engine, identity)
    }

    fn deliveries(actions: &[EngineAction]) -> Vec<&ChannelEnvelope> {
        actions
            .iter()
            .filter_map(|action| match action {
                EngineAction::Deliver { envelope, .. } => Some(envelope),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn oversized_envelope_is_rejected() {
        let (mut engine, _) = engine();
        let bytes = vec![0u8; engine.config().max_envelope_size + 1];
        assert!(matches!(engine.receive(&bytes), Err(EngineError::EnvelopeTooLarge { .. })));
    }

    #[test]
    fn garbage_envelope_is_a_wire_error() {
        let (mut engine, _) = engine();
        assert!(matches!(engine.receive(&[0xFF, 0x00, 0x13]), Err(EngineError::Wire(_))));
    }

    #[test]
    fn ping_is_queued_until_acknowledged() {
        let (mut engine, identity) = engine();
        let remote = DeviceUid::from_bytes([0x11; 32]);

        let actions = engine.start_channel_creation(identity, remote).unwrap();
        let sent = deliveries(&actions);
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0].route, Route::Asymmetric { .. }));
        assert!(actions.iter().any(|action| matches!(
            action,
            EngineAction::ProtocolFinished { outcome: ProtocolOutcome::Done, .. }
        )));

        let pending = engine.pending_deliveries().unwrap();
        assert_eq!(pending.len(), 1);
        let EngineAction::Deliver { message_id, .. } = &pending[0] else {
            panic!("expected a delivery");
        };
        assert!(engine.acknowledge_delivery(message_id).unwrap());
        assert!(!engine.acknowledge_delivery(message_id).unwrap());
        assert!(engine.pending_deliveries().unwrap().is_empty());
    }

    #[test]
    fn pinging_the_current_device_cancels() {
        let (mut engine, identity) = engine();
        let actions =
            engine.start_channel_creation(identity, DeviceUid::from_bytes([0xAA; 32])).unwrap();
        assert!(deliveries(&actions).is_empty());
        assert!(actions.iter().any(|action| matches!(
            action,
            EngineAction::ProtocolFinished { outcome: ProtocolOutcome::Cancelled, .. }
        )));
        assert_eq!(engine.storage().instance_count(), 0);
    }

    #[test]
    fn unknown_owned_identity_is_an_error() {
        let (mut engine, _) = engine();
        let stranger = Identity::from_bytes([9u8; 32]);
        assert!(matches!(
            engine.start_channel_creation(stranger, DeviceUid::from_bytes([1u8; 32])),
            Err(EngineError::Identity(IdentityError::UnknownOwnedIdentity(_)))
        ));
    }

    #[test]
    fn ratchet_without_channel_cancels() {
        let (mut engine, identity) = engine();
        let contact = Identity::from_bytes([7u8; 32]);
        let actions =
            engine.start_full_ratchet(identity, contact, DeviceUid::from_bytes([0x22; 32])).unwrap();
        assert!(deliveries(&actions).is_empty());
        assert!(actions.iter().any(|action| matches!(
            action,
            EngineAction::ProtocolFinished { outcome: ProtocolOutcome::Cancelled, .. }
        )));
    }

    #[test]
    fn envelope_for_another_identity_is_dropped() {
        let (mut engine, _) = engine();
        let envelope = ChannelEnvelope {
            message_id: Uid::from_bytes([1u8; 32]),
            route: Route::Asymmetric {
                to_identity: Identity::from_bytes([9u8; 32]),
                to_devices: vec![],
                from_identity: Identity::from_bytes([9u8; 32]),
            },
            body: EnvelopeBody::Cleartext(vec![1, 2, 3]),
        };
        let actions = engine.receive_envelope(&envelope).unwrap();
        assert_eq!(actions, vec![EngineAction::MessageDropped {
            reason: DropReason::NotAddressedToUs
        }]);
    }

    #[test]
    fn resume_with_empty_outbox_does_nothing() {
        let (mut engine, _) = engine();
        assert!(engine.resume().unwrap().is_empty());
    }
}
