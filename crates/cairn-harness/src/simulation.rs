//! Multi-device simulation.
//!
//! Each simulated device runs a real [`Engine`] over its own in-memory store
//! and identity service. Envelopes the engines emit go through a
//! [`SimRelay`]; the test decides when they are delivered, so any
//! interleaving can be reproduced from a seed.

use cairn_core::{
    Engine, EngineAction, EngineConfig, EngineError, InstanceKey, KeyringChallengeService,
    MemoryStorage, ObliviousChannelRecord, ProtocolOutcome, Storage,
};
use cairn_crypto::SigningSecret;
use cairn_proto::{ChannelEnvelope, DeviceUid, EnvelopeBody, Identity, ProtocolId, ProtocolMessage, Uid};

use crate::{
    invariants::{ChannelSnapshot, DeviceSnapshot, SystemSnapshot},
    relay::{FaultConfig, InFlight, SimRelay, route_targets},
    sim_env::SimEnv,
    sim_identity::SimIdentityService,
};

/// Engine type every simulated device runs.
pub type SimEngine = Engine<SimEnv, MemoryStorage, SimIdentityService, KeyringChallengeService>;

/// One simulated device.
pub struct SimDevice {
    identity: Identity,
    device: DeviceUid,
    signing_key: [u8; 32],
    env: SimEnv,
    storage: MemoryStorage,
    identities: SimIdentityService,
    engine: SimEngine,
}

impl SimDevice {
    /// Owned identity.
    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// Device uid.
    pub fn device_uid(&self) -> DeviceUid {
        self.device
    }

    /// The device's store.
    pub fn storage(&self) -> &MemoryStorage {
        &self.storage
    }

    /// The device's identity service.
    pub fn identities(&self) -> &SimIdentityService {
        &self.identities
    }

    /// The device's engine.
    pub fn engine(&self) -> &SimEngine {
        &self.engine
    }
}

/// A cleartext protocol message seen on the relay.
///
/// Sealed envelopes are opaque to the relay and are not logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentMessage {
    /// Sending device index
    pub from: usize,
    /// Protocol of the message
    pub protocol_id: ProtocolId,
    /// Message kind discriminator
    pub kind: u64,
    /// Instance the message belongs to
    pub instance_uid: Uid,
}

/// A protocol instance that reached a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinishedInstance {
    /// Device index
    pub device: usize,
    /// The instance
    pub key: InstanceKey,
    /// How it finished
    pub outcome: ProtocolOutcome,
}

/// Simulated set of devices connected by a relay.
pub struct Simulation {
    seed: u64,
    config: EngineConfig,
    devices: Vec<SimDevice>,
    relay: SimRelay,
    sent: Vec<SentMessage>,
    finished: Vec<FinishedInstance>,
}

impl Simulation {
    /// Simulation with a reliable FIFO relay.
    pub fn new(seed: u64) -> Self {
        Self::with_faults(seed, FaultConfig::reliable())
    }

    /// Simulation with a misbehaving relay.
    pub fn with_faults(seed: u64, faults: FaultConfig) -> Self {
        Self {
            seed,
            config: EngineConfig::default(),
            devices: Vec::new(),
            relay: SimRelay::new(seed, faults),
            sent: Vec::new(),
            finished: Vec::new(),
        }
    }

    /// Engine configuration used for devices added after this call.
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a device owning the identity of `signing_key`. Returns its index.
    ///
    /// Devices created with the same signing key are devices of the same
    /// identity.
    pub fn add_device(&mut self, signing_key: [u8; 32], device: DeviceUid) -> usize {
        let index = self.devices.len();
        let env = SimEnv::with_seed(self.seed.wrapping_add(index as u64 + 1));
        let storage = MemoryStorage::new();
        let identities = SimIdentityService::new();

        let mut challenge = KeyringChallengeService::new();
        let identity = challenge.insert(SigningSecret::from_bytes(signing_key));
        identities.add_owned_identity(identity, device);

        let engine = Engine::new(
            env.clone(),
            storage.clone(),
            identities.clone(),
            challenge,
            self.config.clone(),
        );

        self.devices.push(SimDevice { identity, device, signing_key, env, storage, identities, engine });
        index
    }

    /// Device by index.
    pub fn device(&self, index: usize) -> &SimDevice {
        &self.devices[index]
    }

    /// Number of devices.
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Change how the relay misbehaves from now on.
    pub fn set_faults(&mut self, faults: FaultConfig) {
        self.relay.set_faults(faults);
    }

    /// The relay.
    pub fn relay(&self) -> &SimRelay {
        &self.relay
    }

    /// Cleartext messages sent so far, in send order.
    pub fn sent_messages(&self) -> &[SentMessage] {
        &self.sent
    }

    /// Instances finished so far, in completion order.
    pub fn finished(&self) -> &[FinishedInstance] {
        &self.finished
    }

    /// Device `from` starts creating a channel with device `to`.
    pub fn start_channel_creation(
        &mut self,
        from: usize,
        to: usize,
    ) -> Result<Vec<EngineAction>, EngineError> {
        let identity = self.devices[from].identity;
        let remote = self.devices[to].device;
        let actions = self.devices[from].engine.start_channel_creation(identity, remote)?;
        self.route(from, &actions);
        Ok(actions)
    }

    /// Device `from` starts (or restarts) a full ratchet with device `to`.
    pub fn start_full_ratchet(
        &mut self,
        from: usize,
        to: usize,
    ) -> Result<Vec<EngineAction>, EngineError> {
        let identity = self.devices[from].identity;
        let (contact_identity, contact_device) = (self.devices[to].identity, self.devices[to].device);
        let actions =
            self.devices[from].engine.start_full_ratchet(identity, contact_identity, contact_device)?;
        self.route(from, &actions);
        Ok(actions)
    }

    /// Device `index` announces its capabilities.
    pub fn discover_capabilities(&mut self, index: usize) -> Result<Vec<EngineAction>, EngineError> {
        let identity = self.devices[index].identity;
        let actions = self.devices[index].engine.discover_capabilities(identity)?;
        self.route(index, &actions);
        Ok(actions)
    }

    /// Take the next envelope off the relay without delivering it.
    pub fn pull(&mut self) -> Option<InFlight> {
        self.relay.pull()
    }

    /// Deliver an envelope to its device.
    pub fn deliver(&mut self, message: &InFlight) -> Result<Vec<EngineAction>, EngineError> {
        let actions = self.devices[message.to].engine.receive(&message.bytes)?;
        self.route(message.to, &actions);
        Ok(actions)
    }

    /// Deliver the next envelope. Returns false when the relay is empty.
    pub fn step(&mut self) -> Result<bool, EngineError> {
        match self.pull() {
            Some(message) => {
                self.deliver(&message)?;
                Ok(true)
            },
            None => Ok(false),
        }
    }

    /// Deliver until the relay is empty or `max_steps` envelopes were
    /// delivered. Returns the number delivered.
    pub fn run_until_quiet(&mut self, max_steps: usize) -> Result<usize, EngineError> {
        let mut steps = 0;
        while steps < max_steps && self.step()? {
            steps += 1;
        }
        Ok(steps)
    }

    /// Simulate a crash of device `index`: rebuild its engine over the same
    /// store, resend what is still in its outbox and resume local work.
    pub fn restart(&mut self, index: usize) -> Result<Vec<EngineAction>, EngineError> {
        let device = &mut self.devices[index];
        let mut challenge = KeyringChallengeService::new();
        challenge.insert(SigningSecret::from_bytes(device.signing_key));
        device.engine = Engine::new(
            device.env.clone(),
            device.storage.clone(),
            device.identities.clone(),
            challenge,
            self.config.clone(),
        );
        tracing::debug!(device = index, "device restarted");

        let mut actions = device.engine.pending_deliveries()?;
        actions.extend(device.engine.resume()?);
        self.route(index, &actions);
        Ok(actions)
    }

    /// Channel device `from` holds with device `to`.
    pub fn channel(&self, from: usize, to: usize) -> Option<ObliviousChannelRecord> {
        let key = cairn_core::ChannelKey {
            owned_identity: self.devices[from].identity,
            remote_identity: self.devices[to].identity,
            remote_device: self.devices[to].device,
        };
        self.devices[from].storage.load_channel(&key).ok().flatten()
    }

    /// Observable state of every device.
    pub fn snapshot(&self) -> SystemSnapshot {
        let devices = self
            .devices
            .iter()
            .enumerate()
            .map(|(index, device)| {
                let mut snapshot = DeviceSnapshot::new(device.identity, device.device);
                snapshot.live_instances =
                    device.storage.list_instances(&device.identity).map_or(0, |keys| keys.len());
                for (other_index, other) in self.devices.iter().enumerate() {
                    if other_index == index {
                        continue;
                    }
                    if let Some(record) = self.channel(index, other_index) {
                        snapshot.channels.push(ChannelSnapshot {
                            remote_identity: other.identity,
                            remote_device: other.device,
                            record,
                        });
                    }
                }
                snapshot
            })
            .collect();
        SystemSnapshot::from_devices(devices)
    }

    /// Put engine output on the relay and record what finished.
    fn route(&mut self, from: usize, actions: &[EngineAction]) {
        for action in actions {
            match action {
                EngineAction::Deliver { message_id, envelope } => {
                    self.send(from, envelope);
                    if let Err(err) = self.devices[from].engine.acknowledge_delivery(message_id) {
                        tracing::warn!(device = from, error = %err, "delivery not acknowledged");
                    }
                },
                EngineAction::ProtocolFinished { key, outcome } => {
                    self.finished.push(FinishedInstance { device: from, key: *key, outcome: *outcome });
                },
                EngineAction::MessageDropped { .. } => {},
            }
        }
    }

    fn send(&mut self, from: usize, envelope: &ChannelEnvelope) {
        let bytes = match envelope.to_bytes() {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::error!(device = from, error = %err, "envelope encoding failed");
                return;
            },
        };

        if let EnvelopeBody::Cleartext(payload) = &envelope.body
            && let Ok(message) = ProtocolMessage::from_bytes(payload)
        {
            self.sent.push(SentMessage {
                from,
                protocol_id: message.protocol_id,
                kind: message.kind,
                instance_uid: message.instance_uid,
            });
        }

        for (identity, device) in route_targets(envelope) {
            for (index, target) in self.devices.iter().enumerate() {
                let matches = target.identity == identity
                    && device.is_none_or(|device| device == target.device);
                if index != from && matches {
                    self.relay.push(index, bytes.clone());
                }
            }
        }
    }
}
