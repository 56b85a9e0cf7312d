//! Full ratchet of an existing owned-device channel.

use cairn_core::{DropReason, EngineAction, EngineConfig, ProtocolOutcome};
use cairn_harness::{FaultConfig, InvariantRegistry, NoStrandedInstances, Simulation};
use cairn_proto::{DeviceUid, ProtocolId};
use proptest::prelude::*;

const SIGNING_KEY: [u8; 32] = [7; 32];
const X: DeviceUid = DeviceUid::from_bytes([0x21; 32]);
const Y: DeviceUid = DeviceUid::from_bytes([0x42; 32]);

/// Two devices paired over a reliable relay, which then applies `faults`.
fn paired(seed: u64, faults: FaultConfig) -> Simulation {
    let mut sim = Simulation::new(seed)
        .with_config(EngineConfig { capabilities: vec!["voip".to_string()], ..EngineConfig::default() });
    let x = sim.add_device(SIGNING_KEY, X);
    let y = sim.add_device(SIGNING_KEY, Y);
    sim.start_channel_creation(x, y).unwrap();
    sim.run_until_quiet(1_000).unwrap();
    assert!(sim.channel(x, y).is_some_and(|c| c.confirmed));
    sim.set_faults(faults);
    sim
}

fn dropped(actions: &[EngineAction]) -> Vec<DropReason> {
    actions
        .iter()
        .filter_map(|a| match a {
            EngineAction::MessageDropped { reason } => Some(reason.clone()),
            _ => None,
        })
        .collect()
}

fn deliveries(actions: &[EngineAction]) -> usize {
    actions.iter().filter(|a| matches!(a, EngineAction::Deliver { .. })).count()
}

#[test]
fn ratchet_renews_initiator_send_direction() {
    let mut sim = paired(1, FaultConfig::reliable());
    let (x, y) = (0, 1);
    let before_x = sim.channel(x, y).unwrap();
    let before_y = sim.channel(y, x).unwrap();

    sim.start_full_ratchet(x, y).unwrap();
    sim.run_until_quiet(100).unwrap();

    let after_x = sim.channel(x, y).unwrap();
    let after_y = sim.channel(y, x).unwrap();
    assert_ne!(after_x.send_seed, before_x.send_seed);
    assert_eq!(after_x.receive_seed, before_x.receive_seed);
    assert_eq!(after_y.send_seed, before_y.send_seed);
    assert_eq!(after_y.previous_receive_seed, Some(before_y.receive_seed));
    assert_eq!(after_x.send_generation, 0);

    let mut registry = InvariantRegistry::standard();
    registry.add(NoStrandedInstances);
    registry.assert_all(&sim.snapshot(), "after ratchet");

    let ratchets_done = sim
        .finished()
        .iter()
        .filter(|f| f.key.protocol_id == ProtocolId::FullRatchet)
        .filter(|f| f.outcome == ProtocolOutcome::Done)
        .count();
    assert_eq!(ratchets_done, 2);
}

#[test]
fn both_directions_renew_when_both_sides_ratchet() {
    let mut sim = paired(2, FaultConfig::reliable());
    let (x, y) = (0, 1);
    let before_x = sim.channel(x, y).unwrap();

    sim.start_full_ratchet(x, y).unwrap();
    sim.run_until_quiet(100).unwrap();
    sim.start_full_ratchet(y, x).unwrap();
    sim.run_until_quiet(100).unwrap();

    let after_x = sim.channel(x, y).unwrap();
    assert_ne!(after_x.send_seed, before_x.send_seed);
    assert_ne!(after_x.receive_seed, before_x.receive_seed);
    InvariantRegistry::standard().assert_all(&sim.snapshot(), "after two ratchets");
}

#[test]
fn stale_counter_reply_is_ignored() {
    let mut sim = paired(3, FaultConfig::reliable());
    let (x, y) = (0, 1);

    // Two attempts before the responder hears of either.
    sim.start_full_ratchet(x, y).unwrap();
    sim.start_full_ratchet(x, y).unwrap();

    let first_key = sim.pull().unwrap();
    let second_key = sim.pull().unwrap();
    assert_eq!(deliveries(&sim.deliver(&first_key).unwrap()), 1);
    assert_eq!(deliveries(&sim.deliver(&second_key).unwrap()), 1);

    // The reply to the first attempt carries a lower counter than the one
    // the initiator now waits for.
    let stale_reply = sim.pull().unwrap();
    let stored_before = sim.device(x).storage().instance_count();
    let actions = sim.deliver(&stale_reply).unwrap();
    assert_eq!(dropped(&actions), vec![DropReason::Stale]);
    assert_eq!(deliveries(&actions), 0);
    assert_eq!(sim.device(x).storage().instance_count(), stored_before);

    sim.run_until_quiet(100).unwrap();
    let mut registry = InvariantRegistry::standard();
    registry.add(NoStrandedInstances);
    registry.assert_all(&sim.snapshot(), "after restarted ratchet");
}

#[test]
fn duplicate_reply_gets_no_second_k2() {
    let mut sim = paired(4, FaultConfig::reliable());
    let (x, y) = (0, 1);

    sim.start_full_ratchet(x, y).unwrap();
    let ephemeral_key = sim.pull().unwrap();
    sim.deliver(&ephemeral_key).unwrap();

    let reply = sim.pull().unwrap();
    assert_eq!(deliveries(&sim.deliver(&reply).unwrap()), 1);

    let actions = sim.deliver(&reply).unwrap();
    assert_eq!(deliveries(&actions), 0);
    assert!(matches!(
        dropped(&actions).as_slice(),
        [DropReason::NoMatchingStep { protocol_id: ProtocolId::FullRatchet, .. }]
    ));

    sim.run_until_quiet(100).unwrap();
    InvariantRegistry::standard().assert_all(&sim.snapshot(), "after duplicate reply");
}

#[test]
fn reply_from_an_earlier_round_is_ignored() {
    // Round nonces are random, so cover many of them.
    for seed in 1..40 {
        let mut sim = paired(seed, FaultConfig::reliable());
        let (x, y) = (0, 1);
        let before = sim.channel(x, y).unwrap();

        sim.start_full_ratchet(x, y).unwrap();
        let ephemeral_key = sim.pull().unwrap();
        sim.deliver(&ephemeral_key).unwrap();
        let first_round_reply = sim.pull().unwrap();
        sim.deliver(&first_round_reply).unwrap();
        sim.run_until_quiet(100).unwrap();
        let after_first = sim.channel(x, y).unwrap();
        assert_ne!(after_first.send_seed, before.send_seed);

        sim.start_full_ratchet(x, y).unwrap();
        let ephemeral_key = sim.pull().unwrap();
        sim.deliver(&ephemeral_key).unwrap();

        let actions = sim.deliver(&first_round_reply).unwrap();
        assert_eq!(deliveries(&actions), 0, "seed {seed}");

        sim.run_until_quiet(100).unwrap();
        let after_second = sim.channel(x, y).unwrap();
        assert_ne!(after_second.send_seed, after_first.send_seed, "seed {seed}");

        let mut registry = InvariantRegistry::standard();
        registry.add(NoStrandedInstances);
        registry.assert_all(&sim.snapshot(), &format!("second round, seed {seed}"));
    }
}

#[test]
fn k2_for_another_responder_key_is_ignored() {
    let mut sim = paired(8, FaultConfig::reliable());
    let (x, y) = (0, 1);

    sim.start_full_ratchet(x, y).unwrap();
    let ephemeral_key = sim.pull().unwrap();
    sim.deliver(&ephemeral_key).unwrap();
    let reply = sim.pull().unwrap();
    sim.deliver(&reply).unwrap();
    let k2 = sim.pull().unwrap();
    sim.deliver(&k2).unwrap();
    let renewed = sim.channel(y, x).unwrap();

    // A late copy of the ephemeral key opens a fresh responder instance with
    // a new key of its own; the old k2 was not made for it.
    assert_eq!(deliveries(&sim.deliver(&ephemeral_key).unwrap()), 1);
    let actions = sim.deliver(&k2).unwrap();
    assert_eq!(deliveries(&actions), 0);
    assert_eq!(sim.channel(y, x).unwrap(), renewed);

    sim.run_until_quiet(100).unwrap();
    InvariantRegistry::standard().assert_all(&sim.snapshot(), "after late duplicates");
}

#[test]
fn message_sealed_before_renewal_still_opens() {
    let mut sim = paired(5, FaultConfig::reliable());
    let (x, y) = (0, 1);
    let identity = sim.device(x).identity();

    sim.start_full_ratchet(x, y).unwrap();
    sim.step().unwrap(); // ephemeral key reaches Y
    sim.step().unwrap(); // Y's reply reaches X, K2 is queued

    sim.device(x).identities().forget_capabilities(&identity, &Y);
    sim.device(y).identities().forget_capabilities(&identity, &X);
    // Sealed with X's old send seed; queued behind K2.
    assert_eq!(deliveries(&sim.discover_capabilities(x).unwrap()), 1);

    sim.step().unwrap(); // K2: Y switches its receive seed
    assert!(sim.channel(y, x).unwrap().previous_receive_seed.is_some());

    sim.step().unwrap(); // capabilities open with Y's previous receive seed
    assert_eq!(
        sim.device(y).identities().capabilities(&identity, &X),
        Some(vec!["voip".to_string()])
    );

    sim.run_until_quiet(100).unwrap();
    InvariantRegistry::standard().assert_all(&sim.snapshot(), "after renewal");
}

#[test]
fn ratchet_without_channel_is_cancelled() {
    let mut sim = Simulation::new(6);
    let x = sim.add_device(SIGNING_KEY, X);
    let y = sim.add_device(SIGNING_KEY, Y);

    let actions = sim.start_full_ratchet(x, y).unwrap();

    assert_eq!(deliveries(&actions), 0);
    assert!(actions.iter().any(|a| matches!(
        a,
        EngineAction::ProtocolFinished { outcome: ProtocolOutcome::Cancelled, .. }
    )));
    assert_eq!(sim.device(x).storage().instance_count(), 0);
}

#[test]
fn crash_during_ratchet_keeps_progress() {
    let mut sim = paired(7, FaultConfig::reliable());
    let (x, y) = (0, 1);

    sim.start_full_ratchet(x, y).unwrap();
    sim.step().unwrap();
    sim.restart(y).unwrap();
    sim.restart(x).unwrap();
    sim.run_until_quiet(100).unwrap();

    let mut registry = InvariantRegistry::standard();
    registry.add(NoStrandedInstances);
    registry.assert_all(&sim.snapshot(), "after crash");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Any number of ratchets in either direction, with the relay delivering
    /// in random order, leaves both ends with matching seeds.
    #[test]
    fn prop_ratchets_keep_seeds_in_agreement(
        seed in 1u64..10_000,
        initiators in prop::collection::vec(any::<bool>(), 1..5),
    ) {
        let mut sim = paired(seed, FaultConfig::unordered_with_duplicates(0.0));
        for from_x in initiators {
            let (from, to) = if from_x { (0, 1) } else { (1, 0) };
            sim.start_full_ratchet(from, to).unwrap();
            sim.run_until_quiet(1_000).unwrap();
        }
        prop_assert!(sim.relay().is_empty());

        let mut registry = InvariantRegistry::standard();
        registry.add(NoStrandedInstances);
        registry.assert_all(&sim.snapshot(), "after ratchets");
    }

    /// Seeds stay in agreement when the relay also repeats messages, so late
    /// copies reach the responder after its round finished.
    #[test]
    fn prop_duplicates_never_split_seeds(
        seed in 1u64..10_000,
        duplicate_rate in 0.05f64..0.3,
        initiators in prop::collection::vec(any::<bool>(), 1..5),
    ) {
        let mut sim = paired(seed, FaultConfig::unordered_with_duplicates(duplicate_rate));
        for from_x in initiators {
            let (from, to) = if from_x { (0, 1) } else { (1, 0) };
            sim.start_full_ratchet(from, to).unwrap();
            sim.run_until_quiet(10_000).unwrap();
            InvariantRegistry::standard().assert_all(&sim.snapshot(), "during ratchets");
        }
        prop_assert!(sim.relay().is_empty());
    }
}
