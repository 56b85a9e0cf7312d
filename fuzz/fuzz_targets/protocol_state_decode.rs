//! Fuzz target for persisted protocol state and message field decoding
//!
//! Stored states come back from disk and message fields come from peers.
//! A truncated or hostile encoding must be rejected, never trusted.
//!
//! # Invariants
//!
//! - Decoding never panics
//! - A state that decodes encodes again

#![no_main]

use arbitrary::Arbitrary;
use cairn_core::{
    ChannelCreationWithOwnedDevice, DeviceCapabilities, FullRatchet, Protocol,
    registry::{ProtocolMessageBody, ProtocolState},
};
use cairn_proto::{Encoded, from_bytes};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
enum Target {
    ChannelCreation,
    FullRatchet,
    DeviceCapabilities,
}

#[derive(Debug, Arbitrary)]
struct Input {
    target: Target,
    kind: u64,
    bytes: Vec<u8>,
}

fn check<P: Protocol>(kind: u64, bytes: &[u8]) {
    if let Ok(state) = P::State::from_bytes(bytes) {
        assert!(state.to_bytes().is_ok());
    }

    if let Ok(Encoded::Array(fields)) = from_bytes(bytes) {
        let _ = P::Message::decode_fields(kind, &fields);
    }
}

fuzz_target!(|input: Input| {
    match input.target {
        Target::ChannelCreation => check::<ChannelCreationWithOwnedDevice>(input.kind, &input.bytes),
        Target::FullRatchet => check::<FullRatchet>(input.kind, &input.bytes),
        Target::DeviceCapabilities => check::<DeviceCapabilities>(input.kind, &input.bytes),
    }
});
