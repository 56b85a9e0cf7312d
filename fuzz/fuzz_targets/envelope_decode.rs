//! Fuzz target for envelope and protocol message decoding
//!
//! Everything a relay hands to a device goes through these two decoders
//! before any protocol logic runs. Looks for:
//! - Parser crashes or panics
//! - Huge claimed CBOR lengths that get allocated
//! - Deep nesting that exhausts the stack
//!
//! The fuzzer should NEVER panic. All invalid inputs should return an error.

#![no_main]

use cairn_proto::{ChannelEnvelope, ProtocolMessage};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(envelope) = ChannelEnvelope::from_bytes(data) {
        // Anything that decodes must encode again
        assert!(envelope.to_bytes().is_ok());
    }

    if let Ok(message) = ProtocolMessage::from_bytes(data) {
        let encoded = message.to_bytes().expect("decoded message must re-encode");
        let again = ProtocolMessage::from_bytes(&encoded).expect("re-encoded message must decode");
        assert_eq!(again.protocol_id, message.protocol_id);
        assert_eq!(again.kind, message.kind);
    }
});
