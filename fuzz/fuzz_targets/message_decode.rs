//! Fuzz target for KexMessage::decode
//!
//! Arbitrary bytes from the relay must never panic the decoder. Anything that
//! does decode must re-encode.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tether_core::KexMessage;

fuzz_target!(|data: &[u8]| {
    if let Ok(message) = KexMessage::decode(data) {
        assert!(message.encode().is_ok());
    }
});
