//! Fuzz target for hostile CBOR behind a valid version byte
//!
//! # Strategy
//!
//! - Deeply nested: arrays or maps nested to arbitrary depth
//! - Huge lengths: byte strings claiming far more data than present
//! - Random bytes: arbitrary CBOR after the version byte
//! - Wrong version: otherwise plausible bodies with a bad version byte
//!
//! # Invariants
//!
//! - Decoding completes quickly and never panics
//! - Claimed lengths are not allocated up front
//! - A wrong version byte is always rejected

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tether_core::{KexMessage, WIRE_VERSION};

#[derive(Debug, Clone, Arbitrary)]
enum CborAttack {
    DeeplyNested { depth: u8, map: bool },
    HugeLength { claimed_len_exponent: u8 },
    RandomBytes { bytes: Vec<u8> },
    WrongVersion { version: u8, bytes: Vec<u8> },
}

fn nested(depth: usize, map: bool) -> Vec<u8> {
    let mut bytes = vec![WIRE_VERSION];
    for _ in 0..depth {
        // array(1) or map(1) with an integer key
        if map {
            bytes.extend_from_slice(&[0xA1, 0x00]);
        } else {
            bytes.push(0x81);
        }
    }
    bytes.push(0x00);
    bytes
}

fuzz_target!(|attack: CborAttack| {
    match attack {
        CborAttack::DeeplyNested { depth, map } => {
            let _ = KexMessage::decode(&nested(usize::from(depth), map));
        },
        CborAttack::HugeLength { claimed_len_exponent } => {
            let claimed = 1u32 << (claimed_len_exponent % 32);
            let mut bytes = vec![WIRE_VERSION, 0x5A];
            bytes.extend_from_slice(&claimed.to_be_bytes());
            bytes.extend_from_slice(&[0u8; 16]);
            assert!(KexMessage::decode(&bytes).is_err());
        },
        CborAttack::RandomBytes { bytes } => {
            let mut framed = vec![WIRE_VERSION];
            framed.extend_from_slice(&bytes);
            let _ = KexMessage::decode(&framed);
        },
        CborAttack::WrongVersion { version, bytes } => {
            if version == WIRE_VERSION {
                return;
            }
            let mut framed = vec![version];
            framed.extend_from_slice(&bytes);
            assert!(KexMessage::decode(&framed).is_err());
        },
    }
});
