//! Fuzz target for SessionGuard admission
//!
//! # Invariants
//!
//! - `check_request` accepts exactly when receiver and session both match
//! - Rejections are always `WrongReceiverDevice` or `SessionMismatch`
//! - NEVER panic

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tether_core::{DeviceId, Direction, Envelope, KexError, SessionGuard};
use tether_crypto::SessionId;

#[derive(Debug, Arbitrary)]
struct Input {
    local: [u8; 16],
    expected: [u8; 32],
    sender: [u8; 16],
    receiver: [u8; 16],
    session: [u8; 32],
    to_provisioner: bool,
}

fuzz_target!(|input: Input| {
    let guard =
        SessionGuard::new(DeviceId::from_bytes(input.local), SessionId::from_bytes(input.expected));
    let direction =
        if input.to_provisioner { Direction::ToProvisioner } else { Direction::ToProvisionee };
    let envelope = Envelope::new(
        DeviceId::from_bytes(input.sender),
        DeviceId::from_bytes(input.receiver),
        SessionId::from_bytes(input.session),
        direction,
    );

    let matches = input.receiver == input.local && input.session == input.expected;
    match guard.check_request(&envelope) {
        Ok(()) => assert!(matches),
        Err(KexError::WrongReceiverDevice { .. } | KexError::SessionMismatch) => {
            assert!(!matches);
        },
        Err(other) => panic!("unexpected rejection: {other}"),
    }
});
