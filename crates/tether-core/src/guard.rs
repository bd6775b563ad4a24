//! Routing checks applied to every inbound message.
//!
//! The relay is shared and untrusted. Before a handler acts on a message it
//! must prove the message was addressed to this device and belongs to this
//! pairing attempt; otherwise the message is rejected with no side effect.

use subtle::ConstantTimeEq;
use tether_crypto::SessionId;

use crate::{error::KexError, identity::DeviceId, message::Envelope};

/// Validates envelopes against the local device and session.
#[derive(Debug, Clone)]
pub struct SessionGuard {
    device_id: DeviceId,
    session_id: SessionId,
}

impl SessionGuard {
    /// Guard for `device_id` in session `session_id`.
    pub fn new(device_id: DeviceId, session_id: SessionId) -> Self {
        Self { device_id, session_id }
    }

    /// Session this guard accepts.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Fails unless the envelope is addressed to this device.
    pub fn check_receiver(&self, envelope: &Envelope) -> Result<(), KexError> {
        tracing::trace!(
            sender = %envelope.sender,
            receiver = %envelope.receiver,
            local = %self.device_id,
            "checking envelope receiver"
        );
        if envelope.receiver != self.device_id {
            return Err(KexError::WrongReceiverDevice {
                expected: self.device_id,
                received: envelope.receiver,
            });
        }
        Ok(())
    }

    /// Fails unless the envelope carries this session id. Constant-time.
    pub fn check_session(&self, envelope: &Envelope) -> Result<(), KexError> {
        if !bool::from(envelope.session_id.ct_eq(&self.session_id)) {
            return Err(KexError::SessionMismatch);
        }
        Ok(())
    }

    /// Both checks; every inbound handler runs this first.
    pub fn check_request(&self, envelope: &Envelope) -> Result<(), KexError> {
        self.check_receiver(envelope)?;
        self.check_session(envelope)
    }
}
