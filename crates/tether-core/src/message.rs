//! Pairing messages and their wire encoding.
//!
//! Every message is an [`Envelope`] (routing: who sent it, who it is for,
//! which session) plus a [`KexBody`]. The relay sees envelopes in the clear;
//! it is untrusted, so receivers re-check routing on every message.
//!
//! # Wire Format
//!
//! ```text
//! ┌─────────┬──────────────────────────────┐
//! │ version │ CBOR(KexMessage)             │
//! │  (1 B)  │                              │
//! └─────────┴──────────────────────────────┘
//! ```
//!
//! Decoding rejects unknown versions, messages above [`MAX_MESSAGE_SIZE`] and
//! trailing bytes after the CBOR value.

use std::io::Cursor;

use serde::{Deserialize, Serialize};
use tether_crypto::{KeyId, ReverseSig, SessionId};

use crate::{
    error::KexError,
    identity::{DeviceId, DeviceType},
};

/// Current wire format version.
pub const WIRE_VERSION: u8 = 1;

/// Largest encoded message accepted by [`KexMessage::decode`].
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Which way a message flows between the two roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Existing device (X) to new device (Y)
    ToProvisionee,
    /// New device (Y) to existing device (X)
    ToProvisioner,
}

impl Direction {
    /// The opposite direction.
    pub const fn reversed(self) -> Self {
        match self {
            Self::ToProvisionee => Self::ToProvisioner,
            Self::ToProvisioner => Self::ToProvisionee,
        }
    }
}

/// Routing metadata carried by every message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sending device
    pub sender: DeviceId,
    /// Intended receiving device
    pub receiver: DeviceId,
    /// Pairing attempt the message belongs to
    pub session_id: SessionId,
    /// Flow direction
    pub direction: Direction,
}

impl Envelope {
    /// New envelope.
    pub fn new(
        sender: DeviceId,
        receiver: DeviceId,
        session_id: SessionId,
        direction: Direction,
    ) -> Self {
        Self { sender, receiver, session_id, direction }
    }

    /// Readdress to the peer: exchange sender and receiver and reverse the
    /// direction.
    pub fn swap(&mut self) {
        std::mem::swap(&mut self.sender, &mut self.receiver);
        self.direction = self.direction.reversed();
    }
}

/// Handshake phases, in protocol order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    /// Provisioner asks the provisionee to begin
    StartKex,
    /// Provisionee announces its device and key
    Hello,
    /// Provisionee asks to have its key delegated
    PleaseSign,
    /// Provisioner reports the delegation is published
    Done,
}

impl Phase {
    /// All phases in protocol order.
    pub const ALL: [Self; 4] = [Self::StartKex, Self::Hello, Self::PleaseSign, Self::Done];

    /// Direction messages of this phase travel in.
    pub const fn direction(self) -> Direction {
        match self {
            Self::StartKex | Self::Done => Direction::ToProvisionee,
            Self::Hello | Self::PleaseSign => Direction::ToProvisioner,
        }
    }
}

/// Delegation request sent by the provisionee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PleaseSign {
    /// Provisionee's new Ed25519 public key
    pub public_key: [u8; 32],
    /// Provisionee's consent signature over the delegation binding
    pub reverse_sig: ReverseSig,
    /// Provisionee's device type
    pub device_type: DeviceType,
    /// Provisionee's device description
    pub description: String,
}

/// Message payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KexBody {
    /// Begin the exchange
    StartKex,
    /// Announce device id and key
    Hello {
        /// Announcing device
        device_id: DeviceId,
        /// Announcing device's key id
        device_kid: KeyId,
    },
    /// Request delegation
    PleaseSign(PleaseSign),
    /// Delegation published
    Done,
    /// Reverse-direction exchange; accepted and ignored
    StartReverseKex,
}

impl KexBody {
    /// Phase this body belongs to, if any.
    pub const fn phase(&self) -> Option<Phase> {
        match self {
            Self::StartKex => Some(Phase::StartKex),
            Self::Hello { .. } => Some(Phase::Hello),
            Self::PleaseSign(_) => Some(Phase::PleaseSign),
            Self::Done => Some(Phase::Done),
            Self::StartReverseKex => None,
        }
    }

    /// Short name for logs and errors.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::StartKex => "StartKex",
            Self::Hello { .. } => "Hello",
            Self::PleaseSign(_) => "PleaseSign",
            Self::Done => "Done",
            Self::StartReverseKex => "StartReverseKex",
        }
    }
}

/// One pairing message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KexMessage {
    /// Routing metadata
    pub envelope: Envelope,
    /// Payload
    pub body: KexBody,
}

impl KexMessage {
    /// New message.
    pub fn new(envelope: Envelope, body: KexBody) -> Self {
        Self { envelope, body }
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>, KexError> {
        let mut buf = vec![WIRE_VERSION];
        ciborium::into_writer(self, &mut buf).map_err(|e| KexError::Codec(e.to_string()))?;
        Ok(buf)
    }

    /// Decode wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, KexError> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(KexError::Codec(format!(
                "message of {} bytes exceeds limit of {MAX_MESSAGE_SIZE}",
                bytes.len()
            )));
        }

        let Some((&version, body)) = bytes.split_first() else {
            return Err(KexError::Codec("empty message".to_string()));
        };
        if version != WIRE_VERSION {
            return Err(KexError::Codec(format!("unsupported wire version {version}")));
        }

        let mut cursor = Cursor::new(body);
        let message: Self =
            ciborium::from_reader(&mut cursor).map_err(|e| KexError::Codec(e.to_string()))?;

        if cursor.position() as usize != body.len() {
            return Err(KexError::Codec("trailing bytes after message".to_string()));
        }

        Ok(message)
    }
}
