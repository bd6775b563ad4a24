//! Error types for the pairing protocol core.
//!
//! Strongly-typed errors for each layer: [`KexError`] for handshake logic,
//! [`TransportError`] for the relay, and [`StoreError`] / [`PublishError`]
//! for the key store and publishing service.
//!
//! Errors split into two classes. Rejections ([`KexError::is_rejection`])
//! drop a single inbound message and leave the attempt untouched, so stray or
//! hostile relay traffic cannot abort a legitimate pairing. Everything else
//! raised while handling a phase is fatal to the attempt and surfaces to the
//! driving caller through that phase's signal.

use std::time::Duration;

use tether_crypto::{CryptoError, KeyType};
use thiserror::Error;

use crate::{
    engine::{EngineState, Role},
    identity::DeviceId,
    message::Direction,
};

/// Errors raised by the handshake engine and its components.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KexError {
    /// No identity bound yet; session derivation is salted per identity
    #[error("no identity bound; load the identity before deriving a session")]
    IdentityMissing,

    /// Message addressed to a different device
    #[error("message for device {received}, this device is {expected}")]
    WrongReceiverDevice {
        /// This device
        expected: DeviceId,
        /// Receiver named in the envelope
        received: DeviceId,
    },

    /// Word source could not supply a phrase
    #[error("word list unavailable: {0}")]
    WordListUnavailable(String),

    /// Message belongs to a different pairing session
    #[error("session id mismatch")]
    SessionMismatch,

    /// Key of the wrong signature scheme
    #[error("key type mismatch: expected {expected:?}, found {found:?}")]
    KeyTypeMismatch {
        /// Scheme the operation needs
        expected: KeyType,
        /// Scheme of the supplied key
        found: KeyType,
    },

    /// Secret signing key could not be retrieved (store failure or declined
    /// prompt)
    #[error("secret signing key unavailable: {0}")]
    SecretKeyUnavailable(String),

    /// Publishing the delegation failed
    #[error("delegation publish failed: {0}")]
    DelegationPublishFailed(String),

    /// Reloading the signature chain failed
    #[error("chain reload failed: {0}")]
    ChainReloadFailed(String),

    /// Peer's reverse signature does not verify
    #[error("reverse signature does not verify")]
    InvalidReverseSignature,

    /// Message kind not accepted by this role or direction
    #[error("unexpected {kind} message travelling {direction:?}")]
    UnexpectedMessage {
        /// Message kind
        kind: &'static str,
        /// Direction it arrived in
        direction: Direction,
    },

    /// Operation not valid in the current state
    #[error("invalid state transition: cannot {operation} from {state:?}")]
    InvalidState {
        /// Current state when error occurred
        state: EngineState,
        /// Operation that was attempted
        operation: &'static str,
    },

    /// Operation belongs to the other role
    #[error("{operation} is not available to the {role:?}")]
    RoleMismatch {
        /// This engine's role
        role: Role,
        /// Operation that was attempted
        operation: &'static str,
    },

    /// Caller-imposed deadline elapsed
    #[error("pairing attempt exceeded {limit:?}")]
    Timeout {
        /// Deadline that elapsed
        limit: Duration,
    },

    /// Attempt was aborted or ended before the awaited event
    #[error("pairing attempt cancelled")]
    Cancelled,

    /// Relay error
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Cryptographic failure other than a key type mismatch
    #[error("crypto error: {0}")]
    Crypto(CryptoError),

    /// Malformed wire message
    #[error("codec error: {0}")]
    Codec(String),
}

impl KexError {
    /// True if this error only rejects a single inbound message.
    ///
    /// Rejections never change engine state and never fail a phase.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::WrongReceiverDevice { .. }
                | Self::SessionMismatch
                | Self::UnexpectedMessage { .. }
                | Self::Codec(_)
        )
    }
}

impl From<CryptoError> for KexError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::KeyTypeMismatch { expected, found } => {
                Self::KeyTypeMismatch { expected, found }
            },
            other => Self::Crypto(other),
        }
    }
}

/// Errors reported by the relay transport.
///
/// End of protocol is not an error: `receive_next` returns `Ok(None)`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Transport shut down; no further messages can flow
    #[error("transport closed")]
    Closed,

    /// Sending a message failed
    #[error("send failed: {0}")]
    Send(String),

    /// Receiving a message failed
    #[error("receive failed: {0}")]
    Receive(String),
}

impl TransportError {
    /// Returns true if this error is transient and polling may continue.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Send(_) | Self::Receive(_))
    }
}

/// Errors reported by identity and secret-key stores.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Requested identity or key does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The user declined or cancelled a prompt
    #[error("cancelled by user")]
    Cancelled,

    /// Backend failure
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Errors reported by the key-publishing service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// Service refused the statement
    #[error("rejected: {0}")]
    Rejected(String),

    /// Service unreachable
    #[error("unavailable: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_failures_are_rejections() {
        let device = DeviceId::from_bytes([1; 16]);
        assert!(KexError::WrongReceiverDevice { expected: device, received: device }.is_rejection());
        assert!(KexError::SessionMismatch.is_rejection());
        assert!(
            KexError::UnexpectedMessage { kind: "Done", direction: Direction::ToProvisioner }
                .is_rejection()
        );
    }

    #[test]
    fn key_and_publish_failures_are_fatal() {
        assert!(
            !KexError::KeyTypeMismatch { expected: KeyType::Ed25519, found: KeyType::Pgp }
                .is_rejection()
        );
        assert!(!KexError::SecretKeyUnavailable("declined".to_string()).is_rejection());
        assert!(!KexError::DelegationPublishFailed("503".to_string()).is_rejection());
        assert!(!KexError::ChainReloadFailed("offline".to_string()).is_rejection());
        assert!(!KexError::InvalidReverseSignature.is_rejection());
    }

    #[test]
    fn crypto_key_mismatch_maps_to_kex_key_mismatch() {
        let err: KexError =
            CryptoError::KeyTypeMismatch { expected: KeyType::Ed25519, found: KeyType::Pgp }.into();
        assert_eq!(err, KexError::KeyTypeMismatch { expected: KeyType::Ed25519, found: KeyType::Pgp });

        let err: KexError = CryptoError::InvalidSignature.into();
        assert_eq!(err, KexError::Crypto(CryptoError::InvalidSignature));
    }

    #[test]
    fn closed_transport_is_not_transient() {
        assert!(!TransportError::Closed.is_transient());
        assert!(TransportError::Receive("reset".to_string()).is_transient());
    }
}
