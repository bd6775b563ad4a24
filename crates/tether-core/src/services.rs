//! Collaborator seams consumed by the engine.
//!
//! The relay, identity storage, secret-key store and key-publishing service
//! live outside this crate. The engine receives them as trait objects at
//! construction; there is no process-wide registry.

use async_trait::async_trait;
use tether_crypto::{KeyId, SecretKey, SessionId, SignedDelegation};

use crate::{
    error::{PublishError, StoreError, TransportError},
    identity::{DeviceId, Identity, LoadIdentityOptions},
    message::{Direction, Envelope, KexBody, KexMessage, PleaseSign},
};

/// Message relay between the two devices.
///
/// Delivery is addressed by envelope; the relay is untrusted and may deliver
/// stray, duplicated, or reordered messages.
#[async_trait]
pub trait KexTransport: Send + Sync {
    /// Deliver a message to the peer named in its envelope.
    async fn send(&self, message: KexMessage) -> Result<(), TransportError>;

    /// Next inbound message for `session_id` travelling in `direction`.
    ///
    /// `Ok(None)` is the end-of-protocol marker: the stream is exhausted and
    /// no further messages will arrive.
    async fn receive_next(
        &self,
        session_id: &SessionId,
        direction: Direction,
    ) -> Result<Option<KexMessage>, TransportError>;

    /// Ask the provisionee to begin.
    async fn start_kex(&self, envelope: &Envelope) -> Result<(), TransportError> {
        self.send(KexMessage::new(envelope.clone(), KexBody::StartKex)).await
    }

    /// Announce this device and its key to the provisioner.
    async fn hello(
        &self,
        envelope: &Envelope,
        device_id: DeviceId,
        device_kid: KeyId,
    ) -> Result<(), TransportError> {
        self.send(KexMessage::new(envelope.clone(), KexBody::Hello { device_id, device_kid }))
            .await
    }

    /// Ask the provisioner to delegate this device's key.
    async fn please_sign(
        &self,
        envelope: &Envelope,
        request: PleaseSign,
    ) -> Result<(), TransportError> {
        self.send(KexMessage::new(envelope.clone(), KexBody::PleaseSign(request))).await
    }

    /// Report to the provisionee that the delegation is published.
    async fn done(&self, envelope: &Envelope) -> Result<(), TransportError> {
        self.send(KexMessage::new(envelope.clone(), KexBody::Done)).await
    }
}

/// Persistent identity and signature-chain storage.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Load an identity, reloading its signature chain from the source of
    /// truth.
    async fn load_identity(&self, options: &LoadIdentityOptions) -> Result<Identity, StoreError>;
}

/// Access to the local device's private signing key.
///
/// Retrieval may prompt a human and can take arbitrarily long. Callers treat
/// it as cancellable.
#[async_trait]
pub trait SecretKeyStore: Send + Sync {
    /// Secret signing key for `identity`. `reason` is shown to the user if a
    /// prompt is needed.
    async fn secret_signing_key(
        &self,
        reason: &str,
        identity: &Identity,
    ) -> Result<SecretKey, StoreError>;
}

/// Remote key-publishing service.
#[async_trait]
pub trait KeyPublisher: Send + Sync {
    /// Publish a signed delegation; returns the key id it granted.
    async fn push(&self, delegation: &SignedDelegation) -> Result<KeyId, PublishError>;
}

/// Source of phrase words.
pub trait WordSource: Send + Sync {
    /// `n` words chosen with cryptographic randomness.
    fn word_list(&self, n: usize) -> Result<Vec<String>, StoreError>;
}
