//! Building and publishing the sibkey delegation.
//!
//! ```text
//!   local sibkey (secret) ─┐
//!   peer public key ───────┤
//!   peer reverse sig ──────┼──► DelegationStatement ──sign──► SignedDelegation ──push──► KeyPublisher
//!   device descriptor ─────┤
//!   eldest kid ────────────┘
//! ```
//!
//! # Invariants
//!
//! - Nothing is published unless the local key is Ed25519, the peer key is
//!   Ed25519, and the peer's reverse signature verifies
//! - A failed publish leaves the chain untouched; the error is fatal to the
//!   phase that requested it

use std::{sync::Arc, time::Duration};

use tether_crypto::{
    CryptoError, DelegationStatement, KeyId, KeyType, PublicKey, ReverseSig, SecretKey,
};

use crate::{
    env::Environment, error::KexError, identity::DeviceDescriptor, services::KeyPublisher,
};

/// Default validity of a delegated sibkey (five years).
pub const DEFAULT_DELEGATION_EXPIRY: Duration = Duration::from_secs(5 * 365 * 24 * 60 * 60);

/// Everything the provisioner knows about the key it is asked to delegate.
#[derive(Debug, Clone)]
pub struct DelegationRequest {
    /// Identity the key joins
    pub identity_name: String,
    /// Identity's eldest key
    pub eldest_kid: KeyId,
    /// Provisionee's public signing key
    pub peer_key: PublicKey,
    /// Provisionee's consent signature
    pub reverse_sig: ReverseSig,
    /// Provisionee's device
    pub device: DeviceDescriptor,
}

/// Signs delegation statements and pushes them to the publishing service.
pub struct DelegationSigner<E: Environment> {
    publisher: Arc<dyn KeyPublisher>,
    env: E,
    expire_in: Duration,
}

impl<E: Environment> DelegationSigner<E> {
    /// Signer publishing through `publisher`.
    pub fn new(publisher: Arc<dyn KeyPublisher>, env: E, expire_in: Duration) -> Self {
        Self { publisher, env, expire_in }
    }

    /// Validity period given to new delegations.
    pub fn expire_in(&self) -> Duration {
        self.expire_in
    }

    /// Sign a delegation of `request.peer_key` with `signing_key` and publish
    /// it.
    ///
    /// # Errors
    ///
    /// - `KeyTypeMismatch` if either key is not Ed25519 (nothing published)
    /// - `InvalidReverseSignature` if the peer did not validly consent
    /// - `DelegationPublishFailed` if the publishing service refuses
    pub async fn sign_and_publish(
        &self,
        signing_key: &SecretKey,
        request: &DelegationRequest,
    ) -> Result<KeyId, KexError> {
        signing_key.as_ed25519()?;
        if request.peer_key.key_type() != KeyType::Ed25519 {
            return Err(KexError::KeyTypeMismatch {
                expected: KeyType::Ed25519,
                found: request.peer_key.key_type(),
            });
        }

        let statement = DelegationStatement {
            identity: request.identity_name.clone(),
            eldest_kid: request.eldest_kid.clone(),
            signing_kid: signing_key.public_key().kid(),
            delegated_kid: request.peer_key.kid(),
            device: request.device.to_record(),
            sibkey: true,
            ctime: self.env.wall_clock_secs(),
            expire_in: self.expire_in.as_secs(),
            reverse_sig: Some(request.reverse_sig.clone()),
        };

        let signed = statement.sign(signing_key).map_err(|e| match e {
            CryptoError::InvalidSignature | CryptoError::MissingReverseSignature => {
                KexError::InvalidReverseSignature
            },
            other => KexError::from(other),
        })?;

        let kid = self
            .publisher
            .push(&signed)
            .await
            .map_err(|e| KexError::DelegationPublishFailed(e.to_string()))?;

        tracing::info!(
            identity = %statement.identity,
            delegated = %statement.delegated_kid,
            device = %request.device.id,
            sig_id = %hex::encode(signed.sig_id()),
            "published sibkey delegation"
        );
        Ok(kid)
    }
}

impl<E: Environment> std::fmt::Debug for DelegationSigner<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegationSigner").field("expire_in", &self.expire_in).finish_non_exhaustive()
    }
}
