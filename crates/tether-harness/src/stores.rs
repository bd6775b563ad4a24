//! In-memory identity, secret-key and publishing collaborators.
//!
//! A single [`KeyServer`] plays the role of the remote source of truth for
//! signature chains. [`RecordingPublisher`] appends accepted delegations to
//! it and [`MemoryIdentityStore`] reads from it, so a reload after publish
//! observes the new sibkey the way a real chain reload would.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tether_core::{
    Identity, IdentityStore, KeyPublisher, LoadIdentityOptions, PublishError, SecretKeyStore,
    StoreError,
};
use tether_crypto::{KeyId, SecretKey, SignedDelegation};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared chain state for every identity in a test.
#[derive(Clone, Default)]
pub struct KeyServer {
    chains: Arc<Mutex<HashMap<String, Identity>>>,
}

impl KeyServer {
    /// Empty server.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an identity.
    pub fn register(&self, identity: Identity) {
        lock(&self.chains).insert(identity.name.clone(), identity);
    }

    /// Current chain for `name`.
    pub fn lookup(&self, name: &str) -> Option<Identity> {
        lock(&self.chains).get(name).cloned()
    }

    /// Append a verified delegation to its identity's chain.
    fn apply(&self, delegation: &SignedDelegation) -> Result<KeyId, PublishError> {
        let statement = delegation.verify().map_err(|e| PublishError::Rejected(e.to_string()))?;
        let mut chains = lock(&self.chains);
        let identity = chains.get_mut(&statement.identity).ok_or_else(|| {
            PublishError::Rejected(format!("unknown identity {}", statement.identity))
        })?;

        if statement.eldest_kid != identity.eldest_kid {
            return Err(PublishError::Rejected("eldest key does not match chain".to_string()));
        }
        if !identity.trusts(&statement.signing_kid) {
            return Err(PublishError::Rejected(format!(
                "signer {} is not a sibkey",
                statement.signing_kid
            )));
        }

        identity.sibkeys.push(statement.delegated_kid.clone());
        identity.chain_len += 1;
        Ok(statement.delegated_kid)
    }
}

/// Identity store backed by a [`KeyServer`].
pub struct MemoryIdentityStore {
    server: KeyServer,
    current: Option<String>,
    loads: AtomicUsize,
    failure: Mutex<Option<StoreError>>,
}

impl MemoryIdentityStore {
    /// Store whose logged-in identity is `current` (none for a new device).
    pub fn new(server: KeyServer, current: Option<String>) -> Self {
        Self { server, current, loads: AtomicUsize::new(0), failure: Mutex::new(None) }
    }

    /// Fail every subsequent load with `error`.
    pub fn fail_with(&self, error: StoreError) {
        *lock(&self.failure) = Some(error);
    }

    /// Loads served so far.
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn load_identity(&self, options: &LoadIdentityOptions) -> Result<Identity, StoreError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = lock(&self.failure).clone() {
            return Err(error);
        }

        let name = options
            .name
            .as_deref()
            .or(self.current.as_deref())
            .ok_or_else(|| StoreError::NotFound("no identity logged in".to_string()))?;
        self.server.lookup(name).ok_or_else(|| StoreError::NotFound(name.to_string()))
    }
}

/// Secret-key store holding one key, counting fetches.
pub struct MemorySecretKeyStore {
    key: SecretKey,
    fetches: AtomicUsize,
    failure: Mutex<Option<StoreError>>,
    delay: Option<Duration>,
}

impl MemorySecretKeyStore {
    /// Store returning `key`.
    pub fn new(key: SecretKey) -> Self {
        Self { key, fetches: AtomicUsize::new(0), failure: Mutex::new(None), delay: None }
    }

    /// Simulate a slow prompt.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail every subsequent fetch with `error`.
    pub fn fail_with(&self, error: StoreError) {
        *lock(&self.failure) = Some(error);
    }

    /// Fetches requested so far.
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecretKeyStore for MemorySecretKeyStore {
    async fn secret_signing_key(
        &self,
        reason: &str,
        identity: &Identity,
    ) -> Result<SecretKey, StoreError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(identity = %identity.name, reason, "secret key requested");
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match lock(&self.failure).clone() {
            Some(error) => Err(error),
            None => Ok(self.key.clone()),
        }
    }
}

/// Publisher that verifies, records and applies delegations.
pub struct RecordingPublisher {
    server: KeyServer,
    pushed: Mutex<Vec<SignedDelegation>>,
    failure: Mutex<Option<PublishError>>,
}

impl RecordingPublisher {
    /// Publisher applying to `server`.
    pub fn new(server: KeyServer) -> Self {
        Self { server, pushed: Mutex::new(Vec::new()), failure: Mutex::new(None) }
    }

    /// Fail every subsequent push with `error`.
    pub fn fail_with(&self, error: PublishError) {
        *lock(&self.failure) = Some(error);
    }

    /// Every push attempted, accepted or not.
    pub fn pushed(&self) -> Vec<SignedDelegation> {
        lock(&self.pushed).clone()
    }
}

#[async_trait]
impl KeyPublisher for RecordingPublisher {
    async fn push(&self, delegation: &SignedDelegation) -> Result<KeyId, PublishError> {
        lock(&self.pushed).push(delegation.clone());
        if let Some(error) = lock(&self.failure).clone() {
            return Err(error);
        }
        self.server.apply(delegation)
    }
}
