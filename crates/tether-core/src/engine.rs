//! Handshake engine: the four-phase pairing state machine.
//!
//! One engine runs per pairing attempt and per side. The driving caller
//! initiates and waits on phase signals; the [`Dispatcher`] feeds inbound
//! messages to [`HandshakeEngine::handle`] on its own task.
//!
//! ```text
//!  Provisioner (X)                                  Provisionee (Y)
//!  ───────────────                                  ───────────────
//!  initiate_as_provisioner                          initiate_as_provisionee
//!    │ ── StartKex ───────────────────────────────►   │ handle StartKex
//!    │                                                │
//!    │ handle Hello  ◄──────────────────────── Hello ─┤
//!    │                                                │ send_please_sign
//!    │ handle PleaseSign ◄─────────────── PleaseSign ─┤
//!    │   fetch secret key (once)                      │
//!    │   sign + publish delegation (once)             │
//!    │ ── Done ───────────────────────────────────►   │ handle Done
//!    ▼ Complete                                       ▼ reload chain, Complete
//! ```
//!
//! # Invariants
//!
//! - Every inbound message passes the role/direction filter and the
//!   [`SessionGuard`] before any handler runs; a rejected message changes
//!   nothing
//! - Each phase signal resolves at most once; a redelivered phase message is
//!   a no-op
//! - The secret signing key is fetched at most once per engine and the
//!   delegation is published at most once
//! - State only moves forward
//!
//! [`Dispatcher`]: crate::dispatch::Dispatcher

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use ed25519_dalek::VerifyingKey;
use tether_crypto::{
    KdfParams, KeyId, KeyPair, PublicKey, ReversePayload, SecretKey, SecretPhrase, SessionId,
};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::{
    delegation::{DEFAULT_DELEGATION_EXPIRY, DelegationRequest, DelegationSigner},
    env::Environment,
    error::{KexError, StoreError},
    guard::SessionGuard,
    identity::{DeviceDescriptor, DeviceId, DeviceType, Identity, LoadIdentityOptions},
    message::{Direction, Envelope, KexBody, KexMessage, Phase, PleaseSign},
    secret::SecretDeriver,
    services::{IdentityStore, KexTransport, KeyPublisher, SecretKeyStore, WordSource},
    signal::PhaseSignals,
};

/// Reason passed to the secret-key store when the provisioner needs its key.
pub const DEFAULT_SECRET_KEY_REASON: &str = "new device install";

/// Which side of the exchange an engine plays. Fixed for the attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Existing, authenticated device ("X")
    Provisioner,
    /// New device being added ("Y")
    Provisionee,
}

impl Role {
    /// Direction of messages this role receives.
    pub const fn inbound(self) -> Direction {
        match self {
            Self::Provisioner => Direction::ToProvisioner,
            Self::Provisionee => Direction::ToProvisionee,
        }
    }

    /// Direction of messages this role sends.
    pub const fn outbound(self) -> Direction {
        self.inbound().reversed()
    }

    /// Whether this role handles inbound messages of this kind.
    pub const fn accepts(self, body: &KexBody) -> bool {
        match (self, body) {
            (_, KexBody::StartReverseKex) => true,
            (Self::Provisioner, KexBody::Hello { .. } | KexBody::PleaseSign(_)) => true,
            (Self::Provisionee, KexBody::StartKex | KexBody::Done) => true,
            _ => false,
        }
    }
}

/// Handshake progress. Ordered; an engine never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EngineState {
    /// Not yet initiated
    Idle,
    /// Initiated; StartKex sent (provisioner) or awaited (provisionee)
    AwaitStart,
    /// StartKex handled and Hello sent (provisionee)
    AwaitHello,
    /// Hello received (provisioner)
    AwaitSign,
    /// PleaseSign processed (provisioner) or sent (provisionee)
    AwaitDone,
    /// Done sent (provisioner) or handled (provisionee)
    Complete,
}

/// Per-engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Side of the exchange
    pub role: Role,
    /// This device
    pub device_id: DeviceId,
    /// Name attached to every log line from this engine
    pub debug_name: String,
    /// Validity of delegations this engine publishes
    pub delegation_expiry: Duration,
    /// Reason shown if fetching the secret key prompts the user
    pub secret_key_reason: String,
    /// Session derivation work factor
    pub kdf: KdfParams,
}

impl EngineConfig {
    /// Defaults for `role` on `device_id`.
    pub fn new(role: Role, device_id: DeviceId) -> Self {
        let debug_name = match role {
            Role::Provisioner => "provisioner",
            Role::Provisionee => "provisionee",
        };
        Self {
            role,
            device_id,
            debug_name: debug_name.to_string(),
            delegation_expiry: DEFAULT_DELEGATION_EXPIRY,
            secret_key_reason: DEFAULT_SECRET_KEY_REASON.to_string(),
            kdf: KdfParams::default(),
        }
    }
}

/// External collaborators, injected at construction.
#[derive(Clone)]
pub struct EngineDeps {
    /// Message relay
    pub transport: Arc<dyn KexTransport>,
    /// Identity and chain storage
    pub identities: Arc<dyn IdentityStore>,
    /// Secret signing key access
    pub secret_keys: Arc<dyn SecretKeyStore>,
    /// Key-publishing service
    pub publisher: Arc<dyn KeyPublisher>,
    /// Phrase word source
    pub words: Arc<dyn WordSource>,
}

/// Read-only view of an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSnapshot {
    /// Current state
    pub state: EngineState,
    /// Every state entered, in order, starting with `Idle`
    pub history: Vec<EngineState>,
    /// Side of the exchange
    pub role: Role,
    /// This device
    pub device_id: DeviceId,
    /// This device's key
    pub device_kid: KeyId,
    /// Peer device, once known
    pub peer_device: Option<DeviceId>,
    /// Peer key announced in Hello
    pub peer_kid: Option<KeyId>,
    /// Whether the secret signing key has been fetched
    pub signing_key_fetched: bool,
    /// Key granted by the published delegation
    pub published: Option<KeyId>,
    /// Phases that completed successfully
    pub completed_phases: Vec<Phase>,
    /// Bound identity name
    pub identity: Option<String>,
}

struct Inner {
    state: EngineState,
    history: Vec<EngineState>,
    identity: Option<Identity>,
    load_options: LoadIdentityOptions,
    deriver: SecretDeriver,
    guard: Option<SessionGuard>,
    peer_device: Option<DeviceId>,
    peer_kid: Option<KeyId>,
}

/// Pairing state machine for one side of one attempt.
pub struct HandshakeEngine<E: Environment> {
    config: EngineConfig,
    deps: EngineDeps,
    device_key: KeyPair,
    inner: Mutex<Inner>,
    signing_key: OnceCell<SecretKey>,
    delegation: OnceCell<KeyId>,
    signals: PhaseSignals,
    completion: CancellationToken,
    signer: DelegationSigner<E>,
}

impl<E: Environment> HandshakeEngine<E> {
    /// New idle engine.
    ///
    /// `device_key` is the provisioner's existing sibkey (public half; the
    /// secret is fetched from the key store when needed) or the provisionee's
    /// new device key (with its secret half).
    pub fn new(config: EngineConfig, deps: EngineDeps, device_key: KeyPair, env: E) -> Self {
        let deriver = SecretDeriver::new(Arc::clone(&deps.words), config.kdf);
        let signer =
            DelegationSigner::new(Arc::clone(&deps.publisher), env, config.delegation_expiry);
        Self {
            inner: Mutex::new(Inner {
                state: EngineState::Idle,
                history: vec![EngineState::Idle],
                identity: None,
                load_options: LoadIdentityOptions::current(),
                deriver,
                guard: None,
                peer_device: None,
                peer_kid: None,
            }),
            config,
            deps,
            device_key,
            signing_key: OnceCell::new(),
            delegation: OnceCell::new(),
            signals: PhaseSignals::default(),
            completion: CancellationToken::new(),
            signer,
        }
    }

    fn with_inner<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut inner)
    }

    fn name(&self) -> &str {
        &self.config.debug_name
    }

    /// Side of the exchange.
    pub fn role(&self) -> Role {
        self.config.role
    }

    /// This device.
    pub fn device_id(&self) -> DeviceId {
        self.config.device_id
    }

    /// This engine's configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Message relay this engine sends through.
    pub fn transport(&self) -> Arc<dyn KexTransport> {
        Arc::clone(&self.deps.transport)
    }

    /// Token cancelled when the attempt completes, fails or is aborted.
    pub fn completion_token(&self) -> CancellationToken {
        self.completion.clone()
    }

    /// Current state.
    pub fn state(&self) -> EngineState {
        self.with_inner(|inner| inner.state)
    }

    /// Session this engine was initiated with.
    pub fn session_id(&self) -> Option<SessionId> {
        self.with_inner(|inner| inner.guard.as_ref().map(|guard| *guard.session_id()))
    }

    /// Bound identity, as last loaded.
    pub fn identity(&self) -> Option<Identity> {
        self.with_inner(|inner| inner.identity.clone())
    }

    /// Key granted by this engine's published delegation.
    pub fn published_kid(&self) -> Option<KeyId> {
        self.delegation.get().cloned()
    }

    /// Read-only introspection.
    pub fn current_state(&self) -> EngineSnapshot {
        let (state, history, peer_device, peer_kid, identity) = self.with_inner(|inner| {
            (
                inner.state,
                inner.history.clone(),
                inner.peer_device,
                inner.peer_kid.clone(),
                inner.identity.as_ref().map(|identity| identity.name.clone()),
            )
        });
        EngineSnapshot {
            state,
            history,
            role: self.config.role,
            device_id: self.config.device_id,
            device_kid: self.device_key.kid(),
            peer_device,
            peer_kid,
            signing_key_fetched: self.signing_key.initialized(),
            published: self.published_kid(),
            completed_phases: self.signals.completed(),
            identity,
        }
    }

    /// Load and bind the identity this attempt acts for.
    ///
    /// Session derivation is salted with the identity name, so this must
    /// happen before [`generate_secret`](Self::generate_secret) or
    /// [`derive_session_id`](Self::derive_session_id).
    pub async fn load_identity(&self, options: LoadIdentityOptions) -> Result<Identity, KexError> {
        let identity = self.deps.identities.load_identity(&options).await.map_err(|e| match e {
            StoreError::NotFound(_) => KexError::IdentityMissing,
            other => KexError::ChainReloadFailed(other.to_string()),
        })?;

        tracing::debug!(
            engine = %self.name(),
            identity = %identity.name,
            sibkeys = identity.sibkeys.len(),
            "identity bound"
        );
        self.with_inner(|inner| {
            inner.deriver.bind_identity(identity.name.clone());
            inner.identity = Some(identity.clone());
            inner.load_options = options;
        });
        Ok(identity)
    }

    /// Draw a fresh phrase and derive its session id.
    ///
    /// The KDF runs on the blocking pool.
    pub async fn generate_secret(&self) -> Result<(SecretPhrase, SessionId), KexError> {
        let deriver = self.with_inner(|inner| inner.deriver.clone());
        tokio::task::spawn_blocking(move || deriver.generate_secret())
            .await
            .map_err(|_| KexError::Cancelled)?
    }

    /// Derive the session id for a phrase entered by the user.
    pub async fn derive_session_id(&self, phrase: SecretPhrase) -> Result<SessionId, KexError> {
        let deriver = self.with_inner(|inner| inner.deriver.clone());
        tokio::task::spawn_blocking(move || deriver.derive_session_id(&phrase))
            .await
            .map_err(|_| KexError::Cancelled)?
    }

    fn require_role(&self, role: Role, operation: &'static str) -> Result<(), KexError> {
        if self.config.role != role {
            return Err(KexError::RoleMismatch { role: self.config.role, operation });
        }
        Ok(())
    }

    /// Move `Idle -> AwaitStart` and install the session guard.
    fn begin(
        &self,
        session_id: SessionId,
        peer: Option<DeviceId>,
        operation: &'static str,
    ) -> Result<(), KexError> {
        let device_id = self.config.device_id;
        self.with_inner(|inner| {
            if inner.state != EngineState::Idle {
                return Err(KexError::InvalidState { state: inner.state, operation });
            }
            if inner.identity.is_none() {
                return Err(KexError::IdentityMissing);
            }
            inner.guard = Some(SessionGuard::new(device_id, session_id));
            inner.peer_device = peer;
            inner.state = EngineState::AwaitStart;
            inner.history.push(EngineState::AwaitStart);
            Ok(())
        })
    }

    fn advance(&self, to: EngineState) {
        self.with_inner(|inner| {
            if to > inner.state {
                tracing::debug!(engine = %self.name(), from = ?inner.state, to = ?to, "state change");
                inner.state = to;
                inner.history.push(to);
            }
        });
    }

    /// Resolve `phase` as failed and end the attempt.
    fn fail(&self, phase: Phase, err: KexError) {
        if self.signals.get(phase).fire(Err(err.clone())) {
            tracing::error!(engine = %self.name(), phase = ?phase, error = %err, "phase failed");
        }
        self.completion.cancel();
    }

    /// Run an initiator-side step that resolves `phase` itself.
    fn settle(&self, phase: Phase, result: Result<(), KexError>) -> Result<(), KexError> {
        match &result {
            Ok(()) => {
                self.signals.get(phase).fire(Ok(()));
            },
            Err(err) => self.fail(phase, err.clone()),
        }
        result
    }

    /// Begin as the provisioner: send StartKex to `peer`.
    pub async fn initiate_as_provisioner(
        &self,
        session_id: SessionId,
        peer: DeviceId,
    ) -> Result<(), KexError> {
        self.require_role(Role::Provisioner, "initiate_as_provisioner")?;
        self.begin(session_id, Some(peer), "initiate_as_provisioner")?;

        tracing::info!(engine = %self.name(), peer = %peer, "starting key exchange");
        let envelope =
            Envelope::new(self.config.device_id, peer, session_id, self.config.role.outbound());
        let sent = self.deps.transport.start_kex(&envelope).await.map_err(KexError::from);
        self.settle(Phase::StartKex, sent)
    }

    /// Begin as the provisionee: wait for the provisioner's StartKex.
    pub async fn initiate_as_provisionee(&self, session_id: SessionId) -> Result<(), KexError> {
        self.require_role(Role::Provisionee, "initiate_as_provisionee")?;
        self.begin(session_id, None, "initiate_as_provisionee")?;
        tracing::info!(engine = %self.name(), "listening for key exchange");
        Ok(())
    }

    /// Ask the provisioner to delegate this device's key.
    ///
    /// Provisionee only, after StartKex has been handled. Signs the reverse
    /// payload with the device key so the provisioner can prove consent.
    pub async fn send_please_sign(
        &self,
        kind: DeviceType,
        description: impl Into<String>,
    ) -> Result<(), KexError> {
        self.require_role(Role::Provisionee, "send_please_sign")?;
        if let Some(outcome) = self.signals.get(Phase::PleaseSign).outcome() {
            return outcome;
        }

        // Enter AwaitDone before sending so a fast Done is never seen early.
        let (identity, peer, session_id) = self.with_inner(|inner| {
            match (&inner.identity, inner.peer_device, &inner.guard) {
                (Some(identity), Some(peer), Some(guard)) if inner.state == EngineState::AwaitHello => {
                    inner.state = EngineState::AwaitDone;
                    inner.history.push(EngineState::AwaitDone);
                    Ok((identity.clone(), peer, *guard.session_id()))
                },
                _ => Err(KexError::InvalidState { state: inner.state, operation: "send_please_sign" }),
            }
        })?;

        let result = self.please_sign(&identity, peer, session_id, kind, description.into()).await;
        self.settle(Phase::PleaseSign, result)
    }

    async fn please_sign(
        &self,
        identity: &Identity,
        peer: DeviceId,
        session_id: SessionId,
        kind: DeviceType,
        description: String,
    ) -> Result<(), KexError> {
        let device = DeviceDescriptor::new_active(self.config.device_id, kind, description.clone());
        let payload = ReversePayload {
            identity: identity.name.clone(),
            eldest_kid: identity.eldest_kid.clone(),
            delegated_kid: self.device_key.kid(),
            device: device.to_record(),
        };
        let secret = self.device_key.secret().ok_or_else(|| {
            KexError::SecretKeyUnavailable("device key has no secret half".to_string())
        })?;
        let reverse_sig = payload.sign(secret)?;

        let request = PleaseSign {
            public_key: self.device_key.public().as_ed25519()?.to_bytes(),
            reverse_sig,
            device_type: kind,
            description,
        };
        let envelope =
            Envelope::new(self.config.device_id, peer, session_id, self.config.role.outbound());

        tracing::debug!(engine = %self.name(), peer = %peer, kid = %payload.delegated_kid, "requesting delegation");
        self.deps.transport.please_sign(&envelope, request).await?;
        Ok(())
    }

    /// Wait until `phase` resolves.
    ///
    /// Returns immediately if it already has. If the attempt ends without
    /// `phase` resolving, returns the failure that ended it.
    pub async fn wait_for_phase(&self, phase: Phase) -> Result<(), KexError> {
        let signal = self.signals.get(phase);
        tokio::select! {
            biased;
            outcome = signal.wait() => outcome,
            () = self.completion.cancelled() => signal.outcome().unwrap_or_else(|| {
                Err(self.signals.first_failure().unwrap_or(KexError::Cancelled))
            }),
        }
    }

    /// [`wait_for_phase`](Self::wait_for_phase) bounded by `limit`.
    pub async fn wait_for_phase_within(
        &self,
        phase: Phase,
        limit: Duration,
    ) -> Result<(), KexError> {
        tokio::time::timeout(limit, self.wait_for_phase(phase))
            .await
            .map_err(|_| KexError::Timeout { limit })?
    }

    /// Abandon the attempt. Pending waits return `Cancelled`; the dispatcher
    /// unwinds.
    pub fn abort(&self) {
        if !self.completion.is_cancelled() {
            tracing::warn!(engine = %self.name(), state = ?self.state(), "pairing attempt aborted");
        }
        self.completion.cancel();
    }

    /// Admission checks shared by every inbound message. No side effects.
    fn admit(&self, message: &KexMessage) -> Result<(), KexError> {
        let role = self.config.role;
        if message.envelope.direction != role.inbound() || !role.accepts(&message.body) {
            return Err(KexError::UnexpectedMessage {
                kind: message.body.kind(),
                direction: message.envelope.direction,
            });
        }

        self.with_inner(|inner| match &inner.guard {
            Some(guard) => guard.check_request(&message.envelope),
            None => Err(KexError::InvalidState { state: inner.state, operation: "handle" }),
        })
    }

    /// Handle one inbound message.
    ///
    /// Rejected messages ([`KexError::is_rejection`]) leave the engine
    /// untouched. Any other error fails the message's phase and ends the
    /// attempt.
    pub async fn handle(&self, message: KexMessage) -> Result<(), KexError> {
        self.admit(&message)?;

        let Some(phase) = message.body.phase() else {
            tracing::debug!(engine = %self.name(), "ignoring StartReverseKex");
            return Ok(());
        };

        if self.signals.get(phase).is_fired() {
            tracing::debug!(engine = %self.name(), phase = ?phase, "duplicate phase message ignored");
            return Ok(());
        }

        tracing::debug!(engine = %self.name(), phase = ?phase, sender = %message.envelope.sender, "handling");
        let KexMessage { envelope, body } = message;
        let result = match body {
            KexBody::StartKex => self.on_start_kex(envelope).await,
            KexBody::Hello { device_id, device_kid } => self.on_hello(&envelope, device_id, device_kid),
            KexBody::PleaseSign(request) => self.on_please_sign(envelope, request).await,
            KexBody::Done => self.on_done().await,
            KexBody::StartReverseKex => Ok(()),
        };

        if let Err(err) = &result {
            if !err.is_rejection() {
                self.fail(phase, err.clone());
            }
        }
        result
    }

    /// Provisionee: answer StartKex with Hello.
    async fn on_start_kex(&self, mut envelope: Envelope) -> Result<(), KexError> {
        self.device_key.public().as_ed25519()?;
        let peer = envelope.sender;
        self.with_inner(|inner| inner.peer_device = Some(peer));

        envelope.swap();
        self.deps.transport.hello(&envelope, self.config.device_id, self.device_key.kid()).await?;

        self.advance(EngineState::AwaitHello);
        self.signals.get(Phase::StartKex).fire(Ok(()));
        self.signals.get(Phase::Hello).fire(Ok(()));
        Ok(())
    }

    /// Provisioner: record the peer's key.
    fn on_hello(
        &self,
        envelope: &Envelope,
        device_id: DeviceId,
        device_kid: KeyId,
    ) -> Result<(), KexError> {
        let bound = self.with_inner(|inner| inner.peer_device);
        if device_id != envelope.sender || bound != Some(device_id) {
            tracing::warn!(engine = %self.name(), sender = %envelope.sender, "Hello from unexpected device");
            return Err(KexError::UnexpectedMessage { kind: "Hello", direction: envelope.direction });
        }

        tracing::debug!(engine = %self.name(), peer = %device_id, kid = %device_kid, "peer announced");
        self.with_inner(|inner| {
            inner.peer_device = Some(device_id);
            inner.peer_kid = Some(device_kid);
        });
        self.advance(EngineState::AwaitSign);
        self.signals.get(Phase::Hello).fire(Ok(()));
        Ok(())
    }

    /// Provisioner: delegate the peer's key, then send Done.
    async fn on_please_sign(
        &self,
        mut envelope: Envelope,
        request: PleaseSign,
    ) -> Result<(), KexError> {
        let unexpected =
            KexError::UnexpectedMessage { kind: "PleaseSign", direction: envelope.direction };
        let (peer_device, peer_kid) =
            self.with_inner(|inner| (inner.peer_device, inner.peer_kid.clone()));
        let Some(peer_kid) = peer_kid.filter(|_| peer_device == Some(envelope.sender)) else {
            tracing::warn!(engine = %self.name(), sender = %envelope.sender, "PleaseSign from unexpected device");
            return Err(unexpected);
        };

        // A key that does not match Hello rejects only this message.
        let Some(peer_key) = VerifyingKey::from_bytes(&request.public_key)
            .ok()
            .map(PublicKey::Ed25519)
            .filter(|key| key.kid() == peer_kid)
        else {
            tracing::warn!(engine = %self.name(), expected = %peer_kid, "PleaseSign key does not match Hello");
            return Err(unexpected);
        };

        let identity = self.identity().ok_or(KexError::IdentityMissing)?;
        let signing_key = self.signing_key.get_or_try_init(|| self.fetch_signing_key(&identity)).await?;

        let delegation = DelegationRequest {
            identity_name: identity.name.clone(),
            eldest_kid: identity.eldest_kid.clone(),
            peer_key,
            reverse_sig: request.reverse_sig,
            device: DeviceDescriptor::new_active(
                envelope.sender,
                request.device_type,
                request.description,
            ),
        };
        self.delegation
            .get_or_try_init(|| self.signer.sign_and_publish(signing_key, &delegation))
            .await?;

        if !self.signals.get(Phase::PleaseSign).fire(Ok(())) {
            return Ok(());
        }
        self.advance(EngineState::AwaitDone);

        envelope.swap();
        let sent = self.deps.transport.done(&envelope).await.map_err(KexError::from);
        if sent.is_ok() {
            self.advance(EngineState::Complete);
        }
        self.settle(Phase::Done, sent)?;
        tracing::info!(engine = %self.name(), peer = %envelope.receiver, "pairing complete");
        self.completion.cancel();
        Ok(())
    }

    /// Fetch the secret signing key; gives up if the attempt ends first.
    async fn fetch_signing_key(&self, identity: &Identity) -> Result<SecretKey, KexError> {
        tracing::debug!(engine = %self.name(), reason = %self.config.secret_key_reason, "fetching secret signing key");
        let fetch = self.deps.secret_keys.secret_signing_key(&self.config.secret_key_reason, identity);
        tokio::select! {
            biased;
            () = self.completion.cancelled() => Err(KexError::Cancelled),
            key = fetch => key.map_err(|e| KexError::SecretKeyUnavailable(e.to_string())),
        }
    }

    /// Provisionee: reload the chain so the new delegation is visible.
    async fn on_done(&self) -> Result<(), KexError> {
        if self.state() != EngineState::AwaitDone {
            return Err(KexError::UnexpectedMessage { kind: "Done", direction: self.config.role.inbound() });
        }

        let options = self.with_inner(|inner| inner.load_options.clone());
        let identity = self
            .deps
            .identities
            .load_identity(&options)
            .await
            .map_err(|e| KexError::ChainReloadFailed(e.to_string()))?;

        let kid = self.device_key.kid();
        if !identity.trusts(&kid) {
            tracing::warn!(engine = %self.name(), kid = %kid, "reloaded chain does not list this device key yet");
        }
        self.with_inner(|inner| inner.identity = Some(identity));

        self.advance(EngineState::Complete);
        self.signals.get(Phase::Done).fire(Ok(()));
        tracing::info!(engine = %self.name(), "pairing complete");
        self.completion.cancel();
        Ok(())
    }
}

impl<E: Environment> std::fmt::Debug for HandshakeEngine<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeEngine")
            .field("name", &self.config.debug_name)
            .field("role", &self.config.role)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use tether_crypto::{KeyType, PgpKey};

    use super::*;
    use crate::testing::{
        Fixture, PROVISIONEE, PROVISIONER, SESSION, ScriptedTransport, alice, device_key, fixture,
        fixture_with_device_key, hello, please_sign, sibkey, to_provisionee, to_provisioner,
    };

    async fn provisioner_after_hello() -> Fixture {
        let fx = fixture(Role::Provisioner, ScriptedTransport::default(), sibkey());
        fx.engine.load_identity(LoadIdentityOptions::current()).await.unwrap();
        fx.engine.initiate_as_provisioner(SESSION, PROVISIONEE).await.unwrap();
        fx.engine.handle(hello()).await.unwrap();
        fx
    }

    #[tokio::test]
    async fn initiate_requires_identity() {
        let fx = fixture(Role::Provisioner, ScriptedTransport::default(), sibkey());
        let err = fx.engine.initiate_as_provisioner(SESSION, PROVISIONEE).await.unwrap_err();
        assert_eq!(err, KexError::IdentityMissing);
        assert_eq!(fx.engine.state(), EngineState::Idle);
        assert!(fx.transport.sent_kinds().is_empty());
    }

    #[tokio::test]
    async fn initiate_is_role_checked() {
        let fx = fixture(Role::Provisionee, ScriptedTransport::default(), sibkey());
        fx.engine.load_identity(LoadIdentityOptions::by_name("alice")).await.unwrap();
        let err = fx.engine.initiate_as_provisioner(SESSION, PROVISIONER).await.unwrap_err();
        assert!(matches!(err, KexError::RoleMismatch { role: Role::Provisionee, .. }));
    }

    #[tokio::test]
    async fn provisioner_sends_start_kex() {
        let fx = fixture(Role::Provisioner, ScriptedTransport::default(), sibkey());
        fx.engine.load_identity(LoadIdentityOptions::current()).await.unwrap();
        fx.engine.initiate_as_provisioner(SESSION, PROVISIONEE).await.unwrap();

        assert_eq!(fx.transport.sent_kinds(), vec!["StartKex"]);
        let sent = fx.transport.sent.lock().unwrap()[0].clone();
        assert_eq!(sent.envelope.receiver, PROVISIONEE);
        assert_eq!(sent.envelope.direction, Direction::ToProvisionee);
        assert_eq!(fx.engine.state(), EngineState::AwaitStart);
        assert_eq!(fx.engine.wait_for_phase(Phase::StartKex).await, Ok(()));

        let again = fx.engine.initiate_as_provisioner(SESSION, PROVISIONEE).await;
        assert!(matches!(again, Err(KexError::InvalidState { state: EngineState::AwaitStart, .. })));
    }

    #[tokio::test]
    async fn hello_records_peer_key() {
        let fx = provisioner_after_hello().await;
        let snapshot = fx.engine.current_state();
        assert_eq!(snapshot.state, EngineState::AwaitSign);
        assert_eq!(snapshot.peer_device, Some(PROVISIONEE));
        assert_eq!(snapshot.peer_kid, Some(device_key().public_key().kid()));
        assert_eq!(snapshot.completed_phases, vec![Phase::StartKex, Phase::Hello]);
    }

    #[tokio::test]
    async fn please_sign_publishes_and_sends_done() {
        let fx = provisioner_after_hello().await;
        fx.engine.handle(please_sign()).await.unwrap();

        assert_eq!(fx.publisher.pushed.lock().unwrap().len(), 1);
        assert_eq!(fx.keys.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(fx.transport.sent_kinds(), vec!["StartKex", "Done"]);
        assert_eq!(fx.engine.state(), EngineState::Complete);
        assert_eq!(fx.engine.published_kid(), Some(device_key().public_key().kid()));
        assert!(fx.engine.completion_token().is_cancelled());

        let snapshot = fx.engine.current_state();
        assert_eq!(
            snapshot.history,
            vec![
                EngineState::Idle,
                EngineState::AwaitStart,
                EngineState::AwaitSign,
                EngineState::AwaitDone,
                EngineState::Complete,
            ]
        );
        assert!(snapshot.signing_key_fetched);
    }

    #[tokio::test]
    async fn redelivered_please_sign_does_not_republish() {
        let fx = provisioner_after_hello().await;
        fx.engine.handle(please_sign()).await.unwrap();
        fx.engine.handle(please_sign()).await.unwrap();
        fx.engine.handle(please_sign()).await.unwrap();

        assert_eq!(fx.publisher.pushed.lock().unwrap().len(), 1);
        assert_eq!(fx.keys.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(fx.transport.sent_kinds(), vec!["StartKex", "Done"]);
    }

    #[tokio::test]
    async fn wrong_session_is_rejected_without_side_effects() {
        let fx = provisioner_after_hello().await;
        let mut message = please_sign();
        message.envelope.session_id = SessionId::from_bytes([8; 32]);

        assert_eq!(fx.engine.handle(message).await, Err(KexError::SessionMismatch));
        assert_eq!(fx.engine.state(), EngineState::AwaitSign);
        assert_eq!(fx.keys.fetches.load(Ordering::SeqCst), 0);
        assert!(fx.publisher.pushed.lock().unwrap().is_empty());
        assert!(!fx.engine.completion_token().is_cancelled());
    }

    #[tokio::test]
    async fn wrong_receiver_is_rejected_without_side_effects() {
        let fx = provisioner_after_hello().await;
        let mut message = please_sign();
        message.envelope.receiver = DeviceId::from_bytes([0xCC; 16]);

        let err = fx.engine.handle(message).await.unwrap_err();
        assert!(matches!(err, KexError::WrongReceiverDevice { expected: PROVISIONER, .. }));
        assert!(fx.publisher.pushed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn please_sign_before_hello_is_rejected() {
        let fx = fixture(Role::Provisioner, ScriptedTransport::default(), sibkey());
        fx.engine.load_identity(LoadIdentityOptions::current()).await.unwrap();
        fx.engine.initiate_as_provisioner(SESSION, PROVISIONEE).await.unwrap();

        let err = fx.engine.handle(please_sign()).await.unwrap_err();
        assert!(err.is_rejection());
        assert!(fx.publisher.pushed.lock().unwrap().is_empty());
        assert_eq!(fx.engine.state(), EngineState::AwaitStart);
    }

    const FOREIGN: DeviceId = DeviceId::from_bytes([0xCC; 16]);

    #[tokio::test]
    async fn hello_from_unbound_device_is_rejected() {
        let fx = fixture(Role::Provisioner, ScriptedTransport::default(), sibkey());
        fx.engine.load_identity(LoadIdentityOptions::current()).await.unwrap();
        fx.engine.initiate_as_provisioner(SESSION, PROVISIONEE).await.unwrap();

        let mut foreign = hello();
        foreign.envelope.sender = FOREIGN;
        foreign.body = KexBody::Hello { device_id: FOREIGN, device_kid: sibkey().public_key().kid() };
        let err = fx.engine.handle(foreign).await.unwrap_err();
        assert!(matches!(err, KexError::UnexpectedMessage { kind: "Hello", .. }));

        // Right sender, but claiming another device id.
        let mut spoofed = hello();
        spoofed.body = KexBody::Hello { device_id: FOREIGN, device_kid: sibkey().public_key().kid() };
        assert!(fx.engine.handle(spoofed).await.unwrap_err().is_rejection());

        let snapshot = fx.engine.current_state();
        assert_eq!(snapshot.state, EngineState::AwaitStart);
        assert_eq!(snapshot.peer_device, Some(PROVISIONEE));
        assert_eq!(snapshot.peer_kid, None);
        assert!(!fx.engine.completion_token().is_cancelled());

        fx.engine.handle(hello()).await.unwrap();
        fx.engine.handle(please_sign()).await.unwrap();
        assert_eq!(fx.engine.state(), EngineState::Complete);
        assert_eq!(fx.publisher.pushed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stray_please_sign_does_not_abort_pairing() {
        let fx = provisioner_after_hello().await;

        let mut foreign = please_sign();
        foreign.envelope.sender = FOREIGN;
        assert!(fx.engine.handle(foreign).await.unwrap_err().is_rejection());

        let mut wrong_key = please_sign();
        if let KexBody::PleaseSign(request) = &mut wrong_key.body {
            request.public_key = sibkey().public_key().as_ed25519().unwrap().to_bytes();
        }
        assert!(fx.engine.handle(wrong_key).await.unwrap_err().is_rejection());

        let mut garbage_key = please_sign();
        if let KexBody::PleaseSign(request) = &mut garbage_key.body {
            request.public_key = [0xFF; 32];
        }
        assert!(fx.engine.handle(garbage_key).await.unwrap_err().is_rejection());

        assert!(!fx.engine.completion_token().is_cancelled());
        assert_eq!(fx.keys.fetches.load(Ordering::SeqCst), 0);
        assert_eq!(fx.engine.state(), EngineState::AwaitSign);

        fx.engine.handle(please_sign()).await.unwrap();
        assert_eq!(fx.engine.state(), EngineState::Complete);
        assert_eq!(fx.publisher.pushed.lock().unwrap().len(), 1);
        assert_eq!(fx.engine.wait_for_phase(Phase::PleaseSign).await, Ok(()));
    }

    #[tokio::test]
    async fn non_ed25519_device_key_fails_start_kex_before_hello() {
        let pgp = KeyPair::public_only(PublicKey::Pgp(PgpKey { fingerprint: [6; 20] }));
        let fx = fixture_with_device_key(Role::Provisionee, ScriptedTransport::default(), sibkey(), pgp);
        fx.engine.load_identity(LoadIdentityOptions::by_name("alice")).await.unwrap();
        fx.engine.initiate_as_provisionee(SESSION).await.unwrap();

        let expected = KexError::KeyTypeMismatch { expected: KeyType::Ed25519, found: KeyType::Pgp };
        assert_eq!(fx.engine.handle(to_provisionee(KexBody::StartKex)).await, Err(expected.clone()));
        assert!(fx.transport.sent_kinds().is_empty());
        assert_eq!(fx.engine.wait_for_phase(Phase::StartKex).await, Err(expected));
        assert_eq!(fx.engine.state(), EngineState::AwaitStart);
    }

    #[tokio::test]
    async fn message_for_other_role_is_unexpected() {
        let fx = provisioner_after_hello().await;
        let err = fx.engine.handle(to_provisionee(KexBody::Done)).await.unwrap_err();
        assert!(matches!(err, KexError::UnexpectedMessage { kind: "Done", .. }));
    }

    #[tokio::test]
    async fn start_reverse_kex_is_a_no_op() {
        let fx = provisioner_after_hello().await;
        let before = fx.engine.current_state();
        fx.engine.handle(to_provisioner(KexBody::StartReverseKex)).await.unwrap();
        assert_eq!(fx.engine.current_state(), before);
    }

    #[tokio::test]
    async fn pgp_signing_key_fails_phase_without_publish() {
        let pgp = SecretKey::Pgp(PgpKey { fingerprint: [4; 20] });
        let fx = fixture(Role::Provisioner, ScriptedTransport::default(), pgp);
        fx.engine.load_identity(LoadIdentityOptions::current()).await.unwrap();
        fx.engine.initiate_as_provisioner(SESSION, PROVISIONEE).await.unwrap();
        fx.engine.handle(hello()).await.unwrap();

        let expected = KexError::KeyTypeMismatch { expected: KeyType::Ed25519, found: KeyType::Pgp };
        assert_eq!(fx.engine.handle(please_sign()).await, Err(expected.clone()));
        assert!(fx.publisher.pushed.lock().unwrap().is_empty());
        assert_eq!(fx.engine.wait_for_phase(Phase::PleaseSign).await, Err(expected.clone()));
        assert_eq!(fx.engine.wait_for_phase(Phase::Done).await, Err(expected));
        assert_eq!(fx.engine.state(), EngineState::AwaitSign);
    }

    #[tokio::test]
    async fn provisionee_answers_start_kex_with_hello() {
        let fx = fixture(Role::Provisionee, ScriptedTransport::default(), sibkey());
        fx.engine.load_identity(LoadIdentityOptions::by_name("alice")).await.unwrap();
        fx.engine.initiate_as_provisionee(SESSION).await.unwrap();
        fx.engine.handle(to_provisionee(KexBody::StartKex)).await.unwrap();

        assert_eq!(fx.engine.state(), EngineState::AwaitHello);
        let sent = fx.transport.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].envelope.receiver, PROVISIONER);
        assert_eq!(sent[0].envelope.sender, PROVISIONEE);
        assert_eq!(sent[0].envelope.direction, Direction::ToProvisioner);
        assert_eq!(
            sent[0].body,
            KexBody::Hello { device_id: PROVISIONEE, device_kid: device_key().public_key().kid() }
        );
    }

    #[tokio::test]
    async fn provisionee_please_sign_carries_valid_reverse_sig() {
        let fx = fixture(Role::Provisionee, ScriptedTransport::default(), sibkey());
        fx.engine.load_identity(LoadIdentityOptions::by_name("alice")).await.unwrap();
        fx.engine.initiate_as_provisionee(SESSION).await.unwrap();

        let early = fx.engine.send_please_sign(DeviceType::Mobile, "phone").await;
        assert!(matches!(early, Err(KexError::InvalidState { .. })));

        fx.engine.handle(to_provisionee(KexBody::StartKex)).await.unwrap();
        fx.engine.send_please_sign(DeviceType::Mobile, "phone").await.unwrap();
        assert_eq!(fx.engine.state(), EngineState::AwaitDone);

        let sent = fx.transport.sent.lock().unwrap().clone();
        let KexBody::PleaseSign(request) = &sent[1].body else {
            panic!("expected PleaseSign, got {:?}", sent[1].body);
        };
        let payload = ReversePayload {
            identity: "alice".to_string(),
            eldest_kid: alice().eldest_kid,
            delegated_kid: device_key().public_key().kid(),
            device: DeviceDescriptor::new_active(PROVISIONEE, DeviceType::Mobile, "phone")
                .to_record(),
        };
        payload.verify(&request.reverse_sig).unwrap();
    }

    #[tokio::test]
    async fn provisionee_done_reloads_chain() {
        let fx = fixture(Role::Provisionee, ScriptedTransport::default(), sibkey());
        fx.engine.load_identity(LoadIdentityOptions::by_name("alice")).await.unwrap();
        fx.engine.initiate_as_provisionee(SESSION).await.unwrap();
        fx.engine.handle(to_provisionee(KexBody::StartKex)).await.unwrap();
        fx.engine.send_please_sign(DeviceType::Desktop, "laptop").await.unwrap();

        fx.identities.identity.lock().unwrap().sibkeys.push(device_key().public_key().kid());
        fx.engine.handle(to_provisionee(KexBody::Done)).await.unwrap();

        assert_eq!(fx.engine.state(), EngineState::Complete);
        assert_eq!(fx.identities.loads.load(Ordering::SeqCst), 2);
        assert!(fx.engine.identity().unwrap().trusts(&device_key().public_key().kid()));
        assert_eq!(fx.engine.wait_for_phase(Phase::Done).await, Ok(()));
    }

    #[tokio::test]
    async fn done_before_please_sign_is_rejected() {
        let fx = fixture(Role::Provisionee, ScriptedTransport::default(), sibkey());
        fx.engine.load_identity(LoadIdentityOptions::by_name("alice")).await.unwrap();
        fx.engine.initiate_as_provisionee(SESSION).await.unwrap();

        let err = fx.engine.handle(to_provisionee(KexBody::Done)).await.unwrap_err();
        assert!(err.is_rejection());
        assert_eq!(fx.engine.state(), EngineState::AwaitStart);
    }

    #[tokio::test]
    async fn failed_chain_reload_fails_done() {
        let fx = fixture(Role::Provisionee, ScriptedTransport::default(), sibkey());
        fx.engine.load_identity(LoadIdentityOptions::by_name("alice")).await.unwrap();
        fx.identities.fail_reloads.store(true, Ordering::SeqCst);
        fx.engine.initiate_as_provisionee(SESSION).await.unwrap();
        fx.engine.handle(to_provisionee(KexBody::StartKex)).await.unwrap();
        fx.engine.send_please_sign(DeviceType::Mobile, "phone").await.unwrap();

        let err = fx.engine.handle(to_provisionee(KexBody::Done)).await.unwrap_err();
        assert!(matches!(err, KexError::ChainReloadFailed(_)));
        assert!(matches!(fx.engine.wait_for_phase(Phase::Done).await, Err(KexError::ChainReloadFailed(_))));
    }

    #[tokio::test]
    async fn failed_send_fails_phase() {
        let transport = ScriptedTransport { fail_sends: true, ..ScriptedTransport::default() };
        let fx = fixture(Role::Provisioner, transport, sibkey());
        fx.engine.load_identity(LoadIdentityOptions::current()).await.unwrap();

        let err = fx.engine.initiate_as_provisioner(SESSION, PROVISIONEE).await.unwrap_err();
        assert!(matches!(err, KexError::Transport(_)));
        assert!(matches!(fx.engine.wait_for_phase(Phase::Hello).await, Err(KexError::Transport(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_phase_within_times_out() {
        let fx = provisioner_after_hello().await;
        let limit = Duration::from_secs(3);
        assert_eq!(
            fx.engine.wait_for_phase_within(Phase::PleaseSign, limit).await,
            Err(KexError::Timeout { limit })
        );
    }

    #[tokio::test]
    async fn abort_releases_waiters() {
        let fx = provisioner_after_hello().await;
        fx.engine.abort();
        assert_eq!(fx.engine.wait_for_phase(Phase::Done).await, Err(KexError::Cancelled));
        assert_eq!(fx.engine.wait_for_phase(Phase::Hello).await, Ok(()));
    }

    #[tokio::test]
    async fn session_derivation_needs_identity() {
        let fx = fixture(Role::Provisioner, ScriptedTransport::default(), sibkey());
        let phrase = SecretPhrase::parse("alpha bravo charlie delta echo").unwrap();
        assert_eq!(fx.engine.derive_session_id(phrase.clone()).await, Err(KexError::IdentityMissing));

        fx.engine.load_identity(LoadIdentityOptions::current()).await.unwrap();
        let (generated, id) = fx.engine.generate_secret().await.unwrap();
        assert_eq!(fx.engine.derive_session_id(generated).await.unwrap(), id);
        assert_ne!(fx.engine.derive_session_id(phrase).await.unwrap(), id);
    }
}
