//! Two-device pairing scenarios.
//!
//! [`PairingScenario`] describes an attempt: who pairs, which phrase each
//! side types, and which collaborators misbehave. [`PairingScenario::build`]
//! wires two engines to a shared [`MemoryRelay`] and [`KeyServer`];
//! [`PairingWorld::run`] drives both sides concurrently the way two real
//! devices would.
//!
//! ```text
//!   provisioner engine ──┐                    ┌── provisionee engine
//!     MemorySecretKeyStore│    MemoryRelay     │MemoryIdentityStore
//!     RecordingPublisher ─┼──► KeyServer ◄─────┤
//!     MemoryIdentityStore ┘                    └──
//! ```

use std::{sync::Arc, time::Duration};

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tether_core::{
    DeviceId, DeviceType, DictionaryWords, EngineConfig, EngineDeps, HandshakeEngine, Identity,
    KexError, LoadIdentityOptions, PublishError, Role, StoreError, env::test_utils::MockEnv,
    run_provisionee, run_provisioner,
};
use tether_crypto::{KdfParams, KeyId, KeyPair, SecretKey, SecretPhrase, SessionId};

use crate::{
    invariants::PairingSnapshot,
    relay::MemoryRelay,
    stores::{KeyServer, MemoryIdentityStore, MemorySecretKeyStore, RecordingPublisher},
};

/// Phrase used when a scenario does not set one.
pub const DEFAULT_PHRASE: [&str; 5] = ["alpha", "bravo", "charlie", "delta", "echo"];

/// Per-side budget used when a scenario does not set one.
pub const DEFAULT_SCENARIO_TIMEOUT: Duration = Duration::from_secs(30);

/// Description of one pairing attempt.
#[derive(Debug, Clone)]
pub struct PairingScenario {
    identity: String,
    provisioner_phrase: Vec<String>,
    provisionee_phrase: Vec<String>,
    kdf: KdfParams,
    seed: u64,
    timeout: Duration,
    device_kind: DeviceType,
    description: String,
    signing_key: Option<SecretKey>,
    publish_failure: Option<PublishError>,
    secret_failure: Option<StoreError>,
}

fn words(phrase: &[&str]) -> Vec<String> {
    phrase.iter().map(|word| (*word).to_string()).collect()
}

impl PairingScenario {
    /// Both devices pair `identity` with [`DEFAULT_PHRASE`].
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            provisioner_phrase: words(&DEFAULT_PHRASE),
            provisionee_phrase: words(&DEFAULT_PHRASE),
            kdf: KdfParams::default(),
            seed: 0,
            timeout: DEFAULT_SCENARIO_TIMEOUT,
            device_kind: DeviceType::Mobile,
            description: "phone".to_string(),
            signing_key: None,
            publish_failure: None,
            secret_failure: None,
        }
    }

    /// Phrase both sides type.
    #[must_use]
    pub fn phrase(mut self, phrase: &[&str]) -> Self {
        self.provisioner_phrase = words(phrase);
        self.provisionee_phrase = words(phrase);
        self
    }

    /// Phrase the provisionee types, e.g. with a misheard word.
    #[must_use]
    pub fn provisionee_phrase(mut self, phrase: &[&str]) -> Self {
        self.provisionee_phrase = words(phrase);
        self
    }

    /// Session derivation work factor.
    #[must_use]
    pub fn kdf(mut self, kdf: KdfParams) -> Self {
        self.kdf = kdf;
        self
    }

    /// Seed for keys, device ids and word choice.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Per-side budget.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// New device's type and description.
    #[must_use]
    pub fn device(mut self, kind: DeviceType, description: impl Into<String>) -> Self {
        self.device_kind = kind;
        self.description = description.into();
        self
    }

    /// Key the provisioner's key store hands out instead of its sibkey.
    #[must_use]
    pub fn signing_key(mut self, key: SecretKey) -> Self {
        self.signing_key = Some(key);
        self
    }

    /// Make the publishing service refuse pushes.
    #[must_use]
    pub fn publish_failure(mut self, error: PublishError) -> Self {
        self.publish_failure = Some(error);
        self
    }

    /// Make the provisioner's key store fail.
    #[must_use]
    pub fn secret_failure(mut self, error: StoreError) -> Self {
        self.secret_failure = Some(error);
        self
    }

    /// Wire both devices.
    pub fn build(self) -> PairingWorld {
        let env = MockEnv::seeded(self.seed);
        let mut rng = ChaCha20Rng::seed_from_u64(self.seed);
        let mut next_key = || {
            let mut bytes = [0u8; 32];
            rng.fill_bytes(&mut bytes);
            SecretKey::Ed25519(ed25519_dalek::SigningKey::from_bytes(&bytes))
        };
        let sibkey = next_key();
        let device_key = next_key();
        let provisioner_id = DeviceId::random(&env);
        let provisionee_id = DeviceId::random(&env);

        let server = KeyServer::new();
        let eldest = sibkey.public_key().kid();
        server.register(Identity {
            name: self.identity.clone(),
            eldest_kid: eldest.clone(),
            sibkeys: vec![eldest],
            chain_len: 1,
        });

        let relay = MemoryRelay::new();
        let words = Arc::new(DictionaryWords::new(env.clone()));

        let provisioner_keys =
            Arc::new(MemorySecretKeyStore::new(self.signing_key.clone().unwrap_or_else(|| sibkey.clone())));
        if let Some(error) = self.secret_failure.clone() {
            provisioner_keys.fail_with(error);
        }
        let publisher = Arc::new(RecordingPublisher::new(server.clone()));
        if let Some(error) = self.publish_failure.clone() {
            publisher.fail_with(error);
        }

        let mut provisioner_config = EngineConfig::new(Role::Provisioner, provisioner_id);
        provisioner_config.kdf = self.kdf;
        let provisioner = Arc::new(HandshakeEngine::new(
            provisioner_config,
            EngineDeps {
                transport: Arc::new(relay.endpoint(provisioner_id)),
                identities: Arc::new(MemoryIdentityStore::new(
                    server.clone(),
                    Some(self.identity.clone()),
                )),
                secret_keys: provisioner_keys.clone(),
                publisher: publisher.clone(),
                words: words.clone(),
            },
            KeyPair::public_only(sibkey.public_key()),
            env.clone(),
        ));

        let provisionee_identities = Arc::new(MemoryIdentityStore::new(server.clone(), None));
        let mut provisionee_config = EngineConfig::new(Role::Provisionee, provisionee_id);
        provisionee_config.kdf = self.kdf;
        let provisionee = Arc::new(HandshakeEngine::new(
            provisionee_config,
            EngineDeps {
                transport: Arc::new(relay.endpoint(provisionee_id)),
                identities: provisionee_identities.clone(),
                secret_keys: Arc::new(MemorySecretKeyStore::new(device_key.clone())),
                publisher: Arc::new(RecordingPublisher::new(server.clone())),
                words,
            },
            KeyPair::from_secret(device_key),
            env,
        ));

        PairingWorld {
            scenario: self,
            provisioner,
            provisionee,
            provisioner_id,
            provisionee_id,
            relay,
            server,
            provisioner_keys,
            publisher,
            provisionee_identities,
        }
    }

    /// Build and run to completion.
    pub async fn run(self) -> PairingOutcome {
        self.build().run().await
    }
}

/// Two wired engines and the collaborators behind them.
pub struct PairingWorld {
    scenario: PairingScenario,
    /// Existing device
    pub provisioner: Arc<HandshakeEngine<MockEnv>>,
    /// New device
    pub provisionee: Arc<HandshakeEngine<MockEnv>>,
    /// Existing device's id
    pub provisioner_id: DeviceId,
    /// New device's id
    pub provisionee_id: DeviceId,
    /// Shared relay
    pub relay: Arc<MemoryRelay>,
    /// Shared chain state
    pub server: KeyServer,
    /// Provisioner's secret-key store
    pub provisioner_keys: Arc<MemorySecretKeyStore>,
    /// Publishing service the provisioner pushes to
    pub publisher: Arc<RecordingPublisher>,
    /// Provisionee's identity store
    pub provisionee_identities: Arc<MemoryIdentityStore>,
}

impl PairingWorld {
    /// Bind identities on both sides and derive each side's session id
    /// from its phrase. Returns `(provisioner, provisionee)` sessions.
    pub async fn prepare(&self) -> Result<(SessionId, SessionId), KexError> {
        self.provisioner.load_identity(LoadIdentityOptions::current()).await?;
        self.provisionee
            .load_identity(LoadIdentityOptions::by_name(self.scenario.identity.clone()))
            .await?;

        let x_phrase = SecretPhrase::new(self.scenario.provisioner_phrase.clone())?;
        let y_phrase = SecretPhrase::new(self.scenario.provisionee_phrase.clone())?;
        let x_session = self.provisioner.derive_session_id(x_phrase).await?;
        let y_session = self.provisionee.derive_session_id(y_phrase).await?;
        Ok((x_session, y_session))
    }

    /// Prepare, then run both sides concurrently.
    pub async fn run(self) -> PairingOutcome {
        let sessions = match self.prepare().await {
            Ok(sessions) => sessions,
            Err(err) => {
                return PairingOutcome {
                    provisioner: Err(err.clone()),
                    provisionee: Err(err),
                    sessions: None,
                    world: self,
                };
            },
        };
        let (x_session, y_session) = sessions;

        tracing::info!(identity = %self.scenario.identity, "running pairing scenario");
        let (provisioner, provisionee) = tokio::join!(
            run_provisioner(
                Arc::clone(&self.provisioner),
                x_session,
                self.provisionee_id,
                self.scenario.timeout,
            ),
            run_provisionee(
                Arc::clone(&self.provisionee),
                y_session,
                self.scenario.device_kind,
                self.scenario.description.clone(),
                self.scenario.timeout,
            ),
        );

        PairingOutcome { provisioner, provisionee, sessions: Some(sessions), world: self }
    }

    /// End-of-run state for invariant checks.
    pub fn snapshot(&self) -> PairingSnapshot {
        PairingSnapshot {
            provisioner: self.provisioner.current_state(),
            provisionee: self.provisionee.current_state(),
            publish_calls: self.publisher.pushed().len(),
            secret_fetches: self.provisioner_keys.fetches(),
        }
    }
}

/// Result of running a scenario.
pub struct PairingOutcome {
    /// Provisioner result: key id granted to the new device
    pub provisioner: Result<KeyId, KexError>,
    /// Provisionee result: reloaded identity
    pub provisionee: Result<Identity, KexError>,
    /// `(provisioner, provisionee)` session ids, if derivation succeeded
    pub sessions: Option<(SessionId, SessionId)>,
    /// The world the run happened in
    pub world: PairingWorld,
}

impl PairingOutcome {
    /// Whether both sides succeeded.
    pub fn succeeded(&self) -> bool {
        self.provisioner.is_ok() && self.provisionee.is_ok()
    }

    /// End-of-run state for invariant checks.
    pub fn snapshot(&self) -> PairingSnapshot {
        self.world.snapshot()
    }
}
