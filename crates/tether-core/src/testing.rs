//! In-crate fakes for engine and dispatcher unit tests.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use tether_crypto::{
    KdfParams, KeyId, KeyPair, ReversePayload, SecretKey, SessionId, SignedDelegation,
};

use crate::{
    engine::{EngineConfig, EngineDeps, HandshakeEngine, Role},
    env::test_utils::MockEnv,
    error::{PublishError, StoreError, TransportError},
    identity::{DeviceDescriptor, DeviceId, DeviceType, Identity, LoadIdentityOptions},
    message::{Direction, Envelope, KexBody, KexMessage, PleaseSign},
    secret::DictionaryWords,
    services::{IdentityStore, KexTransport, KeyPublisher, SecretKeyStore},
};

pub const FAST_KDF: KdfParams = KdfParams { log_n: 4, r: 8, p: 1 };
pub const PROVISIONER: DeviceId = DeviceId::from_bytes([0xA1; 16]);
pub const PROVISIONEE: DeviceId = DeviceId::from_bytes([0xB2; 16]);
pub const SESSION: SessionId = SessionId::from_bytes([7; 32]);

pub fn sibkey() -> SecretKey {
    SecretKey::Ed25519(SigningKey::from_bytes(&[1; 32]))
}

pub fn device_key() -> SecretKey {
    SecretKey::Ed25519(SigningKey::from_bytes(&[2; 32]))
}

pub fn alice() -> Identity {
    let kid = sibkey().public_key().kid();
    Identity { name: "alice".to_string(), eldest_kid: kid.clone(), sibkeys: vec![kid], chain_len: 1 }
}

/// Transport with a scripted inbox that records everything sent.
#[derive(Default)]
pub struct ScriptedTransport {
    pub sent: Mutex<Vec<KexMessage>>,
    pub inbox: Mutex<VecDeque<Result<Option<KexMessage>, TransportError>>>,
    pub fail_sends: bool,
}

impl ScriptedTransport {
    pub fn push(&self, next: Result<Option<KexMessage>, TransportError>) {
        self.inbox.lock().unwrap().push_back(next);
    }

    pub fn sent_kinds(&self) -> Vec<&'static str> {
        self.sent.lock().unwrap().iter().map(|m| m.body.kind()).collect()
    }
}

#[async_trait]
impl KexTransport for ScriptedTransport {
    async fn send(&self, message: KexMessage) -> Result<(), TransportError> {
        if self.fail_sends {
            return Err(TransportError::Send("relay down".to_string()));
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    async fn receive_next(
        &self,
        _session_id: &SessionId,
        _direction: Direction,
    ) -> Result<Option<KexMessage>, TransportError> {
        let next = self.inbox.lock().unwrap().pop_front();
        match next {
            Some(next) => next,
            None => std::future::pending().await,
        }
    }
}

/// Identity store returning a shared identity; reloads can be made to fail.
pub struct FixedIdentities {
    pub identity: Mutex<Identity>,
    pub loads: AtomicUsize,
    pub fail_reloads: AtomicBool,
}

impl FixedIdentities {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity: Mutex::new(identity),
            loads: AtomicUsize::new(0),
            fail_reloads: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl IdentityStore for FixedIdentities {
    async fn load_identity(&self, _options: &LoadIdentityOptions) -> Result<Identity, StoreError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reloads.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("chain server offline".to_string()));
        }
        Ok(self.identity.lock().unwrap().clone())
    }
}

/// Key store counting fetches.
pub struct CountingKeys {
    pub key: SecretKey,
    pub fetches: AtomicUsize,
}

impl CountingKeys {
    pub fn new(key: SecretKey) -> Self {
        Self { key, fetches: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl SecretKeyStore for CountingKeys {
    async fn secret_signing_key(
        &self,
        _reason: &str,
        _identity: &Identity,
    ) -> Result<SecretKey, StoreError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.key.clone())
    }
}

/// Publisher recording pushes.
#[derive(Default)]
pub struct Recorder {
    pub pushed: Mutex<Vec<SignedDelegation>>,
}

#[async_trait]
impl KeyPublisher for Recorder {
    async fn push(&self, delegation: &SignedDelegation) -> Result<KeyId, PublishError> {
        let statement =
            delegation.verify().map_err(|e| PublishError::Rejected(e.to_string()))?;
        self.pushed.lock().unwrap().push(delegation.clone());
        Ok(statement.delegated_kid)
    }
}

pub struct Fixture {
    pub engine: Arc<HandshakeEngine<MockEnv>>,
    pub transport: Arc<ScriptedTransport>,
    pub identities: Arc<FixedIdentities>,
    pub keys: Arc<CountingKeys>,
    pub publisher: Arc<Recorder>,
}

pub fn fixture(role: Role, transport: ScriptedTransport, signing_key: SecretKey) -> Fixture {
    let device_key = match role {
        Role::Provisioner => KeyPair::public_only(sibkey().public_key()),
        Role::Provisionee => KeyPair::from_secret(device_key()),
    };
    fixture_with_device_key(role, transport, signing_key, device_key)
}

pub fn fixture_with_device_key(
    role: Role,
    transport: ScriptedTransport,
    signing_key: SecretKey,
    device_key: KeyPair,
) -> Fixture {
    let env = MockEnv::seeded(9);
    let transport = Arc::new(transport);
    let identities = Arc::new(FixedIdentities::new(alice()));
    let keys = Arc::new(CountingKeys::new(signing_key));
    let publisher = Arc::new(Recorder::default());

    let device_id = match role {
        Role::Provisioner => PROVISIONER,
        Role::Provisionee => PROVISIONEE,
    };
    let mut config = EngineConfig::new(role, device_id);
    config.kdf = FAST_KDF;

    let deps = EngineDeps {
        transport: Arc::clone(&transport) as Arc<dyn KexTransport>,
        identities: Arc::clone(&identities) as Arc<dyn IdentityStore>,
        secret_keys: Arc::clone(&keys) as Arc<dyn SecretKeyStore>,
        publisher: Arc::clone(&publisher) as Arc<dyn KeyPublisher>,
        words: Arc::new(DictionaryWords::new(env.clone())),
    };
    let engine = Arc::new(HandshakeEngine::new(config, deps, device_key, env));
    Fixture { engine, transport, identities, keys, publisher }
}

pub fn to_provisioner(body: KexBody) -> KexMessage {
    KexMessage::new(Envelope::new(PROVISIONEE, PROVISIONER, SESSION, Direction::ToProvisioner), body)
}

pub fn to_provisionee(body: KexBody) -> KexMessage {
    KexMessage::new(Envelope::new(PROVISIONER, PROVISIONEE, SESSION, Direction::ToProvisionee), body)
}

pub fn hello() -> KexMessage {
    to_provisioner(KexBody::Hello {
        device_id: PROVISIONEE,
        device_kid: device_key().public_key().kid(),
    })
}

pub fn please_sign() -> KexMessage {
    let key = device_key();
    let device = DeviceDescriptor::new_active(PROVISIONEE, DeviceType::Mobile, "phone");
    let payload = ReversePayload {
        identity: "alice".to_string(),
        eldest_kid: alice().eldest_kid,
        delegated_kid: key.public_key().kid(),
        device: device.to_record(),
    };
    let reverse_sig = payload.sign(&key).unwrap();
    let public_key = key.public_key().as_ed25519().unwrap().to_bytes();
    to_provisioner(KexBody::PleaseSign(PleaseSign {
        public_key,
        reverse_sig,
        device_type: DeviceType::Mobile,
        description: "phone".to_string(),
    }))
}
