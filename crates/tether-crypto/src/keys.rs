//! Signing keys as a closed set of scheme-specific variants.
//!
//! Operations that need a particular scheme take the variant they need via
//! `as_ed25519()` and reject anything else with
//! [`CryptoError::KeyTypeMismatch`] at the boundary, before the key is used.

use std::fmt;

use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;

/// Leading byte of every key id.
const KID_VERSION: u8 = 0x01;

/// Trailing byte of every key id.
const KID_SUFFIX: u8 = 0x0a;

/// Signature scheme of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    /// Ed25519 (NaCl) signing key
    Ed25519,
    /// OpenPGP key held by an external agent
    Pgp,
}

impl KeyType {
    /// Type byte embedded in a [`KeyId`].
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Ed25519 => 0x20,
            Self::Pgp => 0x11,
        }
    }

    /// Parse a key id type byte.
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x20 => Some(Self::Ed25519),
            0x11 => Some(Self::Pgp),
            _ => None,
        }
    }
}

/// Self-describing key identifier: `0x01 || type || key bytes || 0x0a`.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyId(Vec<u8>);

impl KeyId {
    /// Key id of an Ed25519 public key.
    pub fn from_ed25519(key: &VerifyingKey) -> Self {
        Self::compose(KeyType::Ed25519, key.as_bytes())
    }

    /// Key id of a PGP key, from its fingerprint.
    pub fn from_pgp(key: &PgpKey) -> Self {
        Self::compose(KeyType::Pgp, &key.fingerprint)
    }

    /// Parse and validate raw key id bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let [KID_VERSION, type_byte, body @ .., KID_SUFFIX] = bytes else {
            return Err(CryptoError::InvalidPublicKey);
        };
        let expected_len = match KeyType::from_byte(*type_byte) {
            Some(KeyType::Ed25519) => ed25519_dalek::PUBLIC_KEY_LENGTH,
            Some(KeyType::Pgp) => PgpKey::FINGERPRINT_SIZE,
            None => return Err(CryptoError::InvalidPublicKey),
        };
        if body.len() != expected_len {
            return Err(CryptoError::InvalidPublicKey);
        }
        Ok(Self(bytes.to_vec()))
    }

    fn compose(key_type: KeyType, body: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(body.len() + 3);
        bytes.push(KID_VERSION);
        bytes.push(key_type.to_byte());
        bytes.extend_from_slice(body);
        bytes.push(KID_SUFFIX);
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Scheme encoded in the id, if recognized.
    pub fn key_type(&self) -> Option<KeyType> {
        self.0.get(1).copied().and_then(KeyType::from_byte)
    }

    /// Recover the Ed25519 public key named by this id.
    pub fn to_ed25519(&self) -> Result<VerifyingKey, CryptoError> {
        match self.key_type() {
            Some(KeyType::Ed25519) => {},
            Some(found) => {
                return Err(CryptoError::KeyTypeMismatch { expected: KeyType::Ed25519, found });
            },
            None => return Err(CryptoError::InvalidPublicKey),
        }
        let body = self.0.get(2..self.0.len().saturating_sub(1)).unwrap_or_default();
        let bytes: [u8; ed25519_dalek::PUBLIC_KEY_LENGTH] =
            body.try_into().map_err(|_| CryptoError::InvalidPublicKey)?;
        VerifyingKey::from_bytes(&bytes).map_err(|_| CryptoError::InvalidPublicKey)
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({self})")
    }
}

/// Reference to an OpenPGP key held outside this process.
///
/// Tether never signs with PGP keys; the variant exists so a keyring that
/// returns one is rejected with a type mismatch rather than misused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PgpKey {
    /// V4 fingerprint
    pub fingerprint: [u8; PgpKey::FINGERPRINT_SIZE],
}

impl PgpKey {
    /// Size of a V4 fingerprint.
    pub const FINGERPRINT_SIZE: usize = 20;
}

/// Public half of a device key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKey {
    /// Ed25519 verifying key
    Ed25519(VerifyingKey),
    /// PGP key reference
    Pgp(PgpKey),
}

impl PublicKey {
    /// Signature scheme of this key.
    pub fn key_type(&self) -> KeyType {
        match self {
            Self::Ed25519(_) => KeyType::Ed25519,
            Self::Pgp(_) => KeyType::Pgp,
        }
    }

    /// Key identifier.
    pub fn kid(&self) -> KeyId {
        match self {
            Self::Ed25519(key) => KeyId::from_ed25519(key),
            Self::Pgp(key) => KeyId::from_pgp(key),
        }
    }

    /// The Ed25519 key, or `KeyTypeMismatch`.
    pub fn as_ed25519(&self) -> Result<&VerifyingKey, CryptoError> {
        match self {
            Self::Ed25519(key) => Ok(key),
            other => Err(CryptoError::KeyTypeMismatch {
                expected: KeyType::Ed25519,
                found: other.key_type(),
            }),
        }
    }
}

/// Private half of a device key.
#[derive(Clone)]
pub enum SecretKey {
    /// Ed25519 signing key (zeroized on drop)
    Ed25519(SigningKey),
    /// PGP key held by an external agent
    Pgp(PgpKey),
}

impl SecretKey {
    /// Signature scheme of this key.
    pub fn key_type(&self) -> KeyType {
        match self {
            Self::Ed25519(_) => KeyType::Ed25519,
            Self::Pgp(_) => KeyType::Pgp,
        }
    }

    /// Matching public key.
    pub fn public_key(&self) -> PublicKey {
        match self {
            Self::Ed25519(key) => PublicKey::Ed25519(key.verifying_key()),
            Self::Pgp(key) => PublicKey::Pgp(*key),
        }
    }

    /// The Ed25519 key, or `KeyTypeMismatch`.
    pub fn as_ed25519(&self) -> Result<&SigningKey, CryptoError> {
        match self {
            Self::Ed25519(key) => Ok(key),
            other => Err(CryptoError::KeyTypeMismatch {
                expected: KeyType::Ed25519,
                found: other.key_type(),
            }),
        }
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey({:?}, {})", self.key_type(), self.public_key().kid())
    }
}

/// A device key: always the public half, the secret half only when this
/// process holds it.
#[derive(Debug, Clone)]
pub struct KeyPair {
    public: PublicKey,
    secret: Option<SecretKey>,
}

impl KeyPair {
    /// Key pair whose secret half is held locally.
    pub fn from_secret(secret: SecretKey) -> Self {
        Self { public: secret.public_key(), secret: Some(secret) }
    }

    /// Public-only key pair; the secret must be fetched from a key store.
    pub fn public_only(public: PublicKey) -> Self {
        Self { public, secret: None }
    }

    /// Public half.
    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// Secret half, if held.
    pub fn secret(&self) -> Option<&SecretKey> {
        self.secret.as_ref()
    }

    /// Key identifier.
    pub fn kid(&self) -> KeyId {
        self.public.kid()
    }
}
