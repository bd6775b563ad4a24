//! Session identifiers derived from a spoken secret phrase.
//!
//! Both devices read the same five words and derive the same 32-byte
//! [`SessionId`]. The phrase itself never crosses the relay; envelopes carry
//! only the derived id, which an eavesdropper would have to brute force
//! through scrypt to link back to the words.

use std::{fmt, hash::Hash};

use subtle::{Choice, ConstantTimeEq};
use zeroize::{Zeroize, Zeroizing};

use crate::error::CryptoError;

/// Size of a derived session identifier in bytes.
pub const SESSION_ID_SIZE: usize = 32;

/// Number of words in a pairing phrase.
pub const PHRASE_WORDS: usize = 5;

/// Default scrypt cost exponent (N = 2^15 = 32768).
pub const DEFAULT_KDF_LOG_N: u8 = 15;

/// Default scrypt block size.
pub const DEFAULT_KDF_R: u32 = 8;

/// Default scrypt parallelism.
pub const DEFAULT_KDF_P: u32 = 1;

/// Work factor for session derivation.
///
/// The defaults are the pairing protocol's fixed parameters. Both devices
/// must use identical values or their session ids will never match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    /// Log2 of the CPU/memory cost `N`
    pub log_n: u8,
    /// Block size `r`
    pub r: u32,
    /// Parallelism `p`
    pub p: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self { log_n: DEFAULT_KDF_LOG_N, r: DEFAULT_KDF_R, p: DEFAULT_KDF_P }
    }
}

impl KdfParams {
    /// Cost parameter `N`.
    pub fn cost(&self) -> u64 {
        1u64 << self.log_n
    }

    fn to_scrypt(self) -> Result<scrypt::Params, CryptoError> {
        scrypt::Params::new(self.log_n, self.r, self.p, SESSION_ID_SIZE)
            .map_err(|e| CryptoError::InvalidKdfParams(e.to_string()))
    }
}

/// Identifier shared by both ends of one pairing attempt.
///
/// Equality is constant-time. Immutable once derived.
#[derive(Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct SessionId([u8; SESSION_ID_SIZE]);

impl SessionId {
    /// Wrap raw bytes (e.g. decoded from an envelope).
    pub const fn from_bytes(bytes: [u8; SESSION_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; SESSION_ID_SIZE] {
        &self.0
    }
}

impl ConstantTimeEq for SessionId {
    fn ct_eq(&self, other: &Self) -> Choice {
        self.0[..].ct_eq(&other.0[..])
    }
}

impl PartialEq for SessionId {
    fn eq(&self, other: &Self) -> bool {
        self.ct_eq(other).into()
    }
}

impl Eq for SessionId {}

impl Hash for SessionId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({}..)", hex::encode(&self.0[..4]))
    }
}

/// Ordered words read aloud between devices.
///
/// Transient: words are zeroized on drop and never persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretPhrase {
    words: Vec<String>,
}

impl SecretPhrase {
    /// Build a phrase from exactly [`PHRASE_WORDS`] words.
    pub fn new(words: Vec<String>) -> Result<Self, CryptoError> {
        if words.len() != PHRASE_WORDS {
            return Err(CryptoError::InvalidPhrase { expected: PHRASE_WORDS, got: words.len() });
        }
        Ok(Self { words })
    }

    /// Parse a phrase typed by a human, splitting on whitespace.
    pub fn parse(text: &str) -> Result<Self, CryptoError> {
        Self::new(text.split_whitespace().map(str::to_owned).collect())
    }

    /// The words in order.
    pub fn words(&self) -> &[String] {
        &self.words
    }

    /// Words joined by single spaces, the exact KDF input.
    pub fn joined(&self) -> Zeroizing<String> {
        Zeroizing::new(self.words.join(" "))
    }
}

impl Drop for SecretPhrase {
    fn drop(&mut self) {
        self.words.zeroize();
    }
}

impl fmt::Debug for SecretPhrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretPhrase(<{} words>)", self.words.len())
    }
}

/// Derive the session id for `phrase`, salted with the identity name.
///
/// # Security
///
/// - Deterministic: same phrase, salt and params always give the same id
/// - Memory-hard: each guess costs a full scrypt evaluation
/// - Salted per identity: guesses do not carry over between identities
pub fn derive_session_id(
    phrase: &SecretPhrase,
    identity_name: &str,
    params: &KdfParams,
) -> Result<SessionId, CryptoError> {
    let scrypt_params = params.to_scrypt()?;
    let input = phrase.joined();

    let mut id = [0u8; SESSION_ID_SIZE];
    scrypt::scrypt(input.as_bytes(), identity_name.as_bytes(), &scrypt_params, &mut id)
        .map_err(|e| CryptoError::KdfFailed(e.to_string()))?;

    Ok(SessionId(id))
}
