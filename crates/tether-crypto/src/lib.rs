//! Tether Cryptographic Primitives
//!
//! Cryptographic building blocks for device pairing. Pure functions with
//! deterministic outputs. Callers provide keys and timestamps so every
//! operation is reproducible under test.
//!
//! # Trust Delegation
//!
//! A pairing attempt turns a spoken phrase into a session identifier, then
//! ends with the existing device cross-signing the new device's key:
//!
//! ```text
//! Secret phrase (5 words) + identity name
//!        │
//!        ▼
//! scrypt (N=32768, r=8, p=1) → SessionId (32 bytes)
//!
//! New device key ──sign──> ReverseSig over ReversePayload
//!        │
//!        ▼
//! DelegationStatement { eldest, signer, delegated, device, reverse_sig }
//!        │
//!        ▼
//! Existing sibkey ──sign──> SignedDelegation → published
//! ```
//!
//! # Security
//!
//! Phrase Entropy:
//! - Five dictionary words carry little entropy; the memory-hard KDF makes
//!   offline guessing against captured relay traffic expensive
//! - The identity name salts the KDF so precomputed tables do not transfer
//!   between identities
//!
//! Session Matching:
//! - `SessionId` equality is constant-time (`subtle`), so a forged envelope
//!   learns nothing from rejection timing
//!
//! Mutual Consent:
//! - The delegated key signs the reverse payload before the existing key
//!   signs the statement; a statement without a valid reverse signature is
//!   never produced by [`DelegationStatement::sign`]

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod delegation;
mod error;
pub mod keys;
pub mod session;

pub use delegation::{
    DelegationStatement, DeviceRecord, ReversePayload, ReverseSig, SignedDelegation,
};
pub use error::CryptoError;
pub use keys::{KeyId, KeyPair, KeyType, PgpKey, PublicKey, SecretKey};
pub use session::{
    KdfParams, PHRASE_WORDS, SESSION_ID_SIZE, SecretPhrase, SessionId, derive_session_id,
};
