//! Error types for cryptographic operations.

use thiserror::Error;

use crate::keys::KeyType;

/// Errors produced by session derivation, key handling and delegation
/// signing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// KDF parameters rejected by scrypt
    #[error("invalid KDF parameters: {0}")]
    InvalidKdfParams(String),

    /// Key stretching failed
    #[error("key derivation failed: {0}")]
    KdfFailed(String),

    /// Phrase does not have the expected number of words
    #[error("secret phrase must have {expected} words, got {got}")]
    InvalidPhrase {
        /// Required word count
        expected: usize,
        /// Word count supplied
        got: usize,
    },

    /// Key is of a different signature scheme than the operation requires
    #[error("key type mismatch: expected {expected:?}, found {found:?}")]
    KeyTypeMismatch {
        /// Scheme the operation needs
        expected: KeyType,
        /// Scheme of the supplied key
        found: KeyType,
    },

    /// Bytes do not form a valid public key
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Signature failed verification or is malformed
    #[error("invalid signature")]
    InvalidSignature,

    /// Statement carries no reverse signature
    #[error("delegation statement has no reverse signature")]
    MissingReverseSignature,

    /// Signing key does not match the signer named in the statement
    #[error("signer {actual} does not match statement signer {expected}")]
    SignerMismatch {
        /// Key id named in the statement
        expected: String,
        /// Key id of the supplied key
        actual: String,
    },

    /// CBOR encoding failed
    #[error("encoding failed: {0}")]
    Encoding(String),

    /// CBOR decoding failed
    #[error("decoding failed: {0}")]
    Decoding(String),
}
