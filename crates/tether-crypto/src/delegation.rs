//! Cross-signed key delegation statements.
//!
//! A delegation grants a new device key sibkey status under an identity.
//! Two signatures are involved:
//!
//! 1. The delegated (new) key signs a [`ReversePayload`], consenting to be
//!    bound to the identity and device described in it.
//! 2. The existing sibkey signs the full [`DelegationStatement`], which
//!    embeds that reverse signature.
//!
//! Both signatures cover canonical CBOR prefixed with a domain-separation
//! context, so neither can be replayed as the other.

use ed25519_dalek::{Signature, Signer};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    error::CryptoError,
    keys::{KeyId, SecretKey},
};

/// Domain separation for reverse signatures.
const REVERSE_SIG_CONTEXT: &[u8] = b"tether-reverse-sig-v1";

/// Domain separation for delegation signatures.
const DELEGATION_CONTEXT: &[u8] = b"tether-delegation-v1";

/// Device being granted the delegated key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Device id (hex)
    pub id: String,
    /// Device type label, e.g. `desktop`
    pub kind: String,
    /// Human description, e.g. `work laptop`
    pub description: String,
    /// Status label, e.g. `active`
    pub status: String,
}

/// What the delegated key consents to.
///
/// The provisionee builds this before it knows the statement timestamps, so
/// it covers only the binding itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReversePayload {
    /// Identity name
    pub identity: String,
    /// Identity's eldest key
    pub eldest_kid: KeyId,
    /// Key being delegated
    pub delegated_kid: KeyId,
    /// Device the key belongs to
    pub device: DeviceRecord,
}

impl ReversePayload {
    fn signing_input(&self) -> Result<Vec<u8>, CryptoError> {
        let mut input = REVERSE_SIG_CONTEXT.to_vec();
        input.extend_from_slice(&encode(self)?);
        Ok(input)
    }

    /// Sign with the delegated key.
    ///
    /// The key must be the one named by `delegated_kid`.
    pub fn sign(&self, delegated: &SecretKey) -> Result<ReverseSig, CryptoError> {
        let key = delegated.as_ed25519()?;
        let kid = KeyId::from_ed25519(&key.verifying_key());
        if kid != self.delegated_kid {
            return Err(CryptoError::SignerMismatch {
                expected: self.delegated_kid.to_string(),
                actual: kid.to_string(),
            });
        }

        let signature = key.sign(&self.signing_input()?);
        Ok(ReverseSig(signature.to_bytes().to_vec()))
    }

    /// Verify `sig` against the delegated key.
    pub fn verify(&self, sig: &ReverseSig) -> Result<(), CryptoError> {
        let key = self.delegated_kid.to_ed25519()?;
        let signature =
            Signature::from_slice(&sig.0).map_err(|_| CryptoError::InvalidSignature)?;
        key.verify_strict(&self.signing_input()?, &signature)
            .map_err(|_| CryptoError::InvalidSignature)
    }
}

/// Signature by the delegated key over a [`ReversePayload`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReverseSig(Vec<u8>);

impl ReverseSig {
    /// Wrap signature bytes received from a peer.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Raw signature bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Statement granting `delegated_kid` sibkey status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationStatement {
    /// Identity name
    pub identity: String,
    /// Identity's eldest key, links the statement into the chain
    pub eldest_kid: KeyId,
    /// Existing sibkey that signs the statement
    pub signing_kid: KeyId,
    /// Key being delegated
    pub delegated_kid: KeyId,
    /// Device the delegated key belongs to
    pub device: DeviceRecord,
    /// Delegated as a sibkey (full signing authority)
    pub sibkey: bool,
    /// Creation time, seconds since the Unix epoch
    pub ctime: u64,
    /// Validity period in seconds
    pub expire_in: u64,
    /// Consent signature by the delegated key
    pub reverse_sig: Option<ReverseSig>,
}

impl DelegationStatement {
    /// Binding the reverse signature must cover.
    pub fn reverse_payload(&self) -> ReversePayload {
        ReversePayload {
            identity: self.identity.clone(),
            eldest_kid: self.eldest_kid.clone(),
            delegated_kid: self.delegated_kid.clone(),
            device: self.device.clone(),
        }
    }

    /// Check the embedded reverse signature.
    pub fn verify_reverse_sig(&self) -> Result<(), CryptoError> {
        let sig = self.reverse_sig.as_ref().ok_or(CryptoError::MissingReverseSignature)?;
        self.reverse_payload().verify(sig)
    }

    /// Expiration time, seconds since the Unix epoch.
    pub fn expires_at(&self) -> u64 {
        self.ctime.saturating_add(self.expire_in)
    }

    /// Sign with the existing sibkey.
    ///
    /// # Errors
    ///
    /// - `KeyTypeMismatch` if `signer` is not Ed25519 (checked first)
    /// - `SignerMismatch` if `signer` is not `signing_kid`
    /// - `MissingReverseSignature` / `InvalidSignature` if the delegated key
    ///   has not validly consented
    pub fn sign(&self, signer: &SecretKey) -> Result<SignedDelegation, CryptoError> {
        let key = signer.as_ed25519()?;
        let kid = KeyId::from_ed25519(&key.verifying_key());
        if kid != self.signing_kid {
            return Err(CryptoError::SignerMismatch {
                expected: self.signing_kid.to_string(),
                actual: kid.to_string(),
            });
        }
        self.verify_reverse_sig()?;

        let body = encode(self)?;
        let mut input = DELEGATION_CONTEXT.to_vec();
        input.extend_from_slice(&body);
        let signature = key.sign(&input);

        Ok(SignedDelegation { body, signature: signature.to_bytes().to_vec(), signer: kid })
    }
}

/// A delegation statement with the signer's signature, ready to publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedDelegation {
    body: Vec<u8>,
    signature: Vec<u8>,
    signer: KeyId,
}

impl SignedDelegation {
    /// Reassemble from parts received over the wire.
    pub fn from_parts(body: Vec<u8>, signature: Vec<u8>, signer: KeyId) -> Self {
        Self { body, signature, signer }
    }

    /// Canonical statement encoding.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Signature bytes.
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// Key that signed the statement.
    pub fn signer(&self) -> &KeyId {
        &self.signer
    }

    /// Decode the statement without verifying it.
    pub fn statement(&self) -> Result<DelegationStatement, CryptoError> {
        ciborium::from_reader(self.body.as_slice())
            .map_err(|e| CryptoError::Decoding(e.to_string()))
    }

    /// Verify both signatures and return the statement.
    pub fn verify(&self) -> Result<DelegationStatement, CryptoError> {
        let key = self.signer.to_ed25519()?;
        let signature =
            Signature::from_slice(&self.signature).map_err(|_| CryptoError::InvalidSignature)?;

        let mut input = DELEGATION_CONTEXT.to_vec();
        input.extend_from_slice(&self.body);
        key.verify_strict(&input, &signature).map_err(|_| CryptoError::InvalidSignature)?;

        let statement = self.statement()?;
        if statement.signing_kid != self.signer {
            return Err(CryptoError::SignerMismatch {
                expected: statement.signing_kid.to_string(),
                actual: self.signer.to_string(),
            });
        }
        statement.verify_reverse_sig()?;
        Ok(statement)
    }

    /// SHA-256 over body and signature; stable identifier for the
    /// published statement.
    pub fn sig_id(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(&self.body);
        hasher.update(&self.signature);
        hasher.finalize().into()
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CryptoError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| CryptoError::Encoding(e.to_string()))?;
    Ok(buf)
}
