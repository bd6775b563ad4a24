//! Identities, devices and their descriptors.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use tether_crypto::{DeviceRecord, KeyId};

use crate::env::Environment;

/// Size of a device identifier in bytes.
pub const DEVICE_ID_SIZE: usize = 16;

/// Identifier of one device under an identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId([u8; DEVICE_ID_SIZE]);

impl DeviceId {
    /// Wrap raw bytes.
    pub const fn from_bytes(bytes: [u8; DEVICE_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Fresh random device id.
    pub fn random<E: Environment>(env: &E) -> Self {
        let mut bytes = [0u8; DEVICE_ID_SIZE];
        env.random_bytes(&mut bytes);
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; DEVICE_ID_SIZE] {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({self})")
    }
}

impl FromStr for DeviceId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; DEVICE_ID_SIZE];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

/// Kind of device being provisioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// Desktop or laptop
    Desktop,
    /// Phone or tablet
    Mobile,
}

impl DeviceType {
    /// Label used in delegation statements.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Desktop => "desktop",
            Self::Mobile => "mobile",
        }
    }
}

/// Lifecycle status of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceStatus {
    /// In use
    Active,
    /// Revoked; its keys are no longer trusted
    Revoked,
}

impl DeviceStatus {
    /// Label used in delegation statements.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Revoked => "revoked",
        }
    }
}

/// A device as recorded in a delegation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Device id
    pub id: DeviceId,
    /// Device type
    pub kind: DeviceType,
    /// Human description, e.g. `work laptop`
    pub description: String,
    /// Status
    pub status: DeviceStatus,
}

impl DeviceDescriptor {
    /// Descriptor of a device being added, which is always active.
    pub fn new_active(id: DeviceId, kind: DeviceType, description: impl Into<String>) -> Self {
        Self { id, kind, description: description.into(), status: DeviceStatus::Active }
    }

    /// Form embedded in signed statements.
    pub fn to_record(&self) -> DeviceRecord {
        DeviceRecord {
            id: self.id.to_string(),
            kind: self.kind.as_str().to_string(),
            description: self.description.clone(),
            status: self.status.as_str().to_string(),
        }
    }
}

/// An identity and the public state of its signature chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Identity name; salts session derivation
    pub name: String,
    /// Original key the chain is rooted at
    pub eldest_kid: KeyId,
    /// Keys delegated as sibkeys, in chain order
    pub sibkeys: Vec<KeyId>,
    /// Number of links in the signature chain
    pub chain_len: u64,
}

impl Identity {
    /// Whether `kid` is the eldest key or a delegated sibkey.
    pub fn trusts(&self, kid: &KeyId) -> bool {
        &self.eldest_kid == kid || self.sibkeys.contains(kid)
    }
}

/// How to load an identity from the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadIdentityOptions {
    /// Identity to load; `None` loads the identity logged in on this device
    pub name: Option<String>,
    /// Load even if this device holds no keys for it (new devices)
    pub public_key_optional: bool,
}

impl LoadIdentityOptions {
    /// Load the identity logged in on this device.
    pub fn current() -> Self {
        Self::default()
    }

    /// Load `name` from a device that holds no keys for it yet.
    pub fn by_name(name: impl Into<String>) -> Self {
        Self { name: Some(name.into()), public_key_optional: true }
    }
}
