//! Deterministic test harness for Tether pairing.
//!
//! In-memory implementations of every collaborator the engine consumes, a
//! relay with fault injection, and a scenario builder that runs both sides
//! of a pairing in one process.
//!
//! # Invariant Testing
//!
//! The `invariants` module checks properties that must hold after any run,
//! however the relay behaved. Use [`InvariantRegistry::standard()`] for the
//! full set.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod invariants;
pub mod relay;
pub mod scenario;
pub mod stores;

pub use invariants::{
    CompletionImpliesPublish, Invariant, InvariantRegistry, InvariantResult, PairingSnapshot,
    SecretFetchedOnce, SinglePublish, StateMonotonic, Violation,
};
pub use relay::{MemoryRelay, RelayEndpoint};
pub use scenario::{
    DEFAULT_PHRASE, DEFAULT_SCENARIO_TIMEOUT, PairingOutcome, PairingScenario, PairingWorld,
};
pub use stores::{KeyServer, MemoryIdentityStore, MemorySecretKeyStore, RecordingPublisher};
