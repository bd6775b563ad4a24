//! Pairing protocol engine
//!
//! Adds a new device to an identity's trust chain over an untrusted relay. The
//! only shared secret is a five-word phrase a human reads from one device to
//! the other.
//!
//! # Architecture
//!
//! ```text
//!          driving caller
//!      initiate / wait_for_phase
//!                │
//!                ▼
//!  ┌──────── HandshakeEngine ─────────┐        ┌─────────────────┐
//!  │ SessionGuard   PhaseSignals      │◄───────│   Dispatcher    │◄── KexTransport
//!  │ SecretDeriver  DelegationSigner ─┼──► KeyPublisher          │   (relay)
//!  └───────────┬──────────────────────┘        └─────────────────┘
//!              ├──► IdentityStore
//!              └──► SecretKeyStore
//! ```
//!
//! Collaborators are traits ([`services`]) injected through [`EngineDeps`].
//! Time and randomness come from an [`Environment`] so tests are
//! reproducible.
//!
//! # Components
//!
//! - [`SecretDeriver`]: phrase generation and salted scrypt session derivation
//! - [`SessionGuard`]: receiver and constant-time session checks
//! - [`Dispatcher`]: cancellable receive loop
//! - [`HandshakeEngine`]: StartKex, Hello, PleaseSign, Done
//! - [`DelegationSigner`]: signs and publishes the sibkey delegation
//! - [`pairing`]: drivers that run one side under a deadline

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod delegation;
pub mod dispatch;
pub mod engine;
pub mod env;
pub mod error;
pub mod guard;
pub mod identity;
pub mod message;
pub mod pairing;
pub mod secret;
pub mod services;
pub mod signal;

#[cfg(test)]
mod testing;

pub use delegation::{DEFAULT_DELEGATION_EXPIRY, DelegationRequest, DelegationSigner};
pub use dispatch::{Dispatcher, DispatcherConfig, LoopExit, run_receive_loop};
pub use engine::{EngineConfig, EngineDeps, EngineSnapshot, EngineState, HandshakeEngine, Role};
pub use env::{Environment, SystemEnv};
pub use error::{KexError, PublishError, StoreError, TransportError};
pub use guard::SessionGuard;
pub use identity::{
    DeviceDescriptor, DeviceId, DeviceStatus, DeviceType, Identity, LoadIdentityOptions,
};
pub use message::{
    Direction, Envelope, KexBody, KexMessage, MAX_MESSAGE_SIZE, Phase, PleaseSign, WIRE_VERSION,
};
pub use pairing::{DEFAULT_PAIRING_TIMEOUT, run_provisionee, run_provisioner};
pub use secret::{DictionaryWords, SecretDeriver};
pub use services::{IdentityStore, KexTransport, KeyPublisher, SecretKeyStore, WordSource};
pub use signal::{PhaseOutcome, PhaseSignal, PhaseSignals};
