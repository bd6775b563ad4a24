//! Invariant checking for pairing scenarios.
//!
//! Invariants are properties that must hold after any pairing run, however
//! the relay behaved: replays, forgeries, failures and timeouts included.
//! Scenario tests take a [`PairingSnapshot`] at the end of a run and check it
//! against a registry.
//!
//! # Usage
//!
//! ```ignore
//! let outcome = PairingScenario::new("alice").run().await;
//! InvariantRegistry::standard().assert_all(&outcome.snapshot(), "happy path");
//! ```

mod checks;
mod snapshot;

pub use checks::{CompletionImpliesPublish, SecretFetchedOnce, SinglePublish, StateMonotonic};
pub use snapshot::PairingSnapshot;

/// Invariant check result.
pub type InvariantResult = Result<(), Violation>;

/// Invariant violation with context.
#[derive(Debug, Clone)]
pub struct Violation {
    /// Name of the violated invariant.
    pub invariant: &'static str,
    /// Description of what went wrong.
    pub message: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.invariant, self.message)
    }
}

impl std::error::Error for Violation {}

/// A property checked against the end state of a pairing run.
pub trait Invariant: Send + Sync {
    /// Invariant name for error reporting.
    fn name(&self) -> &'static str;

    /// Check the invariant.
    fn check(&self, state: &PairingSnapshot) -> InvariantResult;
}

/// Registry of invariants to check.
pub struct InvariantRegistry {
    invariants: Vec<Box<dyn Invariant>>,
}

impl Default for InvariantRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InvariantRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self { invariants: Vec::new() }
    }

    /// Registry with every pairing invariant:
    /// - [`SinglePublish`]: at most one delegation pushed per attempt
    /// - [`SecretFetchedOnce`]: secret key fetched at most once
    /// - [`StateMonotonic`]: engine states never move backwards
    /// - [`CompletionImpliesPublish`]: a complete provisionee implies a
    ///   published delegation
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.add(SinglePublish);
        registry.add(SecretFetchedOnce);
        registry.add(StateMonotonic);
        registry.add(CompletionImpliesPublish);
        registry
    }

    /// Add an invariant to the registry.
    pub fn add<I: Invariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    /// Check all invariants, collecting every violation.
    pub fn check_all(&self, state: &PairingSnapshot) -> Result<(), Vec<Violation>> {
        let violations: Vec<_> =
            self.invariants.iter().filter_map(|inv| inv.check(state).err()).collect();

        if violations.is_empty() { Ok(()) } else { Err(violations) }
    }

    /// Check all invariants, panicking with every violation.
    ///
    /// Use this in tests where you want immediate failure with context.
    #[allow(clippy::panic)]
    pub fn assert_all(&self, state: &PairingSnapshot, context: &str) {
        if let Err(violations) = self.check_all(state) {
            let messages: Vec<_> = violations.iter().map(ToString::to_string).collect();
            panic!("Invariant violation {context}:\n  {}", messages.join("\n  "));
        }
    }

    /// Number of registered invariants.
    pub fn len(&self) -> usize {
        self.invariants.len()
    }

    /// Check if registry is empty.
    pub fn is_empty(&self) -> bool {
        self.invariants.is_empty()
    }
}
