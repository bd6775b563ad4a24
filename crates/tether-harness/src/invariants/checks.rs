//! Standard pairing invariants.

use tether_core::EngineState;

use super::{Invariant, InvariantResult, PairingSnapshot, Violation};

/// At most one delegation is pushed per attempt.
///
/// Redelivered PleaseSign messages must not re-publish.
pub struct SinglePublish;

impl Invariant for SinglePublish {
    fn name(&self) -> &'static str {
        "single_publish"
    }

    fn check(&self, state: &PairingSnapshot) -> InvariantResult {
        if state.publish_calls > 1 {
            return Err(Violation {
                invariant: self.name(),
                message: format!("{} publish calls in one attempt", state.publish_calls),
            });
        }
        Ok(())
    }
}

/// The secret signing key is fetched at most once.
pub struct SecretFetchedOnce;

impl Invariant for SecretFetchedOnce {
    fn name(&self) -> &'static str {
        "secret_fetched_once"
    }

    fn check(&self, state: &PairingSnapshot) -> InvariantResult {
        if state.secret_fetches > 1 {
            return Err(Violation {
                invariant: self.name(),
                message: format!("secret key fetched {} times", state.secret_fetches),
            });
        }
        if state.provisioner.signing_key_fetched && state.secret_fetches == 0 {
            return Err(Violation {
                invariant: self.name(),
                message: "engine holds a key the store never served".to_string(),
            });
        }
        Ok(())
    }
}

/// Engine state history never moves backwards.
pub struct StateMonotonic;

impl Invariant for StateMonotonic {
    fn name(&self) -> &'static str {
        "state_monotonic"
    }

    fn check(&self, state: &PairingSnapshot) -> InvariantResult {
        for engine in state.engines() {
            for window in engine.history.windows(2) {
                if window[1] <= window[0] {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "{:?} went {:?} → {:?}",
                            engine.role, window[0], window[1]
                        ),
                    });
                }
            }
            if engine.history.last() != Some(&engine.state) {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "{:?} state {:?} not at end of history {:?}",
                        engine.role, engine.state, engine.history
                    ),
                });
            }
        }
        Ok(())
    }
}

/// A provisionee only completes after the provisioner published.
pub struct CompletionImpliesPublish;

impl Invariant for CompletionImpliesPublish {
    fn name(&self) -> &'static str {
        "completion_implies_publish"
    }

    fn check(&self, state: &PairingSnapshot) -> InvariantResult {
        if state.provisionee.state == EngineState::Complete && state.provisioner.published.is_none()
        {
            return Err(Violation {
                invariant: self.name(),
                message: "provisionee complete but nothing was published".to_string(),
            });
        }
        Ok(())
    }
}
