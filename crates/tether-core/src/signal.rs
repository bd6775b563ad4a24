//! One-shot phase completion signals.
//!
//! Each phase has a signal that resolves at most once, either `Ok` when the
//! phase completed or `Err` when it failed fatally. The first resolution
//! wins; later ones are ignored, so a redelivered phase message cannot
//! re-signal. Waiting on a resolved signal returns immediately.

use tokio::sync::watch;

use crate::{error::KexError, message::Phase};

/// Result a phase resolves to.
pub type PhaseOutcome = Result<(), KexError>;

/// A single-assignment completion cell with async waiters.
#[derive(Debug)]
pub struct PhaseSignal {
    slot: watch::Sender<Option<PhaseOutcome>>,
}

impl Default for PhaseSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseSignal {
    /// Unresolved signal.
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self { slot }
    }

    /// Resolve the signal. Returns `false` if it was already resolved, in
    /// which case `outcome` is discarded.
    pub fn fire(&self, outcome: PhaseOutcome) -> bool {
        self.slot.send_if_modified(move |slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        })
    }

    /// Whether the signal has resolved.
    pub fn is_fired(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// The resolved outcome, if any.
    pub fn outcome(&self) -> Option<PhaseOutcome> {
        self.slot.borrow().clone()
    }

    /// Wait for the signal to resolve.
    pub async fn wait(&self) -> PhaseOutcome {
        let mut rx = self.slot.subscribe();
        let resolved = match rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        resolved.unwrap_or(Err(KexError::Cancelled))
    }
}

/// The four per-phase signals of one pairing attempt.
#[derive(Debug, Default)]
pub struct PhaseSignals {
    start_kex: PhaseSignal,
    hello: PhaseSignal,
    please_sign: PhaseSignal,
    done: PhaseSignal,
}

impl PhaseSignals {
    /// Signal for `phase`.
    pub fn get(&self, phase: Phase) -> &PhaseSignal {
        match phase {
            Phase::StartKex => &self.start_kex,
            Phase::Hello => &self.hello,
            Phase::PleaseSign => &self.please_sign,
            Phase::Done => &self.done,
        }
    }

    /// Phases that have resolved successfully, in protocol order.
    pub fn completed(&self) -> Vec<Phase> {
        Phase::ALL
            .into_iter()
            .filter(|phase| matches!(self.get(*phase).outcome(), Some(Ok(()))))
            .collect()
    }

    /// First failure recorded, in protocol order.
    pub fn first_failure(&self) -> Option<KexError> {
        Phase::ALL.into_iter().find_map(|phase| self.get(phase).outcome()?.err())
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;

    #[test]
    fn first_fire_wins() {
        let signal = PhaseSignal::new();
        assert!(signal.fire(Ok(())));
        assert!(!signal.fire(Err(KexError::SessionMismatch)));
        assert_eq!(signal.outcome(), Some(Ok(())));
    }

    #[test]
    fn failure_is_sticky() {
        let signal = PhaseSignal::new();
        assert!(signal.fire(Err(KexError::InvalidReverseSignature)));
        assert!(!signal.fire(Ok(())));
        assert_eq!(signal.outcome(), Some(Err(KexError::InvalidReverseSignature)));
    }

    #[tokio::test]
    async fn wait_on_fired_signal_returns_immediately() {
        let signal = PhaseSignal::new();
        signal.fire(Ok(()));
        let outcome = tokio::time::timeout(Duration::from_millis(10), signal.wait()).await;
        assert_eq!(outcome, Ok(Ok(())));
    }

    #[tokio::test]
    async fn waiter_observes_later_fire() {
        let signal = Arc::new(PhaseSignal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            tokio::spawn(async move { signal.wait().await })
        };

        tokio::task::yield_now().await;
        signal.fire(Err(KexError::DelegationPublishFailed("503".to_string())));

        assert_eq!(
            waiter.await.unwrap(),
            Err(KexError::DelegationPublishFailed("503".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unfired_signal_keeps_waiting() {
        let signal = PhaseSignal::new();
        let outcome = tokio::time::timeout(Duration::from_secs(5), signal.wait()).await;
        assert!(outcome.is_err(), "wait must not resolve before fire");
    }

    #[test]
    fn completed_lists_successful_phases_in_order() {
        let signals = PhaseSignals::default();
        signals.get(Phase::Hello).fire(Ok(()));
        signals.get(Phase::StartKex).fire(Ok(()));
        signals.get(Phase::PleaseSign).fire(Err(KexError::InvalidReverseSignature));

        assert_eq!(signals.completed(), vec![Phase::StartKex, Phase::Hello]);
        assert_eq!(signals.first_failure(), Some(KexError::InvalidReverseSignature));
    }
}
