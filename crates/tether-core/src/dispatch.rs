//! Receive loop feeding inbound messages to a [`HandshakeEngine`].
//!
//! ```text
//!   ┌──────────── loop ────────────┐
//!   │  select (biased)             │
//!   │    completion cancelled ─────┼──► LoopExit::Completed
//!   │    transport.receive_next    │
//!   │      Ok(None) ───────────────┼──► LoopExit::ProtocolEnd
//!   │      Ok(Some(msg)) ──► engine.handle(msg), errors logged
//!   │      Err(transient) ──► log, back off, poll again
//!   │      Err(Closed) ────────────┼──► Err(Transport(Closed))
//!   └──────────────────────────────┘
//! ```
//!
//! The loop runs on its own task so the driving caller can block on phase
//! signals. Handler errors never stop it; stray traffic on a shared relay
//! must not abort a legitimate attempt.
//!
//! Transport errors other than end-of-protocol are logged and polling
//! continues, with one exception: [`TransportError::Closed`] means the
//! transport can never deliver again, so the loop returns it instead of
//! spinning.
//!
//! [`TransportError::Closed`]: crate::error::TransportError::Closed

use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;

use crate::{
    engine::HandshakeEngine,
    env::Environment,
    error::KexError,
    message::Direction,
};

/// Pause after a transient transport error before polling again.
pub const DEFAULT_TRANSIENT_BACKOFF: Duration = Duration::from_millis(50);

/// How the receive loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Transport reported end of protocol
    ProtocolEnd,
    /// The attempt completed, failed or was aborted
    Completed,
}

/// Receive loop settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Pause after a transient transport error
    pub transient_backoff: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { transient_backoff: DEFAULT_TRANSIENT_BACKOFF }
    }
}

/// Drives one engine from its transport.
pub struct Dispatcher<E: Environment> {
    engine: Arc<HandshakeEngine<E>>,
    direction: Direction,
    config: DispatcherConfig,
}

impl<E: Environment> Dispatcher<E> {
    /// Dispatcher receiving the engine's inbound direction.
    pub fn new(engine: Arc<HandshakeEngine<E>>) -> Self {
        let direction = engine.role().inbound();
        Self { engine, direction, config: DispatcherConfig::default() }
    }

    /// Override the receive direction.
    #[must_use]
    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// Override the loop settings.
    #[must_use]
    pub fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Run the loop on a new task.
    pub fn spawn(self) -> JoinHandle<Result<LoopExit, KexError>> {
        tokio::spawn(self.run())
    }

    /// Run the loop until end of protocol, completion, or a closed
    /// transport.
    pub async fn run(self) -> Result<LoopExit, KexError> {
        let engine = self.engine;
        let name = engine.config().debug_name.clone();
        let session_id = engine.session_id().ok_or(KexError::InvalidState {
            state: engine.state(),
            operation: "run_receive_loop",
        })?;
        let transport = engine.transport();
        let completion = engine.completion_token();

        tracing::debug!(engine = %name, direction = ?self.direction, "receive loop started");
        loop {
            let next = tokio::select! {
                biased;
                () = completion.cancelled() => {
                    tracing::debug!(engine = %name, "receive loop stopped: attempt finished");
                    return Ok(LoopExit::Completed);
                },
                next = transport.receive_next(&session_id, self.direction) => next,
            };

            match next {
                Ok(Some(message)) => {
                    if message.envelope.direction != self.direction {
                        tracing::warn!(
                            engine = %name,
                            kind = message.body.kind(),
                            direction = ?message.envelope.direction,
                            "dropping message travelling the wrong way"
                        );
                        continue;
                    }
                    let kind = message.body.kind();
                    match engine.handle(message).await {
                        Ok(()) => {},
                        Err(err) if err.is_rejection() => {
                            tracing::warn!(engine = %name, kind, error = %err, "message rejected");
                        },
                        Err(err) => {
                            tracing::error!(engine = %name, kind, error = %err, "handler failed");
                        },
                    }
                },
                Ok(None) => {
                    tracing::debug!(engine = %name, "receive loop stopped: end of protocol");
                    return Ok(LoopExit::ProtocolEnd);
                },
                Err(err) if err.is_transient() => {
                    tracing::warn!(engine = %name, error = %err, "transient receive error");
                    tokio::time::sleep(self.config.transient_backoff).await;
                },
                Err(err) => {
                    tracing::error!(engine = %name, error = %err, "transport closed");
                    return Err(err.into());
                },
            }
        }
    }
}

/// Run the receive loop for `engine`, accepting messages in `direction`.
pub async fn run_receive_loop<E: Environment>(
    engine: Arc<HandshakeEngine<E>>,
    direction: Direction,
) -> Result<LoopExit, KexError> {
    Dispatcher::new(engine).with_direction(direction).run().await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::{
        engine::{EngineState, Role},
        error::TransportError,
        identity::{DeviceId, LoadIdentityOptions},
        message::KexBody,
        testing::{
            PROVISIONEE, SESSION, ScriptedTransport, fixture, hello, please_sign, sibkey,
            to_provisionee,
        },
    };

    const QUICK: DispatcherConfig = DispatcherConfig { transient_backoff: Duration::from_millis(1) };

    async fn initiated(transport: ScriptedTransport) -> crate::testing::Fixture {
        let fx = fixture(Role::Provisioner, transport, sibkey());
        fx.engine.load_identity(LoadIdentityOptions::current()).await.unwrap();
        fx.engine.initiate_as_provisioner(SESSION, PROVISIONEE).await.unwrap();
        fx
    }

    #[tokio::test]
    async fn protocol_end_stops_loop_cleanly() {
        let transport = ScriptedTransport::default();
        transport.push(Ok(None));
        let fx = initiated(transport).await;

        let exit = Dispatcher::new(Arc::clone(&fx.engine)).run().await;
        assert_eq!(exit, Ok(LoopExit::ProtocolEnd));
    }

    #[tokio::test]
    async fn loop_survives_errors_and_finishes_on_completion() {
        let transport = ScriptedTransport::default();
        let mut wrong_session = please_sign();
        wrong_session.envelope.session_id = tether_crypto::SessionId::from_bytes([0; 32]);

        transport.push(Err(TransportError::Receive("connection reset".to_string())));
        transport.push(Ok(Some(wrong_session)));
        transport.push(Ok(Some(to_provisionee(KexBody::Done))));
        transport.push(Ok(Some(hello())));
        transport.push(Ok(Some(please_sign())));
        transport.push(Ok(Some(please_sign())));
        let fx = initiated(transport).await;

        let exit = Dispatcher::new(Arc::clone(&fx.engine)).with_config(QUICK).run().await;
        assert_eq!(exit, Ok(LoopExit::Completed));
        assert_eq!(fx.engine.state(), EngineState::Complete);
        assert_eq!(fx.publisher.pushed.lock().unwrap().len(), 1);
        assert_eq!(fx.keys.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn third_device_traffic_does_not_abort_pairing() {
        let foreign = DeviceId::from_bytes([0xCC; 16]);
        let mut foreign_hello = hello();
        foreign_hello.envelope.sender = foreign;
        foreign_hello.body = KexBody::Hello { device_id: foreign, device_kid: sibkey().public_key().kid() };
        let mut foreign_request = please_sign();
        foreign_request.envelope.sender = foreign;

        let transport = ScriptedTransport::default();
        transport.push(Ok(Some(foreign_hello)));
        transport.push(Ok(Some(hello())));
        transport.push(Ok(Some(foreign_request)));
        transport.push(Ok(Some(please_sign())));
        let fx = initiated(transport).await;

        let exit = Dispatcher::new(Arc::clone(&fx.engine)).with_config(QUICK).run().await;
        assert_eq!(exit, Ok(LoopExit::Completed));
        assert_eq!(fx.engine.state(), EngineState::Complete);
        assert_eq!(fx.publisher.pushed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn closed_transport_ends_loop_with_error() {
        let transport = ScriptedTransport::default();
        transport.push(Err(TransportError::Closed));
        let fx = initiated(transport).await;

        let exit = Dispatcher::new(Arc::clone(&fx.engine)).run().await;
        assert_eq!(exit, Err(KexError::Transport(TransportError::Closed)));
    }

    #[tokio::test]
    async fn abort_unwinds_idle_loop() {
        let fx = initiated(ScriptedTransport::default()).await;
        let handle = Dispatcher::new(Arc::clone(&fx.engine)).spawn();

        tokio::task::yield_now().await;
        fx.engine.abort();
        assert_eq!(handle.await.unwrap(), Ok(LoopExit::Completed));
    }

    #[tokio::test]
    async fn loop_requires_initiated_engine() {
        let fx = fixture(Role::Provisioner, ScriptedTransport::default(), sibkey());
        let exit = run_receive_loop(Arc::clone(&fx.engine), Direction::ToProvisioner).await;
        assert!(matches!(exit, Err(KexError::InvalidState { state: EngineState::Idle, .. })));
    }
}
