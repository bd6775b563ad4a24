//! Driving one side of a pairing attempt end to end.
//!
//! These drivers own the caller-side policy the engine leaves out: a
//! wall-clock budget for the whole attempt and aborting the engine when the
//! budget or any phase fails.

use std::{sync::Arc, time::Duration};

use tether_crypto::{KeyId, SessionId};
use tokio::{task::JoinHandle, time::Instant};

use crate::{
    dispatch::{Dispatcher, LoopExit},
    engine::HandshakeEngine,
    env::Environment,
    error::KexError,
    identity::{DeviceId, DeviceType, Identity},
    message::Phase,
};

/// Default budget for a whole pairing attempt.
pub const DEFAULT_PAIRING_TIMEOUT: Duration = Duration::from_secs(300);

/// Budget shared by the phases of one attempt.
struct Deadline {
    limit: Duration,
    at: Instant,
}

impl Deadline {
    fn new(limit: Duration) -> Self {
        Self { limit, at: Instant::now() + limit }
    }

    async fn wait<E: Environment>(
        &self,
        engine: &HandshakeEngine<E>,
        phase: Phase,
    ) -> Result<(), KexError> {
        tokio::time::timeout_at(self.at, engine.wait_for_phase(phase))
            .await
            .map_err(|_| KexError::Timeout { limit: self.limit })?
    }
}

/// Run the provisioner side: send StartKex to `peer` and wait until the
/// delegation is published and Done sent.
///
/// Returns the key id granted to the new device. On any failure the engine
/// is aborted.
pub async fn run_provisioner<E: Environment>(
    engine: Arc<HandshakeEngine<E>>,
    session_id: SessionId,
    peer: DeviceId,
    limit: Duration,
) -> Result<KeyId, KexError> {
    let deadline = Deadline::new(limit);
    engine.initiate_as_provisioner(session_id, peer).await?;
    let receiver = Dispatcher::new(Arc::clone(&engine)).spawn();

    let result = async {
        for phase in [Phase::Hello, Phase::PleaseSign, Phase::Done] {
            deadline.wait(&engine, phase).await?;
        }
        engine.published_kid().ok_or(KexError::Cancelled)
    }
    .await;

    finish(&engine, receiver, result).await
}

/// Run the provisionee side: wait for StartKex, request delegation of this
/// device's key, and wait for Done.
///
/// Returns the reloaded identity. On any failure the engine is aborted.
pub async fn run_provisionee<E: Environment>(
    engine: Arc<HandshakeEngine<E>>,
    session_id: SessionId,
    kind: DeviceType,
    description: String,
    limit: Duration,
) -> Result<Identity, KexError> {
    let deadline = Deadline::new(limit);
    engine.initiate_as_provisionee(session_id).await?;
    let receiver = Dispatcher::new(Arc::clone(&engine)).spawn();

    let result = async {
        deadline.wait(&engine, Phase::StartKex).await?;
        engine.send_please_sign(kind, description).await?;
        deadline.wait(&engine, Phase::Done).await?;
        engine.identity().ok_or(KexError::IdentityMissing)
    }
    .await;

    finish(&engine, receiver, result).await
}

async fn finish<E: Environment, T>(
    engine: &HandshakeEngine<E>,
    receiver: JoinHandle<Result<LoopExit, KexError>>,
    result: Result<T, KexError>,
) -> Result<T, KexError> {
    if result.is_err() {
        engine.abort();
    }
    match receiver.await {
        Ok(Ok(exit)) => {
            tracing::debug!(engine = %engine.config().debug_name, exit = ?exit, "receiver finished");
        },
        Ok(Err(err)) => {
            tracing::warn!(engine = %engine.config().debug_name, error = %err, "receiver failed");
        },
        Err(err) => {
            tracing::warn!(engine = %engine.config().debug_name, error = %err, "receiver task ended abnormally");
        },
    }
    result
}
