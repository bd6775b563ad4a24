//! In-memory message relay.
//!
//! Models the untrusted relay between two devices. Messages travel as encoded
//! bytes, so every delivery exercises the wire codec. Queues are keyed by
//! receiving device and direction; the relay does not look at session ids,
//! matching is left to the engines.
//!
//! Fault injection lets tests replay earlier messages, inject forged ones,
//! or push raw bytes onto a device's queue.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use tether_core::{DeviceId, Direction, KexMessage, KexTransport, TransportError};
use tether_crypto::SessionId;
use tokio::sync::Notify;

type QueueKey = (DeviceId, Direction);

#[derive(Default)]
struct RelayState {
    queues: HashMap<QueueKey, VecDeque<Vec<u8>>>,
    history: HashMap<QueueKey, Vec<Vec<u8>>>,
    sent: Vec<KexMessage>,
    closed: bool,
}

/// Shared relay. Hand each device an [`RelayEndpoint`].
#[derive(Default)]
pub struct MemoryRelay {
    state: Mutex<RelayState>,
    arrivals: Notify,
}

impl MemoryRelay {
    /// Empty open relay.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport for `device`.
    pub fn endpoint(self: &Arc<Self>, device: DeviceId) -> RelayEndpoint {
        RelayEndpoint { relay: Arc::clone(self), device }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut RelayState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    fn enqueue(&self, key: QueueKey, bytes: Vec<u8>) {
        self.with_state(|state| {
            state.history.entry(key).or_default().push(bytes.clone());
            state.queues.entry(key).or_default().push_back(bytes);
        });
        self.arrivals.notify_waiters();
    }

    /// End the protocol: pending messages still drain, then receivers see
    /// end-of-protocol and sends fail.
    pub fn close(&self) {
        self.with_state(|state| state.closed = true);
        self.arrivals.notify_waiters();
    }

    /// Every message sent through an endpoint, in order.
    pub fn sent(&self) -> Vec<KexMessage> {
        self.with_state(|state| state.sent.clone())
    }

    /// Messages of `kind` sent through an endpoint.
    pub fn sent_of_kind(&self, kind: &str) -> Vec<KexMessage> {
        self.with_state(|state| {
            state.sent.iter().filter(|message| message.body.kind() == kind).cloned().collect()
        })
    }

    /// Number of messages ever queued for `device` in `direction`.
    pub fn delivered_to(&self, device: DeviceId, direction: Direction) -> usize {
        self.with_state(|state| state.history.get(&(device, direction)).map_or(0, Vec::len))
    }

    /// Queue `message` for `device` regardless of its envelope.
    pub fn inject(&self, device: DeviceId, message: &KexMessage) -> Result<(), TransportError> {
        let bytes = message.encode().map_err(|e| TransportError::Send(e.to_string()))?;
        self.enqueue((device, message.envelope.direction), bytes);
        Ok(())
    }

    /// Queue raw bytes for `device`.
    pub fn inject_raw(&self, device: DeviceId, direction: Direction, bytes: Vec<u8>) {
        self.enqueue((device, direction), bytes);
    }

    /// Re-queue the `index`th message ever queued for `device` in
    /// `direction`. Returns false if there is no such message.
    pub fn replay(&self, device: DeviceId, direction: Direction, index: usize) -> bool {
        let bytes = self.with_state(|state| {
            state.history.get(&(device, direction)).and_then(|h| h.get(index)).cloned()
        });
        match bytes {
            Some(bytes) => {
                self.enqueue((device, direction), bytes);
                true
            },
            None => false,
        }
    }
}

/// One device's view of a [`MemoryRelay`].
#[derive(Clone)]
pub struct RelayEndpoint {
    relay: Arc<MemoryRelay>,
    device: DeviceId,
}

impl RelayEndpoint {
    /// Device this endpoint receives for.
    pub fn device(&self) -> DeviceId {
        self.device
    }
}

#[async_trait]
impl KexTransport for RelayEndpoint {
    async fn send(&self, message: KexMessage) -> Result<(), TransportError> {
        let bytes = message.encode().map_err(|e| TransportError::Send(e.to_string()))?;
        let key = (message.envelope.receiver, message.envelope.direction);
        let closed = self.relay.with_state(|state| {
            if state.closed {
                return true;
            }
            state.sent.push(message);
            false
        });
        if closed {
            return Err(TransportError::Closed);
        }
        tracing::trace!(from = %self.device, to = %key.0, direction = ?key.1, "relay send");
        self.relay.enqueue(key, bytes);
        Ok(())
    }

    async fn receive_next(
        &self,
        _session_id: &SessionId,
        direction: Direction,
    ) -> Result<Option<KexMessage>, TransportError> {
        let key = (self.device, direction);
        loop {
            let arrival = self.relay.arrivals.notified();
            tokio::pin!(arrival);
            arrival.as_mut().enable();

            let next = self.relay.with_state(|state| {
                match state.queues.get_mut(&key).and_then(VecDeque::pop_front) {
                    Some(bytes) => Some(Some(bytes)),
                    None if state.closed => Some(None),
                    None => None,
                }
            });

            match next {
                Some(Some(bytes)) => {
                    return KexMessage::decode(&bytes)
                        .map(Some)
                        .map_err(|e| TransportError::Receive(e.to_string()));
                },
                Some(None) => return Ok(None),
                None => arrival.await,
            }
        }
    }
}
