//! Message bus collaborator.
//!
//! The wire protocol, broker, and delivery guarantees live outside the
//! core; this module defines the seam. The bus promises at-least-once
//! delivery — the dedup ids stamped on every envelope exist precisely
//! because of that — and accepts acknowledgements for consumed messages.
//!
//! [`InProcessBus`] is a loopback implementation for tests and single
//! process demos: it routes envelopes between managers attached to the same
//! bus instance and records traffic for inspection.

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::errors::FlowError;
use crate::ids::PeerId;
use crate::messages::SessionMessage;

/// Errors from bus operations.
#[derive(Clone, Debug, PartialEq, Eq, Error, Diagnostic)]
pub enum BusError {
    #[error("no endpoint attached for peer {peer}")]
    #[diagnostic(code(flowstate::bus::unknown_peer))]
    UnknownPeer { peer: PeerId },

    #[error("bus backend error: {message}")]
    #[diagnostic(code(flowstate::bus::backend))]
    Backend { message: String },
}

impl From<BusError> for FlowError {
    fn from(e: BusError) -> Self {
        FlowError::Bus {
            message: e.to_string(),
        }
    }
}

/// Receiver side of a bus subscription.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle(&self, from: PeerId, message: SessionMessage);
}

/// The transport seam consumed by the core.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Deliver `message` to `peer`, at least once.
    async fn send(
        &self,
        from: &PeerId,
        peer: &PeerId,
        message: SessionMessage,
    ) -> Result<(), BusError>;

    /// Attach `handler` as the endpoint for `identity`. Messages queued for
    /// the identity before attachment are delivered immediately after.
    async fn subscribe(
        &self,
        identity: PeerId,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<(), BusError>;

    /// Acknowledge consumed inbound messages so the broker stops
    /// redelivering them.
    async fn acknowledge(&self, deduplication_ids: &[String]) -> Result<(), BusError>;
}

/// One attached endpoint: an unbounded queue drained by a single dispatcher
/// task, so delivery order matches send order — the wire FIFO the session
/// layer builds on.
struct Endpoint {
    queue: flume::Sender<(PeerId, SessionMessage)>,
}

#[derive(Default)]
struct InProcessState {
    endpoints: FxHashMap<PeerId, Endpoint>,
    /// Messages sent to peers that have not attached yet.
    parked: Vec<(PeerId, PeerId, SessionMessage)>,
    sent: Vec<(PeerId, PeerId, SessionMessage)>,
    acknowledged: Vec<String>,
}

/// Loopback bus connecting managers within one process.
#[derive(Clone, Default)]
pub struct InProcessBus {
    state: Arc<Mutex<InProcessState>>,
}

impl InProcessBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every envelope sent through this bus, in send order.
    #[must_use]
    pub fn sent_log(&self) -> Vec<(PeerId, PeerId, SessionMessage)> {
        self.state
            .lock()
            .map(|s| s.sent.clone())
            .unwrap_or_default()
    }

    /// Every acknowledged deduplication id, in ack order.
    #[must_use]
    pub fn acknowledged(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.acknowledged.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MessageBus for InProcessBus {
    async fn send(
        &self,
        from: &PeerId,
        peer: &PeerId,
        message: SessionMessage,
    ) -> Result<(), BusError> {
        let mut state = self.state.lock().map_err(|e| BusError::Backend {
            message: format!("lock poisoned: {e}"),
        })?;
        state
            .sent
            .push((from.clone(), peer.clone(), message.clone()));
        match state.endpoints.get(peer) {
            Some(endpoint) => {
                // An unbounded queue never rejects; a closed one means the
                // endpoint was replaced, so park for the successor.
                if endpoint.queue.send((from.clone(), message.clone())).is_err() {
                    state.parked.push((from.clone(), peer.clone(), message));
                }
            }
            None => {
                state.parked.push((from.clone(), peer.clone(), message));
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        identity: PeerId,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<(), BusError> {
        let (queue, inbound) = flume::unbounded::<(PeerId, SessionMessage)>();
        {
            let mut state = self.state.lock().map_err(|e| BusError::Backend {
                message: format!("lock poisoned: {e}"),
            })?;
            // Replay anything parked for this identity, in original order,
            // before new traffic.
            let (backlog, rest): (Vec<_>, Vec<_>) = state
                .parked
                .drain(..)
                .partition(|(_, to, _)| *to == identity);
            state.parked = rest;
            for (from, _, message) in backlog {
                let _ = queue.send((from, message));
            }
            state
                .endpoints
                .insert(identity.clone(), Endpoint { queue });
        }
        // One dispatcher per endpoint keeps delivery sequential and off the
        // sender's stack.
        tokio::spawn(async move {
            while let Ok((from, message)) = inbound.recv_async().await {
                handler.handle(from, message).await;
            }
        });
        Ok(())
    }

    async fn acknowledge(&self, deduplication_ids: &[String]) -> Result<(), BusError> {
        let mut state = self.state.lock().map_err(|e| BusError::Backend {
            message: format!("lock poisoned: {e}"),
        })?;
        state
            .acknowledged
            .extend(deduplication_ids.iter().cloned());
        Ok(())
    }
}
