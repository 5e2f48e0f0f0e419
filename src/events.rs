//! Outward events and the non-blocking channel that carries them

use crate::error::ConnectionError;
use crate::metrics::Metrics;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{trace, warn};

/// Events emitted by shards and the manager
#[derive(Debug, Clone, PartialEq)]
pub enum ShardEvent {
    /// Transport opened, waiting for HELLO
    Connect { shard_id: u32 },
    /// HELLO received
    Hello { shard_id: u32, heartbeat_interval: u64 },
    /// READY received; guilds may still be streaming in
    PreReady { shard_id: u32 },
    /// Shard finished its readiness checks
    Ready { shard_id: u32 },
    /// Session resumed
    Resumed { shard_id: u32 },
    /// Shard lost its connection
    Disconnect {
        shard_id: u32,
        error: Option<ConnectionError>,
        reconnecting: bool,
    },
    /// Dispatch processed through the cache
    Dispatch {
        shard_id: u32,
        name: String,
        new: Option<Value>,
        old: Option<Value>,
    },
    /// Something unexpected that did not interrupt the shard
    Warn { shard_id: u32, message: String },
    /// A connection error; `fatal` errors stop the shard for good
    Error {
        shard_id: u32,
        error: ConnectionError,
        fatal: bool,
    },
    /// Every spawned shard is ready; emitted once per manager run
    AllReady,
}

impl ShardEvent {
    /// Short name for logs
    pub fn name(&self) -> &str {
        match self {
            ShardEvent::Connect { .. } => "connect",
            ShardEvent::Hello { .. } => "hello",
            ShardEvent::PreReady { .. } => "pre_ready",
            ShardEvent::Ready { .. } => "ready",
            ShardEvent::Resumed { .. } => "resumed",
            ShardEvent::Disconnect { .. } => "disconnect",
            ShardEvent::Dispatch { name, .. } => name,
            ShardEvent::Warn { .. } => "warn",
            ShardEvent::Error { .. } => "error",
            ShardEvent::AllReady => "all_ready",
        }
    }
}

/// Sending half of the event channel.
///
/// Never waits: when the consumer falls behind and the channel is full the
/// event is dropped and counted, so heartbeats are never held up.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<ShardEvent>,
    metrics: Arc<Metrics>,
}

impl EventSender {
    pub fn new(tx: mpsc::Sender<ShardEvent>, metrics: Arc<Metrics>) -> Self {
        Self { tx, metrics }
    }

    /// Create a sender and its receiver
    pub fn channel(capacity: usize, metrics: Arc<Metrics>) -> (Self, mpsc::Receiver<ShardEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx, metrics), rx)
    }

    pub fn emit(&self, event: ShardEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.metrics.record_event_dropped();
                warn!("Event channel full, dropping {} event", event.name());
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                trace!("No event consumer, discarding {} event", event.name());
            }
        }
    }
}
