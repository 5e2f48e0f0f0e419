use crate::shard::ShardStatus;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Metrics for observability
///
/// Counters are shared by every shard of a manager; per-shard gauges are
/// refreshed by each shard task after it handles an event. Use `snapshot()`
/// to get a point-in-time view of all metrics.
///
/// # Example
/// ```ignore
/// let metrics = manager.metrics();
/// println!("Heartbeats acked: {}", metrics.heartbeats_acked());
/// let snapshot = metrics.snapshot();
/// ```
#[derive(Debug, Default)]
pub struct Metrics {
    connections_total: AtomicU64,
    reconnections_total: AtomicU64,
    messages_received_total: AtomicU64,
    messages_sent_total: AtomicU64,
    errors_total: AtomicU64,
    heartbeats_sent_total: AtomicU64,
    heartbeats_acked_total: AtomicU64,
    heartbeats_missed_total: AtomicU64,
    identifies_total: AtomicU64,
    resumes_total: AtomicU64,
    invalid_sessions_total: AtomicU64,
    events_dropped_total: AtomicU64,

    /// Per-shard metrics keyed by shard id
    shard_metrics: RwLock<BTreeMap<u32, ShardMetrics>>,
}

/// Metrics for a single shard
#[derive(Debug, Clone)]
pub struct ShardMetrics {
    /// Shard identifier
    pub shard_id: u32,
    /// Current state machine status
    pub status: ShardStatus,
    /// Whether the transport is open
    pub is_connected: bool,
    /// Latest heartbeat round trip
    pub latency: Option<Duration>,
    /// Last processed sequence number
    pub sequence: u64,
    /// Connect attempts since the last successful READY or RESUMED
    pub connect_attempts: u32,
    /// Duration since the transport last opened (None if never connected)
    pub time_since_connected: Option<Duration>,
    /// Total time spent connected
    pub total_uptime: Duration,
    #[doc(hidden)]
    pub(crate) last_connected_at: Option<Instant>,
}

impl ShardMetrics {
    fn new(shard_id: u32) -> Self {
        Self {
            shard_id,
            status: ShardStatus::Disconnected,
            is_connected: false,
            latency: None,
            sequence: 0,
            connect_attempts: 0,
            time_since_connected: None,
            total_uptime: Duration::ZERO,
            last_connected_at: None,
        }
    }

    /// Create a snapshot with computed durations
    fn snapshot(&self) -> ShardMetrics {
        ShardMetrics {
            time_since_connected: self.last_connected_at.map(|t| t.elapsed()),
            ..self.clone()
        }
    }

    /// Flip the connected flag, accumulating uptime on disconnect
    pub(crate) fn set_connected(&mut self, connected: bool) {
        match (self.is_connected, connected) {
            (false, true) => self.last_connected_at = Some(Instant::now()),
            (true, false) => {
                if let Some(connected_at) = self.last_connected_at {
                    self.total_uptime += connected_at.elapsed();
                }
            }
            _ => {}
        }
        self.is_connected = connected;
    }
}

impl Metrics {
    /// Create a new Metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Getters ==========

    /// Get total transports opened
    pub fn connections(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    /// Get total reconnections queued
    pub fn reconnections(&self) -> u64 {
        self.reconnections_total.load(Ordering::Relaxed)
    }

    /// Get total frames received
    pub fn messages_received(&self) -> u64 {
        self.messages_received_total.load(Ordering::Relaxed)
    }

    /// Get total frames sent
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent_total.load(Ordering::Relaxed)
    }

    /// Get total errors
    pub fn errors(&self) -> u64 {
        self.errors_total.load(Ordering::Relaxed)
    }

    /// Get total heartbeats sent
    pub fn heartbeats_sent(&self) -> u64 {
        self.heartbeats_sent_total.load(Ordering::Relaxed)
    }

    /// Get total heartbeats acknowledged
    pub fn heartbeats_acked(&self) -> u64 {
        self.heartbeats_acked_total.load(Ordering::Relaxed)
    }

    /// Get total heartbeats that were never acknowledged
    pub fn heartbeats_missed(&self) -> u64 {
        self.heartbeats_missed_total.load(Ordering::Relaxed)
    }

    /// Get total IDENTIFY frames sent
    pub fn identifies(&self) -> u64 {
        self.identifies_total.load(Ordering::Relaxed)
    }

    /// Get total RESUME frames sent
    pub fn resumes(&self) -> u64 {
        self.resumes_total.load(Ordering::Relaxed)
    }

    /// Get total invalid sessions received
    pub fn invalid_sessions(&self) -> u64 {
        self.invalid_sessions_total.load(Ordering::Relaxed)
    }

    /// Get total events dropped because the consumer fell behind
    pub fn events_dropped(&self) -> u64 {
        self.events_dropped_total.load(Ordering::Relaxed)
    }

    // ========== Recording methods (called internally) ==========

    pub(crate) fn record_connection(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnection(&self) {
        self.reconnections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_message_received(&self) {
        self.messages_received_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_message_sent(&self) {
        self.messages_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_heartbeat(&self) {
        self.heartbeats_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_heartbeat_ack(&self) {
        self.heartbeats_acked_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_heartbeat_missed(&self) {
        self.heartbeats_missed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_identify(&self) {
        self.identifies_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_resume(&self) {
        self.resumes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_invalid_session(&self) {
        self.invalid_sessions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_event_dropped(&self) {
        self.events_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Update metrics for a specific shard, creating its entry if needed
    pub(crate) fn update_shard(&self, shard_id: u32, update_fn: impl FnOnce(&mut ShardMetrics)) {
        let mut shards = self.shard_metrics.write();
        let entry = shards
            .entry(shard_id)
            .or_insert_with(|| ShardMetrics::new(shard_id));
        update_fn(entry);
    }

    pub(crate) fn remove_shard(&self, shard_id: u32) {
        self.shard_metrics.write().remove(&shard_id);
    }

    /// Get a snapshot of one shard
    pub fn shard(&self, shard_id: u32) -> Option<ShardMetrics> {
        self.shard_metrics.read().get(&shard_id).map(ShardMetrics::snapshot)
    }

    /// Get a snapshot of all shard metrics with computed durations
    pub fn shard_metrics(&self) -> Vec<ShardMetrics> {
        self.shard_metrics.read().values().map(ShardMetrics::snapshot).collect()
    }

    /// Get current open transport count
    pub fn active_connections(&self) -> usize {
        self.shard_metrics
            .read()
            .values()
            .filter(|s| s.is_connected)
            .count()
    }

    /// Get a point-in-time snapshot of all metrics for export
    pub fn snapshot(&self) -> MetricsSnapshot {
        // Take the shard lock once to ensure consistency
        let shards = self.shard_metrics.read();
        let shard_snapshots: Vec<ShardMetrics> = shards.values().map(ShardMetrics::snapshot).collect();

        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Acquire),
            reconnections_total: self.reconnections_total.load(Ordering::Acquire),
            messages_received_total: self.messages_received_total.load(Ordering::Acquire),
            messages_sent_total: self.messages_sent_total.load(Ordering::Acquire),
            errors_total: self.errors_total.load(Ordering::Acquire),
            heartbeats_sent_total: self.heartbeats_sent_total.load(Ordering::Acquire),
            heartbeats_acked_total: self.heartbeats_acked_total.load(Ordering::Acquire),
            heartbeats_missed_total: self.heartbeats_missed_total.load(Ordering::Acquire),
            identifies_total: self.identifies_total.load(Ordering::Acquire),
            resumes_total: self.resumes_total.load(Ordering::Acquire),
            invalid_sessions_total: self.invalid_sessions_total.load(Ordering::Acquire),
            events_dropped_total: self.events_dropped_total.load(Ordering::Acquire),
            active_connections: shard_snapshots.iter().filter(|s| s.is_connected).count(),
            ready_shards: shard_snapshots
                .iter()
                .filter(|s| s.status == ShardStatus::Ready)
                .count(),
            shards: shard_snapshots,
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub reconnections_total: u64,
    pub messages_received_total: u64,
    pub messages_sent_total: u64,
    pub errors_total: u64,
    pub heartbeats_sent_total: u64,
    pub heartbeats_acked_total: u64,
    pub heartbeats_missed_total: u64,
    pub identifies_total: u64,
    pub resumes_total: u64,
    pub invalid_sessions_total: u64,
    pub events_dropped_total: u64,
    pub active_connections: usize,
    pub ready_shards: usize,
    pub shards: Vec<ShardMetrics>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_counters() {
        let metrics = Metrics::new();

        metrics.record_connection();
        metrics.record_connection();
        metrics.record_reconnection();
        metrics.record_heartbeat();
        metrics.record_heartbeat_ack();

        assert_eq!(metrics.connections(), 2);
        assert_eq!(metrics.reconnections(), 1);
        assert_eq!(metrics.heartbeats_sent(), 1);
        assert_eq!(metrics.heartbeats_acked(), 1);
        assert_eq!(metrics.heartbeats_missed(), 0);
    }

    #[test]
    fn test_shard_metrics_keyed_by_id() {
        let metrics = Metrics::new();

        metrics.update_shard(7, |s| {
            s.set_connected(true);
            s.status = ShardStatus::Ready;
        });
        metrics.update_shard(2, |s| s.set_connected(true));

        assert_eq!(metrics.active_connections(), 2);
        let ids: Vec<u32> = metrics.shard_metrics().iter().map(|s| s.shard_id).collect();
        assert_eq!(ids, vec![2, 7]);
        assert_eq!(metrics.shard(7).unwrap().status, ShardStatus::Ready);
        assert!(metrics.shard(3).is_none());
    }

    #[test]
    fn test_disconnect_accumulates_uptime() {
        let metrics = Metrics::new();
        metrics.update_shard(0, |s| s.set_connected(true));
        std::thread::sleep(Duration::from_millis(5));
        metrics.update_shard(0, |s| s.set_connected(false));

        let shard = metrics.shard(0).unwrap();
        assert!(!shard.is_connected);
        assert!(shard.total_uptime >= Duration::from_millis(5));
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = Metrics::new();

        metrics.record_connection();
        metrics.record_event_dropped();
        metrics.update_shard(0, |s| {
            s.set_connected(true);
            s.status = ShardStatus::Ready;
            s.sequence = 42;
        });
        metrics.update_shard(1, |s| s.status = ShardStatus::Identifying);

        let snapshot = metrics.snapshot();

        assert_eq!(snapshot.connections_total, 1);
        assert_eq!(snapshot.events_dropped_total, 1);
        assert_eq!(snapshot.active_connections, 1);
        assert_eq!(snapshot.ready_shards, 1);
        assert_eq!(snapshot.shards[0].sequence, 42);

        metrics.remove_shard(1);
        assert_eq!(metrics.snapshot().shards.len(), 1);
    }
}
