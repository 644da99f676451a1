use crate::shard::ShardStatus;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Metrics for observability
///
/// Fleet-wide counters plus one [`ShardMetrics`] entry per spawned shard.
/// Use `snapshot()` to get a point-in-time view of everything, or the
/// individual getters for specific values.
///
/// # Example
/// ```ignore
/// let metrics = fleet.metrics();
///
/// println!("Identifies: {}", metrics.identifies());
/// println!("Resumes: {}", metrics.resumes());
///
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
    heartbeat_acks_total: AtomicU64,
    identifies_total: AtomicU64,
    resumes_total: AtomicU64,
    invalid_sessions_total: AtomicU64,
    zombie_connections_total: AtomicU64,
    fatal_closes_total: AtomicU64,

    /// Per-shard metrics keyed by shard id
    shard_metrics: RwLock<BTreeMap<u32, ShardMetrics>>,
}

/// Metrics for a single shard
#[derive(Debug, Clone)]
pub struct ShardMetrics {
    pub shard_id: u32,
    /// Last status published by the connection task
    pub status: ShardStatus,
    /// Whether a socket is currently open
    pub is_connected: bool,
    /// Round trip of the last acknowledged heartbeat
    pub latency: Option<Duration>,
    /// Duration since last successful connection (None if never connected)
    pub time_since_connected: Option<Duration>,
    /// Duration since last frame received (None if no frames)
    pub time_since_last_message: Option<Duration>,
    /// Current reconnection attempt (0 once READY or RESUMED)
    pub reconnect_attempt: u32,
    /// Total time spent with an open socket
    pub total_uptime: Duration,
    #[doc(hidden)]
    pub(crate) last_connected_at: Option<Instant>,
    #[doc(hidden)]
    pub(crate) last_message_at: Option<Instant>,
}

impl ShardMetrics {
    fn new(shard_id: u32) -> Self {
        Self {
            shard_id,
            status: ShardStatus::Idle,
            is_connected: false,
            latency: None,
            time_since_connected: None,
            time_since_last_message: None,
            reconnect_attempt: 0,
            total_uptime: Duration::ZERO,
            last_connected_at: None,
            last_message_at: None,
        }
    }

    /// Copy with durations computed against now
    fn snapshot(&self) -> ShardMetrics {
        ShardMetrics {
            time_since_connected: self.last_connected_at.map(|t| t.elapsed()),
            time_since_last_message: self.last_message_at.map(|t| t.elapsed()),
            ..self.clone()
        }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Getters ==========

    /// Sockets successfully opened
    pub fn connections(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    pub fn reconnections(&self) -> u64 {
        self.reconnections_total.load(Ordering::Relaxed)
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received_total.load(Ordering::Relaxed)
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent_total.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors_total.load(Ordering::Relaxed)
    }

    pub fn heartbeats_sent(&self) -> u64 {
        self.heartbeats_sent_total.load(Ordering::Relaxed)
    }

    pub fn heartbeat_acks(&self) -> u64 {
        self.heartbeat_acks_total.load(Ordering::Relaxed)
    }

    /// IDENTIFY frames written to a socket
    pub fn identifies(&self) -> u64 {
        self.identifies_total.load(Ordering::Relaxed)
    }

    /// RESUME frames written to a socket
    pub fn resumes(&self) -> u64 {
        self.resumes_total.load(Ordering::Relaxed)
    }

    pub fn invalid_sessions(&self) -> u64 {
        self.invalid_sessions_total.load(Ordering::Relaxed)
    }

    pub fn zombie_connections(&self) -> u64 {
        self.zombie_connections_total.load(Ordering::Relaxed)
    }

    pub fn fatal_closes(&self) -> u64 {
        self.fatal_closes_total.load(Ordering::Relaxed)
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
        self.heartbeat_acks_total.fetch_add(1, Ordering::Relaxed);
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

    pub(crate) fn record_zombie(&self) {
        self.zombie_connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fatal_close(&self) {
        self.fatal_closes_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Update metrics for a specific shard, creating its entry on first use
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

    /// Snapshot of every shard's metrics, ordered by shard id
    pub fn shard_metrics(&self) -> Vec<ShardMetrics> {
        self.shard_metrics.read().values().map(|s| s.snapshot()).collect()
    }

    pub fn shard(&self, shard_id: u32) -> Option<ShardMetrics> {
        self.shard_metrics.read().get(&shard_id).map(|s| s.snapshot())
    }

    /// Shards with an open socket
    pub fn active_connections(&self) -> usize {
        self.shard_metrics
            .read()
            .values()
            .filter(|s| s.is_connected)
            .count()
    }

    pub fn ready_shards(&self) -> usize {
        self.shard_metrics
            .read()
            .values()
            .filter(|s| s.status == ShardStatus::Ready)
            .count()
    }

    /// Get a point-in-time snapshot of all metrics for export
    pub fn snapshot(&self) -> MetricsSnapshot {
        // Take the shard lock once to ensure consistency
        let shards = self.shard_metrics.read();
        let shard_snapshots: Vec<ShardMetrics> = shards.values().map(|s| s.snapshot()).collect();

        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Acquire),
            reconnections_total: self.reconnections_total.load(Ordering::Acquire),
            messages_received_total: self.messages_received_total.load(Ordering::Acquire),
            messages_sent_total: self.messages_sent_total.load(Ordering::Acquire),
            errors_total: self.errors_total.load(Ordering::Acquire),
            heartbeats_sent_total: self.heartbeats_sent_total.load(Ordering::Acquire),
            heartbeat_acks_total: self.heartbeat_acks_total.load(Ordering::Acquire),
            identifies_total: self.identifies_total.load(Ordering::Acquire),
            resumes_total: self.resumes_total.load(Ordering::Acquire),
            invalid_sessions_total: self.invalid_sessions_total.load(Ordering::Acquire),
            zombie_connections_total: self.zombie_connections_total.load(Ordering::Acquire),
            fatal_closes_total: self.fatal_closes_total.load(Ordering::Acquire),
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
    pub heartbeat_acks_total: u64,
    pub identifies_total: u64,
    pub resumes_total: u64,
    pub invalid_sessions_total: u64,
    pub zombie_connections_total: u64,
    pub fatal_closes_total: u64,
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
        metrics.record_identify();
        metrics.record_resume();
        metrics.record_resume();

        assert_eq!(metrics.connections(), 2);
        assert_eq!(metrics.reconnections(), 1);
        assert_eq!(metrics.identifies(), 1);
        assert_eq!(metrics.resumes(), 2);
        assert_eq!(metrics.fatal_closes(), 0);
    }

    #[test]
    fn test_shard_metrics_sparse_ids() {
        let metrics = Metrics::new();

        metrics.update_shard(7, |s| {
            s.is_connected = true;
            s.status = ShardStatus::Ready;
        });
        metrics.update_shard(2, |s| {
            s.is_connected = true;
            s.status = ShardStatus::Resuming;
        });

        let shards = metrics.shard_metrics();
        assert_eq!(shards.len(), 2);
        assert_eq!(shards[0].shard_id, 2);
        assert_eq!(shards[1].shard_id, 7);
        assert_eq!(metrics.active_connections(), 2);
        assert_eq!(metrics.ready_shards(), 1);

        metrics.remove_shard(7);
        assert!(metrics.shard(7).is_none());
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = Metrics::new();

        metrics.record_heartbeat();
        metrics.record_heartbeat_ack();
        metrics.record_zombie();
        metrics.update_shard(0, |s| {
            s.is_connected = true;
            s.last_connected_at = Some(Instant::now());
            s.latency = Some(Duration::from_millis(42));
        });

        let snapshot = metrics.snapshot();

        assert_eq!(snapshot.heartbeats_sent_total, 1);
        assert_eq!(snapshot.heartbeat_acks_total, 1);
        assert_eq!(snapshot.zombie_connections_total, 1);
        assert_eq!(snapshot.active_connections, 1);
        assert_eq!(snapshot.ready_shards, 0);
        assert!(snapshot.shards[0].time_since_connected.is_some());
        assert_eq!(snapshot.shards[0].latency, Some(Duration::from_millis(42)));
    }
}
