use crate::shard::ShardStatus;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Metrics for observability
///
/// Counters are shared by every shard that was given the same `Arc<Metrics>`.
/// Use `snapshot()` to get a point-in-time view of all metrics, or use
/// individual getter methods for specific values.
///
/// # Example
/// ```ignore
/// let metrics = connection.metrics();
///
/// println!("Identifies: {}", metrics.identifies());
/// println!("Heartbeats acked: {}", metrics.heartbeats_acked());
///
/// let snapshot = metrics.snapshot();
/// ```
#[derive(Debug, Default)]
pub struct Metrics {
    connections_total: AtomicU64,
    reconnections_total: AtomicU64,
    identifies_total: AtomicU64,
    resumes_total: AtomicU64,
    invalid_sessions_total: AtomicU64,
    heartbeats_sent_total: AtomicU64,
    heartbeats_acked_total: AtomicU64,
    heartbeat_timeouts_total: AtomicU64,
    frames_received_total: AtomicU64,
    frames_sent_total: AtomicU64,
    dispatches_total: AtomicU64,
    decode_errors_total: AtomicU64,
    member_requests_total: AtomicU64,
    member_requests_completed_total: AtomicU64,
    errors_total: AtomicU64,

    /// Per-shard gauges, indexed by shard id
    shard_metrics: RwLock<Vec<ShardMetrics>>,
}

/// Gauges for a single shard
#[derive(Debug, Clone)]
pub struct ShardMetrics {
    pub shard_id: u32,
    pub status: ShardStatus,
    pub is_connected: bool,
    /// Round trip of the last acknowledged heartbeat
    pub latency: Option<Duration>,
    /// Last sequence number seen
    pub sequence: u64,
    /// Connection attempts since the last READY
    pub connect_attempts: u32,
    /// Duration since last successful connection (None if never connected)
    pub time_since_connected: Option<Duration>,
    /// Duration since the last inbound frame (None if no frames)
    pub time_since_last_frame: Option<Duration>,
    pub total_uptime: Duration,
    #[doc(hidden)]
    pub(crate) last_connected_at: Option<Instant>,
    #[doc(hidden)]
    pub(crate) last_frame_at: Option<Instant>,
}

impl Default for ShardMetrics {
    fn default() -> Self {
        Self {
            shard_id: 0,
            status: ShardStatus::Disconnected,
            is_connected: false,
            latency: None,
            sequence: 0,
            connect_attempts: 0,
            time_since_connected: None,
            time_since_last_frame: None,
            total_uptime: Duration::ZERO,
            last_connected_at: None,
            last_frame_at: None,
        }
    }
}

impl ShardMetrics {
    /// Create a snapshot with computed durations
    fn snapshot(&self) -> ShardMetrics {
        ShardMetrics {
            time_since_connected: self.last_connected_at.map(|t| t.elapsed()),
            time_since_last_frame: self.last_frame_at.map(|t| t.elapsed()),
            ..self.clone()
        }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Getters ==========

    pub fn connections(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    pub fn reconnections(&self) -> u64 {
        self.reconnections_total.load(Ordering::Relaxed)
    }

    pub fn identifies(&self) -> u64 {
        self.identifies_total.load(Ordering::Relaxed)
    }

    pub fn resumes(&self) -> u64 {
        self.resumes_total.load(Ordering::Relaxed)
    }

    pub fn invalid_sessions(&self) -> u64 {
        self.invalid_sessions_total.load(Ordering::Relaxed)
    }

    pub fn heartbeats_sent(&self) -> u64 {
        self.heartbeats_sent_total.load(Ordering::Relaxed)
    }

    pub fn heartbeats_acked(&self) -> u64 {
        self.heartbeats_acked_total.load(Ordering::Relaxed)
    }

    pub fn heartbeat_timeouts(&self) -> u64 {
        self.heartbeat_timeouts_total.load(Ordering::Relaxed)
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received_total.load(Ordering::Relaxed)
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent_total.load(Ordering::Relaxed)
    }

    pub fn dispatches(&self) -> u64 {
        self.dispatches_total.load(Ordering::Relaxed)
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors_total.load(Ordering::Relaxed)
    }

    pub fn member_requests(&self) -> u64 {
        self.member_requests_total.load(Ordering::Relaxed)
    }

    pub fn member_requests_completed(&self) -> u64 {
        self.member_requests_completed_total.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors_total.load(Ordering::Relaxed)
    }

    // ========== Recording methods (called internally) ==========

    pub(crate) fn record_connection(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnection(&self) {
        self.reconnections_total.fetch_add(1, Ordering::Relaxed);
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

    pub(crate) fn record_heartbeat_sent(&self) {
        self.heartbeats_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_heartbeat_ack(&self) {
        self.heartbeats_acked_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_heartbeat_timeout(&self) {
        self.heartbeat_timeouts_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_frame_received(&self) {
        self.frames_received_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_frame_sent(&self) {
        self.frames_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dispatch(&self) {
        self.dispatches_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_decode_error(&self) {
        self.decode_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_member_request(&self) {
        self.member_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_member_request_completed(&self) {
        self.member_requests_completed_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Update metrics for a specific shard
    pub(crate) fn update_shard(&self, shard_id: u32, update_fn: impl FnOnce(&mut ShardMetrics)) {
        let mut shards = self.shard_metrics.write();
        let index = shard_id as usize;

        while shards.len() <= index {
            let id = shards.len() as u32;
            shards.push(ShardMetrics {
                shard_id: id,
                ..Default::default()
            });
        }

        update_fn(&mut shards[index]);
    }

    /// Get a snapshot of all shard metrics with computed durations
    pub fn shard_metrics(&self) -> Vec<ShardMetrics> {
        self.shard_metrics.read().iter().map(|s| s.snapshot()).collect()
    }

    /// Snapshot of one shard, if it has reported anything yet
    pub fn shard(&self, shard_id: u32) -> Option<ShardMetrics> {
        self.shard_metrics
            .read()
            .get(shard_id as usize)
            .map(|s| s.snapshot())
    }

    pub fn active_connections(&self) -> usize {
        self.shard_metrics
            .read()
            .iter()
            .filter(|s| s.is_connected)
            .count()
    }

    /// Get a point-in-time snapshot of all metrics for export
    pub fn snapshot(&self) -> MetricsSnapshot {
        // Take the shard lock once to ensure consistency
        let shards = self.shard_metrics.read();
        let shard_snapshots: Vec<ShardMetrics> = shards.iter().map(|s| s.snapshot()).collect();

        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Acquire),
            reconnections_total: self.reconnections_total.load(Ordering::Acquire),
            identifies_total: self.identifies_total.load(Ordering::Acquire),
            resumes_total: self.resumes_total.load(Ordering::Acquire),
            invalid_sessions_total: self.invalid_sessions_total.load(Ordering::Acquire),
            heartbeats_sent_total: self.heartbeats_sent_total.load(Ordering::Acquire),
            heartbeats_acked_total: self.heartbeats_acked_total.load(Ordering::Acquire),
            heartbeat_timeouts_total: self.heartbeat_timeouts_total.load(Ordering::Acquire),
            frames_received_total: self.frames_received_total.load(Ordering::Acquire),
            frames_sent_total: self.frames_sent_total.load(Ordering::Acquire),
            dispatches_total: self.dispatches_total.load(Ordering::Acquire),
            decode_errors_total: self.decode_errors_total.load(Ordering::Acquire),
            member_requests_total: self.member_requests_total.load(Ordering::Acquire),
            member_requests_completed_total: self
                .member_requests_completed_total
                .load(Ordering::Acquire),
            errors_total: self.errors_total.load(Ordering::Acquire),
            active_connections: shard_snapshots.iter().filter(|s| s.is_connected).count(),
            shards: shard_snapshots,
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub reconnections_total: u64,
    pub identifies_total: u64,
    pub resumes_total: u64,
    pub invalid_sessions_total: u64,
    pub heartbeats_sent_total: u64,
    pub heartbeats_acked_total: u64,
    pub heartbeat_timeouts_total: u64,
    pub frames_received_total: u64,
    pub frames_sent_total: u64,
    pub dispatches_total: u64,
    pub decode_errors_total: u64,
    pub member_requests_total: u64,
    pub member_requests_completed_total: u64,
    pub errors_total: u64,
    pub active_connections: usize,
    pub shards: Vec<ShardMetrics>,
}
