use tokio::time::{Duration, Instant};

/// Tracks heartbeat liveness for a single connection
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    /// Time of last heartbeat sent
    last_sent: Option<Instant>,

    /// Time of last HEARTBEAT_ACK received
    last_received: Option<Instant>,

    /// Whether the last heartbeat has been acknowledged
    acked: bool,

    /// Round trip of the last acknowledged heartbeat
    latency: Option<Duration>,
}

impl Default for HeartbeatMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatMonitor {
    /// Create a new monitor. A fresh connection counts as acknowledged.
    pub fn new() -> Self {
        Self {
            last_sent: None,
            last_received: None,
            acked: true,
            latency: None,
        }
    }

    /// Forget everything about the previous connection
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Record that we sent a heartbeat the server must acknowledge
    pub fn record_sent(&mut self) {
        self.last_sent = Some(Instant::now());
        self.acked = false;
    }

    /// Record a heartbeat sent on the server's request; it does not clear the ack flag
    pub fn record_requested(&mut self) {
        self.last_sent = Some(Instant::now());
    }

    /// Record that we received a HEARTBEAT_ACK
    pub fn record_ack(&mut self) {
        let now = Instant::now();
        self.last_received = Some(now);
        self.acked = true;
        self.latency = self.last_sent.map(|sent| now.saturating_duration_since(sent));
    }

    /// Treat the connection as alive without a round trip.
    ///
    /// Large member chunk streams can delay the ack past the next tick.
    pub fn mark_alive(&mut self) {
        self.acked = true;
    }

    /// Whether the last heartbeat has been acknowledged
    pub fn is_acked(&self) -> bool {
        self.acked
    }

    /// Latency of the last acknowledged heartbeat, if any
    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    /// Latency in milliseconds, `f64::INFINITY` when unknown
    pub fn latency_ms(&self) -> f64 {
        self.latency
            .map(|l| l.as_micros() as f64 / 1000.0)
            .unwrap_or(f64::INFINITY)
    }

    pub fn last_sent(&self) -> Option<Instant> {
        self.last_sent
    }

    pub fn last_received(&self) -> Option<Instant> {
        self.last_received
    }
}
