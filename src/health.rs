use tokio::time::{Duration, Instant};

/// Heartbeat bookkeeping for a single connection
#[derive(Debug, Clone)]
pub struct HeartbeatState {
    /// Interval announced by HELLO
    interval: Option<Duration>,

    /// Time of last heartbeat sent
    last_sent_at: Option<Instant>,

    /// Whether the previous heartbeat was acknowledged
    acked: bool,

    /// Round trip of the last acknowledged heartbeat
    latency: Option<Duration>,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self {
            interval: None,
            last_sent_at: None,
            acked: true,
            latency: None,
        }
    }
}

impl HeartbeatState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = Some(interval);
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Record that we sent a heartbeat
    pub fn record_sent(&mut self, now: Instant) {
        self.last_sent_at = Some(now);
        self.acked = false;
    }

    /// Record a HEARTBEAT_ACK and compute the round trip
    pub fn record_ack(&mut self, now: Instant) {
        self.acked = true;
        if let Some(sent) = self.last_sent_at {
            self.latency = Some(now.saturating_duration_since(sent));
        }
    }

    /// Treat the previous beat as answered, used before forced beats.
    pub fn mark_acked(&mut self) {
        self.acked = true;
    }

    pub fn is_acked(&self) -> bool {
        self.acked
    }

    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    /// Delay before the first beat: a random fraction of the interval, or the full interval.
    pub fn first_beat_delay(interval: Duration, jitter: bool) -> Duration {
        if jitter {
            interval.mul_f64(rand::random::<f64>())
        } else {
            interval
        }
    }
}
