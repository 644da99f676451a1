//! Outbound frame queue enforcing the gateway's send budget.

use crate::config::RateLimitConfig;
use crate::protocol::GatewayFrame;
use std::collections::VecDeque;
use tokio::time::{Duration, Instant};

#[derive(Debug)]
struct Queued {
    frame: GatewayFrame,
    important: bool,
}

/// Result of a drain pass.
#[derive(Debug, Default)]
pub struct Drained {
    /// Frames to write to the socket, in order
    pub frames: Vec<GatewayFrame>,
    /// When the budget frees up again, if frames are still waiting on it
    pub refill_at: Option<Instant>,
}

/// Per-shard send queue with a rolling window budget.
///
/// Every transmission instant is remembered for one window, so no window of
/// `window` length ever contains more than `capacity` transmissions.
/// Important frames are queued at the head.
#[derive(Debug)]
pub struct RateLimitedSender {
    capacity: usize,
    window: Duration,
    queue: VecDeque<Queued>,
    sent: VecDeque<Instant>,
}

impl RateLimitedSender {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            capacity: config.capacity,
            window: config.window,
            queue: VecDeque::new(),
            sent: VecDeque::with_capacity(config.capacity),
        }
    }

    pub fn enqueue(&mut self, frame: GatewayFrame, important: bool) {
        let entry = Queued { frame, important };
        if important {
            self.queue.push_front(entry);
        } else {
            self.queue.push_back(entry);
        }
    }

    /// Pop every frame the budget allows at `now`.
    ///
    /// Normal frames stay queued while `allow_normal` is false; important
    /// frames always go first so they are never blocked by that.
    pub fn drain(&mut self, now: Instant, allow_normal: bool) -> Drained {
        self.expire(now);

        let mut drained = Drained::default();
        while let Some(front) = self.queue.front() {
            if !front.important && !allow_normal {
                break;
            }
            if self.sent.len() >= self.capacity {
                drained.refill_at = self.sent.front().map(|oldest| *oldest + self.window);
                break;
            }
            if let Some(entry) = self.queue.pop_front() {
                self.sent.push_back(now);
                drained.frames.push(entry.frame);
            }
        }
        drained
    }

    /// Frames still sendable in the current window.
    pub fn remaining(&self, now: Instant) -> usize {
        let in_window = self
            .sent
            .iter()
            .filter(|at| now.duration_since(**at) < self.window)
            .count();
        self.capacity.saturating_sub(in_window)
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Forget the previous socket: its queued control frames and its send log.
    ///
    /// Heartbeats, IDENTIFY and RESUME belong to the old socket. Application
    /// frames stay queued and go out once the next session is established.
    /// The budget is per socket, so the send log starts over.
    pub fn reset(&mut self) {
        self.queue.retain(|entry| !entry.important);
        self.sent.clear();
    }

    fn expire(&mut self, now: Instant) {
        while let Some(oldest) = self.sent.front() {
            if now.duration_since(*oldest) >= self.window {
                self.sent.pop_front();
            } else {
                break;
            }
        }
    }
}
