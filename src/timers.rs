//! Per-shard deadlines kept in one owned collection.
//!
//! The driver sleeps until [`Timers::next_deadline`] and then hands the
//! expired kinds back to the state machine one at a time, so a timer that
//! tears the connection down clears the rest before they can fire.

use std::collections::HashMap;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// HELLO must arrive after connecting
    Hello,
    /// READY must arrive after IDENTIFY
    ReadyDispatch,
    /// RESUMED must arrive after RESUME (refreshed while replay traffic flows)
    ResumedDispatch,
    /// Give up waiting for GUILD_CREATE and report fully ready
    GuildReady,
    /// Next periodic heartbeat
    Heartbeat,
    /// Rate limit window has room again
    RateLimitRefill,
    /// Socket did not confirm closure
    WsClose,
}

#[derive(Debug, Default)]
pub struct Timers {
    deadlines: HashMap<TimerKind, Instant>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) `kind` to fire `after` from `now`.
    pub fn arm(&mut self, kind: TimerKind, now: Instant, after: Duration) {
        self.arm_at(kind, now + after);
    }

    pub fn arm_at(&mut self, kind: TimerKind, deadline: Instant) {
        self.deadlines.insert(kind, deadline);
    }

    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        self.deadlines.remove(&kind).is_some()
    }

    pub fn clear(&mut self) {
        self.deadlines.clear();
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.deadlines.contains_key(&kind)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Remove and return the earliest timer due at `now`, with its deadline.
    pub fn pop_expired(&mut self, now: Instant) -> Option<(TimerKind, Instant)> {
        let (kind, deadline) = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .min_by_key(|(_, deadline)| **deadline)
            .map(|(kind, deadline)| (*kind, *deadline))?;
        self.deadlines.remove(&kind);
        Some((kind, deadline))
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pop_expired_in_deadline_order() {
        let now = Instant::now();
        let mut timers = Timers::new();
        timers.arm(TimerKind::Heartbeat, now, Duration::from_secs(3));
        timers.arm(TimerKind::Hello, now, Duration::from_secs(1));
        timers.arm(TimerKind::GuildReady, now, Duration::from_secs(10));

        let later = now + Duration::from_secs(5);
        assert_eq!(
            timers.pop_expired(later),
            Some((TimerKind::Hello, now + Duration::from_secs(1)))
        );
        assert_eq!(
            timers.pop_expired(later).map(|(kind, _)| kind),
            Some(TimerKind::Heartbeat)
        );
        assert_eq!(timers.pop_expired(later), None);
        assert!(timers.is_armed(TimerKind::GuildReady));
    }

    #[test]
    fn test_rearm_replaces_deadline() {
        let now = Instant::now();
        let mut timers = Timers::new();
        timers.arm(TimerKind::ResumedDispatch, now, Duration::from_secs(20));
        timers.arm(TimerKind::ResumedDispatch, now, Duration::from_secs(40));

        assert_eq!(timers.len(), 1);
        assert_eq!(timers.next_deadline(), Some(now + Duration::from_secs(40)));
    }

    #[test]
    fn test_clear_drops_everything() {
        let now = Instant::now();
        let mut timers = Timers::new();
        timers.arm(TimerKind::Heartbeat, now, Duration::ZERO);
        timers.arm(TimerKind::WsClose, now, Duration::ZERO);
        timers.clear();

        assert!(timers.is_empty());
        assert_eq!(timers.pop_expired(now), None);
        assert_eq!(timers.next_deadline(), None);
    }

    #[test]
    fn test_cancel() {
        let now = Instant::now();
        let mut timers = Timers::new();
        timers.arm(TimerKind::ReadyDispatch, now, Duration::from_secs(20));
        assert!(timers.cancel(TimerKind::ReadyDispatch));
        assert!(!timers.cancel(TimerKind::ReadyDispatch));
    }
}
