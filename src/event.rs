use crate::protocol::{GatewayFrame, CLOSE_ABNORMAL, CLOSE_INTERNAL_ERROR};
use serde_json::Value;
use std::collections::HashSet;

/// How a socket went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    pub code: u16,
    pub reason: String,
    /// A close frame was exchanged
    pub was_clean: bool,
}

impl CloseEvent {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            was_clean: true,
        }
    }

    /// Transport dropped without a close frame.
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            code: CLOSE_ABNORMAL,
            reason: reason.into(),
            was_clean: false,
        }
    }

    /// Synthesized when the socket never confirmed closure.
    pub fn unconfirmed() -> Self {
        Self {
            code: CLOSE_INTERNAL_ERROR,
            reason: "INTERNAL_ERROR".to_string(),
            was_clean: false,
        }
    }
}

/// Shard lifecycle notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// READY received; guilds may still be streaming in
    Ready { session_id: String, expected_guilds: usize },
    /// RESUMED received after replaying `replayed` events
    Resumed { replayed: i64 },
    /// Every READY guild arrived, or the wait timed out with `unavailable` left
    AllReady { unavailable: Option<HashSet<String>> },
    Close(CloseEvent),
    /// The gateway refused to resume; the shard starts a new session
    InvalidSession,
    Destroyed,
}

/// Everything a shard reports upward.
#[derive(Debug, Clone, PartialEq)]
pub enum ShardEvent {
    /// Every decoded inbound frame
    Raw(GatewayFrame),
    /// `op = 0` frames
    Dispatch { name: String, data: Value },
    Lifecycle(LifecycleEvent),
}
