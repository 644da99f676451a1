//! Resumable session state and its persistence seam.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// What a shard needs to resume after a drop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Set by READY, cleared only when a new session is required
    pub session_id: Option<String>,
    /// Highest sequence seen on the open socket, `-1` when none
    pub sequence: i64,
    /// Last sequence of the previous socket, sent with RESUME
    pub close_sequence: i64,
    /// `resume_gateway_url` from READY
    pub resume_url: Option<String>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            session_id: None,
            sequence: -1,
            close_sequence: 0,
            resume_url: None,
        }
    }
}

/// How the next HELLO is answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionIntent {
    NewSession,
    ResumeSession { session_id: String, seq: i64 },
}

impl Session {
    pub fn intent(&self) -> SessionIntent {
        match &self.session_id {
            Some(session_id) => SessionIntent::ResumeSession {
                session_id: session_id.clone(),
                seq: self.resume_sequence(),
            },
            None => SessionIntent::NewSession,
        }
    }

    /// Sequence to resume from: the live one if the socket saw dispatches, else the frozen one.
    pub fn resume_sequence(&self) -> i64 {
        if self.sequence >= 0 {
            self.sequence.max(self.close_sequence)
        } else {
            self.close_sequence
        }
    }

    /// Apply a frame's `s`, never moving backwards.
    pub fn observe(&mut self, seq: i64) {
        if seq > self.sequence {
            self.sequence = seq;
        }
    }

    /// Freeze the sequence when a socket goes away.
    pub fn freeze(&mut self) {
        if self.sequence != -1 {
            self.close_sequence = self.sequence;
        }
    }

    /// Forget the session so the next handshake identifies.
    pub fn reset(&mut self) {
        self.sequence = -1;
        self.session_id = None;
        self.resume_url = None;
    }
}

/// Persists sessions across reconnects and restarts.
pub trait SessionStore: Send + Sync + 'static {
    fn get(&self, shard_id: u32) -> Option<Session>;

    fn put(&self, shard_id: u32, session: Session);
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<u32, Session>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl SessionStore for InMemorySessionStore {
    fn get(&self, shard_id: u32) -> Option<Session> {
        self.sessions.get(&shard_id).map(|entry| entry.value().clone())
    }

    fn put(&self, shard_id: u32, session: Session) {
        self.sessions.insert(shard_id, session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_never_decreases() {
        let mut session = Session::default();
        session.observe(5);
        session.observe(3);
        session.observe(9);
        session.observe(9);
        assert_eq!(session.sequence, 9);
    }

    #[test]
    fn test_intent_after_close_uses_frozen_sequence() {
        let mut session = Session {
            session_id: Some("abc".into()),
            ..Default::default()
        };
        session.observe(42);
        session.freeze();
        session.sequence = -1;

        assert_eq!(
            session.intent(),
            SessionIntent::ResumeSession { session_id: "abc".into(), seq: 42 }
        );
    }

    #[test]
    fn test_reset_requires_identify() {
        let mut session = Session {
            session_id: Some("abc".into()),
            sequence: 10,
            close_sequence: 8,
            resume_url: Some("wss://resume".into()),
        };
        session.reset();

        assert_eq!(session.intent(), SessionIntent::NewSession);
        assert_eq!(session.sequence, -1);
        assert_eq!(session.close_sequence, 8);
    }

    #[test]
    fn test_freeze_ignores_unset_sequence() {
        let mut session = Session { close_sequence: 7, ..Default::default() };
        session.freeze();
        assert_eq!(session.close_sequence, 7);
    }

    #[test]
    fn test_in_memory_store() {
        let store = InMemorySessionStore::new();
        assert!(store.get(3).is_none());

        store.put(3, Session { session_id: Some("s".into()), ..Default::default() });
        assert_eq!(store.get(3).and_then(|s| s.session_id).as_deref(), Some("s"));
        assert_eq!(store.len(), 1);
    }
}
