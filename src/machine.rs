//! Per-shard gateway state machine.
//!
//! [`ShardMachine`] owns the session, heartbeat bookkeeping, timers and the
//! outbound queue of one shard, but never touches a socket. The connection
//! driver feeds it [`Input`]s together with the current instant and executes
//! the returned [`Effect`]s in order. Timer expiry is pulled by the driver
//! through [`ShardMachine::poll_timers`].

use crate::config::FleetConfig;
use crate::error::{Error, HandshakeStage};
use crate::event::{CloseEvent, LifecycleEvent, ShardEvent};
use crate::health::HeartbeatState;
use crate::protocol::{
    classify_close, CloseClass, GatewayFrame, HelloPayload, IdentifyPayload, OpCode, ReadyPayload,
    ResumePayload, CLOSE_NORMAL, CLOSE_RECONNECT, CLOSE_SESSION_TIMEOUT,
};
use crate::ratelimit::RateLimitedSender;
use crate::session::{Session, SessionIntent};
use crate::shard::ShardStatus;
use crate::timers::{TimerKind, Timers};
use serde_json::Value;
use std::collections::HashSet;
use std::mem;
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How a shard should be torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestroyOptions {
    /// Close code sent to the gateway
    pub close_code: u16,
    /// Forget the session so the next connection identifies
    pub reset: bool,
    /// Connect again once the socket is gone
    pub reconnect: bool,
}

impl Default for DestroyOptions {
    fn default() -> Self {
        Self::terminal()
    }
}

impl DestroyOptions {
    /// Close for good.
    pub fn terminal() -> Self {
        Self {
            close_code: CLOSE_NORMAL,
            reset: false,
            reconnect: false,
        }
    }

    /// Close with `close_code` and connect again.
    pub fn reconnect(close_code: u16) -> Self {
        Self {
            close_code,
            reset: false,
            reconnect: true,
        }
    }

    pub fn with_reset(mut self) -> Self {
        self.reset = true;
        self
    }
}

/// Everything that can happen to a shard.
#[derive(Debug, Clone)]
pub enum Input {
    /// A connection attempt starts; `stored` is what the session store holds
    Connect { stored: Option<Session> },
    SocketOpened,
    Frame(GatewayFrame),
    /// The identify coordinator granted this shard's bucket
    IdentifyGranted,
    Send { frame: GatewayFrame, important: bool },
    SocketClosed(CloseEvent),
    /// An inbound payload could not be decompressed
    DecodeFailed(String),
    Destroy(DestroyOptions),
}

/// What the driver must do, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Transmit(GatewayFrame),
    /// Start waiting on the identify coordinator
    RequestIdentify,
    /// Abandon a pending identify wait
    CancelIdentify,
    /// Drop a held identify lease
    ReleaseIdentify,
    CloseSocket { code: u16 },
    PersistSession(Session),
    Emit(ShardEvent),
}

/// Why the current socket went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Gateway sent RECONNECT
    Requested,
    /// Gateway closed the socket
    Remote,
    Transport(String),
    Zombie,
    HandshakeTimeout(HandshakeStage),
    Decode(String),
    Protocol(String),
}

/// What the driver does after the socket is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Reconnect,
    /// Authentication or configuration failure; never retried
    Fatal { code: u16, reason: String },
    Stop,
}

#[derive(Debug)]
pub struct ShardMachine {
    shard_id: u32,
    shard_count: u32,
    config: Arc<FleetConfig>,
    status: ShardStatus,
    session: Session,
    heartbeat: HeartbeatState,
    timers: Timers,
    sender: RateLimitedSender,
    expected_guilds: HashSet<String>,
    socket_open: bool,
    /// The close of the current socket has been reported
    close_emitted: bool,
    /// Set once a local destroy started closing the socket
    closing: Option<DestroyOptions>,
    identify_pending: bool,
    last_frame_at: Option<Instant>,
    last_close: Option<CloseEvent>,
    reason: Option<DisconnectReason>,
    disposition: Option<Disposition>,
    out: Vec<Effect>,
}

impl ShardMachine {
    pub fn new(shard_id: u32, shard_count: u32, config: Arc<FleetConfig>) -> Self {
        let sender = RateLimitedSender::new(&config.rate_limit);
        Self {
            shard_id,
            shard_count,
            config,
            status: ShardStatus::Idle,
            session: Session::default(),
            heartbeat: HeartbeatState::new(),
            timers: Timers::new(),
            sender,
            expected_guilds: HashSet::new(),
            socket_open: false,
            close_emitted: false,
            closing: None,
            identify_pending: false,
            last_frame_at: None,
            last_close: None,
            reason: None,
            disposition: None,
            out: Vec::new(),
        }
    }

    /// Apply one input and return the resulting effects.
    pub fn handle(&mut self, input: Input, now: Instant) -> Vec<Effect> {
        match input {
            Input::Connect { stored } => self.on_connect(stored, now),
            Input::SocketOpened => self.on_open(),
            Input::Frame(frame) => self.on_frame(frame, now),
            Input::IdentifyGranted => self.on_identify_granted(now),
            Input::Send { frame, important } => self.on_send(frame, important),
            Input::SocketClosed(event) => self.on_close(event),
            Input::DecodeFailed(message) => self.on_decode_failed(message, now),
            Input::Destroy(opts) => self.destroy(opts, now),
        }
        self.flush(now);
        mem::take(&mut self.out)
    }

    /// Fire every timer due at `now`, earliest first.
    pub fn poll_timers(&mut self, now: Instant) -> Vec<Effect> {
        while let Some((kind, deadline)) = self.timers.pop_expired(now) {
            self.on_timer(kind, deadline, now);
        }
        self.flush(now);
        mem::take(&mut self.out)
    }

    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    pub fn status(&self) -> ShardStatus {
        self.status
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn latency(&self) -> Option<Duration> {
        self.heartbeat.latency()
    }

    /// The current socket is done and its close has been reported.
    pub fn socket_finished(&self) -> bool {
        self.close_emitted
    }

    pub fn disposition(&self) -> Option<&Disposition> {
        self.disposition.as_ref()
    }

    pub fn last_close(&self) -> Option<&CloseEvent> {
        self.last_close.as_ref()
    }

    pub fn disconnect_reason(&self) -> Option<&DisconnectReason> {
        self.reason.as_ref()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// URL to resume against, when a resumable session is held.
    pub fn resume_url(&self) -> Option<&str> {
        self.session.session_id.as_ref()?;
        self.session.resume_url.as_deref()
    }

    /// Frames waiting in the outbound queue.
    pub fn queued(&self) -> usize {
        self.sender.queued()
    }

    /// The error a pending `connect()` is rejected with after a close.
    pub fn close_error(&self) -> Error {
        if let Some(Disposition::Fatal { code, reason }) = &self.disposition {
            return Error::FatalClose {
                code: *code,
                reason: reason.clone(),
            };
        }
        match &self.reason {
            Some(DisconnectReason::Zombie) => Error::ZombieConnection,
            Some(DisconnectReason::HandshakeTimeout(stage)) => Error::HandshakeTimeout { stage: *stage },
            Some(DisconnectReason::Transport(message)) => Error::Transport(message.clone()),
            Some(DisconnectReason::Decode(message)) => Error::Decompression(message.clone()),
            Some(DisconnectReason::Protocol(message)) => Error::ProtocolViolation(message.clone()),
            _ => {
                let (code, reason) = self
                    .last_close
                    .as_ref()
                    .map(|close| (close.code, close.reason.clone()))
                    .unwrap_or((CLOSE_NORMAL, String::new()));
                Error::Closed { code, reason }
            }
        }
    }

    fn on_connect(&mut self, stored: Option<Session>, now: Instant) {
        if self.status == ShardStatus::Destroyed {
            warn!("[SHARD-{}] Ignoring connect on a destroyed shard", self.shard_id);
            return;
        }
        if let Some(stored) = stored {
            self.session = stored;
        }
        self.session.freeze();
        self.session.sequence = -1;

        self.status = if self.status == ShardStatus::Idle {
            ShardStatus::Connecting
        } else {
            ShardStatus::Reconnecting
        };
        self.heartbeat = HeartbeatState::new();
        self.timers.clear();
        self.sender.reset();
        self.expected_guilds.clear();
        self.socket_open = false;
        self.close_emitted = false;
        self.closing = None;
        self.identify_pending = false;
        self.last_frame_at = None;
        self.reason = None;
        self.disposition = None;

        self.timers
            .arm(TimerKind::Hello, now, self.config.connection.handshake_timeout);
    }

    fn on_open(&mut self) {
        self.socket_open = true;
        self.status = ShardStatus::Nearly;
        debug!("[SHARD-{}] Socket open, waiting for HELLO", self.shard_id);
    }

    fn on_frame(&mut self, frame: GatewayFrame, now: Instant) {
        if !self.socket_open || self.closing.is_some() {
            return;
        }
        self.last_frame_at = Some(now);
        if let Some(seq) = frame.s {
            self.session.observe(seq);
        }
        self.emit(ShardEvent::Raw(frame.clone()));

        match frame.op {
            OpCode::Hello => self.on_hello(frame.d, now),
            OpCode::HeartbeatAck => {
                self.heartbeat.record_ack(now);
                debug!(
                    "[SHARD-{}] Heartbeat acknowledged ({:?})",
                    self.shard_id,
                    self.heartbeat.latency()
                );
            }
            OpCode::Heartbeat => {
                debug!("[SHARD-{}] Gateway requested a heartbeat", self.shard_id);
                self.send_heartbeat(now);
            }
            OpCode::Reconnect => {
                info!("[SHARD-{}] Gateway requested reconnect", self.shard_id);
                self.reason = Some(DisconnectReason::Requested);
                self.destroy(DestroyOptions::reconnect(CLOSE_RECONNECT), now);
            }
            OpCode::InvalidSession => self.on_invalid_session(frame.d.as_bool().unwrap_or(false), now),
            OpCode::Dispatch => {
                let name = frame.t.unwrap_or_default();
                self.emit(ShardEvent::Dispatch {
                    name: name.clone(),
                    data: frame.d.clone(),
                });
                match name.as_str() {
                    "READY" => self.on_ready(frame.d, now),
                    "RESUMED" => self.on_resumed(now),
                    "GUILD_CREATE" if self.status == ShardStatus::WaitingForGuilds => {
                        self.on_guild_create(&frame.d)
                    }
                    _ => {}
                }
            }
            other => warn!("[SHARD-{}] Unexpected inbound opcode {:?}", self.shard_id, other),
        }
    }

    fn on_hello(&mut self, d: Value, now: Instant) {
        if self.heartbeat.interval().is_some() {
            warn!("[SHARD-{}] Duplicate HELLO ignored", self.shard_id);
            return;
        }
        let interval = match serde_json::from_value::<HelloPayload>(d) {
            Ok(hello) if hello.heartbeat_interval > 0 => Duration::from_millis(hello.heartbeat_interval),
            Ok(_) => return self.protocol_violation("HELLO with zero heartbeat interval".into(), now),
            Err(e) => return self.protocol_violation(format!("malformed HELLO: {}", e), now),
        };

        self.timers.cancel(TimerKind::Hello);
        self.heartbeat.set_interval(interval);
        let first = HeartbeatState::first_beat_delay(interval, self.config.heartbeat.jitter);
        self.timers.arm(TimerKind::Heartbeat, now, first);
        debug!(
            "[SHARD-{}] HELLO: heartbeat every {:?}, first in {:?}",
            self.shard_id, interval, first
        );

        self.begin_handshake(now);
    }

    fn begin_handshake(&mut self, now: Instant) {
        match self.session.intent() {
            SessionIntent::ResumeSession { session_id, seq } => {
                info!(
                    "[SHARD-{}] Resuming session {} at sequence {}",
                    self.shard_id, session_id, seq
                );
                self.status = ShardStatus::Resuming;
                let payload = ResumePayload {
                    token: self.config.token.clone(),
                    session_id,
                    seq,
                };
                self.sender.enqueue(GatewayFrame::resume(&payload), true);
                self.timers
                    .arm(TimerKind::ResumedDispatch, now, self.config.connection.handshake_timeout);
            }
            SessionIntent::NewSession => {
                self.status = ShardStatus::Identifying;
                self.request_identify();
            }
        }
    }

    fn request_identify(&mut self) {
        if !self.identify_pending {
            self.identify_pending = true;
            self.out.push(Effect::RequestIdentify);
        }
    }

    fn on_identify_granted(&mut self, now: Instant) {
        if !self.identify_pending {
            debug!("[SHARD-{}] Stale identify grant released", self.shard_id);
            self.out.push(Effect::ReleaseIdentify);
            return;
        }
        self.identify_pending = false;
        if !self.socket_open || self.closing.is_some() {
            self.out.push(Effect::ReleaseIdentify);
            return;
        }

        let identify = &self.config.identify;
        let payload = IdentifyPayload {
            token: self.config.token.clone(),
            intents: self.config.intents,
            properties: identify.properties.clone(),
            shard: [self.shard_id, self.shard_count],
            compress: None,
            large_threshold: identify.large_threshold,
            presence: identify.presence.clone(),
        };
        info!(
            "[SHARD-{}] Identifying as shard {}/{}",
            self.shard_id, self.shard_id, self.shard_count
        );
        self.status = ShardStatus::Identifying;
        self.sender.enqueue(GatewayFrame::identify(&payload), true);
        self.timers
            .arm(TimerKind::ReadyDispatch, now, self.config.connection.handshake_timeout);
    }

    fn on_ready(&mut self, d: Value, now: Instant) {
        let ready = match serde_json::from_value::<ReadyPayload>(d) {
            Ok(ready) => ready,
            Err(e) => return self.protocol_violation(format!("malformed READY: {}", e), now),
        };
        self.timers.cancel(TimerKind::ReadyDispatch);
        self.identify_pending = false;
        self.out.push(Effect::ReleaseIdentify);

        self.status = ShardStatus::WaitingForGuilds;
        self.session.session_id = Some(ready.session_id.clone());
        self.session.resume_url = ready.resume_gateway_url.clone();
        self.expected_guilds = ready.guild_ids();
        info!(
            "[SHARD-{}] READY (session {}, {} guilds expected)",
            self.shard_id,
            ready.session_id,
            self.expected_guilds.len()
        );
        self.emit(ShardEvent::Lifecycle(LifecycleEvent::Ready {
            session_id: ready.session_id,
            expected_guilds: self.expected_guilds.len(),
        }));
        self.persist();

        self.heartbeat.mark_acked();
        self.send_heartbeat(now);
        self.check_ready(now);
    }

    fn on_resumed(&mut self, now: Instant) {
        self.timers.cancel(TimerKind::ResumedDispatch);
        self.status = ShardStatus::Ready;
        let replayed = (self.session.sequence - self.session.close_sequence).max(0);
        info!("[SHARD-{}] RESUMED, {} events replayed", self.shard_id, replayed);
        self.emit(ShardEvent::Lifecycle(LifecycleEvent::Resumed { replayed }));
        self.persist();

        self.heartbeat.mark_acked();
        self.send_heartbeat(now);
    }

    fn on_guild_create(&mut self, d: &Value) {
        let Some(id) = d.get("id").and_then(Value::as_str) else {
            return;
        };
        if self.expected_guilds.remove(id) && self.expected_guilds.is_empty() {
            self.all_ready(None);
        }
    }

    fn check_ready(&mut self, now: Instant) {
        if self.expected_guilds.is_empty() {
            self.all_ready(None);
            return;
        }
        let wait = if self.config.wants_guilds() {
            self.config.connection.guild_ready_timeout
        } else {
            Duration::ZERO
        };
        self.timers.arm(TimerKind::GuildReady, now, wait);
    }

    fn all_ready(&mut self, unavailable: Option<HashSet<String>>) {
        self.timers.cancel(TimerKind::GuildReady);
        self.status = ShardStatus::Ready;
        match &unavailable {
            Some(missing) if !missing.is_empty() => warn!(
                "[SHARD-{}] Ready with {} guilds unavailable",
                self.shard_id,
                missing.len()
            ),
            _ => info!("[SHARD-{}] All guilds received, shard ready", self.shard_id),
        }
        self.emit(ShardEvent::Lifecycle(LifecycleEvent::AllReady { unavailable }));
    }

    fn on_invalid_session(&mut self, resumable: bool, now: Instant) {
        self.timers.cancel(TimerKind::ReadyDispatch);
        self.timers.cancel(TimerKind::ResumedDispatch);
        self.timers.cancel(TimerKind::GuildReady);

        if resumable {
            info!("[SHARD-{}] Session invalidated, resumable", self.shard_id);
            self.begin_handshake(now);
            return;
        }

        warn!("[SHARD-{}] Session invalidated, starting a new one", self.shard_id);
        self.session.reset();
        self.status = ShardStatus::Reconnecting;
        self.persist();
        self.emit(ShardEvent::Lifecycle(LifecycleEvent::InvalidSession));
        self.request_identify();
    }

    fn on_send(&mut self, frame: GatewayFrame, important: bool) {
        if self.status == ShardStatus::Destroyed {
            warn!("[SHARD-{}] Dropping {:?} frame, shard destroyed", self.shard_id, frame.op);
            return;
        }
        self.sender.enqueue(frame, important);
    }

    fn on_decode_failed(&mut self, message: String, now: Instant) {
        warn!("[SHARD-{}] Failed to decode inbound payload: {}", self.shard_id, message);
        self.reason = Some(DisconnectReason::Decode(message));
        self.destroy(DestroyOptions::reconnect(CLOSE_RECONNECT), now);
    }

    fn protocol_violation(&mut self, message: String, now: Instant) {
        warn!("[SHARD-{}] Protocol violation: {}", self.shard_id, message);
        self.reason = Some(DisconnectReason::Protocol(message));
        self.destroy(DestroyOptions::reconnect(CLOSE_RECONNECT), now);
    }

    fn send_heartbeat(&mut self, now: Instant) {
        self.heartbeat.record_sent(now);
        self.sender
            .enqueue(GatewayFrame::heartbeat(self.session.sequence), true);
    }

    fn on_timer(&mut self, kind: TimerKind, deadline: Instant, now: Instant) {
        let handshake_timeout = self.config.connection.handshake_timeout;
        match kind {
            TimerKind::Heartbeat => {
                if !self.heartbeat.is_acked() && !self.status.tolerates_missing_ack() {
                    warn!(
                        "[SHARD-{}] Heartbeat not acknowledged, zombie connection",
                        self.shard_id
                    );
                    self.reason = Some(DisconnectReason::Zombie);
                    self.destroy(DestroyOptions::reconnect(CLOSE_SESSION_TIMEOUT).with_reset(), now);
                    return;
                }
                self.send_heartbeat(now);
                if let Some(interval) = self.heartbeat.interval() {
                    let next = deadline + interval;
                    if next > now {
                        self.timers.arm_at(TimerKind::Heartbeat, next);
                    } else {
                        self.timers.arm(TimerKind::Heartbeat, now, interval);
                    }
                }
            }
            TimerKind::Hello => self.handshake_timed_out(HandshakeStage::Hello, true, now),
            TimerKind::ReadyDispatch => self.handshake_timed_out(HandshakeStage::Ready, true, now),
            TimerKind::ResumedDispatch => {
                if let Some(last) = self.last_frame_at {
                    if now.saturating_duration_since(last) < handshake_timeout {
                        debug!("[SHARD-{}] Replay still flowing, extending RESUMED wait", self.shard_id);
                        self.timers.arm_at(TimerKind::ResumedDispatch, last + handshake_timeout);
                        return;
                    }
                }
                self.handshake_timed_out(HandshakeStage::Resumed, false, now);
            }
            TimerKind::GuildReady => {
                if self.status == ShardStatus::WaitingForGuilds {
                    let missing = mem::take(&mut self.expected_guilds);
                    self.all_ready(Some(missing));
                }
            }
            // draining happens in flush
            TimerKind::RateLimitRefill => {}
            TimerKind::WsClose => {
                if !self.close_emitted {
                    warn!("[SHARD-{}] Socket did not confirm close, forcing it", self.shard_id);
                    if self.reason.is_none() {
                        self.reason = Some(DisconnectReason::Transport("close not confirmed".into()));
                    }
                    self.on_close(CloseEvent::unconfirmed());
                }
            }
        }
    }

    fn handshake_timed_out(&mut self, stage: HandshakeStage, reset: bool, now: Instant) {
        warn!("[SHARD-{}] Timed out waiting for {}", self.shard_id, stage);
        self.reason = Some(DisconnectReason::HandshakeTimeout(stage));
        let mut opts = DestroyOptions::reconnect(CLOSE_SESSION_TIMEOUT);
        opts.reset = reset;
        self.destroy(opts, now);
    }

    fn destroy(&mut self, opts: DestroyOptions, now: Instant) {
        if self.status == ShardStatus::Destroyed {
            return;
        }
        info!(
            "[SHARD-{}] Destroying (code {}, reset {}, reconnect {})",
            self.shard_id, opts.close_code, opts.reset, opts.reconnect
        );

        self.timers.clear();
        if self.socket_open && !self.close_emitted {
            if self.closing.is_none() {
                self.out.push(Effect::CloseSocket { code: opts.close_code });
            }
            self.timers
                .arm(TimerKind::WsClose, now, self.config.connection.close_timeout);
            self.closing = Some(opts);
        } else {
            self.disposition = Some(if opts.reconnect {
                Disposition::Reconnect
            } else {
                Disposition::Stop
            });
        }
        self.abandon_identify();

        self.status = if opts.reconnect {
            ShardStatus::Disconnected
        } else {
            ShardStatus::Destroyed
        };
        self.session.freeze();
        if opts.reset {
            self.session.reset();
        }
        self.persist();
        self.sender.reset();

        if !opts.reconnect {
            self.emit(ShardEvent::Lifecycle(LifecycleEvent::Destroyed));
        }
    }

    fn on_close(&mut self, event: CloseEvent) {
        if self.close_emitted {
            return;
        }
        self.close_emitted = true;
        self.socket_open = false;
        self.timers.clear();
        self.session.freeze();
        self.session.sequence = -1;
        self.abandon_identify();
        self.sender.reset();

        if self.reason.is_none() {
            self.reason = Some(if event.was_clean {
                DisconnectReason::Remote
            } else {
                DisconnectReason::Transport(event.reason.clone())
            });
        }

        let disposition = match self.closing {
            _ if self.status == ShardStatus::Destroyed => Disposition::Stop,
            Some(opts) if !opts.reconnect => Disposition::Stop,
            Some(_) => Disposition::Reconnect,
            None => match classify_close(event.code) {
                CloseClass::Fatal => {
                    error!(
                        "[SHARD-{}] Fatal close {}: {}",
                        self.shard_id, event.code, event.reason
                    );
                    Disposition::Fatal {
                        code: event.code,
                        reason: event.reason.clone(),
                    }
                }
                CloseClass::NewSession => {
                    self.session.reset();
                    Disposition::Reconnect
                }
                CloseClass::Resumable => Disposition::Reconnect,
            },
        };
        info!(
            "[SHARD-{}] Socket closed with {} ({}), {:?}",
            self.shard_id, event.code, event.reason, disposition
        );
        self.disposition = Some(disposition);
        if self.status != ShardStatus::Destroyed {
            self.status = ShardStatus::Disconnected;
        }
        self.persist();
        self.last_close = Some(event.clone());
        self.emit(ShardEvent::Lifecycle(LifecycleEvent::Close(event)));
    }

    fn abandon_identify(&mut self) {
        if self.identify_pending {
            self.identify_pending = false;
            self.out.push(Effect::CancelIdentify);
        }
        self.out.push(Effect::ReleaseIdentify);
    }

    fn flush(&mut self, now: Instant) {
        if !self.socket_open || self.closing.is_some() {
            return;
        }
        let drained = self
            .sender
            .drain(now, self.status.accepts_application_frames());
        self.out.extend(drained.frames.into_iter().map(Effect::Transmit));
        match drained.refill_at {
            Some(at) => self.timers.arm_at(TimerKind::RateLimitRefill, at),
            None => {
                self.timers.cancel(TimerKind::RateLimitRefill);
            }
        }
    }

    fn persist(&mut self) {
        self.out.push(Effect::PersistSession(self.session.clone()));
    }

    fn emit(&mut self, event: ShardEvent) {
        self.out.push(Effect::Emit(event));
    }
}
