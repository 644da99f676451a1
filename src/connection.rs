use crate::compression::{decompressor_for, Decompressor};
use crate::config::FleetConfig;
use crate::error::Error;
use crate::event::{CloseEvent, LifecycleEvent, ShardEvent};
use crate::identify::{IdentifyCoordinator, IdentifyLease};
use crate::machine::{DestroyOptions, DisconnectReason, Disposition, Effect, Input, ShardMachine};
use crate::metrics::Metrics;
use crate::protocol::{GatewayFrame, OpCode};
use crate::session::SessionStore;
use crate::shard::ShardStatus;
use futures_util::future::BoxFuture;
use futures_util::stream::SplitSink;
use futures_util::{FutureExt, SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{
    client_async_tls_with_config, tungstenite::client::IntoClientRequest, tungstenite::Message,
    Connector, MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;

/// Wake-up used when no timer is armed
const IDLE_WAKE: Duration = Duration::from_secs(60);

/// Close frame without a status code
const CLOSE_NO_STATUS: u16 = 1005;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type IdentifyWait = BoxFuture<'static, Result<IdentifyLease, Error>>;

/// Commands that can be sent to a connection
#[derive(Debug)]
pub(crate) enum ConnectionCommand {
    /// Start connecting (first call) and report when the session is up
    Connect(oneshot::Sender<Result<(), Error>>),
    /// Queue a frame through the rate limiter
    Send { frame: GatewayFrame, important: bool },
    Destroy(DestroyOptions),
}

/// Drives one shard: owns its socket and feeds the state machine.
pub(crate) struct Connection<S: SessionStore> {
    shard_id: u32,
    machine: ShardMachine,
    config: Arc<FleetConfig>,
    gateway_url: String,
    coordinator: IdentifyCoordinator,
    store: Arc<S>,
    metrics: Arc<Metrics>,
    command_rx: mpsc::Receiver<ConnectionCommand>,
    commands_open: bool,
    event_tx: mpsc::UnboundedSender<ShardEvent>,
    status_tx: watch::Sender<ShardStatus>,
    decompressor: Box<dyn Decompressor>,
    /// `connect()` callers waiting for READY or RESUMED
    pending: Vec<oneshot::Sender<Result<(), Error>>>,
    identify: Option<IdentifyWait>,
    identify_cancel: Option<CancellationToken>,
    lease: Option<IdentifyLease>,
    attempt: u32,
}

impl<S: SessionStore> Connection<S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        shard_id: u32,
        shard_count: u32,
        config: Arc<FleetConfig>,
        gateway_url: String,
        coordinator: IdentifyCoordinator,
        store: Arc<S>,
        metrics: Arc<Metrics>,
        command_rx: mpsc::Receiver<ConnectionCommand>,
        event_tx: mpsc::UnboundedSender<ShardEvent>,
        status_tx: watch::Sender<ShardStatus>,
    ) -> Self {
        Self {
            shard_id,
            machine: ShardMachine::new(shard_id, shard_count, config.clone()),
            decompressor: decompressor_for(config.compression),
            config,
            gateway_url,
            coordinator,
            store,
            metrics,
            command_rx,
            commands_open: true,
            event_tx,
            status_tx,
            pending: Vec::new(),
            identify: None,
            identify_cancel: None,
            lease: None,
            attempt: 0,
        }
    }

    /// Run the connection until destroyed or a fatal close.
    ///
    /// Stays idle until the first `Connect` command, then reconnects on
    /// every transient failure with backoff.
    pub(crate) async fn run(mut self) -> Result<(), Error> {
        loop {
            match self.command_rx.recv().await {
                Some(ConnectionCommand::Connect(reply)) => {
                    self.pending.push(reply);
                    break;
                }
                Some(command) => {
                    self.on_command(command, None).await;
                    if self.machine.status() == ShardStatus::Destroyed {
                        return Ok(());
                    }
                }
                None => return Ok(()),
            }
        }

        loop {
            self.connect_and_run().await;

            match self.machine.disposition().cloned() {
                Some(Disposition::Reconnect) => {}
                Some(Disposition::Fatal { code, reason }) => {
                    error!(
                        "[SHARD-{}] Stopping after fatal close {}: {}",
                        self.shard_id, code, reason
                    );
                    return Err(Error::FatalClose { code, reason });
                }
                Some(Disposition::Stop) | None => {
                    info!("[SHARD-{}] Connection closed gracefully", self.shard_id);
                    self.reject_pending(|id| Error::Destroyed { shard_id: id });
                    return Ok(());
                }
            }

            let delay = if self.attempt == 0 && self.machine.session().session_id.is_some() {
                Duration::ZERO
            } else {
                self.config.backoff.delay_for_attempt(self.attempt)
            };
            self.attempt = self.attempt.saturating_add(1);
            self.metrics
                .update_shard(self.shard_id, |s| s.reconnect_attempt = self.attempt);
            debug!(
                "[SHARD-{}] Reconnecting in {:?} (attempt {})",
                self.shard_id, delay, self.attempt
            );

            if !self.wait_before_reconnect(delay).await {
                info!("[SHARD-{}] Destroyed while waiting to reconnect", self.shard_id);
                return Ok(());
            }
            self.metrics.record_reconnection();
        }
    }

    /// Sleep out the backoff while still serving commands. Returns false if destroyed.
    async fn wait_before_reconnect(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return true,
                cmd = self.command_rx.recv(), if self.commands_open => {
                    match cmd {
                        Some(command) => self.on_command(command, None).await,
                        None => self.on_commands_closed(None).await,
                    }
                    if self.machine.status() == ShardStatus::Destroyed {
                        return false;
                    }
                }
            }
        }
    }

    async fn connect_and_run(&mut self) {
        let stored = self.store.get(self.shard_id);
        self.step(Input::Connect { stored }, None).await;
        self.decompressor.reset();

        let base = self.machine.resume_url().unwrap_or(&self.gateway_url);
        let url = match build_gateway_url(base, self.config.api_version, self.decompressor.query_param()) {
            Ok(url) => url,
            Err(e) => return self.connect_failed(e).await,
        };
        debug!("[SHARD-{}] Connecting to {}", self.shard_id, url);

        let ws_stream = match timeout(self.config.connection.connect_timeout, connect_socket(&url)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return self.connect_failed(e).await,
            Err(_) => {
                return self
                    .connect_failed(Error::Transport("Connection timeout".to_string()))
                    .await
            }
        };

        self.metrics.record_connection();
        self.metrics.update_shard(self.shard_id, |s| {
            s.is_connected = true;
            s.last_connected_at = Some(std::time::Instant::now());
        });
        info!("[SHARD-{}] Connected to {}", self.shard_id, url);

        let (mut write, mut read) = ws_stream.split();
        self.step(Input::SocketOpened, Some(&mut write)).await;

        while !self.machine.socket_finished() {
            let wake = self
                .machine
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + IDLE_WAKE);

            tokio::select! {
                msg = read.next() => {
                    let input = match msg {
                        Some(Ok(message)) => match self.decode(message) {
                            Some(input) => input,
                            None => continue,
                        },
                        Some(Err(e)) => {
                            warn!("[SHARD-{}] WebSocket error: {}", self.shard_id, e);
                            self.metrics.record_error();
                            Input::SocketClosed(CloseEvent::abnormal(e.to_string()))
                        }
                        None => {
                            info!("[SHARD-{}] WebSocket stream ended", self.shard_id);
                            Input::SocketClosed(CloseEvent::abnormal("stream ended"))
                        }
                    };
                    self.step(input, Some(&mut write)).await;
                }

                cmd = self.command_rx.recv(), if self.commands_open => {
                    match cmd {
                        Some(command) => self.on_command(command, Some(&mut write)).await,
                        None => self.on_commands_closed(Some(&mut write)).await,
                    }
                }

                _ = tokio::time::sleep_until(wake) => {
                    let effects = self.machine.poll_timers(Instant::now());
                    self.run_effects(effects, Some(&mut write)).await;
                }

                granted = wait_identify(&mut self.identify) => {
                    self.identify = None;
                    self.identify_cancel = None;
                    match granted {
                        Ok(lease) => {
                            self.lease = Some(lease);
                            self.step(Input::IdentifyGranted, Some(&mut write)).await;
                        }
                        Err(e) => debug!("[SHARD-{}] Identify wait ended: {}", self.shard_id, e),
                    }
                }
            }
        }

        // Dropping both halves terminates a socket that never confirmed the close
        drop(read);
        drop(write);

        self.metrics.update_shard(self.shard_id, |s| {
            s.is_connected = false;
            if let Some(connected_at) = s.last_connected_at {
                s.total_uptime += connected_at.elapsed();
            }
        });
    }

    async fn connect_failed(&mut self, error: Error) {
        warn!("[SHARD-{}] Connection failed: {}", self.shard_id, error);
        self.metrics.record_error();
        self.step(Input::SocketClosed(CloseEvent::abnormal(error.to_string())), None)
            .await;
    }

    async fn on_command(&mut self, command: ConnectionCommand, sink: Option<&mut WsSink>) {
        match command {
            ConnectionCommand::Connect(reply) => match self.machine.status() {
                ShardStatus::Ready | ShardStatus::WaitingForGuilds => {
                    let _ = reply.send(Ok(()));
                }
                ShardStatus::Destroyed => {
                    let _ = reply.send(Err(Error::Destroyed { shard_id: self.shard_id }));
                }
                _ => self.pending.push(reply),
            },
            ConnectionCommand::Send { frame, important } => {
                self.step(Input::Send { frame, important }, sink).await;
            }
            ConnectionCommand::Destroy(opts) => {
                self.step(Input::Destroy(opts), sink).await;
            }
        }
    }

    async fn on_commands_closed(&mut self, sink: Option<&mut WsSink>) {
        info!("[SHARD-{}] Command channel closed", self.shard_id);
        self.commands_open = false;
        self.step(Input::Destroy(DestroyOptions::terminal()), sink).await;
    }

    /// Turn a socket message into machine input.
    fn decode(&mut self, message: Message) -> Option<Input> {
        self.metrics.record_message_received();
        self.metrics
            .update_shard(self.shard_id, |s| s.last_message_at = Some(std::time::Instant::now()));

        match message {
            Message::Text(text) => self.parse(text.as_str()),
            Message::Binary(data) => match self.decompressor.push(&data) {
                Ok(Some(text)) => self.parse(&text),
                Ok(None) => None,
                Err(e) => {
                    self.metrics.record_error();
                    Some(Input::DecodeFailed(e.to_string()))
                }
            },
            Message::Close(frame) => {
                info!("[SHARD-{}] Received close frame", self.shard_id);
                Some(Input::SocketClosed(close_event(frame)))
            }
            // tungstenite answers pings on its own
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => None,
        }
    }

    fn parse(&self, text: &str) -> Option<Input> {
        match GatewayFrame::parse(text) {
            Ok(frame) => {
                trace!("[SHARD-{}] <- op {:?} {:?}", self.shard_id, frame.op, frame.t);
                match frame.op {
                    OpCode::HeartbeatAck => self.metrics.record_heartbeat_ack(),
                    OpCode::InvalidSession => self.metrics.record_invalid_session(),
                    _ => {}
                }
                Some(Input::Frame(frame))
            }
            Err(e) => {
                let error = Error::ProtocolViolation(format!("undecodable frame: {}", e));
                warn!("[SHARD-{}] {}", self.shard_id, error);
                self.metrics.record_error();
                None
            }
        }
    }

    async fn step(&mut self, input: Input, sink: Option<&mut WsSink>) {
        let effects = self.machine.handle(input, Instant::now());
        self.run_effects(effects, sink).await;
    }

    /// Execute effects, feeding a write failure back as a socket close.
    async fn run_effects(&mut self, mut effects: Vec<Effect>, mut sink: Option<&mut WsSink>) {
        loop {
            match self.apply(effects, sink.as_deref_mut()).await {
                Some(close) => {
                    effects = self
                        .machine
                        .handle(Input::SocketClosed(close), Instant::now());
                }
                None => break,
            }
        }
        self.publish_status();
    }

    async fn apply(&mut self, effects: Vec<Effect>, mut sink: Option<&mut WsSink>) -> Option<CloseEvent> {
        for effect in effects {
            match effect {
                Effect::Transmit(frame) => {
                    let Some(sink) = sink.as_mut() else {
                        continue;
                    };
                    if let Err(e) = transmit(sink, &frame).await {
                        warn!("[SHARD-{}] Failed to send {:?}: {}", self.shard_id, frame.op, e);
                        self.metrics.record_error();
                        return Some(CloseEvent::abnormal(e.to_string()));
                    }
                    self.metrics.record_message_sent();
                    match frame.op {
                        OpCode::Heartbeat => self.metrics.record_heartbeat(),
                        OpCode::Identify => self.metrics.record_identify(),
                        OpCode::Resume => self.metrics.record_resume(),
                        _ => {}
                    }
                    trace!("[SHARD-{}] -> op {:?}", self.shard_id, frame.op);
                }
                Effect::CloseSocket { code } => {
                    let Some(sink) = sink.as_mut() else {
                        continue;
                    };
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: "".into(),
                    };
                    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                        debug!("[SHARD-{}] Close frame not sent: {}", self.shard_id, e);
                        return Some(CloseEvent::abnormal(e.to_string()));
                    }
                }
                Effect::RequestIdentify => self.request_identify(),
                Effect::CancelIdentify => {
                    if let Some(token) = self.identify_cancel.take() {
                        token.cancel();
                    }
                    self.identify = None;
                }
                Effect::ReleaseIdentify => {
                    if let Some(lease) = self.lease.take() {
                        debug!(
                            "[SHARD-{}] Identify bucket {} released",
                            self.shard_id,
                            lease.bucket()
                        );
                    }
                }
                Effect::PersistSession(session) => self.store.put(self.shard_id, session),
                Effect::Emit(event) => self.dispatch(event),
            }
        }
        None
    }

    fn request_identify(&mut self) {
        self.lease = None;
        if let Some(token) = self.identify_cancel.take() {
            token.cancel();
        }
        let token = CancellationToken::new();
        let cancel = token.clone();
        let coordinator = self.coordinator.clone();
        let shard_id = self.shard_id;
        self.identify = Some(async move { coordinator.wait_for_identify(shard_id, &cancel).await }.boxed());
        self.identify_cancel = Some(token);
    }

    fn dispatch(&mut self, event: ShardEvent) {
        if let ShardEvent::Lifecycle(lifecycle) = &event {
            match lifecycle {
                LifecycleEvent::Ready { .. } | LifecycleEvent::Resumed { .. } => {
                    self.attempt = 0;
                    self.metrics.update_shard(self.shard_id, |s| s.reconnect_attempt = 0);
                    for reply in self.pending.drain(..) {
                        let _ = reply.send(Ok(()));
                    }
                }
                LifecycleEvent::InvalidSession => {
                    self.reject_pending(|_| Error::SessionInvalidated { resumable: false });
                }
                LifecycleEvent::Close(_) => {
                    if self.machine.disconnect_reason() == Some(&DisconnectReason::Zombie) {
                        self.metrics.record_zombie();
                    }
                    if matches!(self.machine.disposition(), Some(Disposition::Fatal { .. })) {
                        self.metrics.record_fatal_close();
                    }
                    if !self.pending.is_empty() {
                        let machine = &self.machine;
                        for reply in self.pending.drain(..) {
                            let _ = reply.send(Err(machine.close_error()));
                        }
                    }
                }
                LifecycleEvent::Destroyed => {
                    self.reject_pending(|id| Error::Destroyed { shard_id: id });
                }
                LifecycleEvent::AllReady { .. } => {}
            }
        }

        self.publish_status();
        if self.event_tx.send(event).is_err() {
            trace!("[SHARD-{}] Event receiver dropped", self.shard_id);
        }
    }

    fn reject_pending(&mut self, error: impl Fn(u32) -> Error) {
        for reply in self.pending.drain(..) {
            let _ = reply.send(Err(error(self.shard_id)));
        }
    }

    fn publish_status(&self) {
        let status = self.machine.status();
        self.status_tx.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
        let latency = self.machine.latency();
        self.metrics.update_shard(self.shard_id, |s| {
            s.status = status;
            s.latency = latency;
        });
    }
}

async fn transmit(sink: &mut WsSink, frame: &GatewayFrame) -> Result<(), Error> {
    let json = frame.to_json()?;
    sink.send(Message::text(json)).await?;
    Ok(())
}

async fn wait_identify(pending: &mut Option<IdentifyWait>) -> Result<IdentifyLease, Error> {
    match pending {
        Some(wait) => wait.await,
        None => std::future::pending().await,
    }
}

/// Gateway URL with the query string this client needs.
pub(crate) fn build_gateway_url(base: &str, api_version: u8, compress: Option<&str>) -> Result<Url, Error> {
    let mut url = Url::parse(base).map_err(|e| Error::Transport(format!("Invalid URL {}: {}", base, e)))?;
    url.set_query(None);
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("v", &api_version.to_string());
        query.append_pair("encoding", "json");
        if let Some(compress) = compress {
            query.append_pair("compress", compress);
        }
    }
    Ok(url)
}

fn close_event(frame: Option<CloseFrame>) -> CloseEvent {
    match frame {
        Some(frame) => CloseEvent::new(u16::from(frame.code), frame.reason.to_string()),
        None => CloseEvent::new(CLOSE_NO_STATUS, ""),
    }
}

/// Open the TCP, TLS and WebSocket layers for `url`.
async fn connect_socket(url: &Url) -> Result<WsStream, Error> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::Transport("No host in URL".to_string()))?;
    let is_tls = url.scheme() == "wss";
    let port = url.port().unwrap_or(if is_tls { 443 } else { 80 });

    let request = url.as_str().into_client_request()?;

    let tcp_stream = connect_direct(host, port).await?;
    set_tcp_options(&tcp_stream);

    let connector = if is_tls {
        let tls = native_tls::TlsConnector::new()
            .map_err(|e| Error::Transport(format!("TLS error: {}", e)))?;
        Some(Connector::NativeTls(tls))
    } else {
        None
    };

    let (ws_stream, _response) = client_async_tls_with_config(request, tcp_stream, None, connector).await?;
    Ok(ws_stream)
}

async fn connect_direct(host: &str, port: u16) -> Result<TcpStream, Error> {
    let dest_str = format!("{}:{}", host, port);
    let dest_addr: SocketAddr = tokio::net::lookup_host(&dest_str)
        .await
        .map_err(|e| Error::Transport(format!("DNS lookup failed: {}", e)))?
        .next()
        .ok_or_else(|| Error::Transport(format!("No addresses found for {}", host)))?;

    let socket = if dest_addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|e| Error::Transport(format!("Failed to create socket: {}", e)))?;

    socket
        .connect(dest_addr)
        .await
        .map_err(|e| Error::Transport(format!("TCP connect to {} failed: {}", dest_addr, e)))
}

/// Set TCP options for low latency
fn set_tcp_options(stream: &TcpStream) {
    let sock2 = socket2::SockRef::from(stream);

    // Disable Nagle's algorithm
    let _ = sock2.set_nodelay(true);

    // Keepalive to detect dead connections below the heartbeat
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));
    let _ = sock2.set_tcp_keepalive(&keepalive);
}
