use crate::config::FleetConfig;
use crate::connection::{Connection, ConnectionCommand};
use crate::error::Error;
use crate::event::{LifecycleEvent, ShardEvent};
use crate::handler::{EventSink, GatewayInfo, RestLookup};
use crate::identify::IdentifyCoordinator;
use crate::machine::DestroyOptions;
use crate::metrics::Metrics;
use crate::protocol::GatewayFrame;
use crate::session::SessionStore;
use crate::shard::{shard_for_key, Shard, ShardStatus};
use futures_util::future::join_all;
use futures_util::FutureExt;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default command channel buffer size per shard
const DEFAULT_CHANNEL_SIZE: usize = 100;

/// Owns every shard connection of one bot.
///
/// The fleet asks [`RestLookup`] for the gateway URL, recommended shard
/// count and identify concurrency once, then spawns one connection task per
/// shard. All shards share one [`IdentifyCoordinator`]; every event they
/// produce is relayed to the [`EventSink`] tagged with its shard id.
///
/// # Thread Safety
///
/// `ShardFleet` is `Send + Sync`; all methods take `&self`. Spawn, respawn
/// and teardown are serialized by an async lifecycle lock.
pub struct ShardFleet<S: SessionStore, E: EventSink> {
    config: Arc<FleetConfig>,
    gateway: GatewayInfo,
    shard_count: u32,
    coordinator: IdentifyCoordinator,
    store: Arc<S>,
    sink: Arc<E>,
    metrics: Arc<Metrics>,
    state: Arc<RwLock<FleetState>>,
    shards: RwLock<HashMap<u32, Shard>>,
    shard_handles: RwLock<HashMap<u32, ShardTasks>>,
    /// Held across await points by spawn, respawn and teardown
    lifecycle_lock: Mutex<()>,
}

#[derive(Debug, Default)]
struct FleetState {
    spawned: HashSet<u32>,
    /// Shards that reached full readiness on their current session
    ready: HashSet<u32>,
    /// Shards stopped by a fatal close
    fatal: HashSet<u32>,
    fleet_ready_notified: bool,
}

impl FleetState {
    /// Record a ready shard; true exactly once, when the whole fleet is ready.
    fn mark_ready(&mut self, shard_id: u32) -> bool {
        self.ready.insert(shard_id);
        if self.fleet_ready_notified || self.spawned.is_empty() {
            return false;
        }
        if self.spawned.iter().all(|id| self.ready.contains(id)) {
            self.fleet_ready_notified = true;
            return true;
        }
        false
    }
}

struct ShardTasks {
    connection: JoinHandle<()>,
    relay: JoinHandle<()>,
}

impl<S: SessionStore, E: EventSink> ShardFleet<S, E> {
    /// Build a fleet, fetching gateway bootstrap data once.
    pub async fn new(config: FleetConfig, lookup: &impl RestLookup, store: S, sink: E) -> Result<Self, Error> {
        let gateway = lookup.fetch_gateway_info().await?;
        if gateway.url.is_empty() {
            return Err(Error::GatewayLookup("empty gateway URL".to_string()));
        }
        let shard_count = config.shard_count.unwrap_or(gateway.shard_count);
        if shard_count == 0 {
            return Err(Error::GatewayLookup("shard count is 0".to_string()));
        }

        info!(
            "Gateway {} with {} shards (max concurrency {})",
            gateway.url, shard_count, gateway.max_concurrency
        );

        let coordinator = IdentifyCoordinator::new(gateway.max_concurrency, config.identify.spacing);
        Ok(Self {
            config: Arc::new(config),
            gateway,
            shard_count,
            coordinator,
            store: Arc::new(store),
            sink: Arc::new(sink),
            metrics: Arc::new(Metrics::new()),
            state: Arc::new(RwLock::new(FleetState::default())),
            shards: RwLock::new(HashMap::new()),
            shard_handles: RwLock::new(HashMap::new()),
            lifecycle_lock: Mutex::new(()),
        })
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn gateway(&self) -> &GatewayInfo {
        &self.gateway
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    /// Shard that owns `key` (e.g. a guild id).
    pub fn shard_for_key(&self, key: u64) -> u32 {
        shard_for_key(key, self.shard_count)
    }

    /// Spawned shard ids, ascending.
    pub fn shard_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.shards.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn status(&self, shard_id: u32) -> Option<ShardStatus> {
        self.shards.read().get(&shard_id).map(Shard::status)
    }

    /// Every spawned shard is fully ready on its current session.
    pub fn is_ready(&self) -> bool {
        let state = self.state.read();
        !state.spawned.is_empty() && state.spawned.iter().all(|id| state.ready.contains(id))
    }

    /// Shards stopped by a fatal close and not respawned since.
    pub fn fatal_shards(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.state.read().fatal.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Spawn connection tasks for `shard_ids`. Shards stay idle until [`connect_all`](Self::connect_all).
    pub async fn spawn(&self, shard_ids: impl IntoIterator<Item = u32>) -> Result<(), Error> {
        let _lifecycle_guard = self.lifecycle_lock.lock().await;

        for shard_id in shard_ids {
            if shard_id >= self.shard_count {
                return Err(Error::UnknownShard(shard_id));
            }
            if self.shards.read().contains_key(&shard_id) {
                debug!("[SHARD-{}] Already spawned", shard_id);
                continue;
            }
            self.create_shard(shard_id);
        }
        Ok(())
    }

    /// Spawn every shard in `0..shard_count`.
    pub async fn spawn_all(&self) -> Result<(), Error> {
        self.spawn(0..self.shard_count).await
    }

    /// Connect every spawned shard, staggered by the configured spawn delay.
    ///
    /// Resolves once each shard has reported READY/RESUMED or failed its
    /// first attempt. Transient failures are logged and retried by the
    /// shard; the first fatal close is returned as the error.
    pub async fn connect_all(&self) -> Result<(), Error> {
        let mut replies = Vec::new();
        for (i, shard_id) in self.shard_ids().into_iter().enumerate() {
            if i > 0 && !self.config.spawn_delay.is_zero() {
                tokio::time::sleep(self.config.spawn_delay).await;
            }
            let (tx, rx) = oneshot::channel();
            self.command(shard_id, ConnectionCommand::Connect(tx)).await?;
            replies.push((shard_id, rx));
        }

        let results = join_all(
            replies
                .into_iter()
                .map(|(shard_id, rx)| async move { (shard_id, rx.await) }),
        )
        .await;

        let mut fatal = None;
        for (shard_id, result) in results {
            match result {
                Ok(Ok(())) => debug!("[SHARD-{}] Connected", shard_id),
                Ok(Err(e)) if e.is_fatal() => {
                    error!("[SHARD-{}] Failed to connect: {}", shard_id, e);
                    if fatal.is_none() {
                        fatal = Some(e);
                    }
                }
                Ok(Err(e)) => warn!("[SHARD-{}] First attempt failed, retrying: {}", shard_id, e),
                Err(_) => warn!("[SHARD-{}] Connection task ended before reporting", shard_id),
            }
        }
        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Queue a frame on one shard. Control opcodes jump the queue.
    pub async fn send(&self, shard_id: u32, frame: GatewayFrame) -> Result<(), Error> {
        let important = frame.op.is_control();
        self.command(shard_id, ConnectionCommand::Send { frame, important })
            .await
    }

    /// Queue a frame on every spawned shard.
    pub async fn broadcast(&self, frame: GatewayFrame) -> Result<(), Error> {
        for shard_id in self.shard_ids() {
            self.send(shard_id, frame.clone()).await?;
        }
        Ok(())
    }

    /// Destroy one shard. A terminal destroy also waits for its tasks and forgets it.
    pub async fn destroy(&self, shard_id: u32, opts: DestroyOptions) -> Result<(), Error> {
        let _lifecycle_guard = self.lifecycle_lock.lock().await;
        self.command(shard_id, ConnectionCommand::Destroy(opts)).await?;
        if !opts.reconnect {
            self.remove_shard(shard_id).await;
        }
        Ok(())
    }

    /// Destroy every shard and wait for their tasks to finish.
    pub async fn destroy_all(&self) -> Result<(), Error> {
        let _lifecycle_guard = self.lifecycle_lock.lock().await;
        info!("Destroying all shards");

        let channels: Vec<_> = self
            .shards
            .read()
            .values()
            .map(|shard| (shard.id, shard.commands()))
            .collect();
        for (shard_id, tx) in channels {
            if let Err(e) = tx
                .send(ConnectionCommand::Destroy(DestroyOptions::terminal()))
                .await
            {
                warn!("[SHARD-{}] Failed to send destroy command: {}", shard_id, e);
            }
        }

        let handles: HashMap<u32, ShardTasks> = std::mem::take(&mut *self.shard_handles.write());
        for (_shard_id, tasks) in handles {
            let _ = tasks.connection.await;
            let _ = tasks.relay.await;
        }

        self.shards.write().clear();
        {
            let mut state = self.state.write();
            state.spawned.clear();
            state.ready.clear();
        }
        for shard_id in self.metrics.shard_metrics().iter().map(|s| s.shard_id) {
            self.metrics.remove_shard(shard_id);
        }
        info!("All shards destroyed");
        Ok(())
    }

    /// Tear a shard down if it is running, spawn it again and connect it.
    ///
    /// This is the only way back for a shard stopped by a fatal close.
    pub async fn respawn(&self, shard_id: u32) -> Result<(), Error> {
        if shard_id >= self.shard_count {
            return Err(Error::UnknownShard(shard_id));
        }
        let rx = {
            let _lifecycle_guard = self.lifecycle_lock.lock().await;
            if self.shards.read().contains_key(&shard_id) {
                let _ = self
                    .command(shard_id, ConnectionCommand::Destroy(DestroyOptions::terminal()))
                    .await;
                self.remove_shard(shard_id).await;
            }
            info!("[SHARD-{}] Respawning", shard_id);
            self.create_shard(shard_id);

            let (tx, rx) = oneshot::channel();
            self.command(shard_id, ConnectionCommand::Connect(tx)).await?;
            rx
        };
        rx.await.map_err(|_| Error::ShuttingDown)?
    }

    async fn command(&self, shard_id: u32, command: ConnectionCommand) -> Result<(), Error> {
        let tx = self
            .shards
            .read()
            .get(&shard_id)
            .map(Shard::commands)
            .ok_or(Error::UnknownShard(shard_id))?;
        tx.send(command)
            .await
            .map_err(|e| Error::ChannelSend(format!("shard {}: {}", shard_id, e)))
    }

    fn create_shard(&self, shard_id: u32) {
        let (command_tx, command_rx) = mpsc::channel::<ConnectionCommand>(DEFAULT_CHANNEL_SIZE);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ShardStatus::Idle);

        debug!("[SHARD-{}] Creating shard {}/{}", shard_id, shard_id, self.shard_count);

        let connection = Connection::new(
            shard_id,
            self.shard_count,
            self.config.clone(),
            self.gateway.url.clone(),
            self.coordinator.clone(),
            self.store.clone(),
            self.metrics.clone(),
            command_rx,
            event_tx,
            status_tx,
        );

        let connection_task = tokio::spawn(Self::run_connection_with_recovery(
            shard_id,
            connection,
            self.metrics.clone(),
            self.state.clone(),
        ));
        let relay_task = tokio::spawn(Self::relay(
            shard_id,
            event_rx,
            self.sink.clone(),
            self.state.clone(),
        ));

        self.shards
            .write()
            .insert(shard_id, Shard::new(shard_id, command_tx, status_rx));
        self.shard_handles.write().insert(
            shard_id,
            ShardTasks {
                connection: connection_task,
                relay: relay_task,
            },
        );
        {
            let mut state = self.state.write();
            state.spawned.insert(shard_id);
            state.ready.remove(&shard_id);
            state.fatal.remove(&shard_id);
        }
        self.metrics.update_shard(shard_id, |s| {
            s.status = ShardStatus::Idle;
            s.is_connected = false;
        });
    }

    async fn remove_shard(&self, shard_id: u32) {
        let tasks = self.shard_handles.write().remove(&shard_id);
        if let Some(tasks) = tasks {
            let _ = tasks.connection.await;
            let _ = tasks.relay.await;
        }
        self.shards.write().remove(&shard_id);
        {
            let mut state = self.state.write();
            state.spawned.remove(&shard_id);
            state.ready.remove(&shard_id);
        }
        self.metrics.remove_shard(shard_id);
    }

    /// Run connection with panic recovery
    async fn run_connection_with_recovery(
        shard_id: u32,
        connection: Connection<S>,
        metrics: Arc<Metrics>,
        state: Arc<RwLock<FleetState>>,
    ) {
        match AssertUnwindSafe(connection.run()).catch_unwind().await {
            Ok(Ok(())) => {
                debug!("[SHARD-{}] Connection task completed normally", shard_id);
            }
            Ok(Err(e)) if e.is_fatal() => {
                error!("[SHARD-{}] Stopped: {}. Not respawning.", shard_id, e);
                state.write().fatal.insert(shard_id);
            }
            Ok(Err(e)) => {
                warn!("[SHARD-{}] Connection task ended with error: {}", shard_id, e);
            }
            Err(panic_err) => {
                error!(
                    "[SHARD-{}] Connection task PANICKED: {}. Shard is now dead.",
                    shard_id,
                    panic_message(&*panic_err)
                );
                metrics.record_error();
            }
        }
    }

    /// Forward one shard's events to the sink, in order.
    async fn relay(
        shard_id: u32,
        mut event_rx: mpsc::UnboundedReceiver<ShardEvent>,
        sink: Arc<E>,
        state: Arc<RwLock<FleetState>>,
    ) {
        while let Some(event) = event_rx.recv().await {
            let fleet_ready = match &event {
                ShardEvent::Lifecycle(LifecycleEvent::AllReady { .. })
                | ShardEvent::Lifecycle(LifecycleEvent::Resumed { .. }) => state.write().mark_ready(shard_id),
                ShardEvent::Lifecycle(
                    LifecycleEvent::Close(_) | LifecycleEvent::InvalidSession | LifecycleEvent::Destroyed,
                ) => {
                    state.write().ready.remove(&shard_id);
                    false
                }
                _ => false,
            };

            if let Err(panic_err) = AssertUnwindSafe(deliver(sink.as_ref(), shard_id, event))
                .catch_unwind()
                .await
            {
                error!(
                    "[SHARD-{}] Event sink panicked: {}. Event dropped.",
                    shard_id,
                    panic_message(&*panic_err)
                );
            }

            if fleet_ready {
                info!("All shards ready");
                if let Err(panic_err) = AssertUnwindSafe(sink.on_fleet_ready()).catch_unwind().await {
                    error!("Event sink panicked in on_fleet_ready: {}", panic_message(&*panic_err));
                }
            }
        }
    }
}

async fn deliver<E: EventSink>(sink: &E, shard_id: u32, event: ShardEvent) {
    match event {
        ShardEvent::Raw(frame) => sink.on_raw(shard_id, &frame).await,
        ShardEvent::Dispatch { name, data } => sink.on_dispatch(shard_id, &name, data).await,
        ShardEvent::Lifecycle(lifecycle) => sink.on_lifecycle(shard_id, &lifecycle).await,
    }
}

fn panic_message(panic_err: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic_err.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic_err.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

impl<S: SessionStore, E: EventSink> Drop for ShardFleet<S, E> {
    fn drop(&mut self) {
        // Abort all shard tasks to prevent orphans
        let handles = std::mem::take(&mut *self.shard_handles.write());
        for (_shard_id, tasks) in handles {
            tasks.connection.abort();
            tasks.relay.abort();
        }
    }
}
