//! # gateway-shard-core
//!
//! Transport core for sharded real-time chat gateways: one WebSocket per
//! shard, each driven through HELLO, IDENTIFY or RESUME, READY and guild
//! streaming, kept alive by heartbeats and brought back after drops.
//!
//! ## Features
//!
//! - **Session resume** with sequence tracking and a pluggable [`SessionStore`]
//! - **Heartbeats** with jittered first beat and zombie detection
//! - **Identify coordination** across concurrency buckets
//! - **Outbound rate limiting** with a priority lane for control frames
//! - **Close-code classification** into resume, re-identify or stop
//! - **Transport compression** via zlib-stream
//! - **Metrics** for observability
//!
//! ## Example
//!
//! ```ignore
//! use gateway_shard_core::{EventSink, FleetConfig, GatewayInfo, InMemorySessionStore, ShardFleet};
//! use serde_json::Value;
//!
//! struct Bot;
//!
//! impl EventSink for Bot {
//!     async fn on_dispatch(&self, shard_id: u32, event: &str, payload: Value) {
//!         println!("[{shard_id}] {event}");
//!     }
//! }
//!
//! let config = FleetConfig::builder(token).intents(1 | 512).build()?;
//! let gateway = GatewayInfo { url: "wss://gateway.example".into(), shard_count: 2, max_concurrency: 1 };
//!
//! let fleet = ShardFleet::new(config, &gateway, InMemorySessionStore::new(), Bot).await?;
//! fleet.spawn_all().await?;
//! fleet.connect_all().await?;
//! ```
//!
//! The per-shard protocol logic lives in [`ShardMachine`], a synchronous
//! state machine that turns inputs into effects. It can be driven by hand
//! for testing or alternative transports.

mod compression;
mod config;
mod connection;
mod error;
mod event;
mod fleet;
mod handler;
mod health;
mod identify;
mod machine;
mod metrics;
mod protocol;
mod ratelimit;
mod session;
mod shard;
mod timers;

pub use compression::{decompressor_for, Decompressor, NoCompression, ZlibStream};
pub use config::{
    BackoffConfig, Compression, ConfigError, ConnectionConfig, FleetConfig, FleetConfigBuilder,
    HeartbeatConfig, IdentifyConfig, RateLimitConfig,
};
pub use error::{Error, ErrorKind, HandshakeStage};
pub use event::{CloseEvent, LifecycleEvent, ShardEvent};
pub use fleet::ShardFleet;
pub use handler::{EventSink, GatewayInfo, RestLookup};
pub use health::HeartbeatState;
pub use identify::{IdentifyCoordinator, IdentifyLease};
pub use machine::{DestroyOptions, DisconnectReason, Disposition, Effect, Input, ShardMachine};
pub use metrics::{Metrics, MetricsSnapshot, ShardMetrics};
pub use protocol::{
    classify_close, CloseClass, ConnectionProperties, GatewayFrame, HelloPayload, IdentifyPayload, OpCode,
    ReadyPayload, ResumePayload, UnavailableGuild, UnknownOpCode, CLOSE_ABNORMAL, CLOSE_INTERNAL_ERROR, CLOSE_NORMAL,
    CLOSE_RECONNECT, CLOSE_SESSION_TIMEOUT, GUILDS_INTENT,
};
pub use ratelimit::{Drained, RateLimitedSender};
pub use session::{InMemorySessionStore, Session, SessionIntent, SessionStore};
pub use shard::{shard_for_key, Shard, ShardStatus};
pub use timers::{TimerKind, Timers};

/// Result type for gateway-shard-core operations
pub type Result<T> = std::result::Result<T, Error>;
