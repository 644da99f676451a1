//! Example: connecting a small fleet to a chat gateway
//!
//! Reads `GATEWAY_TOKEN` (plus the optional `GATEWAY_*` settings) from the
//! environment or a `.env` file and logs every dispatch it receives.
//!
//! Run with: GATEWAY_TOKEN=... cargo run --example gateway

use gateway_shard_core::{EventSink, FleetConfig, GatewayInfo, InMemorySessionStore, LifecycleEvent, ShardFleet};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

struct Logger;

impl EventSink for Logger {
    async fn on_dispatch(&self, shard_id: u32, event: &str, payload: Value) {
        // Cut on a char boundary; payloads carry arbitrary user text
        let preview: String = payload.to_string().chars().take(100).collect();
        info!("[SHARD-{}] {} {}", shard_id, event, preview);
    }

    async fn on_lifecycle(&self, shard_id: u32, event: &LifecycleEvent) {
        match event {
            LifecycleEvent::Close(close) => {
                warn!("[SHARD-{}] Closed with {} ({})", shard_id, close.code, close.reason)
            }
            other => info!("[SHARD-{}] {:?}", shard_id, other),
        }
    }

    async fn on_fleet_ready(&self) {
        info!("Every shard is ready");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = FleetConfig::from_env()?;

    // A real client would ask the REST API for this
    let gateway = GatewayInfo {
        url: std::env::var("GATEWAY_URL").unwrap_or_else(|_| "wss://gateway.discord.gg".to_string()),
        shard_count: 1,
        max_concurrency: 1,
    };

    let fleet = ShardFleet::new(config, &gateway, InMemorySessionStore::new(), Logger).await?;
    fleet.spawn_all().await?;
    fleet.connect_all().await?;
    info!("Fleet connected with {} shards", fleet.shard_count());

    info!("Running... Press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    let snapshot = fleet.metrics().snapshot();
    info!("Final metrics:");
    info!("  Connections: {}", snapshot.connections_total);
    info!("  Resumes: {}", snapshot.resumes_total);
    info!("  Messages received: {}", snapshot.messages_received_total);
    info!("  Heartbeat acks: {}", snapshot.heartbeat_acks_total);

    fleet.destroy_all().await?;
    info!("Fleet stopped");

    Ok(())
}
