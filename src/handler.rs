use crate::error::Error;
use crate::event::LifecycleEvent;
use crate::protocol::GatewayFrame;
use serde_json::Value;
use std::future::Future;

/// Trait that users implement to consume what the fleet receives.
///
/// Every callback is tagged with the shard it came from. Callbacks run on
/// the fleet's relay task for that shard, one at a time and in arrival
/// order. A panicking callback is logged and the event dropped; the shard
/// keeps running.
///
/// # Example
///
/// ```ignore
/// use gateway_shard_core::{EventSink, LifecycleEvent};
/// use serde_json::Value;
///
/// struct Printer;
///
/// impl EventSink for Printer {
///     async fn on_dispatch(&self, shard_id: u32, event: &str, payload: Value) {
///         println!("[{shard_id}] {event}: {payload}");
///     }
///
///     async fn on_lifecycle(&self, shard_id: u32, event: &LifecycleEvent) {
///         println!("[{shard_id}] {event:?}");
///     }
/// }
/// ```
pub trait EventSink: Send + Sync + 'static {
    /// Called for every dispatch (`op = 0`) frame.
    fn on_dispatch(&self, shard_id: u32, event: &str, payload: Value) -> impl Future<Output = ()> + Send;

    /// Called for every decoded inbound frame, dispatch or not.
    fn on_raw(&self, _shard_id: u32, _frame: &GatewayFrame) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Called on READY, RESUMED, full readiness, close, invalidation and destroy.
    fn on_lifecycle(&self, _shard_id: u32, _event: &LifecycleEvent) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Called once, when every spawned shard has become ready.
    fn on_fleet_ready(&self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Gateway bootstrap data, fetched once when the fleet is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayInfo {
    /// Base `wss://` URL
    pub url: String,
    /// Recommended shard count
    pub shard_count: u32,
    /// Identify concurrency buckets
    pub max_concurrency: u32,
}

/// Source of [`GatewayInfo`], usually an HTTP call made by the embedding client.
pub trait RestLookup: Send + Sync {
    fn fetch_gateway_info(&self) -> impl Future<Output = Result<GatewayInfo, Error>> + Send;
}

/// Fixed deployments can hand the fleet a literal.
impl RestLookup for GatewayInfo {
    async fn fetch_gateway_info(&self) -> Result<GatewayInfo, Error> {
        Ok(self.clone())
    }
}
