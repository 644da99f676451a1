use crate::protocol::ConnectionProperties;
use serde_json::Value;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Configuration for a shard fleet
#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// Bot token sent with IDENTIFY and RESUME
    pub token: String,
    /// Gateway intents bitfield
    pub intents: u64,
    /// Gateway API version appended to the connection URL
    pub api_version: u8,
    /// Overrides the recommended shard count from the gateway lookup
    pub shard_count: Option<u32>,
    /// Transport compression for inbound frames
    pub compression: Compression,
    /// Delay between successive `connect()` calls during fleet startup
    pub spawn_delay: Duration,
    /// Connection and handshake timing
    pub connection: ConnectionConfig,
    /// IDENTIFY contents and coordination
    pub identify: IdentifyConfig,
    /// Heartbeat behaviour
    pub heartbeat: HeartbeatConfig,
    /// Outbound rate limit
    pub rate_limit: RateLimitConfig,
    /// Backoff settings for reconnection
    pub backoff: BackoffConfig,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            intents: crate::protocol::GUILDS_INTENT,
            api_version: 10,
            shard_count: None,
            compression: Compression::default(),
            spawn_delay: Duration::from_millis(500),
            connection: ConnectionConfig::default(),
            identify: IdentifyConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            rate_limit: RateLimitConfig::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl FleetConfig {
    /// Create a new builder for configuration
    pub fn builder(token: impl Into<String>) -> FleetConfigBuilder {
        FleetConfigBuilder {
            config: FleetConfig {
                token: token.into(),
                ..Default::default()
            },
        }
    }

    /// Load configuration from the environment, reading a `.env` file first if present.
    ///
    /// `GATEWAY_TOKEN` is required. Optional: `GATEWAY_INTENTS`, `GATEWAY_SHARD_COUNT`,
    /// `GATEWAY_COMPRESS`, `GATEWAY_LARGE_THRESHOLD`, `GATEWAY_SPAWN_DELAY_MS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let token = env::var("GATEWAY_TOKEN").map_err(|_| ConfigError::MissingToken)?;
        let mut builder = Self::builder(token);

        if let Some(intents) = env_parse::<u64>("GATEWAY_INTENTS")? {
            builder = builder.intents(intents);
        }
        if let Some(count) = env_parse::<u32>("GATEWAY_SHARD_COUNT")? {
            builder = builder.shard_count(count);
        }
        if let Some(compress) = env_parse::<bool>("GATEWAY_COMPRESS")? {
            builder = builder.compression(if compress { Compression::ZlibStream } else { Compression::None });
        }
        if let Some(threshold) = env_parse::<u32>("GATEWAY_LARGE_THRESHOLD")? {
            builder = builder.large_threshold(threshold);
        }
        if let Some(ms) = env_parse::<u64>("GATEWAY_SPAWN_DELAY_MS")? {
            builder = builder.spawn_delay(Duration::from_millis(ms));
        }

        builder.build()
    }

    /// Whether READY is followed by a GUILD_CREATE stream worth waiting for.
    pub fn wants_guilds(&self) -> bool {
        self.intents & crate::protocol::GUILDS_INTENT != 0
    }
}

fn env_parse<T>(var: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ConfigError::InvalidEnv {
                var: var.to_string(),
                message: format!("{e}"),
            }),
        Err(_) => Ok(None),
    }
}

/// Builder for FleetConfig
#[derive(Debug, Clone)]
pub struct FleetConfigBuilder {
    config: FleetConfig,
}

impl FleetConfigBuilder {
    pub fn intents(mut self, intents: u64) -> Self {
        self.config.intents = intents;
        self
    }

    pub fn api_version(mut self, version: u8) -> Self {
        self.config.api_version = version;
        self
    }

    /// Use a fixed shard count instead of the recommended one
    pub fn shard_count(mut self, count: u32) -> Self {
        self.config.shard_count = Some(count);
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.config.compression = compression;
        self
    }

    pub fn spawn_delay(mut self, delay: Duration) -> Self {
        self.config.spawn_delay = delay;
        self
    }

    pub fn large_threshold(mut self, threshold: u32) -> Self {
        self.config.identify.large_threshold = Some(threshold);
        self
    }

    /// Initial presence sent with IDENTIFY
    pub fn presence(mut self, presence: Value) -> Self {
        self.config.identify.presence = Some(presence);
        self
    }

    /// Set connection configuration
    pub fn connection(mut self, config: ConnectionConfig) -> Self {
        self.config.connection = config;
        self
    }

    pub fn identify(mut self, config: IdentifyConfig) -> Self {
        self.config.identify = config;
        self
    }

    pub fn heartbeat(mut self, config: HeartbeatConfig) -> Self {
        self.config.heartbeat = config;
        self
    }

    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.config.rate_limit = config;
        self
    }

    /// Set backoff configuration
    pub fn backoff(mut self, config: BackoffConfig) -> Self {
        self.config.backoff = config;
        self
    }

    /// Build the configuration with validation.
    pub fn build(self) -> Result<FleetConfig, ConfigError> {
        if self.config.token.trim().is_empty() {
            return Err(ConfigError::MissingToken);
        }

        if self.config.backoff.max_delay < self.config.backoff.initial_delay {
            return Err(ConfigError::InvalidBackoff(
                "max_delay must be >= initial_delay".to_string(),
            ));
        }

        if self.config.backoff.multiplier <= 0.0 {
            return Err(ConfigError::InvalidBackoff(
                "multiplier must be > 0".to_string(),
            ));
        }

        if self.config.rate_limit.capacity == 0 {
            return Err(ConfigError::InvalidRateLimit(
                "capacity cannot be 0".to_string(),
            ));
        }

        if self.config.rate_limit.window.is_zero() {
            return Err(ConfigError::InvalidRateLimit(
                "window cannot be zero".to_string(),
            ));
        }

        if self.config.connection.handshake_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "handshake_timeout cannot be zero".to_string(),
            ));
        }

        if self.config.connection.close_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "close_timeout cannot be zero".to_string(),
            ));
        }

        if let Some(0) = self.config.shard_count {
            return Err(ConfigError::InvalidShardCount);
        }

        Ok(self.config)
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing gateway token")]
    MissingToken,
    /// Invalid backoff configuration
    #[error("Invalid backoff configuration: {0}")]
    InvalidBackoff(String),
    #[error("Invalid rate limit configuration: {0}")]
    InvalidRateLimit(String),
    #[error("Invalid timeout configuration: {0}")]
    InvalidTimeout(String),
    #[error("Shard count cannot be 0")]
    InvalidShardCount,
    #[error("Invalid value for {var}: {message}")]
    InvalidEnv { var: String, message: String },
}

/// Transport compression negotiated through the connection URL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Compression {
    /// Plain text frames
    None,
    /// One zlib context per connection, messages end with a sync flush
    #[default]
    ZlibStream,
}

/// Connection-related configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout for the TCP + TLS + WebSocket handshake
    pub connect_timeout: Duration,
    /// Deadline for HELLO after connecting, READY after IDENTIFY and RESUMED after RESUME
    pub handshake_timeout: Duration,
    /// How long to wait for the socket to confirm closure before forcing it
    pub close_timeout: Duration,
    /// How long to wait for GUILD_CREATE of every READY guild. Zero fires at once.
    pub guild_ready_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(20),
            close_timeout: Duration::from_secs(5),
            guild_ready_timeout: Duration::from_secs(15),
        }
    }
}

/// IDENTIFY contents and coordination
#[derive(Debug, Clone)]
pub struct IdentifyConfig {
    pub properties: ConnectionProperties,
    pub large_threshold: Option<u32>,
    pub presence: Option<Value>,
    /// Minimum gap between two identify grants in the same concurrency bucket
    pub spacing: Duration,
}

impl Default for IdentifyConfig {
    fn default() -> Self {
        Self {
            properties: ConnectionProperties::default(),
            large_threshold: None,
            presence: None,
            spacing: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Delay the first beat by a random fraction of the interval
    pub jitter: bool,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { jitter: true }
    }
}

/// Outbound frame budget per connection
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub capacity: usize,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 120,
            window: Duration::from_secs(60),
        }
    }
}

/// Backoff configuration for reconnection
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Initial delay before first reconnection attempt
    pub initial_delay: Duration,
    /// Maximum delay between reconnection attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (typically 2.0)
    pub multiplier: f64,
    /// Whether to add random jitter to delays
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true, // full jitter
        }
    }
}

impl BackoffConfig {
    /// Calculate the delay for a given attempt number (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay.as_millis() as f64
            * self.multiplier.powi(attempt.min(32) as i32);
        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        if self.jitter {
            // Full jitter: random value between 0 and capped_delay
            let jittered = rand::random::<f64>() * capped_delay;
            Duration::from_millis(jittered as u64)
        } else {
            Duration::from_millis(capped_delay as u64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delay_calculation() {
        let config = BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: false,
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(800));

        // Should cap at max_delay
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(30));
        assert_eq!(config.delay_for_attempt(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_with_jitter() {
        let config = BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        };

        for attempt in 0..5 {
            let delay = config.delay_for_attempt(attempt);
            let max_expected = Duration::from_millis((100.0 * 2.0_f64.powi(attempt as i32)) as u64);
            assert!(delay <= max_expected);
        }
    }

    #[test]
    fn test_config_builder() {
        let config = FleetConfig::builder("token")
            .intents(513)
            .shard_count(4)
            .compression(Compression::None)
            .large_threshold(100)
            .build()
            .expect("valid config");

        assert_eq!(config.intents, 513);
        assert_eq!(config.shard_count, Some(4));
        assert_eq!(config.compression, Compression::None);
        assert_eq!(config.identify.large_threshold, Some(100));
        assert_eq!(config.rate_limit.capacity, 120); // default
        assert_eq!(config.connection.handshake_timeout, Duration::from_secs(20));
        assert!(config.wants_guilds());
    }

    #[test]
    fn test_config_builder_rejects_empty_token() {
        assert!(matches!(
            FleetConfig::builder("  ").build(),
            Err(ConfigError::MissingToken)
        ));
    }

    #[test]
    fn test_config_builder_rejects_zero_shards() {
        let result = FleetConfig::builder("token").shard_count(0).build();
        assert!(matches!(result, Err(ConfigError::InvalidShardCount)));
    }

    #[test]
    fn test_config_builder_rejects_empty_rate_limit() {
        let result = FleetConfig::builder("token")
            .rate_limit(RateLimitConfig {
                capacity: 0,
                window: Duration::from_secs(60),
            })
            .build();
        assert!(matches!(result, Err(ConfigError::InvalidRateLimit(_))));
    }

    #[test]
    fn test_guilds_intent_detection() {
        let config = FleetConfig::builder("token").intents(1 << 9).build().unwrap();
        assert!(!config.wants_guilds());
    }

    #[test]
    fn test_from_env() {
        const VARS: [&str; 6] = [
            "GATEWAY_TOKEN",
            "GATEWAY_INTENTS",
            "GATEWAY_SHARD_COUNT",
            "GATEWAY_COMPRESS",
            "GATEWAY_LARGE_THRESHOLD",
            "GATEWAY_SPAWN_DELAY_MS",
        ];
        for var in VARS {
            env::remove_var(var);
        }
        assert!(matches!(FleetConfig::from_env(), Err(ConfigError::MissingToken)));

        env::set_var("GATEWAY_TOKEN", "secret");
        env::set_var("GATEWAY_INTENTS", "513");
        env::set_var("GATEWAY_SHARD_COUNT", "4");
        env::set_var("GATEWAY_COMPRESS", "true");
        env::set_var("GATEWAY_LARGE_THRESHOLD", "100");
        env::set_var("GATEWAY_SPAWN_DELAY_MS", "250");
        let config = FleetConfig::from_env().unwrap();
        assert_eq!(config.token, "secret");
        assert_eq!(config.intents, 513);
        assert_eq!(config.shard_count, Some(4));
        assert_eq!(config.compression, Compression::ZlibStream);
        assert_eq!(config.identify.large_threshold, Some(100));
        assert_eq!(config.spawn_delay, Duration::from_millis(250));

        env::set_var("GATEWAY_SHARD_COUNT", "many");
        match FleetConfig::from_env() {
            Err(ConfigError::InvalidEnv { var, .. }) => assert_eq!(var, "GATEWAY_SHARD_COUNT"),
            other => panic!("expected InvalidEnv, got {:?}", other),
        }

        for var in VARS {
            env::remove_var(var);
        }
    }
}
