use crate::codec::Encoding;
use crate::protocol::{IdentifyProperties, Intents, Presence};
use rand::Rng;
use std::time::Duration;

/// Smallest accepted large-guild threshold
pub const MIN_LARGE_THRESHOLD: u16 = 50;
/// Largest accepted large-guild threshold
pub const MAX_LARGE_THRESHOLD: u16 = 250;

/// Configuration for the shard manager
#[derive(Debug, Clone)]
pub struct ShardManagerConfig {
    /// Bot token sent in IDENTIFY and RESUME
    pub token: String,
    /// Event groups to subscribe to
    pub intents: Intents,
    /// Gateway session settings
    pub gateway: GatewayConfig,
    /// Connection-related settings
    pub connection: ConnectionConfig,
    /// Backoff settings for reconnection
    pub backoff: BackoffConfig,
    /// Which shards this process runs
    pub sharding: ShardingConfig,
    /// Capacity of the outward event channel
    pub event_buffer: usize,
}

impl Default for ShardManagerConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            intents: Intents::default(),
            gateway: GatewayConfig::default(),
            connection: ConnectionConfig::default(),
            backoff: BackoffConfig::default(),
            sharding: ShardingConfig::default(),
            event_buffer: 1024,
        }
    }
}

impl ShardManagerConfig {
    /// Create a new builder for configuration
    pub fn builder() -> ShardManagerConfigBuilder {
        ShardManagerConfigBuilder::default()
    }
}

/// Builder for ShardManagerConfig
#[derive(Debug, Clone, Default)]
pub struct ShardManagerConfigBuilder {
    config: ShardManagerConfig,
}

impl ShardManagerConfigBuilder {
    /// Set the bot token
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.token = token.into();
        self
    }

    /// Set the gateway intents
    pub fn intents(mut self, intents: Intents) -> Self {
        self.config.intents = intents;
        self
    }

    /// Set gateway session configuration
    pub fn gateway(mut self, config: GatewayConfig) -> Self {
        self.config.gateway = config;
        self
    }

    /// Set connection configuration
    pub fn connection(mut self, config: ConnectionConfig) -> Self {
        self.config.connection = config;
        self
    }

    /// Set backoff configuration
    pub fn backoff(mut self, config: BackoffConfig) -> Self {
        self.config.backoff = config;
        self
    }

    /// Set sharding configuration
    pub fn sharding(mut self, config: ShardingConfig) -> Self {
        self.config.sharding = config;
        self
    }

    /// Request zlib-stream transport compression
    pub fn compress(mut self, enabled: bool) -> Self {
        self.config.gateway.compress = enabled;
        self
    }

    /// Set the payload encoding
    pub fn encoding(mut self, encoding: Encoding) -> Self {
        self.config.gateway.encoding = encoding;
        self
    }

    /// Fetch full member lists of large guilds before reporting ready
    pub fn fetch_all_members(mut self, enabled: bool) -> Self {
        self.config.gateway.fetch_all_members = enabled;
        self
    }

    /// Set the initial presence
    pub fn presence(mut self, presence: Presence) -> Self {
        self.config.gateway.presence = presence;
        self
    }

    /// Set the outward event channel capacity
    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.config.event_buffer = capacity;
        self
    }

    /// Build the configuration with validation.
    pub fn build(self) -> Result<ShardManagerConfig, ConfigError> {
        let config = self.config;

        if config.token.trim().is_empty() {
            return Err(ConfigError::MissingToken);
        }

        if !(MIN_LARGE_THRESHOLD..=MAX_LARGE_THRESHOLD).contains(&config.gateway.large_threshold) {
            return Err(ConfigError::InvalidGateway(format!(
                "large_threshold must be between {} and {}",
                MIN_LARGE_THRESHOLD, MAX_LARGE_THRESHOLD
            )));
        }

        if config.backoff.max_delay < config.backoff.initial_delay {
            return Err(ConfigError::InvalidBackoff(
                "max_delay must be >= initial_delay".to_string(),
            ));
        }

        if config.backoff.max_multiplier < 1.0 {
            return Err(ConfigError::InvalidBackoff(
                "max_multiplier must be >= 1".to_string(),
            ));
        }

        if let Some(0) = config.sharding.total_shards {
            return Err(ConfigError::InvalidSharding(
                "total_shards cannot be 0".to_string(),
            ));
        }

        if let Some(0) = config.sharding.concurrency {
            return Err(ConfigError::InvalidSharding(
                "concurrency cannot be 0".to_string(),
            ));
        }

        match &config.sharding.selection {
            ShardSelection::Range { first, last } if first > last => {
                return Err(ConfigError::InvalidSharding(format!(
                    "shard range {}..={} is empty",
                    first, last
                )));
            }
            ShardSelection::List(ids) if ids.is_empty() => {
                return Err(ConfigError::InvalidSharding(
                    "shard list cannot be empty".to_string(),
                ));
            }
            _ => {}
        }

        if let Some(total) = config.sharding.total_shards {
            config.sharding.selection.ids(total)?;
        }

        for ip in &config.connection.source_ips {
            if ip.parse::<std::net::IpAddr>().is_err() {
                return Err(ConfigError::InvalidConnection(format!(
                    "invalid source IP '{}'",
                    ip
                )));
            }
        }

        if config.event_buffer == 0 {
            return Err(ConfigError::InvalidEventBuffer);
        }

        Ok(config)
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// No token configured
    #[error("A token is required")]
    MissingToken,
    /// Invalid connection configuration
    #[error("Invalid connection configuration: {0}")]
    InvalidConnection(String),
    /// Invalid gateway configuration
    #[error("Invalid gateway configuration: {0}")]
    InvalidGateway(String),
    /// Invalid backoff configuration
    #[error("Invalid backoff configuration: {0}")]
    InvalidBackoff(String),
    /// Invalid sharding configuration
    #[error("Invalid sharding configuration: {0}")]
    InvalidSharding(String),
    /// Event channel capacity of zero
    #[error("event_buffer must be > 0")]
    InvalidEventBuffer,
}

/// Gateway session settings
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Gateway protocol version
    pub version: u8,
    /// Payload encoding
    pub encoding: Encoding,
    /// Request zlib-stream compression
    pub compress: bool,
    /// Member count above which a guild is considered large (50..=250)
    pub large_threshold: u16,
    /// Fetch full member lists of large guilds before reporting ready
    pub fetch_all_members: bool,
    /// How long to wait for the burst of GUILD_CREATE after READY
    pub guild_create_timeout: Duration,
    /// Default timeout for member-list requests
    pub request_timeout: Duration,
    /// Presence sent in IDENTIFY
    pub presence: Presence,
    /// Client properties sent in IDENTIFY
    pub properties: IdentifyProperties,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            version: 10,
            encoding: Encoding::Json,
            compress: false,
            large_threshold: 250,
            fetch_all_members: false,
            guild_create_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(15),
            presence: Presence::default(),
            properties: IdentifyProperties::default(),
        }
    }
}

/// Connection-related configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Time allowed from opening the transport until HELLO arrives
    pub connect_timeout: Duration,
    /// Reconnect automatically after recoverable disconnects
    pub auto_reconnect: bool,
    /// Give up after this many consecutive connect attempts, `None` for never
    pub max_reconnect_attempts: Option<u32>,
    /// Forget the session after this many attempts to resume it
    pub max_resume_attempts: u32,
    /// Local addresses to bind outgoing connections to, assigned round-robin by shard id
    pub source_ips: Vec<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            auto_reconnect: true,
            max_reconnect_attempts: None,
            max_resume_attempts: 10,
            source_ips: Vec::new(),
        }
    }
}

impl ConnectionConfig {
    /// Source address for a shard, if any are configured
    pub fn source_ip_for_shard(&self, shard_id: u32) -> Option<&str> {
        if self.source_ips.is_empty() {
            return None;
        }
        let index = shard_id as usize % self.source_ips.len();
        self.source_ips.get(index).map(String::as_str)
    }
}

/// Backoff configuration for reconnection
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first reconnection attempt without a session
    pub initial_delay: Duration,
    /// Maximum delay between reconnection attempts
    pub max_delay: Duration,
    /// Each failure multiplies the delay by a random factor in `[1, max_multiplier)`
    pub max_multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30000),
            max_multiplier: 3.0,
        }
    }
}

impl BackoffConfig {
    /// Grow `current` by a random factor, capped at `max_delay`.
    ///
    /// The result is never smaller than `current`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        let factor = if self.max_multiplier > 1.0 {
            rand::thread_rng().gen_range(1.0..self.max_multiplier)
        } else {
            1.0
        };
        let grown = (current.as_millis() as f64 * factor).round();
        let capped = grown.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64).max(current.min(self.max_delay))
    }
}

/// Which shard ids this process runs
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ShardSelection {
    /// Every shard from 0 to total - 1
    #[default]
    All,
    /// Inclusive range of shard ids
    Range { first: u32, last: u32 },
    /// Explicit shard ids
    List(Vec<u32>),
}

impl ShardSelection {
    /// Resolve to concrete ids given the total shard count
    pub fn ids(&self, total: u32) -> Result<Vec<u32>, ConfigError> {
        let ids: Vec<u32> = match self {
            ShardSelection::All => (0..total).collect(),
            ShardSelection::Range { first, last } => (*first..=*last).collect(),
            ShardSelection::List(ids) => {
                let mut ids = ids.clone();
                ids.sort_unstable();
                ids.dedup();
                ids
            }
        };
        if let Some(bad) = ids.iter().find(|id| **id >= total) {
            return Err(ConfigError::InvalidSharding(format!(
                "shard {} is out of range for {} total shards",
                bad, total
            )));
        }
        Ok(ids)
    }
}

/// Sharding configuration
#[derive(Debug, Clone, Default)]
pub struct ShardingConfig {
    /// Shards run by this process
    pub selection: ShardSelection,
    /// Total shard count across all processes, `None` to use the gateway's recommendation
    pub total_shards: Option<u32>,
    /// Identify concurrency override, `None` to use the gateway's value
    pub concurrency: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> ShardManagerConfigBuilder {
        ShardManagerConfig::builder().token("Bot abc")
    }

    #[test]
    fn test_backoff_grows_within_bounds() {
        let config = BackoffConfig::default();
        let mut delay = config.initial_delay;
        for _ in 0..20 {
            let next = config.next_delay(delay);
            assert!(next >= delay, "{:?} < {:?}", next, delay);
            assert!(next <= config.max_delay);
            assert!(next <= delay * 3);
            delay = next;
        }
        assert_eq!(config.next_delay(config.max_delay), config.max_delay);
    }

    #[test]
    fn test_backoff_without_jitter() {
        let config = BackoffConfig {
            max_multiplier: 1.0,
            ..BackoffConfig::default()
        };
        assert_eq!(config.next_delay(Duration::from_secs(2)), Duration::from_secs(2));
    }

    #[test]
    fn test_config_builder() {
        let config = builder()
            .intents(Intents::GUILDS | Intents::GUILD_MEMBERS)
            .fetch_all_members(true)
            .build()
            .expect("valid config");

        assert!(config.gateway.fetch_all_members);
        assert!(config.intents.contains(Intents::GUILD_MEMBERS));
        assert!(config.connection.auto_reconnect); // default
        assert_eq!(config.connection.max_reconnect_attempts, None);
    }

    #[test]
    fn test_config_builder_rejects_missing_token() {
        let result = ShardManagerConfig::builder().build();
        assert!(matches!(result, Err(ConfigError::MissingToken)));
    }

    #[test]
    fn test_config_builder_rejects_bad_large_threshold() {
        let gateway = GatewayConfig {
            large_threshold: 10,
            ..GatewayConfig::default()
        };
        assert!(builder().gateway(gateway).build().is_err());
    }

    #[test]
    fn test_config_builder_rejects_bad_sharding() {
        let sharding = ShardingConfig {
            selection: ShardSelection::Range { first: 4, last: 2 },
            ..ShardingConfig::default()
        };
        assert!(builder().sharding(sharding).build().is_err());

        let sharding = ShardingConfig {
            selection: ShardSelection::List(vec![0, 5]),
            total_shards: Some(4),
            concurrency: None,
        };
        assert!(builder().sharding(sharding).build().is_err());

        let sharding = ShardingConfig {
            concurrency: Some(0),
            ..ShardingConfig::default()
        };
        assert!(builder().sharding(sharding).build().is_err());
    }

    #[test]
    fn test_source_ip_round_robin() {
        let connection = ConnectionConfig {
            source_ips: vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()],
            ..ConnectionConfig::default()
        };
        assert_eq!(connection.source_ip_for_shard(0), Some("10.0.0.1"));
        assert_eq!(connection.source_ip_for_shard(3), Some("10.0.0.2"));
        assert_eq!(ConnectionConfig::default().source_ip_for_shard(1), None);

        let bad = ConnectionConfig {
            source_ips: vec!["not-an-ip".to_string()],
            ..ConnectionConfig::default()
        };
        assert!(matches!(
            builder().connection(bad).build(),
            Err(ConfigError::InvalidConnection(_))
        ));
    }

    #[test]
    fn test_shard_selection_ids() {
        assert_eq!(ShardSelection::All.ids(3).unwrap(), vec![0, 1, 2]);
        assert_eq!(
            ShardSelection::Range { first: 2, last: 4 }.ids(8).unwrap(),
            vec![2, 3, 4]
        );
        assert_eq!(
            ShardSelection::List(vec![5, 1, 5]).ids(8).unwrap(),
            vec![1, 5]
        );
        assert!(ShardSelection::Range { first: 2, last: 4 }.ids(4).is_err());
    }
}
