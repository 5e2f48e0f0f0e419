//! # gateway-shards
//!
//! A sharded client for real-time chat gateways: one WebSocket per shard,
//! heartbeats, session resume and rate-limited sends.
//!
//! ## Features
//!
//! - **Resume or identify** on reconnect, with close codes classified into
//!   recoverable, session-invalidating and fatal
//! - **Backoff** with jitter between reconnect attempts
//! - **Identify gate** honouring the gateway's `max_concurrency`
//! - **Readiness checks** waiting for unavailable guilds and, optionally, full
//!   member lists of large guilds
//! - **Token buckets** dual-gating presence updates under the global send limit
//! - **zlib-stream** compression and **MessagePack** encoding behind features
//! - **Metrics** for observability
//!
//! ## Example
//!
//! ```ignore
//! use gateway_shards::{Intents, ShardEvent, ShardManager, ShardManagerConfig, StaticGateway};
//!
//! let config = ShardManagerConfig::builder()
//!     .token("Bot <token>")
//!     .intents(Intents::GUILDS | Intents::GUILD_MESSAGES)
//!     .build()?;
//!
//! let manager = ShardManager::new(config, StaticGateway::new("wss://gateway.example"));
//! let mut events = manager.take_events().expect("first call");
//! manager.start().await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let ShardEvent::AllReady = event {
//!         println!("all shards ready");
//!     }
//! }
//! ```

pub mod bucket;
pub mod cache;
pub mod codec;
mod config;
mod connection;
mod error;
mod events;
mod health;
mod manager;
mod metrics;
pub mod protocol;
mod rest;
pub mod sequential;
mod shard;

pub use bucket::TokenBucket;
pub use cache::{Cache, CacheKey, EntityKind, InMemoryCache};
pub use codec::{CodecConfig, Compression, Encoding};
pub use config::{
    BackoffConfig, ConfigError, ConnectionConfig, GatewayConfig, ShardManagerConfig,
    ShardManagerConfigBuilder, ShardSelection, ShardingConfig,
};
pub use connection::ShardHandle;
pub use error::{ConnectionError, Error, ErrorKind};
pub use events::{EventSender, ShardEvent};
pub use health::{HeartbeatMonitor, HeartbeatTick};
pub use manager::{shard_for_guild, ShardManager};
pub use metrics::{Metrics, MetricsSnapshot, ShardMetrics};
pub use protocol::{Activity, Intents, MemberRequest, OpCode, Presence, Status, VoiceStateUpdate};
pub use rest::{gateway_url, GatewayInfo, GatewayResolver, StaticGateway};
pub use sequential::SequentialBucket;
pub use shard::{ManagerSignal, MemberResponder, Outgoing, Shard, ShardConfig, ShardStatus};

/// Result type for gateway-shards operations
pub type Result<T> = std::result::Result<T, Error>;
