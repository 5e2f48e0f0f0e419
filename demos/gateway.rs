//! Connects to a gateway and logs shard events.
//!
//! ```text
//! GATEWAY_TOKEN="Bot ..." GATEWAY_URL=wss://gateway.example RUST_LOG=info \
//!     cargo run --example gateway
//! ```

use gateway_shards::{Intents, ShardEvent, ShardManager, ShardManagerConfig, StaticGateway, Status};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let token = std::env::var("GATEWAY_TOKEN")?;
    let url = std::env::var("GATEWAY_URL").unwrap_or_else(|_| "wss://gateway.example".to_string());

    let config = ShardManagerConfig::builder()
        .token(token)
        .intents(Intents::GUILDS | Intents::GUILD_MESSAGES)
        .build()?;

    let manager = ShardManager::new(config, StaticGateway::new(url).with_shards(1));
    let mut events = manager.take_events().ok_or("event receiver already taken")?;
    manager.start().await?;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    ShardEvent::AllReady => {
                        tracing::info!("All shards ready");
                        if let Some(shard) = manager.shard(0) {
                            shard.edit_status(Status::Idle, Vec::new()).await?;
                        }
                    }
                    ShardEvent::Dispatch { shard_id, name, .. } => {
                        tracing::debug!("[SHARD-{}] {}", shard_id, name);
                    }
                    ShardEvent::Error { shard_id, error, fatal: true } => {
                        tracing::error!("[SHARD-{}] Fatal: {}", shard_id, error);
                        break;
                    }
                    other => tracing::info!("{:?}", other),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    println!("{:#?}", manager.metrics().snapshot());
    manager.stop().await?;
    Ok(())
}
