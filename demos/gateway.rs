//! Example: Running a single gateway shard
//!
//! Connects shard 0 of 1, logs lifecycle and message events, and prints
//! metrics on Ctrl+C.
//!
//! Run with: GATEWAY_TOKEN=... cargo run --example gateway

use gateway_shard::{
    Activity, GatewayConfig, GatewayHandler, InMemoryCache, Intents, Presence, ShardConnection,
    ShardEvent, Status,
};
use std::sync::Arc;
use tracing::{info, warn, Level};

struct LoggingHandler;

impl GatewayHandler for LoggingHandler {
    async fn on_event(&self, shard_id: u32, event: ShardEvent) {
        match event {
            ShardEvent::Ready => info!("[SHARD-{}] Ready", shard_id),
            ShardEvent::Resumed => info!("[SHARD-{}] Resumed", shard_id),
            ShardEvent::Disconnect { error } => {
                info!("[SHARD-{}] Disconnected (error: {:?})", shard_id, error)
            }
            ShardEvent::GuildCreate(guild) | ShardEvent::GuildAvailable(guild) => {
                info!("[SHARD-{}] Guild {} ({})", shard_id, guild.name, guild.id)
            }
            ShardEvent::MessageCreate(message) => info!(
                "[SHARD-{}] #{}: {}",
                shard_id,
                message.channel_id,
                &message.content[..message.content.len().min(100)]
            ),
            ShardEvent::Warn(text) => warn!("[SHARD-{}] {}", shard_id, text),
            ShardEvent::Error(e) => warn!("[SHARD-{}] Error: {}", shard_id, e),
            _ => {}
        }
    }

    async fn shard_ready(&self, shard_id: u32) {
        info!("[SHARD-{}] Session established", shard_id);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .init();

    let token = std::env::var("GATEWAY_TOKEN")?;

    let config = GatewayConfig::builder(token)
        .shard_count(1)
        .intents(Intents::GUILDS | Intents::GUILD_MESSAGES | Intents::MESSAGE_CONTENT)
        .compress(true)
        .presence(Presence {
            activities: vec![Activity {
                name: "the gateway".to_string(),
                kind: 3,
                url: None,
                state: None,
            }],
            status: Status::Online,
            ..Default::default()
        })
        .build()?;

    let cache = Arc::new(InMemoryCache::new());
    let connection = ShardConnection::new(0, config, cache, Arc::new(LoggingHandler));
    let handle = connection.handle();
    let metrics = connection.metrics();

    let task = tokio::spawn(connection.run());

    info!("Running... Press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    let snapshot = metrics.snapshot();
    info!("Final metrics:");
    info!("  Connections: {}", snapshot.connections_total);
    info!("  Resumes: {}", snapshot.resumes_total);
    info!("  Dispatches: {}", snapshot.dispatches_total);
    info!("  Heartbeats acked: {}", snapshot.heartbeats_acked_total);
    info!("  Latency: {:?}", handle.latency());

    handle.disconnect().await?;
    task.await??;
    info!("Shard stopped");

    Ok(())
}
