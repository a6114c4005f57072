//! # gateway-shard
//!
//! A single persistent, resumable connection to a sharded real-time gateway.
//!
//! ## Features
//!
//! - **Session resumption** with sequence tracking and the gateway's resume URL
//! - **Heartbeating** on the server-provided interval, with zombie detection
//! - **Reconnection** with bounded exponential backoff and close-code policy
//! - **Rate limiting** of outbound frames through global and presence token buckets
//! - **Streaming zlib** decompression and JSON (or, with `etf`, binary) encoding
//! - **Dispatch routing** into an entity cache, republished as typed events
//! - **Member chunking** correlated by nonce, resolved at completion or deadline
//! - **Metrics** for observability
//!
//! ## Example
//!
//! ```ignore
//! use gateway_shard::{GatewayConfig, GatewayHandler, InMemoryCache, Intents, ShardConnection, ShardEvent};
//! use std::sync::Arc;
//!
//! struct MyHandler;
//!
//! impl GatewayHandler for MyHandler {
//!     async fn on_event(&self, shard_id: u32, event: ShardEvent) {
//!         // ...
//!     }
//! }
//!
//! let config = GatewayConfig::builder(token)
//!     .shard_count(4)
//!     .intents(Intents::GUILDS | Intents::GUILD_MESSAGES)
//!     .build()?;
//!
//! let connection = ShardConnection::new(0, config, Arc::new(InMemoryCache::new()), Arc::new(MyHandler));
//! let handle = connection.handle();
//! tokio::spawn(connection.run());
//! ```

mod bucket;
mod cache;
mod compression;
mod config;
mod connection;
mod encoding;
mod error;
mod event;
mod handler;
mod health;
mod metrics;
mod model;
mod pending;
mod protocol;
mod router;
mod shard;

pub use bucket::{queue_all, TokenBucket};
pub use cache::{EntityCache, EntityStore, InMemoryCache, MemberKey, MemoryStore};
pub use compression::{Compression, Decompressor};
pub use config::{
    BackoffConfig, BucketConfig, ConfigError, ConnectionOptions, GatewayConfig,
    GatewayConfigBuilder, RateLimitConfig, DEFAULT_GATEWAY_URL,
};
pub use connection::{ShardConnection, ShardHandle};
pub use encoding::Encoding;
pub use error::{Error, ErrorKind};
pub use event::{
    DispatchEvent, GuildCreatePayload, GuildEmojisUpdatePayload, GuildMemberPayload,
    GuildMemberRemovePayload, GuildMembersChunkPayload, GuildRoleDeletePayload, GuildRolePayload,
    GuildStickersUpdatePayload, MessageDeleteBulkPayload, MessageDeletePayload,
    MessageUpdatePayload, PartialUser, PresencePayload, PresenceUpdatePayload, ReadyPayload,
    ShardEvent, ThreadListSyncPayload, ThreadMembersUpdatePayload, VoiceStatePayload,
};
pub use handler::GatewayHandler;
pub use metrics::{Metrics, MetricsSnapshot, ShardMetrics};
pub use model::{
    Channel, Guild, Member, MemberPresence, Message, Role, Snowflake, ThreadMember,
    UnavailableGuild, User,
};
pub use pending::{PendingHandle, PendingRequests};
pub use protocol::{
    Activity, CloseCode, ConnectionProperties, GatewayFrame, Intents, MemberRequest, OpCode,
    OutboundFrame, Packet, Presence, Status, VoiceStateOptions, GATEWAY_VERSION,
};
pub use router::{DispatchRouter, RouteEffect, Routed, DEFAULT_MESSAGE_LIMIT};
pub use shard::{Action, ReconnectPlan, Shard, ShardStatus};

// Re-export http types for ConnectionOptions::headers
pub use http::{HeaderName, HeaderValue};

/// Result type for gateway-shard operations
pub type Result<T> = std::result::Result<T, Error>;
