use crate::event::ShardEvent;
use std::future::Future;

/// Trait that users implement to receive gateway events.
///
/// The connection driver owns the transport, heartbeating, resuming and
/// rate limiting; the handler only sees the republished events. Calls for
/// one shard are made in order from a task of their own, so the handler may
/// await a [`ShardHandle`](crate::ShardHandle) call, such as a member
/// request, without stalling the connection. Events queue up while a call
/// is in progress.
///
/// # Example
///
/// ```ignore
/// use gateway_shard::{GatewayHandler, ShardEvent};
///
/// struct Logger;
///
/// impl GatewayHandler for Logger {
///     async fn on_event(&self, shard_id: u32, event: ShardEvent) {
///         if let ShardEvent::MessageCreate(message) = event {
///             println!("[{shard_id}] {}", message.content);
///         }
///     }
/// }
/// ```
pub trait GatewayHandler: Send + Sync + 'static {
    /// Called for every event the shard publishes, lifecycle and dispatch alike.
    fn on_event(&self, shard_id: u32, event: ShardEvent) -> impl Future<Output = ()> + Send;

    /// Called when the shard holds a session (READY or RESUMED).
    ///
    /// Orchestrators use this to release the next shard waiting to identify.
    fn shard_ready(&self, _shard_id: u32) -> impl Future<Output = ()> + Send {
        async {}
    }
}
