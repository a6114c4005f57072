use crate::bucket::{queue_all, TokenBucket};
use crate::cache::EntityCache;
use crate::compression::Decompressor;
use crate::config::{BucketConfig, ConnectionOptions, GatewayConfig, RateLimitConfig};
use crate::encoding::Encoding;
use crate::error::Error;
use crate::event::ShardEvent;
use crate::handler::GatewayHandler;
use crate::metrics::Metrics;
use crate::model::{Member, Snowflake};
use crate::pending::PendingHandle;
use crate::protocol::{MemberRequest, OpCode, OutboundFrame, Presence, VoiceStateOptions};
use crate::router::DispatchRouter;
use crate::shard::{Action, ReconnectPlan, Shard, ShardStatus};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::net::TcpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout_at, Duration, Instant, Interval, MissedTickBehavior, Sleep};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{
    client_async_tls_with_config, tungstenite::client::IntoClientRequest, tungstenite::Message,
    Connector, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, trace, warn};
use url::Url;

/// Close code reported when the stream ends without a close frame
const ABNORMAL_CLOSE_CODE: u16 = 1006;

/// Close code reported for a close frame without a status
const NO_STATUS_CLOSE_CODE: u16 = 1005;

/// Commands sent from a [`ShardHandle`] to its connection
#[derive(Debug)]
enum Command {
    RequestMembers {
        guild_id: Snowflake,
        request: MemberRequest,
        reply: oneshot::Sender<Result<PendingHandle<Member>, Error>>,
    },
    UpdatePresence(Presence),
    UpdateVoiceState {
        guild_id: Snowflake,
        channel_id: Option<Snowflake>,
        options: VoiceStateOptions,
    },
    /// Drop the transport and reconnect, resuming if possible
    Reconnect,
    /// Drop the transport and the session, and stop
    Disconnect,
}

/// Sanitize a proxy URL for logging by removing credentials.
/// Returns the URL with username/password replaced with "***" if present.
fn sanitize_proxy_url(proxy: &str) -> String {
    match Url::parse(proxy) {
        Ok(mut url) => {
            if !url.username().is_empty() || url.password().is_some() {
                // Replace credentials with placeholder
                let _ = url.set_username("***");
                let _ = url.set_password(Some("***"));
            }
            url.to_string()
        }
        Err(_) => "[invalid-url]".to_string(),
    }
}

/// The two outbound buckets of a shard
struct RateLimiter {
    global: TokenBucket,
    presence: TokenBucket,
}

impl RateLimiter {
    fn new(config: &RateLimitConfig) -> Self {
        let bucket =
            |c: &BucketConfig| TokenBucket::new(c.capacity, c.interval, c.reserved);
        Self {
            global: bucket(&config.global),
            presence: bucket(&config.presence),
        }
    }

    /// Buckets a frame must pass, in order
    fn gate(&self, op: Option<OpCode>) -> Vec<&TokenBucket> {
        match op {
            Some(OpCode::PresenceUpdate) => vec![&self.global, &self.presence],
            _ => vec![&self.global],
        }
    }
}

/// Work for the handler task, in publish order
enum Delivery {
    Event(ShardEvent),
    Ready,
}

/// Per-transport timers
struct Link {
    generation: u64,
    heartbeat: Option<Interval>,
    guild_timer: Option<Pin<Box<Sleep>>>,
}

/// How a transport ended
struct Closed {
    code: u16,
    plan: ReconnectPlan,
    error: Option<Error>,
}

/// Handle for driving a running shard from other tasks
#[derive(Debug, Clone)]
pub struct ShardHandle {
    shard_id: u32,
    commands: mpsc::Sender<Command>,
    metrics: Arc<Metrics>,
}

impl ShardHandle {
    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    /// Request a guild's member list and wait for every chunk, or for the
    /// request deadline, whichever comes first.
    pub async fn request_guild_members(
        &self,
        guild_id: impl Into<Snowflake>,
        request: MemberRequest,
    ) -> Result<Vec<Member>, Error> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::RequestMembers {
            guild_id: guild_id.into(),
            request,
            reply,
        })
        .await?;
        let handle = rx.await.map_err(|_| Error::ShuttingDown)??;
        Ok(handle.await)
    }

    pub async fn update_presence(&self, presence: Presence) -> Result<(), Error> {
        self.send(Command::UpdatePresence(presence)).await
    }

    /// Join or move to `channel_id`, or leave voice with `None`.
    pub async fn update_voice_state(
        &self,
        guild_id: impl Into<Snowflake>,
        channel_id: Option<Snowflake>,
        options: VoiceStateOptions,
    ) -> Result<(), Error> {
        self.send(Command::UpdateVoiceState {
            guild_id: guild_id.into(),
            channel_id,
            options,
        })
        .await
    }

    /// Drop the current transport and reconnect, resuming the session if one is held.
    pub async fn reconnect(&self) -> Result<(), Error> {
        self.send(Command::Reconnect).await
    }

    /// Close the connection, discard the session and make `run` return.
    pub async fn disconnect(&self) -> Result<(), Error> {
        self.send(Command::Disconnect).await
    }

    pub fn status(&self) -> ShardStatus {
        self.metrics
            .shard(self.shard_id)
            .map(|s| s.status)
            .unwrap_or_default()
    }

    /// Round trip of the last acknowledged heartbeat
    pub fn latency(&self) -> Option<Duration> {
        self.metrics.shard(self.shard_id).and_then(|s| s.latency)
    }

    async fn send(&self, command: Command) -> Result<(), Error> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::ShuttingDown)
    }
}

/// Runs one gateway shard: owns its transport, timers and rate limiters,
/// and reconnects according to the session state.
pub struct ShardConnection<H: GatewayHandler, C: EntityCache> {
    shard: Shard,
    config: Arc<GatewayConfig>,
    router: DispatchRouter<C>,
    handler: Arc<H>,
    metrics: Arc<Metrics>,
    encoding: Encoding,
    limiter: RateLimiter,
    /// Transport generation; admitted frames of an older one are dropped
    generation: u64,
    outbound_tx: mpsc::UnboundedSender<(u64, Message)>,
    outbound_rx: mpsc::UnboundedReceiver<(u64, Message)>,
    command_tx: mpsc::Sender<Command>,
    command_rx: mpsc::Receiver<Command>,
    loaded_tx: mpsc::UnboundedSender<Snowflake>,
    loaded_rx: mpsc::UnboundedReceiver<Snowflake>,
    delivery_tx: mpsc::UnboundedSender<Delivery>,
    delivery_rx: Option<mpsc::UnboundedReceiver<Delivery>>,
}

impl<H: GatewayHandler, C: EntityCache> ShardConnection<H, C> {
    pub fn new(shard_id: u32, config: GatewayConfig, cache: Arc<C>, handler: Arc<H>) -> Self {
        Self::with_metrics(shard_id, config, cache, handler, Arc::new(Metrics::new()))
    }

    /// Create a connection reporting into shared metrics
    pub fn with_metrics(
        shard_id: u32,
        config: GatewayConfig,
        cache: Arc<C>,
        handler: Arc<H>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let config = Arc::new(config);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::channel(64);
        let (loaded_tx, loaded_rx) = mpsc::unbounded_channel();
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        metrics.update_shard(shard_id, |_| {});

        Self {
            shard: Shard::new(shard_id, config.clone(), metrics.clone()),
            encoding: config.effective_encoding(),
            limiter: RateLimiter::new(&config.rate_limits),
            config: config.clone(),
            router: DispatchRouter::new(cache).with_message_limit(config.message_cache_limit),
            handler,
            metrics,
            generation: 0,
            outbound_tx,
            outbound_rx,
            command_tx,
            command_rx,
            loaded_tx,
            loaded_rx,
            delivery_tx,
            delivery_rx: Some(delivery_rx),
        }
    }

    pub fn handle(&self) -> ShardHandle {
        ShardHandle {
            shard_id: self.shard.id(),
            commands: self.command_tx.clone(),
            metrics: self.metrics.clone(),
        }
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn cache(&self) -> &Arc<C> {
        self.router.cache()
    }

    /// Run the connection loop until the shard is disconnected or fails fatally.
    ///
    /// Fatal errors (rejected token, invalid sharding or intents) are returned
    /// here after being published to the handler. Every event published
    /// before the return has been delivered by the time it happens.
    pub async fn run(mut self) -> Result<(), Error> {
        let delivery = self.delivery_rx.take().map(|rx| {
            tokio::spawn(deliver_events(
                self.handler.clone(),
                self.shard.id(),
                self.metrics.clone(),
                rx,
            ))
        });

        let shard_id = self.shard.id();
        let result = self.drive().await;

        // Closing the queue lets the handler task drain and exit
        drop(self);
        if let Some(task) = delivery {
            if let Err(e) = task.await {
                warn!("[SHARD-{}] Handler task failed: {:?}", shard_id, e);
            }
        }
        result
    }

    async fn drive(&mut self) -> Result<(), Error> {
        loop {
            let url = self.shard.connect()?;
            let closed = self.connect_and_run(url).await;

            match closed.plan {
                ReconnectPlan::Immediate => {}
                ReconnectPlan::After(delay) => {
                    if !self.wait_before_reconnect(delay).await {
                        info!("[SHARD-{}] Disconnected while waiting to reconnect", self.shard.id());
                        return Ok(());
                    }
                }
                ReconnectPlan::Stop => {
                    return match closed.error {
                        Some(e) if e.is_fatal() => {
                            error!("[SHARD-{}] Fatal gateway error: {}", self.shard.id(), e);
                            Err(e)
                        }
                        _ => {
                            info!("[SHARD-{}] Connection closed gracefully", self.shard.id());
                            Ok(())
                        }
                    };
                }
            }
        }
    }

    /// Open a transport and run it until it is torn down.
    async fn connect_and_run(&mut self, url: String) -> Closed {
        let config = self.config.clone();
        let deadline = Instant::now() + config.connect_timeout;
        let options = &config.connection;

        debug!(
            "[SHARD-{}] Connecting to {} (source_ip={:?}, proxy={:?}, headers={})",
            self.shard.id(),
            url,
            options.source_ip,
            options.proxy.as_deref().map(sanitize_proxy_url),
            options.headers.len()
        );

        let stream = match timeout_at(deadline, connect_with_options(&url, options)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.shard.on_connect_failed(e);
                return self.finish_detached().await;
            }
            Err(_) => {
                self.shard.on_connect_timeout();
                return self.finish_detached().await;
            }
        };

        self.generation += 1;
        let mut link = Link {
            generation: self.generation,
            heartbeat: None,
            guild_timer: None,
        };
        let mut decompressor = Decompressor::new(config.compression());
        let (mut write, mut read) = stream.split();

        let via = match (options.source_ip.as_deref(), options.proxy.as_deref()) {
            (Some(ip), Some(p)) => format!("{} via proxy {}", ip, sanitize_proxy_url(p)),
            (Some(ip), None) => ip.to_string(),
            (None, Some(p)) => format!("proxy {}", sanitize_proxy_url(p)),
            (None, None) => "default".to_string(),
        };
        info!("[SHARD-{}] Connected to {} ({})", self.shard.id(), url, via);
        self.shard.on_open();

        let closed = loop {
            if let Some(closed) = self.apply_actions(Some(&mut link)).await {
                break closed;
            }

            tokio::select! {
                message = read.next() => match message {
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            self.shard.on_transport_error(e.into());
                        }
                    }
                    Some(Ok(message)) => self.on_message(message, &mut decompressor),
                    Some(Err(e)) => {
                        warn!("[SHARD-{}] WebSocket error: {}", self.shard.id(), e);
                        self.shard.on_transport_error(e.into());
                    }
                    None => {
                        info!("[SHARD-{}] WebSocket stream ended", self.shard.id());
                        self.shard.on_close(ABNORMAL_CLOSE_CODE, "stream ended");
                    }
                },

                Some((generation, message)) = self.outbound_rx.recv() => {
                    if generation != link.generation {
                        trace!("[SHARD-{}] Dropping frame admitted for transport {}", self.shard.id(), generation);
                        continue;
                    }
                    match write.send(message).await {
                        Ok(()) => self.metrics.record_frame_sent(),
                        Err(e) => {
                            warn!("[SHARD-{}] Failed to send frame: {}", self.shard.id(), e);
                            self.shard.on_transport_error(e.into());
                        }
                    }
                }

                Some(command) = self.command_rx.recv() => self.apply_command(command),

                Some(guild_id) = self.loaded_rx.recv() => self.shard.on_members_loaded(&guild_id),

                _ = tick(&mut link.heartbeat) => self.shard.heartbeat(false),

                _ = fire(&mut link.guild_timer) => {
                    link.guild_timer = None;
                    self.shard.on_guild_create_timeout();
                }

                _ = tokio::time::sleep_until(deadline), if self.shard.is_handshaking() => {
                    self.shard.on_connect_timeout();
                }
            }
        };

        let frame = CloseFrame {
            code: WsCloseCode::from(closed.code),
            reason: "".into(),
        };
        if let Err(e) = write.send(Message::Close(Some(frame))).await {
            trace!("[SHARD-{}] Close frame not sent: {}", self.shard.id(), e);
        }
        closed
    }

    /// Process actions queued while no transport exists.
    async fn finish_detached(&mut self) -> Closed {
        self.apply_actions(None).await.unwrap_or(Closed {
            code: 1000,
            plan: ReconnectPlan::Stop,
            error: None,
        })
    }

    /// Sleep out the reconnect backoff. Returns false if told to disconnect.
    async fn wait_before_reconnect(&mut self, delay: Duration) -> bool {
        debug!("[SHARD-{}] Reconnecting in {:?}", self.shard.id(), delay);
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                Some(command) = self.command_rx.recv() => match command {
                    Command::Disconnect => {
                        self.shard.hard_reset();
                        return false;
                    }
                    Command::Reconnect => return true,
                    other => {
                        self.apply_command(other);
                        self.apply_actions(None).await;
                    }
                },
            }
        }
    }

    fn on_message(&mut self, message: Message, decompressor: &mut Decompressor) {
        match message {
            Message::Text(text) => self.on_frame_bytes(text.as_bytes()),
            Message::Binary(bytes) => match decompressor.feed(&bytes) {
                Ok(Some(frame)) => self.on_frame_bytes(&frame),
                Ok(None) => {}
                // The shared inflate context is unusable from here on
                Err(e) => {
                    self.shard.on_transport_error(e);
                }
            },
            Message::Close(frame) => {
                let (code, reason) = frame
                    .map(|f| (u16::from(f.code), f.reason.into_owned()))
                    .unwrap_or((NO_STATUS_CLOSE_CODE, String::new()));
                info!("[SHARD-{}] Received close frame ({})", self.shard.id(), code);
                self.shard.on_close(code, &reason);
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }

    fn on_frame_bytes(&mut self, bytes: &[u8]) {
        match self.encoding.decode(bytes) {
            Ok(frame) => self.shard.on_frame(frame),
            Err(e) => self.shard.on_decode_error(e),
        }
    }

    fn apply_command(&mut self, command: Command) {
        match command {
            Command::RequestMembers {
                guild_id,
                request,
                reply,
            } => {
                let _ = reply.send(self.shard.request_guild_members(guild_id, request));
            }
            Command::UpdatePresence(presence) => self.shard.update_presence(presence),
            Command::UpdateVoiceState {
                guild_id,
                channel_id,
                options,
            } => self.shard.update_voice_state(guild_id, channel_id, options),
            Command::Reconnect => {
                info!("[SHARD-{}] Received reconnect command", self.shard.id());
                self.shard.disconnect(true, None);
            }
            Command::Disconnect => {
                info!("[SHARD-{}] Received disconnect command", self.shard.id());
                self.shard.disconnect(false, None);
            }
        }
    }

    /// Carry out everything the state machine queued. Returns how the
    /// transport ends if one of the actions tore it down.
    async fn apply_actions(&mut self, mut link: Option<&mut Link>) -> Option<Closed> {
        let mut closed = None;
        loop {
            let actions = self.shard.drain_actions();
            if actions.is_empty() {
                return closed;
            }

            for action in actions {
                match action {
                    Action::Send { frame, priority } => match link.as_deref() {
                        Some(link) => self.queue_frame(frame, priority, link.generation),
                        None => debug!("[SHARD-{}] No transport, dropping op {}", self.shard.id(), frame.op),
                    },
                    Action::Emit(event) => self.deliver(Delivery::Event(event)),
                    Action::Dispatch(event) => {
                        let routed = self.router.route(event, self.shard.is_ready());
                        self.shard.apply_routed(routed);
                    }
                    Action::ArmHeartbeat(period) => {
                        if let Some(link) = link.as_deref_mut() {
                            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                            link.heartbeat = Some(interval);
                        }
                    }
                    Action::CancelHeartbeat => {
                        if let Some(link) = link.as_deref_mut() {
                            link.heartbeat = None;
                        }
                    }
                    Action::ArmGuildCreateTimeout(wait) => {
                        if let Some(link) = link.as_deref_mut() {
                            link.guild_timer = Some(Box::pin(tokio::time::sleep(wait)));
                        }
                    }
                    Action::CancelGuildCreateTimeout => {
                        if let Some(link) = link.as_deref_mut() {
                            link.guild_timer = None;
                        }
                    }
                    Action::TrackMembers { guild_id, handle } => self.track_members(guild_id, handle),
                    Action::NotifyReady => self.deliver(Delivery::Ready),
                    Action::Close { code, plan, error } => {
                        closed = Some(Closed { code, plan, error });
                    }
                }
            }
        }
    }

    /// Encode `frame` and hand it to the rate limiters.
    fn queue_frame(&self, frame: OutboundFrame, priority: bool, generation: u64) {
        let message = match self.encoding.encode(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("[SHARD-{}] Failed to encode op {}: {}", self.shard.id(), frame.op, e);
                self.metrics.record_error();
                return;
            }
        };
        debug!("[SHARD-{}] Queueing {}", self.shard.id(), frame.redacted());

        let outbound = self.outbound_tx.clone();
        queue_all(
            &self.limiter.gate(frame.opcode()),
            move || {
                let _ = outbound.send((generation, message));
            },
            priority,
        );
    }

    fn track_members(&self, guild_id: Snowflake, handle: PendingHandle<Member>) {
        let loaded = self.loaded_tx.clone();
        let shard_id = self.shard.id();
        tokio::spawn(async move {
            let members = handle.await;
            debug!(
                "[SHARD-{}] Loaded {} members of guild {}",
                shard_id,
                members.len(),
                guild_id
            );
            let _ = loaded.send(guild_id);
        });
    }

    /// Queue work for the handler task.
    fn deliver(&self, delivery: Delivery) {
        if self.delivery_tx.send(delivery).is_err() {
            trace!("[SHARD-{}] Handler task gone, event dropped", self.shard.id());
        }
    }
}

/// Call the handler for each queued item, in order, with panic protection.
///
/// Each call runs in its own task and is awaited before the next, so a
/// panicking handler loses one event and the shard keeps running. The
/// handler is free to call back into its [`ShardHandle`].
async fn deliver_events<H: GatewayHandler>(
    handler: Arc<H>,
    shard_id: u32,
    metrics: Arc<Metrics>,
    mut queue: mpsc::UnboundedReceiver<Delivery>,
) {
    while let Some(delivery) = queue.recv().await {
        let handler = handler.clone();
        let (name, result) = match delivery {
            Delivery::Event(event) => (
                "on_event",
                tokio::spawn(async move { handler.on_event(shard_id, event).await }).await,
            ),
            Delivery::Ready => (
                "shard_ready",
                tokio::spawn(async move { handler.shard_ready(shard_id).await }).await,
            ),
        };

        if let Err(e) = result {
            if e.is_panic() {
                error!(
                    "[SHARD-{}] Handler.{} panicked! Event dropped. Error: {:?}",
                    shard_id, name, e
                );
                metrics.record_error();
            } else {
                warn!("[SHARD-{}] Handler.{} task failed: {:?}", shard_id, name, e);
            }
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn fire(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => std::future::pending().await,
    }
}

/// Type alias for WebSocket stream
type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Open the WebSocket with the orchestrator's source IP, proxy and headers.
async fn connect_with_options(url: &str, options: &ConnectionOptions) -> Result<WsStream, Error> {
    let parsed_url =
        Url::parse(url).map_err(|e| Error::ConnectionFailed(format!("Invalid URL: {}", e)))?;

    let host = parsed_url
        .host_str()
        .ok_or_else(|| Error::ConnectionFailed("No host in URL".to_string()))?;

    let is_tls = parsed_url.scheme() == "wss";
    let port = parsed_url.port().unwrap_or(if is_tls { 443 } else { 80 });

    let mut request = url
        .into_client_request()
        .map_err(|e| Error::ConnectionFailed(format!("Invalid WebSocket request: {}", e)))?;

    for (name, value) in &options.headers {
        request.headers_mut().insert(name.clone(), value.clone());
    }

    let source_ip = options.source_ip.as_deref();
    let tcp_stream = match options.proxy.as_deref() {
        Some(proxy_url) => connect_via_proxy(proxy_url, host, port, source_ip).await?,
        None => connect_direct(host, port, source_ip).await?,
    };

    set_tcp_options(&tcp_stream);

    let connector = if is_tls {
        let tls = native_tls::TlsConnector::new()
            .map_err(|e| Error::ConnectionFailed(format!("TLS error: {}", e)))?;
        Some(Connector::NativeTls(tls))
    } else {
        None
    };

    let (ws_stream, _response) =
        client_async_tls_with_config(request, tcp_stream, None, connector).await?;

    Ok(ws_stream)
}

/// Connect directly (optionally with source IP binding)
async fn connect_direct(
    host: &str,
    port: u16,
    source_ip: Option<&str>,
) -> Result<tokio::net::TcpStream, Error> {
    let dest_str = format!("{}:{}", host, port);
    let dest_addr: SocketAddr = tokio::net::lookup_host(&dest_str)
        .await
        .map_err(|e| Error::ConnectionFailed(format!("DNS lookup failed: {}", e)))?
        .next()
        .ok_or_else(|| Error::ConnectionFailed(format!("No addresses found for {}", host)))?;

    let socket = if dest_addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|e| Error::ConnectionFailed(format!("Failed to create socket: {}", e)))?;

    if let Some(ip) = source_ip {
        let source_addr: SocketAddr = format!("{}:0", ip)
            .parse()
            .map_err(|e| Error::ConnectionFailed(format!("Invalid source IP '{}': {}", ip, e)))?;
        socket
            .bind(source_addr)
            .map_err(|e| Error::ConnectionFailed(format!("Failed to bind to {}: {}", ip, e)))?;
    }

    socket
        .connect(dest_addr)
        .await
        .map_err(|e| Error::ConnectionFailed(format!("TCP connect to {} failed: {}", dest_addr, e)))
}

/// Connect through a SOCKS5 proxy
async fn connect_via_proxy(
    proxy_url: &str,
    target_host: &str,
    target_port: u16,
    source_ip: Option<&str>,
) -> Result<tokio::net::TcpStream, Error> {
    let parsed = Url::parse(proxy_url)
        .map_err(|e| Error::ConnectionFailed(format!("Invalid proxy URL: {}", e)))?;

    if !matches!(parsed.scheme(), "socks5" | "socks5h") {
        return Err(Error::ConnectionFailed(format!(
            "Unsupported proxy scheme '{}'",
            parsed.scheme()
        )));
    }

    let proxy_host = parsed
        .host_str()
        .ok_or_else(|| Error::ConnectionFailed("No host in proxy URL".to_string()))?;
    let proxy_port = parsed.port().unwrap_or(1080);

    // tokio-socks opens the proxy socket itself
    if source_ip.is_some() {
        warn!("source_ip is not supported with SOCKS5 proxy, ignoring");
    }

    let proxy_addr = (proxy_host, proxy_port);
    let target = (target_host, target_port);

    let socks_stream = if !parsed.username().is_empty() {
        tokio_socks::tcp::Socks5Stream::connect_with_password(
            proxy_addr,
            target,
            parsed.username(),
            parsed.password().unwrap_or(""),
        )
        .await
    } else {
        tokio_socks::tcp::Socks5Stream::connect(proxy_addr, target).await
    }
    .map_err(|e| Error::ConnectionFailed(format!("SOCKS5 connect failed: {}", e)))?;

    Ok(socks_stream.into_inner())
}

/// Set TCP options for low latency
fn set_tcp_options(stream: &tokio::net::TcpStream) {
    let sock2 = socket2::SockRef::from(stream);

    // Heartbeats are tiny; never hold them back
    let _ = sock2.set_nodelay(true);

    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));
    let _ = sock2.set_tcp_keepalive(&keepalive);
}
