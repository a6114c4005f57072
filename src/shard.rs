//! Session state machine of a single gateway shard.
//!
//! [`Shard`] performs no I/O. Every input (an inbound frame, a timer firing,
//! a transport close, a request from the application) mutates the session
//! state and queues [`Action`]s that the connection driver carries out in
//! order. Decoded dispatches are handed back as [`Action::Dispatch`]; the
//! driver routes them through the cache and feeds the outcome to
//! [`Shard::apply_routed`].

use crate::config::GatewayConfig;
use crate::error::Error;
use crate::event::{DispatchEvent, ShardEvent};
use crate::health::HeartbeatMonitor;
use crate::metrics::Metrics;
use crate::model::{Member, Snowflake};
use crate::pending::{new_nonce, PendingHandle, PendingRequests};
use crate::protocol::{
    CloseCode, GatewayFrame, Identify, Intents, MemberRequest, OpCode, OutboundFrame, Packet,
    Presence, RequestGuildMembers, Resume, Status, UpdateVoiceState, VoiceStateOptions,
    MAX_MEMBER_REQUEST_USER_IDS, RESUME_CLOSE_CODE,
};
use crate::router::{RouteEffect, Routed};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Close code for a clean shutdown that gives up the session
const NORMAL_CLOSE_CODE: u16 = 1000;

/// Lifecycle of the shard's connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShardStatus {
    #[default]
    Disconnected,
    /// Transport is being opened
    Connecting,
    /// Transport open, waiting for HELLO
    Handshaking,
    /// IDENTIFY sent, waiting for READY
    Identifying,
    /// RESUME sent, waiting for RESUMED
    Resuming,
    Ready,
}

/// What the driver does after a transport is torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPlan {
    /// Reconnect right away and resume the held session
    Immediate,
    /// Wait, then reconnect with a fresh IDENTIFY
    After(Duration),
    /// Stay disconnected
    Stop,
}

/// Side effect requested by the state machine
#[derive(Debug)]
pub enum Action {
    /// Write a frame through the rate limiters; `priority` may use reserved tokens
    Send { frame: OutboundFrame, priority: bool },
    /// Publish an event to the handler
    Emit(ShardEvent),
    /// Route a decoded dispatch and hand the outcome to [`Shard::apply_routed`]
    Dispatch(DispatchEvent),
    /// (Re)start the heartbeat timer with this period
    ArmHeartbeat(Duration),
    CancelHeartbeat,
    /// (Re)start the one-shot guild-create timer
    ArmGuildCreateTimeout(Duration),
    CancelGuildCreateTimeout,
    /// A startup member request is in flight; report back with
    /// [`Shard::on_members_loaded`] once `handle` resolves
    TrackMembers {
        guild_id: Snowflake,
        handle: PendingHandle<Member>,
    },
    /// Tell the orchestrator this shard holds a session
    NotifyReady,
    /// Tear down the transport with `code`, then follow `plan`
    Close {
        code: u16,
        plan: ReconnectPlan,
        error: Option<Error>,
    },
}

/// Session state of one shard.
pub struct Shard {
    id: u32,
    config: Arc<GatewayConfig>,
    metrics: Arc<Metrics>,
    status: ShardStatus,
    /// A transport exists (opening or open)
    connected: bool,
    /// Between `connect()` and READY/RESUMED
    handshaking: bool,

    sequence: u64,
    session_id: Option<String>,
    resume_url: Option<String>,

    heartbeat: HeartbeatMonitor,
    connect_attempts: u32,
    reconnect_interval: Duration,
    presence: Presence,

    pre_ready: bool,
    ready: bool,
    /// Guilds READY announced as unavailable that have not arrived yet
    unavailable_guilds: HashSet<Snowflake>,
    /// Large guilds whose member list is queued or being fetched
    loading_guilds: HashSet<Snowflake>,
    member_queue: VecDeque<Snowflake>,
    member_requests: PendingRequests<Member>,

    actions: Vec<Action>,
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("sequence", &self.sequence)
            .field("session_id", &self.session_id)
            .field("connect_attempts", &self.connect_attempts)
            .field("ready", &self.ready)
            .finish_non_exhaustive()
    }
}

impl Shard {
    pub fn new(id: u32, config: Arc<GatewayConfig>, metrics: Arc<Metrics>) -> Self {
        let presence = config.presence.clone();
        let reconnect_interval = config.backoff.floor;
        Self {
            id,
            config,
            metrics,
            status: ShardStatus::Disconnected,
            connected: false,
            handshaking: false,
            sequence: 0,
            session_id: None,
            resume_url: None,
            heartbeat: HeartbeatMonitor::new(),
            connect_attempts: 0,
            reconnect_interval,
            presence,
            pre_ready: false,
            ready: false,
            unavailable_guilds: HashSet::new(),
            loading_guilds: HashSet::new(),
            member_queue: VecDeque::new(),
            member_requests: PendingRequests::new(),
            actions: Vec::new(),
        }
    }

    // ========== Accessors ==========

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn config(&self) -> &Arc<GatewayConfig> {
        &self.config
    }

    pub fn status(&self) -> ShardStatus {
        self.status
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn resume_url(&self) -> Option<&str> {
        self.resume_url.as_deref()
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts
    }

    pub fn reconnect_interval(&self) -> Duration {
        self.reconnect_interval
    }

    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Startup finished: every guild arrived (or timed out) and member loading is done
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn is_pre_ready(&self) -> bool {
        self.pre_ready
    }

    /// Between `connect()` and READY/RESUMED; the connect deadline applies
    pub fn is_handshaking(&self) -> bool {
        self.handshaking
    }

    /// Round trip of the last acknowledged heartbeat
    pub fn latency(&self) -> Option<Duration> {
        self.heartbeat.latency()
    }

    /// Latency in milliseconds, infinite while unknown
    pub fn latency_ms(&self) -> f64 {
        self.heartbeat.latency_ms()
    }

    /// Take every queued action, oldest first.
    pub fn drain_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    // ========== Connection lifecycle ==========

    /// Start a connection attempt and return the URL to open.
    pub fn connect(&mut self) -> Result<String, Error> {
        if self.connected {
            self.error(Error::AlreadyConnected(self.id));
            return Err(Error::AlreadyConnected(self.id));
        }
        if self.config.token.is_empty() {
            return Err(Error::InvalidToken);
        }

        self.connect_attempts += 1;
        self.connected = true;
        self.handshaking = true;
        self.set_status(ShardStatus::Connecting);
        self.metrics.update_shard(self.id, |s| s.connect_attempts = self.connect_attempts);

        let url = match (self.session_id.is_some(), self.resume_url.clone()) {
            (true, Some(url)) => url,
            (true, None) => {
                self.warn("Resuming a session without a resume URL; using the primary gateway");
                self.config.gateway_endpoint()
            }
            (false, _) => self.config.gateway_endpoint(),
        };
        self.debug(format!("Connection attempt {} to {url}", self.connect_attempts));
        Ok(url)
    }

    /// The transport is open.
    pub fn on_open(&mut self) {
        self.heartbeat.reset();
        self.set_status(ShardStatus::Handshaking);
        self.metrics.record_connection();
        self.metrics.update_shard(self.id, |s| {
            s.is_connected = true;
            s.last_connected_at = Some(std::time::Instant::now());
        });
        info!("[SHARD-{}] Connected", self.id);
        self.emit(ShardEvent::Connect);
    }

    /// The transport could not be opened.
    pub fn on_connect_failed(&mut self, error: Error) -> ReconnectPlan {
        warn!("[SHARD-{}] Connection failed: {}", self.id, error);
        self.disconnect(self.config.auto_reconnect, Some(error))
    }

    /// The connect deadline passed before READY or RESUMED.
    pub fn on_connect_timeout(&mut self) -> ReconnectPlan {
        if !self.handshaking {
            return ReconnectPlan::Stop;
        }
        warn!("[SHARD-{}] Connection timeout", self.id);
        self.disconnect(self.config.auto_reconnect, Some(Error::ConnectTimeout))
    }

    /// An inbound frame could not be decoded. The connection continues.
    pub fn on_decode_error(&mut self, error: Error) {
        self.metrics.record_decode_error();
        warn!("[SHARD-{}] {}", self.id, error);
        self.error(error);
    }

    /// The transport failed underneath an open connection.
    pub fn on_transport_error(&mut self, error: Error) -> ReconnectPlan {
        self.disconnect(self.config.auto_reconnect, Some(error))
    }

    /// The transport was closed, by the gateway or the network.
    pub fn on_close(&mut self, code: u16, reason: &str) -> ReconnectPlan {
        let close = CloseCode::from(code);
        let clean = close == CloseCode::Normal;
        self.debug(format!(
            "{} WS close: {}: {}",
            if clean { "Clean" } else { "Unclean" },
            code,
            reason
        ));

        if close.clears_session() {
            self.session_id = None;
        }
        if close.resets_sequence() {
            self.sequence = 0;
        }

        let reconnect = close.should_reconnect() && self.config.auto_reconnect;
        let error = (!clean).then(|| Error::Gateway {
            code: close,
            message: close.description().to_string(),
        });
        self.disconnect(reconnect, error)
    }

    /// Tear down the current transport and decide how to continue.
    ///
    /// A held session is resumed immediately; otherwise the shard waits out
    /// the reconnect interval, which then grows. Without `reconnect` the whole
    /// session is discarded.
    pub fn disconnect(&mut self, reconnect: bool, error: Option<Error>) -> ReconnectPlan {
        if !self.connected {
            return ReconnectPlan::Stop;
        }

        let code = if reconnect && self.session_id.is_some() {
            RESUME_CLOSE_CODE
        } else {
            NORMAL_CLOSE_CODE
        };
        self.actions.push(Action::CancelHeartbeat);
        self.actions.push(Action::CancelGuildCreateTimeout);
        self.connected = false;
        self.reset();
        self.metrics.update_shard(self.id, |s| {
            s.is_connected = false;
            if let Some(at) = s.last_connected_at.take() {
                s.total_uptime += at.elapsed();
            }
        });

        if let Some(error) = &error {
            self.error(error.clone());
        }
        info!("[SHARD-{}] Disconnected", self.id);
        self.emit(ShardEvent::Disconnect {
            error: error.clone(),
        });

        if self.session_id.is_some() && self.connect_attempts >= self.config.max_reconnect_attempts {
            self.debug(format!(
                "Automatically invalidating session due to excessive resume attempts | Attempt {}",
                self.connect_attempts
            ));
            self.session_id = None;
        }

        let plan = if !reconnect {
            self.hard_reset();
            ReconnectPlan::Stop
        } else if self.session_id.is_some() {
            self.debug(format!("Immediately reconnecting for potential resume | Attempt {}", self.connect_attempts));
            ReconnectPlan::Immediate
        } else {
            let wait = self.reconnect_interval;
            self.debug(format!(
                "Queueing reconnect in {}ms | Attempt {}",
                wait.as_millis(),
                self.connect_attempts
            ));
            self.reconnect_interval = self.config.backoff.next_interval(wait);
            ReconnectPlan::After(wait)
        };
        if plan != ReconnectPlan::Stop {
            self.metrics.record_reconnection();
        }

        self.actions.push(Action::Close { code, plan, error });
        plan
    }

    /// Drop per-connection state. The session survives.
    pub fn reset(&mut self) {
        let flushed = self.member_requests.flush();
        if flushed > 0 {
            debug!("[SHARD-{}] Resolved {} member requests early", self.id, flushed);
        }
        self.handshaking = false;
        self.ready = false;
        self.pre_ready = false;
        self.unavailable_guilds.clear();
        self.loading_guilds.clear();
        self.member_queue.clear();
        self.heartbeat.reset();
        self.set_status(ShardStatus::Disconnected);
    }

    /// Forget the session entirely.
    pub fn hard_reset(&mut self) {
        self.reset();
        self.sequence = 0;
        self.session_id = None;
        self.resume_url = None;
        self.reconnect_interval = self.config.backoff.floor;
        self.connect_attempts = 0;
        self.presence = self.config.presence.clone();
        self.metrics.update_shard(self.id, |s| {
            s.sequence = 0;
            s.connect_attempts = 0;
            s.latency = None;
        });
    }

    // ========== Inbound ==========

    /// Handle one decoded inbound frame.
    pub fn on_frame(&mut self, frame: GatewayFrame) {
        self.metrics.record_frame_received();
        self.metrics
            .update_shard(self.id, |s| s.last_frame_at = Some(std::time::Instant::now()));

        if let Some(sequence) = frame.s.filter(|s| *s > 0) {
            if sequence > self.sequence + 1 && self.status != ShardStatus::Resuming {
                self.warn(format!(
                    "Non-consecutive sequence ({} -> {})",
                    self.sequence, sequence
                ));
            }
            self.sequence = sequence;
            self.metrics.update_shard(self.id, |s| s.sequence = sequence);
        }

        let packet = match frame.into_packet() {
            Ok(packet) => packet,
            Err(e) => {
                self.metrics.record_decode_error();
                self.error(e);
                return;
            }
        };

        match packet {
            Packet::Dispatch { name, data } => match DispatchEvent::decode(&name, data) {
                Ok(event) => {
                    self.metrics.record_dispatch();
                    self.actions.push(Action::Dispatch(event));
                }
                Err(e) => {
                    self.metrics.record_decode_error();
                    warn!("[SHARD-{}] Failed to decode {}: {}", self.id, name, e);
                    self.error(e);
                }
            },
            Packet::Heartbeat => self.heartbeat(true),
            Packet::InvalidSession { resumable } => {
                self.metrics.record_invalid_session();
                if resumable {
                    self.warn("Session invalidated, resuming");
                    self.resume();
                } else {
                    self.sequence = 0;
                    self.session_id = None;
                    self.warn("Session invalidated, identifying");
                    self.identify();
                }
            }
            Packet::Reconnect => {
                self.debug("Reconnecting due to server request");
                self.disconnect(true, None);
            }
            Packet::Hello { heartbeat_interval } => {
                self.debug(format!(
                    "Received HELLO, heartbeat interval {}ms",
                    heartbeat_interval.as_millis()
                ));
                self.actions.push(Action::ArmHeartbeat(heartbeat_interval));
                self.heartbeat(false);
                if self.session_id.is_some() {
                    self.resume();
                } else {
                    self.identify();
                }
                self.emit(ShardEvent::Hello { heartbeat_interval });
            }
            Packet::HeartbeatAck => {
                self.heartbeat.record_ack();
                self.metrics.record_heartbeat_ack();
                let latency = self.heartbeat.latency();
                self.metrics.update_shard(self.id, |s| s.latency = latency);
            }
            Packet::Unknown { op } => self.warn(format!("Unhandled op code {op}")),
        }
    }

    /// Send a heartbeat. `requested` marks one asked for by the gateway, which
    /// does not wait for an ack.
    pub fn heartbeat(&mut self, requested: bool) {
        if matches!(self.status, ShardStatus::Resuming | ShardStatus::Identifying) {
            return;
        }
        if requested {
            self.heartbeat.record_requested();
        } else {
            if !self.heartbeat.is_acked() {
                self.metrics.record_heartbeat_timeout();
                self.debug("Heartbeat timeout");
                self.disconnect(self.config.auto_reconnect, Some(Error::HeartbeatTimeout));
                return;
            }
            self.heartbeat.record_sent();
        }
        self.metrics.record_heartbeat_sent();
        self.send(OutboundFrame::heartbeat(self.sequence), true);
    }

    /// The guild-create timer fired: stop waiting for unavailable guilds.
    pub fn on_guild_create_timeout(&mut self) {
        if !self.unavailable_guilds.is_empty() {
            self.debug(format!(
                "Guild create timeout with {} guilds still unavailable",
                self.unavailable_guilds.len()
            ));
        }
        self.check_ready();
    }

    /// A startup member request resolved, completely or at its deadline.
    pub fn on_members_loaded(&mut self, guild_id: &Snowflake) {
        if self.loading_guilds.remove(guild_id) {
            self.check_ready();
        }
    }

    /// Fold the outcome of a routed dispatch back into the session.
    pub fn apply_routed(&mut self, routed: Routed) {
        for event in routed.events {
            self.emit(event);
        }
        for effect in routed.effects {
            match effect {
                RouteEffect::Ready {
                    session_id,
                    resume_gateway_url,
                    unavailable_guilds,
                } => self.on_ready(session_id, &resume_gateway_url, unavailable_guilds),
                RouteEffect::Resumed => self.on_resumed(),
                RouteEffect::GuildCreated {
                    guild_id,
                    member_shortfall,
                } => self.on_guild_created(guild_id, member_shortfall),
                RouteEffect::MembersChunk {
                    guild_id,
                    nonce,
                    members,
                    chunk_index,
                    chunk_count,
                } => {
                    self.member_requests.append(&nonce, members);
                    if self.member_requests.complete(&nonce, chunk_index, chunk_count) {
                        self.metrics.record_member_request_completed();
                    }
                    if chunk_index.saturating_add(1) >= chunk_count {
                        self.on_members_loaded(&guild_id);
                    }
                    self.heartbeat.mark_alive();
                }
            }
        }
    }

    fn on_ready(&mut self, session_id: String, resume_url: &str, unavailable: Vec<Snowflake>) {
        self.connect_attempts = 0;
        self.reconnect_interval = self.config.backoff.floor;
        self.handshaking = false;
        self.set_status(ShardStatus::Ready);
        self.metrics.update_shard(self.id, |s| s.connect_attempts = 0);
        self.actions.push(Action::NotifyReady);

        info!("[SHARD-{}] Session {} established", self.id, session_id);
        self.session_id = Some(session_id);
        self.resume_url = Some(self.config.endpoint_for(resume_url));

        self.unavailable_guilds = unavailable.into_iter().collect();
        self.pre_ready = true;
        self.emit(ShardEvent::PreReady);

        if self.unavailable_guilds.is_empty() {
            self.check_ready();
        } else {
            self.arm_guild_create_timeout();
        }
    }

    fn on_resumed(&mut self) {
        self.connect_attempts = 0;
        self.reconnect_interval = self.config.backoff.floor;
        self.handshaking = false;
        self.pre_ready = true;
        self.ready = true;
        self.set_status(ShardStatus::Ready);
        self.metrics.update_shard(self.id, |s| s.connect_attempts = 0);
        self.actions.push(Action::NotifyReady);
        info!("[SHARD-{}] Session resumed at sequence {}", self.id, self.sequence);
        self.emit(ShardEvent::Resumed);
    }

    fn on_guild_created(&mut self, guild_id: Snowflake, member_shortfall: bool) {
        let fetch = self.config.get_all_users && member_shortfall;
        if self.ready {
            if fetch {
                let presences = self.config.intents.contains(Intents::GUILD_PRESENCES);
                if let Err(e) = self.request_all_members(guild_id, presences) {
                    self.error(e);
                }
            }
            return;
        }

        self.unavailable_guilds.remove(&guild_id);
        if fetch && self.loading_guilds.insert(guild_id.clone()) {
            self.member_queue.push_back(guild_id);
        }
        if self.unavailable_guilds.is_empty() {
            self.actions.push(Action::CancelGuildCreateTimeout);
            self.check_ready();
        } else {
            self.arm_guild_create_timeout();
        }
    }

    fn arm_guild_create_timeout(&mut self) {
        self.actions
            .push(Action::ArmGuildCreateTimeout(self.config.guild_create_timeout));
    }

    /// Start the next queued member fetch, or declare the shard ready once
    /// nothing is loading.
    fn check_ready(&mut self) {
        if self.ready || !self.pre_ready {
            return;
        }

        // One startup member request at a time
        while self.loading_guilds.len() == self.member_queue.len() {
            let Some(guild_id) = self.member_queue.pop_front() else {
                break;
            };
            let presences = self.config.intents.contains(Intents::GUILD_PRESENCES);
            match self.request_all_members(guild_id.clone(), presences) {
                Ok(handle) => {
                    self.actions.push(Action::TrackMembers { guild_id, handle });
                }
                Err(e) => {
                    self.warn(format!("Skipping member fetch for guild {guild_id}: {e}"));
                    self.loading_guilds.remove(&guild_id);
                }
            }
        }

        if self.loading_guilds.is_empty() {
            self.ready = true;
            info!("[SHARD-{}] Ready", self.id);
            self.emit(ShardEvent::Ready);
        }
    }

    fn request_all_members(
        &mut self,
        guild_id: Snowflake,
        presences: bool,
    ) -> Result<PendingHandle<Member>, Error> {
        self.request_guild_members(
            guild_id,
            MemberRequest {
                presences,
                ..Default::default()
            },
        )
    }

    // ========== Outbound ==========

    /// Send IDENTIFY for a fresh session.
    pub fn identify(&mut self) {
        let payload = Identify {
            token: self.config.token.clone(),
            properties: self.config.connection_properties.clone(),
            compress: self.config.compress,
            large_threshold: self.config.large_threshold,
            shard: [self.id, self.config.shard_count],
            presence: self.presence.clone(),
            intents: self.config.intents,
        };
        match OutboundFrame::new(OpCode::Identify, &payload) {
            Ok(frame) => {
                self.set_status(ShardStatus::Identifying);
                self.metrics.record_identify();
                self.debug(format!(
                    "Identifying as shard {}/{}",
                    self.id, self.config.shard_count
                ));
                self.send(frame, false);
            }
            Err(e) => self.error(e),
        }
    }

    /// Send RESUME for the held session, falling back to IDENTIFY without one.
    pub fn resume(&mut self) {
        let Some(session_id) = self.session_id.clone() else {
            self.identify();
            return;
        };
        let payload = Resume {
            token: self.config.token.clone(),
            session_id,
            seq: self.sequence,
        };
        match OutboundFrame::new(OpCode::Resume, &payload) {
            Ok(frame) => {
                self.set_status(ShardStatus::Resuming);
                self.metrics.record_resume();
                self.debug(format!("Resuming at sequence {}", self.sequence));
                self.send(frame, false);
            }
            Err(e) => self.error(e),
        }
    }

    /// Replace the shard's presence. It is also sent with every later IDENTIFY.
    pub fn update_presence(&mut self, mut presence: Presence) {
        presence.since = (presence.status == Status::Idle).then(unix_millis);
        match OutboundFrame::new(OpCode::PresenceUpdate, &presence) {
            Ok(frame) => {
                self.presence = presence;
                self.send(frame, false);
            }
            Err(e) => self.error(e),
        }
    }

    /// Request a guild's member list. The handle resolves with every member
    /// received by the final chunk, or with what arrived by the deadline.
    pub fn request_guild_members(
        &mut self,
        guild_id: Snowflake,
        request: MemberRequest,
    ) -> Result<PendingHandle<Member>, Error> {
        let MemberRequest {
            limit,
            presences,
            mut query,
            user_ids,
            timeout,
        } = request;

        if query.is_none() && user_ids.is_none() {
            query = Some(String::new());
        }
        let all_members = query.as_deref().map_or(true, str::is_empty) && user_ids.is_none();
        if all_members && !self.config.intents.contains(Intents::GUILD_MEMBERS) {
            return Err(Error::Capability(
                "Cannot request all members without the GUILD_MEMBERS intent.".to_string(),
            ));
        }
        if presences && !self.config.intents.contains(Intents::GUILD_PRESENCES) {
            return Err(Error::Capability(
                "Cannot request members presences without the GUILD_PRESENCES intent.".to_string(),
            ));
        }
        if user_ids
            .as_ref()
            .is_some_and(|ids| ids.len() > MAX_MEMBER_REQUEST_USER_IDS)
        {
            return Err(Error::Capability(format!(
                "Cannot request more than {MAX_MEMBER_REQUEST_USER_IDS} members by their ID."
            )));
        }

        let nonce = new_nonce();
        let frame = OutboundFrame::new(
            OpCode::RequestGuildMembers,
            &RequestGuildMembers {
                guild_id,
                limit,
                user_ids,
                query,
                nonce: nonce.clone(),
                presences,
            },
        )?;

        let deadline = Instant::now() + timeout.unwrap_or(self.config.request_timeout);
        let handle = self.member_requests.open(nonce, deadline);
        self.metrics.record_member_request();
        self.send(frame, false);
        Ok(handle)
    }

    /// Join, move between or leave (`channel_id: None`) voice channels.
    pub fn update_voice_state(
        &mut self,
        guild_id: Snowflake,
        channel_id: Option<Snowflake>,
        options: VoiceStateOptions,
    ) {
        let payload = UpdateVoiceState {
            guild_id,
            channel_id,
            self_mute: options.self_mute,
            self_deaf: options.self_deaf,
        };
        match OutboundFrame::new(OpCode::VoiceStateUpdate, &payload) {
            Ok(frame) => self.send(frame, false),
            Err(e) => self.error(e),
        }
    }

    // ========== Helpers ==========

    fn send(&mut self, frame: OutboundFrame, priority: bool) {
        if !self.connected {
            debug!("[SHARD-{}] Dropping op {} while disconnected", self.id, frame.op);
            return;
        }
        self.actions.push(Action::Send { frame, priority });
    }

    fn set_status(&mut self, status: ShardStatus) {
        self.status = status;
        self.metrics.update_shard(self.id, |s| s.status = status);
    }

    fn emit(&mut self, event: ShardEvent) {
        self.actions.push(Action::Emit(event));
    }

    fn debug(&mut self, message: impl Into<String>) {
        let message = message.into();
        debug!("[SHARD-{}] {}", self.id, message);
        self.emit(ShardEvent::Debug(message));
    }

    fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("[SHARD-{}] {}", self.id, message);
        self.emit(ShardEvent::Warn(message));
    }

    fn error(&mut self, error: Error) {
        self.metrics.record_error();
        self.emit(ShardEvent::Error(error));
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{EntityCache, InMemoryCache};
    use crate::encoding::Encoding;
    use crate::router::DispatchRouter;
    use serde_json::{json, Value};

    struct Harness {
        shard: Shard,
        router: DispatchRouter<InMemoryCache>,
    }

    impl Harness {
        fn new(config: GatewayConfig) -> Self {
            Self {
                shard: Shard::new(0, Arc::new(config), Arc::new(Metrics::new())),
                router: DispatchRouter::new(Arc::new(InMemoryCache::new())),
            }
        }

        fn connected(config: GatewayConfig) -> Self {
            let mut harness = Self::new(config);
            harness.shard.connect().unwrap();
            harness.shard.on_open();
            harness.settle();
            harness
        }

        /// Drain actions, routing dispatches the way the driver does.
        fn settle(&mut self) -> Vec<Action> {
            let mut out = Vec::new();
            let mut queue: VecDeque<Action> = self.shard.drain_actions().into();
            while let Some(action) = queue.pop_front() {
                match action {
                    Action::Dispatch(event) => {
                        let routed = self.router.route(event, self.shard.is_ready());
                        self.shard.apply_routed(routed);
                        queue.extend(self.shard.drain_actions());
                    }
                    other => out.push(other),
                }
            }
            out
        }

        fn frame(&mut self, frame: Value) -> Vec<Action> {
            self.shard.on_frame(serde_json::from_value(frame).unwrap());
            self.settle()
        }

        fn hello(&mut self) -> Vec<Action> {
            self.frame(json!({"op": 10, "d": {"heartbeat_interval": 41250}}))
        }

        fn ready(&mut self, guilds: Value) -> Vec<Action> {
            self.frame(json!({
                "op": 0, "t": "READY", "s": 1,
                "d": {
                    "session_id": "abc",
                    "resume_gateway_url": "wss://resume.example.test?v=9",
                    "user": {"id": "1", "username": "bot"},
                    "guilds": guilds
                }
            }))
        }
    }

    fn config() -> GatewayConfig {
        GatewayConfig::builder("token")
            .encoding(Encoding::Json)
            .build()
            .unwrap()
    }

    fn sent_ops(actions: &[Action]) -> Vec<u8> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send { frame, .. } => Some(frame.op),
                _ => None,
            })
            .collect()
    }

    fn events(actions: &[Action]) -> Vec<&ShardEvent> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Emit(event) => Some(event),
                _ => None,
            })
            .collect()
    }

    fn close_plan(actions: &[Action]) -> Option<ReconnectPlan> {
        actions.iter().find_map(|a| match a {
            Action::Close { plan, .. } => Some(*plan),
            _ => None,
        })
    }

    #[tokio::test]
    async fn test_hello_identifies_once_then_ready() {
        let mut h = Harness::connected(config());

        let actions = h.hello();
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::ArmHeartbeat(interval) if *interval == Duration::from_millis(41250)
        )));
        let ops = sent_ops(&actions);
        assert_eq!(ops, vec![OpCode::Heartbeat as u8, OpCode::Identify as u8]);
        assert_eq!(h.shard.status(), ShardStatus::Identifying);

        let actions = h.ready(json!([]));
        assert_eq!(h.shard.status(), ShardStatus::Ready);
        assert!(h.shard.is_ready());
        assert_eq!(h.shard.connect_attempts(), 0);
        assert_eq!(h.shard.reconnect_interval(), Duration::from_millis(1000));
        assert_eq!(h.shard.session_id(), Some("abc"));
        assert_eq!(
            h.shard.resume_url(),
            Some("wss://resume.example.test/?v=10&encoding=json")
        );
        assert!(actions.iter().any(|a| matches!(a, Action::NotifyReady)));
        let events = events(&actions);
        assert!(matches!(events[..], [ShardEvent::PreReady, ShardEvent::Ready]));
        assert!(sent_ops(&actions).is_empty());
    }

    #[tokio::test]
    async fn test_identify_carries_compress_flag() {
        for compress in [false, true] {
            let mut h = Harness::connected(
                GatewayConfig::builder("token")
                    .encoding(Encoding::Json)
                    .compress(compress)
                    .build()
                    .unwrap(),
            );
            let actions = h.hello();
            let identify = actions
                .iter()
                .find_map(|a| match a {
                    Action::Send { frame, .. } if frame.op == OpCode::Identify as u8 => Some(frame),
                    _ => None,
                })
                .unwrap();
            assert_eq!(identify.d["compress"], json!(compress));
        }
    }

    #[tokio::test]
    async fn test_heartbeats_suppressed_while_identifying() {
        let mut h = Harness::connected(config());
        h.hello();
        h.frame(json!({"op": 11}));

        h.shard.heartbeat(false);
        assert!(sent_ops(&h.settle()).is_empty());
    }

    #[tokio::test]
    async fn test_unacked_heartbeat_disconnects() {
        let mut h = Harness::connected(config());
        h.hello();
        h.ready(json!([]));

        // The heartbeat sent on HELLO was never acknowledged
        h.shard.heartbeat(false);
        let actions = h.settle();
        assert!(events(&actions)
            .iter()
            .any(|e| matches!(e, ShardEvent::Error(Error::HeartbeatTimeout))));
        assert_eq!(close_plan(&actions), Some(ReconnectPlan::Immediate));
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Close { code: RESUME_CLOSE_CODE, .. }
        )));
        assert_eq!(h.shard.status(), ShardStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_acked_heartbeat_sends_sequence() {
        let mut h = Harness::connected(config());
        h.hello();
        h.ready(json!([]));
        h.frame(json!({"op": 11}));

        h.shard.heartbeat(false);
        let actions = h.settle();
        let Some(Action::Send { frame, priority }) = actions.first() else {
            panic!("expected a heartbeat");
        };
        assert_eq!(frame, &OutboundFrame::heartbeat(1));
        assert!(*priority);
    }

    #[tokio::test]
    async fn test_requested_heartbeat_ignores_ack_state() {
        let mut h = Harness::connected(config());
        h.hello();
        h.ready(json!([]));

        let actions = h.frame(json!({"op": 1}));
        assert_eq!(sent_ops(&actions), vec![OpCode::Heartbeat as u8]);
        assert!(h.shard.is_connected());
    }

    #[tokio::test]
    async fn test_resume_after_unclean_close() {
        let mut h = Harness::connected(config());
        h.hello();
        h.ready(json!([]));
        h.frame(json!({"op": 0, "t": "TYPING_START", "s": 2, "d": {}}));

        assert_eq!(h.shard.on_close(1006, ""), ReconnectPlan::Immediate);
        h.settle();
        assert_eq!(h.shard.session_id(), Some("abc"));

        let url = h.shard.connect().unwrap();
        assert!(url.starts_with("wss://resume.example.test/"));
        h.shard.on_open();
        let actions = h.hello();
        let resume = actions
            .iter()
            .find_map(|a| match a {
                Action::Send { frame, .. } if frame.op == OpCode::Resume as u8 => Some(frame),
                _ => None,
            })
            .unwrap();
        assert_eq!(resume.d["session_id"], json!("abc"));
        assert_eq!(resume.d["seq"], json!(2));
        assert_eq!(h.shard.status(), ShardStatus::Resuming);

        let actions = h.frame(json!({"op": 0, "t": "RESUMED", "s": 3, "d": {}}));
        assert_eq!(h.shard.status(), ShardStatus::Ready);
        assert_eq!(h.shard.connect_attempts(), 0);
        assert!(actions.iter().any(|a| matches!(a, Action::NotifyReady)));
        assert!(events(&actions)
            .iter()
            .any(|e| matches!(e, ShardEvent::Resumed)));
    }

    #[tokio::test]
    async fn test_authentication_failure_never_reconnects() {
        let mut h = Harness::connected(config());
        h.hello();

        assert_eq!(h.shard.on_close(4004, "Authentication failed."), ReconnectPlan::Stop);
        let actions = h.settle();
        let error = actions
            .iter()
            .find_map(|a| match a {
                Action::Close { error, .. } => error.clone(),
                _ => None,
            })
            .unwrap();
        assert!(error.is_fatal());
        assert_eq!(h.shard.session_id(), None);
        assert!(!h.shard.is_connected());
    }

    #[tokio::test]
    async fn test_clean_close_stops() {
        let mut h = Harness::connected(config());
        h.hello();
        h.ready(json!([]));

        assert_eq!(h.shard.on_close(1000, ""), ReconnectPlan::Stop);
        let actions = h.settle();
        assert_eq!(h.shard.session_id(), None);
        assert_eq!(h.shard.sequence(), 0);
        assert!(events(&actions)
            .iter()
            .any(|e| matches!(e, ShardEvent::Disconnect { error: None })));
    }

    #[tokio::test]
    async fn test_invalid_sequence_resets_sequence_keeps_session() {
        let mut h = Harness::connected(config());
        h.hello();
        h.ready(json!([]));

        assert_eq!(h.shard.on_close(4007, ""), ReconnectPlan::Immediate);
        assert_eq!(h.shard.sequence(), 0);
        assert_eq!(h.shard.session_id(), Some("abc"));
    }

    #[tokio::test]
    async fn test_backoff_without_session_is_bounded() {
        let mut h = Harness::new(config());
        let mut previous = Duration::ZERO;

        for attempt in 0..20 {
            h.shard.connect().unwrap();
            let ReconnectPlan::After(wait) = h.shard.on_close(1006, "") else {
                panic!("expected a delayed reconnect");
            };
            if attempt == 0 {
                assert_eq!(wait, Duration::from_millis(1000));
            }
            assert!(wait >= previous);
            assert!(wait <= Duration::from_millis(30_000));
            previous = wait;
        }
        assert_eq!(h.shard.connect_attempts(), 20);
    }

    #[tokio::test]
    async fn test_stale_session_dropped_after_max_attempts() {
        let mut h = Harness::connected(
            GatewayConfig::builder("token")
                .max_reconnect_attempts(2)
                .build()
                .unwrap(),
        );
        h.hello();
        h.ready(json!([]));

        assert_eq!(h.shard.on_close(1006, ""), ReconnectPlan::Immediate);
        h.shard.connect().unwrap();
        assert_eq!(h.shard.on_close(1006, ""), ReconnectPlan::Immediate);
        h.shard.connect().unwrap();
        assert!(matches!(h.shard.on_close(1006, ""), ReconnectPlan::After(_)));
        assert_eq!(h.shard.session_id(), None);
    }

    #[tokio::test]
    async fn test_default_config_stops_resuming_unreachable_session() {
        let mut h = Harness::connected(config());
        h.hello();
        h.ready(json!([]));

        for _ in 0..10 {
            assert_eq!(h.shard.on_close(1006, ""), ReconnectPlan::Immediate);
            h.shard.connect().unwrap();
        }
        assert!(matches!(h.shard.on_close(1006, ""), ReconnectPlan::After(_)));
        assert_eq!(h.shard.session_id(), None);
    }

    #[tokio::test]
    async fn test_connect_while_connected_is_rejected() {
        let mut h = Harness::connected(config());
        assert!(matches!(h.shard.connect(), Err(Error::AlreadyConnected(0))));
        assert_eq!(h.shard.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_sequence_gap_warns() {
        let mut h = Harness::connected(config());
        h.hello();
        h.ready(json!([]));

        let actions = h.frame(json!({"op": 0, "t": "TYPING_START", "s": 5, "d": {}}));
        assert!(events(&actions).iter().any(
            |e| matches!(e, ShardEvent::Warn(m) if m == "Non-consecutive sequence (1 -> 5)")
        ));
        assert_eq!(h.shard.sequence(), 5);
    }

    #[tokio::test]
    async fn test_invalid_session_not_resumable_identifies() {
        let mut h = Harness::connected(config());
        h.hello();
        h.ready(json!([]));

        let actions = h.frame(json!({"op": 9, "d": false}));
        assert_eq!(sent_ops(&actions), vec![OpCode::Identify as u8]);
        assert_eq!(h.shard.session_id(), None);
        assert_eq!(h.shard.sequence(), 0);

        h.shard.session_id = Some("abc".into());
        let actions = h.frame(json!({"op": 9, "d": true}));
        assert_eq!(sent_ops(&actions), vec![OpCode::Resume as u8]);
    }

    #[tokio::test]
    async fn test_reconnect_request_keeps_session() {
        let mut h = Harness::connected(config());
        h.hello();
        h.ready(json!([]));

        let actions = h.frame(json!({"op": 7, "d": null}));
        assert_eq!(close_plan(&actions), Some(ReconnectPlan::Immediate));
        assert_eq!(h.shard.session_id(), Some("abc"));
    }

    #[tokio::test]
    async fn test_unknown_opcode_warns() {
        let mut h = Harness::connected(config());
        let actions = h.frame(json!({"op": 42, "d": null}));
        assert!(events(&actions)
            .iter()
            .any(|e| matches!(e, ShardEvent::Warn(m) if m.contains("42"))));
        assert!(h.shard.is_connected());
    }

    #[tokio::test]
    async fn test_member_request_capabilities() {
        let mut h = Harness::connected(config());

        let err = h
            .shard
            .request_guild_members("1".into(), MemberRequest::default())
            .unwrap_err();
        assert!(matches!(err, Error::Capability(m) if m.contains("GUILD_MEMBERS")));

        let with_members = GatewayConfig::builder("token")
            .intents(Intents::GUILDS | Intents::GUILD_MEMBERS)
            .build()
            .unwrap();
        let mut h = Harness::connected(with_members);
        let err = h
            .shard
            .request_guild_members(
                "1".into(),
                MemberRequest {
                    presences: true,
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::Capability(m) if m.contains("GUILD_PRESENCES")));

        let too_many = (0..101).map(|i| Snowflake::from(i.to_string())).collect();
        let err = h
            .shard
            .request_guild_members(
                "1".into(),
                MemberRequest {
                    user_ids: Some(too_many),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::Capability(_)));

        // A prefix query needs no privileged intent
        let mut h = Harness::connected(config());
        let handle = h
            .shard
            .request_guild_members(
                "1".into(),
                MemberRequest {
                    query: Some("fer".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        let actions = h.settle();
        let Some(Action::Send { frame, .. }) = actions.first() else {
            panic!("expected a member request");
        };
        assert_eq!(frame.d["nonce"], json!(handle.token()));
        assert_eq!(frame.d["query"], json!("fer"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_member_chunks_resolve_request() {
        let mut h = Harness::connected(
            GatewayConfig::builder("token")
                .intents(Intents::GUILDS | Intents::GUILD_MEMBERS)
                .build()
                .unwrap(),
        );
        h.hello();
        h.ready(json!([]));
        h.frame(json!({"op": 0, "t": "GUILD_CREATE", "s": 2, "d": {"id": "5"}}));

        let handle = h
            .shard
            .request_guild_members("5".into(), MemberRequest::default())
            .unwrap();
        let nonce = handle.token().to_string();
        for (index, user) in ["7", "8"].iter().enumerate() {
            h.frame(json!({
                "op": 0, "t": "GUILD_MEMBERS_CHUNK", "s": 3 + index,
                "d": {
                    "guild_id": "5",
                    "members": [{"user": {"id": user}, "roles": []}],
                    "chunk_index": index,
                    "chunk_count": 2,
                    "nonce": nonce
                }
            }));
        }

        let members = handle.await;
        let ids: Vec<&str> = members.iter().map(|m| m.id().as_str()).collect();
        assert_eq!(ids, vec!["7", "8"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_waits_for_guilds_and_member_loading() {
        let mut h = Harness::connected(
            GatewayConfig::builder("token")
                .intents(Intents::GUILDS | Intents::GUILD_MEMBERS)
                .get_all_users(true)
                .build()
                .unwrap(),
        );
        h.hello();

        let actions = h.ready(json!([
            {"id": "10", "unavailable": true},
            {"id": "11", "unavailable": true}
        ]));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::ArmGuildCreateTimeout(_))));
        assert!(h.shard.is_pre_ready());
        assert!(!h.shard.is_ready());

        let actions = h.frame(json!({
            "op": 0, "t": "GUILD_CREATE", "s": 2,
            "d": {"id": "10", "member_count": 300, "members": []}
        }));
        assert!(sent_ops(&actions).is_empty());
        assert!(events(&actions).is_empty());

        let mut actions = h.frame(json!({
            "op": 0, "t": "GUILD_CREATE", "s": 3,
            "d": {"id": "11", "member_count": 1, "members": [{"user": {"id": "1"}, "roles": []}]}
        }));
        assert_eq!(sent_ops(&actions), vec![OpCode::RequestGuildMembers as u8]);
        assert!(!h.shard.is_ready());

        let index = actions
            .iter()
            .position(|a| matches!(a, Action::TrackMembers { .. }))
            .unwrap();
        let Action::TrackMembers { guild_id, handle } = actions.remove(index) else {
            unreachable!();
        };
        assert_eq!(guild_id, Snowflake::from("10"));
        let nonce = handle.token().to_string();

        let actions = h.frame(json!({
            "op": 0, "t": "GUILD_MEMBERS_CHUNK", "s": 4,
            "d": {"guild_id": "10", "members": [], "chunk_index": 0, "chunk_count": 1, "nonce": nonce}
        }));
        assert!(h.shard.is_ready());
        assert!(events(&actions)
            .iter()
            .any(|e| matches!(e, ShardEvent::Ready)));
        assert!(h.router.cache().guilds().get(&"11".into()).is_some());
    }

    #[tokio::test]
    async fn test_guild_create_timeout_forces_ready() {
        let mut h = Harness::connected(config());
        h.hello();
        h.ready(json!([{"id": "10", "unavailable": true}]));
        assert!(!h.shard.is_ready());

        h.shard.on_guild_create_timeout();
        let actions = h.settle();
        assert!(h.shard.is_ready());
        assert!(events(&actions)
            .iter()
            .any(|e| matches!(e, ShardEvent::Ready)));
    }

    #[tokio::test]
    async fn test_idle_presence_sets_since() {
        let mut h = Harness::connected(config());
        h.shard.update_presence(Presence {
            status: Status::Idle,
            ..Default::default()
        });
        let actions = h.settle();
        let Some(Action::Send { frame, .. }) = actions.first() else {
            panic!("expected a presence update");
        };
        assert_eq!(frame.op, OpCode::PresenceUpdate as u8);
        assert!(frame.d["since"].as_u64().is_some());
        assert_eq!(h.shard.presence().status, Status::Idle);

        h.shard.disconnect(false, None);
        assert_eq!(h.shard.presence(), &Presence::default());
    }

    #[tokio::test]
    async fn test_disconnect_flushes_member_requests() {
        let mut h = Harness::connected(
            GatewayConfig::builder("token")
                .intents(Intents::GUILDS | Intents::GUILD_MEMBERS)
                .build()
                .unwrap(),
        );
        let handle = h
            .shard
            .request_guild_members("1".into(), MemberRequest::default())
            .unwrap();

        assert_eq!(h.shard.disconnect(false, None), ReconnectPlan::Stop);
        assert!(handle.await.is_empty());
    }

    #[test]
    fn test_sends_dropped_while_disconnected() {
        let mut h = Harness::new(config());
        h.shard.update_voice_state("1".into(), None, VoiceStateOptions::default());
        assert!(h.settle().is_empty());
    }
}
