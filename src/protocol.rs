//! Gateway wire protocol: opcodes, close codes, frames and outbound payloads.

use crate::error::Error;
use crate::model::Snowflake;
use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Gateway protocol version requested in every connection URL
pub const GATEWAY_VERSION: u8 = 10;

/// Trailing bytes of every complete frame in a `zlib-stream` transport
pub const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// Maximum number of user ids in a single member request
pub const MAX_MEMBER_REQUEST_USER_IDS: usize = 100;

/// Close code sent by the client when it intends to resume afterwards
pub const RESUME_CLOSE_CODE: u16 = 4999;

/// Gateway opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Dispatch = 0,
    Heartbeat = 1,
    Identify = 2,
    PresenceUpdate = 3,
    VoiceStateUpdate = 4,
    Resume = 6,
    Reconnect = 7,
    RequestGuildMembers = 8,
    InvalidSession = 9,
    Hello = 10,
    HeartbeatAck = 11,
}

impl OpCode {
    pub fn from_u8(op: u8) -> Option<Self> {
        Some(match op {
            0 => OpCode::Dispatch,
            1 => OpCode::Heartbeat,
            2 => OpCode::Identify,
            3 => OpCode::PresenceUpdate,
            4 => OpCode::VoiceStateUpdate,
            6 => OpCode::Resume,
            7 => OpCode::Reconnect,
            8 => OpCode::RequestGuildMembers,
            9 => OpCode::InvalidSession,
            10 => OpCode::Hello,
            11 => OpCode::HeartbeatAck,
            _ => return None,
        })
    }
}

/// WebSocket close codes the gateway (or the network) may end a connection with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// 1000
    Normal,
    /// 1006, no close frame was received
    Abnormal,
    /// 4000
    UnknownError,
    /// 4001
    UnknownOpcode,
    /// 4002
    DecodeError,
    /// 4003
    NotAuthenticated,
    /// 4004
    AuthenticationFailed,
    /// 4005
    AlreadyAuthenticated,
    /// 4007
    InvalidSequence,
    /// 4008
    RateLimited,
    /// 4010
    InvalidShard,
    /// 4011
    ShardingRequired,
    /// 4012
    InvalidApiVersion,
    /// 4013
    InvalidIntents,
    /// 4014
    DisallowedIntents,
    /// Anything else
    Other(u16),
}

impl CloseCode {
    pub fn code(self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::Abnormal => 1006,
            CloseCode::UnknownError => 4000,
            CloseCode::UnknownOpcode => 4001,
            CloseCode::DecodeError => 4002,
            CloseCode::NotAuthenticated => 4003,
            CloseCode::AuthenticationFailed => 4004,
            CloseCode::AlreadyAuthenticated => 4005,
            CloseCode::InvalidSequence => 4007,
            CloseCode::RateLimited => 4008,
            CloseCode::InvalidShard => 4010,
            CloseCode::ShardingRequired => 4011,
            CloseCode::InvalidApiVersion => 4012,
            CloseCode::InvalidIntents => 4013,
            CloseCode::DisallowedIntents => 4014,
            CloseCode::Other(code) => code,
        }
    }

    /// Authentication and configuration failures. These are never retried.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            CloseCode::AuthenticationFailed
                | CloseCode::InvalidShard
                | CloseCode::ShardingRequired
                | CloseCode::InvalidApiVersion
                | CloseCode::InvalidIntents
                | CloseCode::DisallowedIntents
        )
    }

    /// Whether the session id must be discarded after this close.
    pub fn clears_session(self) -> bool {
        self == CloseCode::NotAuthenticated || self.is_fatal()
    }

    /// Whether the sequence number must be reset to 0 after this close.
    pub fn resets_sequence(self) -> bool {
        self == CloseCode::InvalidSequence
    }

    /// Whether a reconnect should be attempted after this close.
    pub fn should_reconnect(self) -> bool {
        self != CloseCode::Normal && !self.is_fatal()
    }

    /// Human readable description used for the surfaced error.
    pub fn description(self) -> &'static str {
        match self {
            CloseCode::Normal => "Clean close.",
            CloseCode::Abnormal => {
                "Connection reset by peer. This is a network issue, not a protocol error."
            }
            CloseCode::UnknownError => "Gateway encountered an unknown error.",
            CloseCode::UnknownOpcode => "Gateway received an unknown opcode.",
            CloseCode::DecodeError => "Gateway received an improperly encoded packet.",
            CloseCode::NotAuthenticated => "Gateway received a packet before authentication.",
            CloseCode::AuthenticationFailed => "Authentication failed.",
            CloseCode::AlreadyAuthenticated => {
                "Gateway received an authentication attempt while already authenticated."
            }
            CloseCode::InvalidSequence => "Gateway received an invalid sequence.",
            CloseCode::RateLimited => "Gateway connection was ratelimited.",
            CloseCode::InvalidShard => "Invalid sharding specified.",
            CloseCode::ShardingRequired => "Shard would handle too many guilds.",
            CloseCode::InvalidApiVersion => "Invalid API version.",
            CloseCode::InvalidIntents => "Invalid intents specified.",
            CloseCode::DisallowedIntents => {
                "Disallowed intents specified. Privileged intents must be enabled for the application."
            }
            CloseCode::Other(_) => "Unknown close.",
        }
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1006 => CloseCode::Abnormal,
            4000 => CloseCode::UnknownError,
            4001 => CloseCode::UnknownOpcode,
            4002 => CloseCode::DecodeError,
            4003 => CloseCode::NotAuthenticated,
            4004 => CloseCode::AuthenticationFailed,
            4005 => CloseCode::AlreadyAuthenticated,
            4007 => CloseCode::InvalidSequence,
            4008 => CloseCode::RateLimited,
            4010 => CloseCode::InvalidShard,
            4011 => CloseCode::ShardingRequired,
            4012 => CloseCode::InvalidApiVersion,
            4013 => CloseCode::InvalidIntents,
            4014 => CloseCode::DisallowedIntents,
            other => CloseCode::Other(other),
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

bitflags! {
    /// Gateway intents bitfield
    ///
    /// Sent as a plain integer in IDENTIFY.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Intents: u64 {
        const GUILDS = 1 << 0;
        /// Privileged
        const GUILD_MEMBERS = 1 << 1;
        const GUILD_MODERATION = 1 << 2;
        const GUILD_EMOJIS_AND_STICKERS = 1 << 3;
        const GUILD_INTEGRATIONS = 1 << 4;
        const GUILD_WEBHOOKS = 1 << 5;
        const GUILD_INVITES = 1 << 6;
        const GUILD_VOICE_STATES = 1 << 7;
        /// Privileged
        const GUILD_PRESENCES = 1 << 8;
        const GUILD_MESSAGES = 1 << 9;
        const GUILD_MESSAGE_REACTIONS = 1 << 10;
        const GUILD_MESSAGE_TYPING = 1 << 11;
        const DIRECT_MESSAGES = 1 << 12;
        const DIRECT_MESSAGE_REACTIONS = 1 << 13;
        const DIRECT_MESSAGE_TYPING = 1 << 14;
        /// Privileged
        const MESSAGE_CONTENT = 1 << 15;
        const GUILD_SCHEDULED_EVENTS = 1 << 16;
        const AUTO_MODERATION_CONFIGURATION = 1 << 20;
        const AUTO_MODERATION_EXECUTION = 1 << 21;
    }
}

impl Serialize for Intents {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(self.bits())
    }
}

// Unknown bits are kept so newer gateway intents pass through untouched
impl<'de> Deserialize<'de> for Intents {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Intents::from_bits_retain)
    }
}

/// Online status advertised in presence updates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Online,
    Idle,
    Dnd,
    Invisible,
    Offline,
}

/// A single activity shown in the presence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

/// The shard's own presence, restored from configuration on every hard reset
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Presence {
    pub activities: Vec<Activity>,
    pub afk: bool,
    pub since: Option<u64>,
    pub status: Status,
}

/// Client properties sent with IDENTIFY
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: env!("CARGO_PKG_NAME").to_string(),
            device: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

/// A raw inbound frame as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GatewayFrame {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default)]
    pub s: Option<u64>,
    #[serde(default)]
    pub t: Option<String>,
}

/// An inbound frame interpreted by opcode.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Dispatch { name: String, data: Value },
    Heartbeat,
    Reconnect,
    InvalidSession { resumable: bool },
    Hello { heartbeat_interval: Duration },
    HeartbeatAck,
    Unknown { op: u8 },
}

#[derive(Deserialize)]
struct HelloData {
    heartbeat_interval: u64,
}

impl GatewayFrame {
    /// Interpret the frame by opcode.
    pub fn into_packet(self) -> Result<Packet, Error> {
        let packet = match OpCode::from_u8(self.op) {
            Some(OpCode::Dispatch) => {
                let name = self
                    .t
                    .ok_or_else(|| Error::Decode("DISPATCH frame without an event name".into()))?;
                Packet::Dispatch { name, data: self.d }
            }
            Some(OpCode::Heartbeat) => Packet::Heartbeat,
            Some(OpCode::Reconnect) => Packet::Reconnect,
            Some(OpCode::InvalidSession) => Packet::InvalidSession {
                resumable: self.d.as_bool().unwrap_or(false),
            },
            Some(OpCode::Hello) => {
                let hello: HelloData = serde_json::from_value(self.d)?;
                Packet::Hello {
                    heartbeat_interval: Duration::from_millis(hello.heartbeat_interval),
                }
            }
            Some(OpCode::HeartbeatAck) => Packet::HeartbeatAck,
            _ => Packet::Unknown { op: self.op },
        };
        Ok(packet)
    }
}

/// A frame produced by the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundFrame {
    pub op: u8,
    pub d: Value,
}

impl OutboundFrame {
    pub fn new<T: Serialize>(op: OpCode, payload: &T) -> Result<Self, Error> {
        Ok(Self {
            op: op as u8,
            d: serde_json::to_value(payload)?,
        })
    }

    /// HEARTBEAT carrying the last sequence, or null before the first dispatch.
    pub fn heartbeat(sequence: u64) -> Self {
        Self {
            op: OpCode::Heartbeat as u8,
            d: if sequence == 0 {
                Value::Null
            } else {
                Value::from(sequence)
            },
        }
    }

    pub fn opcode(&self) -> Option<OpCode> {
        OpCode::from_u8(self.op)
    }

    /// A copy of the frame safe to log: any `token` field is replaced.
    pub fn redacted(&self) -> Value {
        let mut d = self.d.clone();
        if let Some(token) = d.get_mut("token") {
            *token = Value::from("[REMOVED]");
        }
        serde_json::json!({ "op": self.op, "d": d })
    }
}

/// IDENTIFY payload
#[derive(Debug, Clone, Serialize)]
pub struct Identify {
    pub token: String,
    pub properties: ConnectionProperties,
    pub compress: bool,
    pub large_threshold: u8,
    pub shard: [u32; 2],
    pub presence: Presence,
    pub intents: Intents,
}

/// RESUME payload
#[derive(Debug, Clone, Serialize)]
pub struct Resume {
    pub token: String,
    pub session_id: String,
    pub seq: u64,
}

/// REQUEST_GUILD_MEMBERS payload
#[derive(Debug, Clone, Serialize)]
pub struct RequestGuildMembers {
    pub guild_id: Snowflake,
    pub limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_ids: Option<Vec<Snowflake>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    pub nonce: String,
    pub presences: bool,
}

/// VOICE_STATE_UPDATE payload
#[derive(Debug, Clone, Serialize)]
pub struct UpdateVoiceState {
    pub guild_id: Snowflake,
    pub channel_id: Option<Snowflake>,
    pub self_mute: bool,
    pub self_deaf: bool,
}

/// Options for a member-list request
#[derive(Debug, Clone, Default)]
pub struct MemberRequest {
    /// Maximum number of members to return, 0 for no limit
    pub limit: u32,
    /// Request presences as well (requires the presences intent)
    pub presences: bool,
    /// Username prefix; empty or absent requests every member
    pub query: Option<String>,
    /// Specific users to fetch (at most 100)
    pub user_ids: Option<Vec<Snowflake>>,
    /// Overrides the configured request deadline
    pub timeout: Option<Duration>,
}

/// Options for a voice state update
#[derive(Debug, Clone, Copy, Default)]
pub struct VoiceStateOptions {
    pub self_mute: bool,
    pub self_deaf: bool,
}
