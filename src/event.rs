//! Decoded dispatch payloads and the higher-level events republished to handlers.

use crate::error::Error;
use crate::model::{
    Channel, Guild, Member, MemberPresence, Message, Role, Snowflake, ThreadMember,
    UnavailableGuild, User,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReadyPayload {
    pub session_id: String,
    pub resume_gateway_url: String,
    pub user: User,
    #[serde(default)]
    pub guilds: Vec<UnavailableGuild>,
    #[serde(default)]
    pub application: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GuildCreatePayload {
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub threads: Vec<Channel>,
    #[serde(default)]
    pub members: Vec<Member>,
    #[serde(default)]
    pub roles: Vec<Role>,
    #[serde(flatten)]
    pub guild: Guild,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GuildMemberPayload {
    pub guild_id: Snowflake,
    #[serde(flatten)]
    pub member: Member,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GuildMemberRemovePayload {
    pub guild_id: Snowflake,
    pub user: User,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PresencePayload {
    pub user: PartialUser,
    #[serde(flatten)]
    pub presence: MemberPresence,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GuildMembersChunkPayload {
    pub guild_id: Snowflake,
    pub members: Vec<Member>,
    #[serde(default)]
    pub presences: Option<Vec<PresencePayload>>,
    pub chunk_index: u32,
    pub chunk_count: u32,
    #[serde(default)]
    pub nonce: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GuildRolePayload {
    pub guild_id: Snowflake,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GuildRoleDeletePayload {
    pub guild_id: Snowflake,
    pub role_id: Snowflake,
}

/// MESSAGE_UPDATE may carry only the changed fields.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MessageUpdatePayload {
    pub id: Snowflake,
    pub channel_id: Snowflake,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MessageDeletePayload {
    pub id: Snowflake,
    pub channel_id: Snowflake,
    #[serde(default)]
    pub guild_id: Option<Snowflake>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MessageDeleteBulkPayload {
    pub ids: Vec<Snowflake>,
    pub channel_id: Snowflake,
    #[serde(default)]
    pub guild_id: Option<Snowflake>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ThreadListSyncPayload {
    pub guild_id: Snowflake,
    /// Parent channels being synced; absent means the whole guild
    #[serde(default)]
    pub channel_ids: Option<Vec<Snowflake>>,
    #[serde(default)]
    pub threads: Vec<Channel>,
    #[serde(default)]
    pub members: Vec<ThreadMember>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ThreadMembersUpdatePayload {
    /// The thread
    pub id: Snowflake,
    pub guild_id: Snowflake,
    pub member_count: u32,
    #[serde(default)]
    pub added_members: Vec<ThreadMember>,
    #[serde(default)]
    pub removed_member_ids: Vec<Snowflake>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GuildEmojisUpdatePayload {
    pub guild_id: Snowflake,
    pub emojis: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GuildStickersUpdatePayload {
    pub guild_id: Snowflake,
    pub stickers: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PartialUser {
    pub id: Snowflake,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PresenceUpdatePayload {
    pub user: PartialUser,
    #[serde(default)]
    pub guild_id: Option<Snowflake>,
    #[serde(flatten)]
    pub presence: MemberPresence,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VoiceStatePayload {
    #[serde(default)]
    pub guild_id: Option<Snowflake>,
    #[serde(default)]
    pub channel_id: Option<Snowflake>,
    pub user_id: Snowflake,
}

/// Every dispatch the router understands, decoded from `(t, d)`.
///
/// Adding a variant forces every match over dispatches to handle it.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    Ready(Box<ReadyPayload>),
    Resumed,
    GuildCreate(Box<GuildCreatePayload>),
    GuildUpdate(Guild),
    GuildDelete(UnavailableGuild),
    GuildEmojisUpdate(GuildEmojisUpdatePayload),
    GuildStickersUpdate(GuildStickersUpdatePayload),
    ChannelCreate(Channel),
    ChannelUpdate(Channel),
    ChannelDelete(Channel),
    ThreadCreate(Channel),
    ThreadUpdate(Channel),
    ThreadDelete(Channel),
    ThreadListSync(ThreadListSyncPayload),
    ThreadMembersUpdate(ThreadMembersUpdatePayload),
    GuildMemberAdd(GuildMemberPayload),
    GuildMemberUpdate(GuildMemberPayload),
    GuildMemberRemove(GuildMemberRemovePayload),
    GuildMembersChunk(GuildMembersChunkPayload),
    GuildRoleCreate(GuildRolePayload),
    GuildRoleUpdate(GuildRolePayload),
    GuildRoleDelete(GuildRoleDeletePayload),
    MessageCreate(Message),
    MessageUpdate(MessageUpdatePayload),
    MessageDelete(MessageDeletePayload),
    MessageDeleteBulk(MessageDeleteBulkPayload),
    PresenceUpdate(PresenceUpdatePayload),
    UserUpdate(User),
    /// Voice signaling is out of scope; routed as a no-op.
    VoiceStateUpdate(VoiceStatePayload),
    /// An event name this client does not model
    Unknown { name: String, data: Value },
}

impl DispatchEvent {
    /// Decode a dispatch payload by event name.
    pub fn decode(name: &str, data: Value) -> Result<Self, Error> {
        fn from<T: serde::de::DeserializeOwned>(data: Value) -> Result<T, Error> {
            Ok(serde_json::from_value(data)?)
        }

        Ok(match name {
            "READY" => DispatchEvent::Ready(Box::new(from(data)?)),
            "RESUMED" => DispatchEvent::Resumed,
            "GUILD_CREATE" => DispatchEvent::GuildCreate(Box::new(from(data)?)),
            "GUILD_UPDATE" => DispatchEvent::GuildUpdate(from(data)?),
            "GUILD_DELETE" => DispatchEvent::GuildDelete(from(data)?),
            "GUILD_EMOJIS_UPDATE" => DispatchEvent::GuildEmojisUpdate(from(data)?),
            "GUILD_STICKERS_UPDATE" => DispatchEvent::GuildStickersUpdate(from(data)?),
            "CHANNEL_CREATE" => DispatchEvent::ChannelCreate(from(data)?),
            "CHANNEL_UPDATE" => DispatchEvent::ChannelUpdate(from(data)?),
            "CHANNEL_DELETE" => DispatchEvent::ChannelDelete(from(data)?),
            "THREAD_CREATE" => DispatchEvent::ThreadCreate(from(data)?),
            "THREAD_UPDATE" => DispatchEvent::ThreadUpdate(from(data)?),
            "THREAD_DELETE" => DispatchEvent::ThreadDelete(from(data)?),
            "THREAD_LIST_SYNC" => DispatchEvent::ThreadListSync(from(data)?),
            "THREAD_MEMBERS_UPDATE" => DispatchEvent::ThreadMembersUpdate(from(data)?),
            "GUILD_MEMBER_ADD" => DispatchEvent::GuildMemberAdd(from(data)?),
            "GUILD_MEMBER_UPDATE" => DispatchEvent::GuildMemberUpdate(from(data)?),
            "GUILD_MEMBER_REMOVE" => DispatchEvent::GuildMemberRemove(from(data)?),
            "GUILD_MEMBERS_CHUNK" => DispatchEvent::GuildMembersChunk(from(data)?),
            "GUILD_ROLE_CREATE" => DispatchEvent::GuildRoleCreate(from(data)?),
            "GUILD_ROLE_UPDATE" => DispatchEvent::GuildRoleUpdate(from(data)?),
            "GUILD_ROLE_DELETE" => DispatchEvent::GuildRoleDelete(from(data)?),
            "MESSAGE_CREATE" => DispatchEvent::MessageCreate(from(data)?),
            "MESSAGE_UPDATE" => DispatchEvent::MessageUpdate(from(data)?),
            "MESSAGE_DELETE" => DispatchEvent::MessageDelete(from(data)?),
            "MESSAGE_DELETE_BULK" => DispatchEvent::MessageDeleteBulk(from(data)?),
            "PRESENCE_UPDATE" => DispatchEvent::PresenceUpdate(from(data)?),
            "USER_UPDATE" => DispatchEvent::UserUpdate(from(data)?),
            "VOICE_STATE_UPDATE" => DispatchEvent::VoiceStateUpdate(from(data)?),
            _ => DispatchEvent::Unknown {
                name: name.to_string(),
                data,
            },
        })
    }
}

/// Events republished to the [`GatewayHandler`](crate::GatewayHandler).
///
/// Update events carry the new state and, when it was cached, the previous
/// snapshot for diffing.
#[derive(Debug, Clone)]
pub enum ShardEvent {
    /// Transport opened
    Connect,
    /// HELLO received
    Hello { heartbeat_interval: Duration },
    /// READY received; guilds may still be streaming in
    PreReady,
    /// Every guild has arrived (or timed out) and member loading finished
    Ready,
    /// Session resumed
    Resumed,
    /// Transport torn down
    Disconnect { error: Option<Error> },
    Warn(String),
    Debug(String),
    Error(Error),

    GuildCreate(Guild),
    GuildAvailable(Guild),
    GuildUpdate { guild: Guild, old: Option<Guild> },
    GuildDelete(Guild),
    GuildUnavailable(UnavailableGuild),
    UnavailableGuildCreate(UnavailableGuild),
    GuildEmojisUpdate { guild: Guild, emojis: Vec<Value>, old: Vec<Value> },
    GuildStickersUpdate { guild: Guild, stickers: Vec<Value>, old: Vec<Value> },

    ChannelCreate(Channel),
    ChannelUpdate { channel: Channel, old: Option<Channel> },
    ChannelDelete(Channel),
    ThreadCreate(Channel),
    ThreadUpdate { thread: Channel, old: Option<Channel> },
    ThreadDelete(Channel),
    ThreadMembersUpdate {
        thread: Channel,
        added: Vec<ThreadMember>,
        removed: Vec<ThreadMember>,
    },

    GuildMemberAdd { guild: Guild, member: Member },
    GuildMemberUpdate { guild: Guild, member: Member, old: Option<Member> },
    GuildMemberRemove { guild: Guild, user: User, member: Option<Member> },
    GuildMemberChunk { guild: Guild, members: Vec<Member> },

    GuildRoleCreate { guild: Guild, role: Role },
    GuildRoleUpdate { guild: Guild, role: Role, old: Option<Role> },
    GuildRoleDelete { guild: Guild, role: Role },

    MessageCreate(Message),
    MessageUpdate { message: Message, old: Option<Message> },
    MessageDelete(Message),
    /// Cached messages, or placeholders for those never cached, in payload order
    MessageDeleteBulk(Vec<Message>),

    PresenceUpdate {
        guild: Guild,
        member: Member,
        old: Option<MemberPresence>,
        presence: MemberPresence,
    },
    UserUpdate { user: User, old: Option<User> },

    /// A dispatch with no dedicated variant
    Unknown { name: String, data: Value },
}
