//! Applies decoded dispatches to the entity cache and republishes them.
//!
//! Routing is pure with respect to the connection: it never blocks and never
//! touches session state. The few outcomes the state machine must react to are
//! returned as [`RouteEffect`]s.

use crate::cache::EntityCache;
use crate::event::{
    DispatchEvent, GuildCreatePayload, GuildMembersChunkPayload, MessageUpdatePayload,
    PresenceUpdatePayload, ShardEvent, ThreadMembersUpdatePayload,
};
use crate::model::{Guild, Member, Message, Role, Snowflake, User};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Messages kept per channel unless configured otherwise
pub const DEFAULT_MESSAGE_LIMIT: usize = 100;

/// Outcome of a dispatch that feeds back into the shard state machine
#[derive(Debug, Clone, PartialEq)]
pub enum RouteEffect {
    /// READY: a new session was established
    Ready {
        session_id: String,
        resume_gateway_url: String,
        unavailable_guilds: Vec<Snowflake>,
    },
    /// RESUMED: the session was resumed
    Resumed,
    /// An available GUILD_CREATE arrived
    GuildCreated {
        guild_id: Snowflake,
        /// Fewer members arrived than the guild reports
        member_shortfall: bool,
    },
    /// A correlated member-list page arrived
    MembersChunk {
        guild_id: Snowflake,
        nonce: String,
        members: Vec<Member>,
        chunk_index: u32,
        chunk_count: u32,
    },
}

/// Result of routing one dispatch
#[derive(Debug, Default)]
pub struct Routed {
    pub events: Vec<ShardEvent>,
    pub effects: Vec<RouteEffect>,
}

impl Routed {
    fn event(event: ShardEvent) -> Self {
        Self {
            events: vec![event],
            effects: Vec::new(),
        }
    }
}

pub struct DispatchRouter<C: EntityCache> {
    cache: Arc<C>,
    message_limit: usize,
    /// Cached message ids per channel, oldest first
    message_order: Arc<Mutex<HashMap<Snowflake, VecDeque<Snowflake>>>>,
}

impl<C: EntityCache> Clone for DispatchRouter<C> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            message_limit: self.message_limit,
            message_order: self.message_order.clone(),
        }
    }
}

impl<C: EntityCache> DispatchRouter<C> {
    pub fn new(cache: Arc<C>) -> Self {
        Self {
            cache,
            message_limit: DEFAULT_MESSAGE_LIMIT,
            message_order: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Keep at most `limit` messages per channel, evicting the oldest.
    /// Zero disables message caching.
    pub fn with_message_limit(mut self, limit: usize) -> Self {
        self.message_limit = limit;
        self
    }

    pub fn cache(&self) -> &Arc<C> {
        &self.cache
    }

    /// Apply `event` to the cache. `ready` tells startup GUILD_CREATEs apart
    /// from guilds joined or recovered later.
    pub fn route(&self, event: DispatchEvent, ready: bool) -> Routed {
        match event {
            DispatchEvent::Ready(payload) => {
                let cache = &self.cache;
                cache.users().update(payload.user.id.clone(), payload.user);
                let mut unavailable_guilds = Vec::with_capacity(payload.guilds.len());
                for guild in payload.guilds {
                    cache.guilds().delete(&guild.id);
                    unavailable_guilds.push(guild.id.clone());
                    cache.unavailable_guilds().update(guild.id.clone(), guild);
                }
                Routed {
                    events: Vec::new(),
                    effects: vec![RouteEffect::Ready {
                        session_id: payload.session_id,
                        resume_gateway_url: payload.resume_gateway_url,
                        unavailable_guilds,
                    }],
                }
            }
            DispatchEvent::Resumed => Routed {
                events: Vec::new(),
                effects: vec![RouteEffect::Resumed],
            },
            DispatchEvent::GuildCreate(payload) => self.guild_create(*payload, ready),
            DispatchEvent::GuildUpdate(guild) => {
                let old = self.cache.guilds().update(guild.id.clone(), guild.clone());
                Routed::event(ShardEvent::GuildUpdate { guild, old })
            }
            DispatchEvent::GuildDelete(unavailable) => {
                let removed = self.cache.guilds().delete(&unavailable.id);
                let id = unavailable.id.clone();
                self.forget_guild(&id);
                if unavailable.unavailable {
                    self.cache
                        .unavailable_guilds()
                        .update(unavailable.id.clone(), unavailable.clone());
                    Routed::event(ShardEvent::GuildUnavailable(unavailable))
                } else {
                    Routed::event(ShardEvent::GuildDelete(
                        removed.unwrap_or_else(|| Guild::placeholder(id)),
                    ))
                }
            }
            DispatchEvent::ChannelCreate(channel) => {
                self.cache.channels().update(channel.id.clone(), channel.clone());
                Routed::event(ShardEvent::ChannelCreate(channel))
            }
            DispatchEvent::ChannelUpdate(channel) => {
                let old = self.cache.channels().update(channel.id.clone(), channel.clone());
                Routed::event(ShardEvent::ChannelUpdate { channel, old })
            }
            DispatchEvent::ChannelDelete(channel) => {
                let removed = self.cache.channels().delete(&channel.id);
                self.forget_messages(&HashSet::from([channel.id.clone()]));
                Routed::event(ShardEvent::ChannelDelete(removed.unwrap_or(channel)))
            }
            DispatchEvent::ThreadCreate(thread) => {
                self.cache.channels().update(thread.id.clone(), thread.clone());
                Routed::event(ShardEvent::ThreadCreate(thread))
            }
            DispatchEvent::ThreadUpdate(thread) => {
                let old = self.cache.channels().update(thread.id.clone(), thread.clone());
                Routed::event(ShardEvent::ThreadUpdate { thread, old })
            }
            DispatchEvent::ThreadDelete(thread) => {
                let removed = self.cache.channels().delete(&thread.id);
                self.forget_messages(&HashSet::from([thread.id.clone()]));
                Routed::event(ShardEvent::ThreadDelete(removed.unwrap_or(thread)))
            }
            DispatchEvent::ThreadListSync(payload) => {
                for mut thread in payload.threads {
                    thread.guild_id = Some(payload.guild_id.clone());
                    // Keep members already tracked for a known thread
                    if let Some(old) = self.cache.channels().get(&thread.id) {
                        if thread.members.is_empty() {
                            thread.members = old.members;
                        }
                    }
                    self.cache.channels().update(thread.id.clone(), thread);
                }
                Routed::default()
            }
            DispatchEvent::ThreadMembersUpdate(payload) => self.thread_members_update(payload),
            DispatchEvent::GuildEmojisUpdate(payload) => {
                let (guild, old) =
                    self.replace_guild_list(&payload.guild_id, "emojis", &payload.emojis);
                Routed::event(ShardEvent::GuildEmojisUpdate {
                    guild,
                    emojis: payload.emojis,
                    old,
                })
            }
            DispatchEvent::GuildStickersUpdate(payload) => {
                let (guild, old) =
                    self.replace_guild_list(&payload.guild_id, "stickers", &payload.stickers);
                Routed::event(ShardEvent::GuildStickersUpdate {
                    guild,
                    stickers: payload.stickers,
                    old,
                })
            }
            DispatchEvent::GuildMemberAdd(payload) => {
                let guild = self.guild(&payload.guild_id);
                let member = self.store_member(&payload.guild_id, payload.member);
                Routed::event(ShardEvent::GuildMemberAdd { guild, member })
            }
            DispatchEvent::GuildMemberUpdate(payload) => {
                let guild = self.guild(&payload.guild_id);
                let key = (payload.guild_id.clone(), payload.member.id().clone());
                let old = self.cache.members().get(&key);
                let mut member = payload.member;
                if member.presence.is_none() {
                    member.presence = old.as_ref().and_then(|m| m.presence.clone());
                }
                let member = self.store_member(&payload.guild_id, member);
                Routed::event(ShardEvent::GuildMemberUpdate { guild, member, old })
            }
            DispatchEvent::GuildMemberRemove(payload) => {
                let guild = self.guild(&payload.guild_id);
                let key = (payload.guild_id, payload.user.id.clone());
                let member = self.cache.members().delete(&key);
                self.cache.users().update(payload.user.id.clone(), payload.user.clone());
                Routed::event(ShardEvent::GuildMemberRemove {
                    guild,
                    user: payload.user,
                    member,
                })
            }
            DispatchEvent::GuildMembersChunk(payload) => self.members_chunk(payload),
            DispatchEvent::GuildRoleCreate(payload) => {
                let guild = self.guild(&payload.guild_id);
                let mut role = payload.role;
                role.guild_id = Some(payload.guild_id);
                self.cache.roles().update(role.id.clone(), role.clone());
                Routed::event(ShardEvent::GuildRoleCreate { guild, role })
            }
            DispatchEvent::GuildRoleUpdate(payload) => {
                let guild = self.guild(&payload.guild_id);
                let mut role = payload.role;
                role.guild_id = Some(payload.guild_id);
                let old = self.cache.roles().update(role.id.clone(), role.clone());
                Routed::event(ShardEvent::GuildRoleUpdate { guild, role, old })
            }
            DispatchEvent::GuildRoleDelete(payload) => {
                let guild = self.guild(&payload.guild_id);
                let role = self
                    .cache
                    .roles()
                    .delete(&payload.role_id)
                    .unwrap_or_else(|| Role::placeholder(payload.role_id, payload.guild_id));
                Routed::event(ShardEvent::GuildRoleDelete { guild, role })
            }
            DispatchEvent::MessageCreate(message) => {
                if self.cache.channels().get(&message.channel_id).is_some() {
                    self.store_message(&message);
                }
                Routed::event(ShardEvent::MessageCreate(message))
            }
            DispatchEvent::MessageUpdate(payload) => self.message_update(payload),
            DispatchEvent::MessageDelete(payload) => {
                let message =
                    self.delete_message(payload.id, &payload.channel_id, &payload.guild_id);
                Routed::event(ShardEvent::MessageDelete(message))
            }
            DispatchEvent::MessageDeleteBulk(payload) => {
                let messages = payload
                    .ids
                    .into_iter()
                    .map(|id| self.delete_message(id, &payload.channel_id, &payload.guild_id))
                    .collect();
                Routed::event(ShardEvent::MessageDeleteBulk(messages))
            }
            DispatchEvent::PresenceUpdate(payload) => self.presence_update(payload),
            DispatchEvent::UserUpdate(user) => {
                let old = self.cache.users().update(user.id.clone(), user.clone());
                Routed::event(ShardEvent::UserUpdate { user, old })
            }
            // Voice signaling is out of scope
            DispatchEvent::VoiceStateUpdate(_) => Routed::default(),
            DispatchEvent::Unknown { name, data } => {
                Routed::event(ShardEvent::Unknown { name, data })
            }
        }
    }

    fn guild(&self, id: &Snowflake) -> Guild {
        self.cache
            .guilds()
            .get(id)
            .unwrap_or_else(|| Guild::placeholder(id.clone()))
    }

    /// Drop everything cached under guild `id`.
    fn forget_guild(&self, id: &Snowflake) {
        let cache = &self.cache;
        let mut channels = HashSet::new();
        cache.channels().retain(&mut |channel_id, channel| {
            if channel.guild_id.as_ref() == Some(id) {
                channels.insert(channel_id.clone());
                false
            } else {
                true
            }
        });
        cache.members().retain(&mut |(guild_id, _), _| guild_id != id);
        cache
            .roles()
            .retain(&mut |_, role| role.guild_id.as_ref() != Some(id));
        cache
            .messages()
            .retain(&mut |_, message| message.guild_id.as_ref() != Some(id));
        self.forget_messages(&channels);
    }

    /// Drop every cached message of `channels`.
    fn forget_messages(&self, channels: &HashSet<Snowflake>) {
        if channels.is_empty() {
            return;
        }
        self.cache
            .messages()
            .retain(&mut |_, message| !channels.contains(&message.channel_id));
        let mut order = self.message_order.lock();
        for channel in channels {
            order.remove(channel);
        }
    }

    fn store_message(&self, message: &Message) {
        if self.message_limit == 0 {
            return;
        }
        let evicted: Vec<Snowflake> = {
            let mut order = self.message_order.lock();
            let ids = order.entry(message.channel_id.clone()).or_default();
            if !ids.contains(&message.id) {
                ids.push_back(message.id.clone());
            }
            let excess = ids.len().saturating_sub(self.message_limit);
            ids.drain(..excess).collect()
        };
        self.cache.messages().update(message.id.clone(), message.clone());
        for id in evicted {
            self.cache.messages().delete(&id);
        }
    }

    /// Remove a message, or describe it by id when it was never cached.
    fn delete_message(
        &self,
        id: Snowflake,
        channel_id: &Snowflake,
        guild_id: &Option<Snowflake>,
    ) -> Message {
        if let Some(ids) = self.message_order.lock().get_mut(channel_id) {
            ids.retain(|cached| cached != &id);
        }
        self.cache.messages().delete(&id).unwrap_or_else(|| {
            let mut message = Message::placeholder(id, channel_id.clone());
            message.guild_id = guild_id.clone();
            message
        })
    }

    /// Swap one of the guild's list fields, returning the guild and the old list.
    fn replace_guild_list(
        &self,
        guild_id: &Snowflake,
        field: &str,
        items: &[Value],
    ) -> (Guild, Vec<Value>) {
        let Some(mut guild) = self.cache.guilds().get(guild_id) else {
            return (Guild::placeholder(guild_id.clone()), Vec::new());
        };
        let old = match guild.extra.insert(field.to_string(), Value::Array(items.to_vec())) {
            Some(Value::Array(old)) => old,
            _ => Vec::new(),
        };
        self.cache.guilds().update(guild_id.clone(), guild.clone());
        (guild, old)
    }

    fn thread_members_update(&self, payload: ThreadMembersUpdatePayload) -> Routed {
        let Some(mut thread) = self.cache.channels().get(&payload.id) else {
            return Routed::event(ShardEvent::Warn(format!(
                "Missing thread {} in THREAD_MEMBERS_UPDATE",
                payload.id
            )));
        };
        let mut routed = Routed::default();
        thread.member_count = Some(payload.member_count);

        let mut added = Vec::with_capacity(payload.added_members.len());
        for member in payload.added_members {
            match thread.members.iter_mut().find(|m| m.user_id == member.user_id) {
                Some(existing) => *existing = member.clone(),
                None => thread.members.push(member.clone()),
            }
            added.push(member);
        }

        let mut removed = Vec::with_capacity(payload.removed_member_ids.len());
        for user_id in payload.removed_member_ids {
            match thread
                .members
                .iter()
                .position(|m| m.user_id.as_ref() == Some(&user_id))
            {
                Some(index) => removed.push(thread.members.remove(index)),
                None => routed.events.push(ShardEvent::Warn(format!(
                    "Missing member {} in THREAD_MEMBERS_UPDATE",
                    user_id
                ))),
            }
        }

        self.cache.channels().update(thread.id.clone(), thread.clone());
        routed.events.push(ShardEvent::ThreadMembersUpdate {
            thread,
            added,
            removed,
        });
        routed
    }

    fn store_member(&self, guild_id: &Snowflake, mut member: Member) -> Member {
        member.guild_id = Some(guild_id.clone());
        self.cache
            .users()
            .update(member.user.id.clone(), member.user.clone());
        self.cache
            .members()
            .update((guild_id.clone(), member.id().clone()), member.clone());
        member
    }

    fn guild_create(&self, payload: GuildCreatePayload, ready: bool) -> Routed {
        let GuildCreatePayload {
            channels,
            threads,
            members,
            roles,
            mut guild,
        } = payload;
        let cache = &self.cache;

        if guild.unavailable {
            cache.guilds().delete(&guild.id);
            let unavailable = crate::model::UnavailableGuild {
                id: guild.id,
                unavailable: true,
            };
            cache
                .unavailable_guilds()
                .update(unavailable.id.clone(), unavailable.clone());
            return Routed::event(ShardEvent::UnavailableGuildCreate(unavailable));
        }

        let member_shortfall = guild
            .member_count
            .is_some_and(|count| (members.len() as u64) < count);

        for mut channel in channels.into_iter().chain(threads) {
            channel.guild_id = Some(guild.id.clone());
            cache.channels().update(channel.id.clone(), channel);
        }
        for mut role in roles {
            role.guild_id = Some(guild.id.clone());
            cache.roles().update(role.id.clone(), role);
        }
        for member in members {
            self.store_member(&guild.id, member);
        }

        guild.unavailable = false;
        cache.guilds().update(guild.id.clone(), guild.clone());
        let was_unavailable = cache.unavailable_guilds().delete(&guild.id).is_some();

        let mut routed = Routed {
            events: Vec::new(),
            effects: vec![RouteEffect::GuildCreated {
                guild_id: guild.id.clone(),
                member_shortfall,
            }],
        };
        if ready {
            routed.events.push(if was_unavailable {
                ShardEvent::GuildAvailable(guild)
            } else {
                ShardEvent::GuildCreate(guild)
            });
        }
        routed
    }

    fn members_chunk(&self, payload: GuildMembersChunkPayload) -> Routed {
        let guild = self.guild(&payload.guild_id);
        let mut members: Vec<Member> = payload
            .members
            .into_iter()
            .map(|member| self.store_member(&payload.guild_id, member))
            .collect();

        for presence in payload.presences.unwrap_or_default() {
            let key = (payload.guild_id.clone(), presence.user.id.clone());
            if let Some(mut member) = self.cache.members().get(&key) {
                member.presence = Some(presence.presence.clone());
                self.cache.members().update(key, member);
            }
            if let Some(member) = members.iter_mut().find(|m| m.id() == &presence.user.id) {
                member.presence = Some(presence.presence);
            }
        }

        let Some(nonce) = payload.nonce else {
            return Routed::event(ShardEvent::Warn(
                "Received GUILD_MEMBERS_CHUNK without a nonce".to_string(),
            ));
        };

        Routed {
            events: vec![ShardEvent::GuildMemberChunk {
                guild,
                members: members.clone(),
            }],
            effects: vec![RouteEffect::MembersChunk {
                guild_id: payload.guild_id,
                nonce,
                members,
                chunk_index: payload.chunk_index,
                chunk_count: payload.chunk_count,
            }],
        }
    }

    fn message_update(&self, payload: MessageUpdatePayload) -> Routed {
        let old = self.cache.messages().get(&payload.id);

        let mut merged = old
            .as_ref()
            .and_then(|m| match serde_json::to_value(m) {
                Ok(Value::Object(map)) => Some(map),
                _ => None,
            })
            .unwrap_or_default();
        merged.extend(payload.fields);
        merged.insert("id".into(), Value::from(payload.id.as_str()));
        merged.insert("channel_id".into(), Value::from(payload.channel_id.as_str()));

        let message = serde_json::from_value::<Message>(Value::Object(merged))
            .unwrap_or_else(|_| Message::placeholder(payload.id, payload.channel_id));

        if old.is_some() {
            self.cache.messages().update(message.id.clone(), message.clone());
        }
        Routed::event(ShardEvent::MessageUpdate { message, old })
    }

    fn presence_update(&self, payload: PresenceUpdatePayload) -> Routed {
        let mut routed = Routed::default();
        let user_id = payload.user.id.clone();

        if let Some(old_user) = self.cache.users().get(&user_id) {
            if !payload.user.fields.is_empty() {
                if let Some(user) = merge_user(&old_user, payload.user.fields) {
                    if user != old_user {
                        self.cache.users().update(user_id.clone(), user.clone());
                        routed.events.push(ShardEvent::UserUpdate {
                            user,
                            old: Some(old_user),
                        });
                    }
                }
            }
        }

        let Some(guild) = payload
            .guild_id
            .as_ref()
            .and_then(|id| self.cache.guilds().get(id))
        else {
            routed.events.push(ShardEvent::Debug(format!(
                "Got PRESENCE_UPDATE for {} without guild {}",
                user_id,
                payload
                    .guild_id
                    .as_ref()
                    .map(Snowflake::to_string)
                    .unwrap_or_default()
            )));
            return routed;
        };

        let key = (guild.id.clone(), user_id);
        if let Some(mut member) = self.cache.members().get(&key) {
            let old = member.presence.replace(payload.presence.clone());
            self.cache.members().update(key, member.clone());
            routed.events.push(ShardEvent::PresenceUpdate {
                guild,
                member,
                old,
                presence: payload.presence,
            });
        }
        routed
    }
}

fn merge_user(user: &User, fields: serde_json::Map<String, Value>) -> Option<User> {
    let Ok(Value::Object(mut map)) = serde_json::to_value(user) else {
        return None;
    };
    map.extend(fields);
    serde_json::from_value(Value::Object(map)).ok()
}
