//! Cache contract consumed by the dispatch router.
//!
//! The router only needs get/update/delete per entity kind. Cross-shard
//! synchronization is the cache's responsibility: every method takes `&self`
//! and may be called concurrently from several shards.

use crate::model::{Channel, Guild, Member, Message, Role, Snowflake, UnavailableGuild, User};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;

/// Members are keyed by `(guild_id, user_id)`.
pub type MemberKey = (Snowflake, Snowflake);

/// Insert/update/delete contract for one entity kind.
pub trait EntityStore<K, V>: Send + Sync {
    /// Current snapshot of the entity, if cached.
    fn get(&self, key: &K) -> Option<V>;

    /// Insert or replace the entity, returning the previous snapshot.
    fn update(&self, key: K, value: V) -> Option<V>;

    /// Remove the entity, returning the removed snapshot.
    fn delete(&self, key: &K) -> Option<V>;

    /// Drop every entry for which `keep` returns false. Returns the number removed.
    fn retain(&self, keep: &mut dyn FnMut(&K, &V) -> bool) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Entity cache provider injected into every shard.
pub trait EntityCache: Send + Sync + 'static {
    fn users(&self) -> &dyn EntityStore<Snowflake, User>;
    fn guilds(&self) -> &dyn EntityStore<Snowflake, Guild>;
    fn unavailable_guilds(&self) -> &dyn EntityStore<Snowflake, UnavailableGuild>;
    /// Guild channels and threads
    fn channels(&self) -> &dyn EntityStore<Snowflake, Channel>;
    fn members(&self) -> &dyn EntityStore<MemberKey, Member>;
    fn roles(&self) -> &dyn EntityStore<Snowflake, Role>;
    fn messages(&self) -> &dyn EntityStore<Snowflake, Message>;
}

/// `HashMap` behind a `parking_lot::RwLock`.
#[derive(Debug)]
pub struct MemoryStore<K, V> {
    items: RwLock<HashMap<K, V>>,
}

impl<K, V> Default for MemoryStore<K, V> {
    fn default() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> EntityStore<K, V> for MemoryStore<K, V>
where
    K: Eq + Hash + Send + Sync,
    V: Clone + Send + Sync,
{
    fn get(&self, key: &K) -> Option<V> {
        self.items.read().get(key).cloned()
    }

    fn update(&self, key: K, value: V) -> Option<V> {
        self.items.write().insert(key, value)
    }

    fn delete(&self, key: &K) -> Option<V> {
        self.items.write().remove(key)
    }

    fn retain(&self, keep: &mut dyn FnMut(&K, &V) -> bool) -> usize {
        let mut items = self.items.write();
        let before = items.len();
        items.retain(|k, v| keep(k, v));
        before - items.len()
    }

    fn len(&self) -> usize {
        self.items.read().len()
    }
}

/// In-process cache for clients that do not bring their own.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    users: MemoryStore<Snowflake, User>,
    guilds: MemoryStore<Snowflake, Guild>,
    unavailable_guilds: MemoryStore<Snowflake, UnavailableGuild>,
    channels: MemoryStore<Snowflake, Channel>,
    members: MemoryStore<MemberKey, Member>,
    roles: MemoryStore<Snowflake, Role>,
    messages: MemoryStore<Snowflake, Message>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EntityCache for InMemoryCache {
    fn users(&self) -> &dyn EntityStore<Snowflake, User> {
        &self.users
    }

    fn guilds(&self) -> &dyn EntityStore<Snowflake, Guild> {
        &self.guilds
    }

    fn unavailable_guilds(&self) -> &dyn EntityStore<Snowflake, UnavailableGuild> {
        &self.unavailable_guilds
    }

    fn channels(&self) -> &dyn EntityStore<Snowflake, Channel> {
        &self.channels
    }

    fn members(&self) -> &dyn EntityStore<MemberKey, Member> {
        &self.members
    }

    fn roles(&self) -> &dyn EntityStore<Snowflake, Role> {
        &self.roles
    }

    fn messages(&self) -> &dyn EntityStore<Snowflake, Message> {
        &self.messages
    }
}
