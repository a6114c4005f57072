//! Entity snapshots the dispatch router stores in the cache.
//!
//! Only the fields the shard itself reads are typed; everything else the
//! gateway sends is preserved in `extra` so cached snapshots round-trip.

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Entity identifier. Accepts both string and integer encodings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Snowflake(String);

impl Snowflake {
    pub fn new(id: impl Into<String>) -> Self {
        Snowflake(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Snowflake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Snowflake {
    fn from(id: &str) -> Self {
        Snowflake(id.to_string())
    }
}

impl From<String> for Snowflake {
    fn from(id: String) -> Self {
        Snowflake(id)
    }
}

impl From<u64> for Snowflake {
    fn from(id: u64) -> Self {
        Snowflake(id.to_string())
    }
}

impl<'de> Deserialize<'de> for Snowflake {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SnowflakeVisitor;

        impl Visitor<'_> for SnowflakeVisitor {
            type Value = Snowflake;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a snowflake as a string or an integer")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Snowflake, E> {
                Ok(Snowflake(v.to_string()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<Snowflake, E> {
                Ok(Snowflake(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Snowflake, E> {
                Ok(Snowflake(v.to_string()))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Snowflake, E> {
                if v < 0 {
                    return Err(E::custom("negative snowflake"));
                }
                Ok(Snowflake(v.to_string()))
            }
        }

        deserializer.deserialize_any(SnowflakeVisitor)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Snowflake,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub global_name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub bot: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl User {
    pub fn placeholder(id: Snowflake) -> Self {
        Self {
            id,
            username: String::new(),
            global_name: None,
            avatar: None,
            bot: false,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Guild {
    pub id: Snowflake,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub owner_id: Option<Snowflake>,
    #[serde(default)]
    pub member_count: Option<u64>,
    #[serde(default)]
    pub large: bool,
    #[serde(default)]
    pub unavailable: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Guild {
    /// A guild known only by id, used when an event references an uncached guild.
    pub fn placeholder(id: Snowflake) -> Self {
        Self {
            id,
            name: String::new(),
            owner_id: None,
            member_count: None,
            large: false,
            unavailable: false,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnavailableGuild {
    pub id: Snowflake,
    #[serde(default)]
    pub unavailable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: Snowflake,
    #[serde(rename = "type", default)]
    pub kind: u8,
    #[serde(default)]
    pub guild_id: Option<Snowflake>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub parent_id: Option<Snowflake>,
    /// Threads only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_count: Option<u32>,
    /// Thread members seen through THREAD_MEMBERS_UPDATE
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<ThreadMember>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Channel {
    pub fn placeholder(id: Snowflake) -> Self {
        Self {
            id,
            kind: 0,
            guild_id: None,
            name: None,
            parent_id: None,
            member_count: None,
            members: Vec::new(),
            extra: Map::new(),
        }
    }

    /// Announcement, public and private threads
    pub fn is_thread(&self) -> bool {
        matches!(self.kind, 10..=12)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadMember {
    /// The thread
    #[serde(default)]
    pub id: Option<Snowflake>,
    #[serde(default)]
    pub user_id: Option<Snowflake>,
    #[serde(default)]
    pub flags: u64,
    #[serde(default)]
    pub join_timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub id: Snowflake,
    #[serde(default)]
    pub guild_id: Option<Snowflake>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub color: u32,
    #[serde(default)]
    pub position: i64,
    #[serde(default)]
    pub permissions: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Role {
    pub fn placeholder(id: Snowflake, guild_id: Snowflake) -> Self {
        Self {
            id,
            guild_id: Some(guild_id),
            name: String::new(),
            color: 0,
            position: 0,
            permissions: String::new(),
            extra: Map::new(),
        }
    }
}

/// Presence of a guild member as last reported by the gateway
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MemberPresence {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub activities: Vec<Value>,
    #[serde(default)]
    pub client_status: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub user: User,
    #[serde(default)]
    pub guild_id: Option<Snowflake>,
    #[serde(default)]
    pub nick: Option<String>,
    #[serde(default)]
    pub roles: Vec<Snowflake>,
    #[serde(default)]
    pub joined_at: Option<String>,
    #[serde(default)]
    pub presence: Option<MemberPresence>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Member {
    pub fn id(&self) -> &Snowflake {
        &self.user.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Snowflake,
    pub channel_id: Snowflake,
    #[serde(default)]
    pub guild_id: Option<Snowflake>,
    #[serde(default)]
    pub author: Option<User>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub edited_timestamp: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    pub fn placeholder(id: Snowflake, channel_id: Snowflake) -> Self {
        Self {
            id,
            channel_id,
            guild_id: None,
            author: None,
            content: String::new(),
            edited_timestamp: None,
            extra: Map::new(),
        }
    }
}
