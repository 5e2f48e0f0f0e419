//! Dispatch events, decoded once from the `t` and `d` fields of op 0 frames

use crate::cache::{CacheKey, EntityKind};
use crate::error::Error;
use serde::Deserialize;
use serde_json::{json, Value};

/// Guild stub listed in READY
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UnavailableGuild {
    pub id: String,
    #[serde(default)]
    pub unavailable: bool,
}

/// Body of the READY dispatch
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Ready {
    pub session_id: String,
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
    #[serde(default)]
    pub guilds: Vec<UnavailableGuild>,
    #[serde(default)]
    pub user: Value,
}

/// Body of GUILD_MEMBERS_CHUNK
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MembersChunk {
    pub guild_id: String,
    #[serde(default)]
    pub members: Vec<Value>,
    pub chunk_index: u32,
    pub chunk_count: u32,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub not_found: Vec<Value>,
}

impl MembersChunk {
    /// Whether this is the final chunk of its response
    pub fn is_last(&self) -> bool {
        self.chunk_index + 1 >= self.chunk_count
    }
}

/// GUILD_CREATE fields the shard itself needs
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GuildCreate {
    pub id: String,
    #[serde(default)]
    pub unavailable: bool,
    #[serde(default)]
    pub large: bool,
    #[serde(default)]
    pub member_count: Option<u32>,
    #[serde(skip)]
    pub data: Value,
}

impl GuildCreate {
    /// Large per the gateway flag, or by member count against our threshold
    pub fn is_large(&self, threshold: u16) -> bool {
        self.large || self.member_count.is_some_and(|count| count > u32::from(threshold))
    }
}

/// GUILD_DELETE body
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GuildDelete {
    pub id: String,
    #[serde(default)]
    pub unavailable: bool,
}

/// Dispatch events that only flow through the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityEvent {
    ChannelCreate,
    ChannelUpdate,
    ChannelDelete,
    ThreadCreate,
    ThreadUpdate,
    ThreadDelete,
    GuildUpdate,
    GuildEmojisUpdate,
    GuildRoleCreate,
    GuildRoleUpdate,
    GuildRoleDelete,
    GuildMemberAdd,
    GuildMemberUpdate,
    GuildMemberRemove,
    GuildBanAdd,
    GuildBanRemove,
    MessageCreate,
    MessageUpdate,
    MessageDelete,
    MessageDeleteBulk,
    MessageReactionAdd,
    MessageReactionRemove,
    PresenceUpdate,
    TypingStart,
    UserUpdate,
    VoiceStateUpdate,
    InteractionCreate,
}

/// What a dispatch does to the cache
#[derive(Debug, Clone, PartialEq)]
pub enum CacheOp {
    /// Create or partially update an entity
    Upsert { key: CacheKey, delta: Value },
    /// Delete an entity
    Remove { key: CacheKey },
    /// No cache effect, emit the payload as-is
    Emit,
}

fn str_field<'a>(data: &'a Value, path: &[&str]) -> Option<&'a str> {
    path.iter()
        .try_fold(data, |value, field| value.get(field))
        .and_then(Value::as_str)
}

impl EntityEvent {
    /// Get the wire name
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ChannelCreate => "CHANNEL_CREATE",
            Self::ChannelUpdate => "CHANNEL_UPDATE",
            Self::ChannelDelete => "CHANNEL_DELETE",
            Self::ThreadCreate => "THREAD_CREATE",
            Self::ThreadUpdate => "THREAD_UPDATE",
            Self::ThreadDelete => "THREAD_DELETE",
            Self::GuildUpdate => "GUILD_UPDATE",
            Self::GuildEmojisUpdate => "GUILD_EMOJIS_UPDATE",
            Self::GuildRoleCreate => "GUILD_ROLE_CREATE",
            Self::GuildRoleUpdate => "GUILD_ROLE_UPDATE",
            Self::GuildRoleDelete => "GUILD_ROLE_DELETE",
            Self::GuildMemberAdd => "GUILD_MEMBER_ADD",
            Self::GuildMemberUpdate => "GUILD_MEMBER_UPDATE",
            Self::GuildMemberRemove => "GUILD_MEMBER_REMOVE",
            Self::GuildBanAdd => "GUILD_BAN_ADD",
            Self::GuildBanRemove => "GUILD_BAN_REMOVE",
            Self::MessageCreate => "MESSAGE_CREATE",
            Self::MessageUpdate => "MESSAGE_UPDATE",
            Self::MessageDelete => "MESSAGE_DELETE",
            Self::MessageDeleteBulk => "MESSAGE_DELETE_BULK",
            Self::MessageReactionAdd => "MESSAGE_REACTION_ADD",
            Self::MessageReactionRemove => "MESSAGE_REACTION_REMOVE",
            Self::PresenceUpdate => "PRESENCE_UPDATE",
            Self::TypingStart => "TYPING_START",
            Self::UserUpdate => "USER_UPDATE",
            Self::VoiceStateUpdate => "VOICE_STATE_UPDATE",
            Self::InteractionCreate => "INTERACTION_CREATE",
        }
    }

    /// Parse from the wire name
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "CHANNEL_CREATE" => Some(Self::ChannelCreate),
            "CHANNEL_UPDATE" => Some(Self::ChannelUpdate),
            "CHANNEL_DELETE" => Some(Self::ChannelDelete),
            "THREAD_CREATE" => Some(Self::ThreadCreate),
            "THREAD_UPDATE" => Some(Self::ThreadUpdate),
            "THREAD_DELETE" => Some(Self::ThreadDelete),
            "GUILD_UPDATE" => Some(Self::GuildUpdate),
            "GUILD_EMOJIS_UPDATE" => Some(Self::GuildEmojisUpdate),
            "GUILD_ROLE_CREATE" => Some(Self::GuildRoleCreate),
            "GUILD_ROLE_UPDATE" => Some(Self::GuildRoleUpdate),
            "GUILD_ROLE_DELETE" => Some(Self::GuildRoleDelete),
            "GUILD_MEMBER_ADD" => Some(Self::GuildMemberAdd),
            "GUILD_MEMBER_UPDATE" => Some(Self::GuildMemberUpdate),
            "GUILD_MEMBER_REMOVE" => Some(Self::GuildMemberRemove),
            "GUILD_BAN_ADD" => Some(Self::GuildBanAdd),
            "GUILD_BAN_REMOVE" => Some(Self::GuildBanRemove),
            "MESSAGE_CREATE" => Some(Self::MessageCreate),
            "MESSAGE_UPDATE" => Some(Self::MessageUpdate),
            "MESSAGE_DELETE" => Some(Self::MessageDelete),
            "MESSAGE_DELETE_BULK" => Some(Self::MessageDeleteBulk),
            "MESSAGE_REACTION_ADD" => Some(Self::MessageReactionAdd),
            "MESSAGE_REACTION_REMOVE" => Some(Self::MessageReactionRemove),
            "PRESENCE_UPDATE" => Some(Self::PresenceUpdate),
            "TYPING_START" => Some(Self::TypingStart),
            "USER_UPDATE" => Some(Self::UserUpdate),
            "VOICE_STATE_UPDATE" => Some(Self::VoiceStateUpdate),
            "INTERACTION_CREATE" => Some(Self::InteractionCreate),
            _ => None,
        }
    }

    /// Map the payload to its cache operation.
    ///
    /// Payloads missing the id fields fall back to [`CacheOp::Emit`].
    pub fn cache_op(self, data: &Value) -> CacheOp {
        let keyed = |kind: EntityKind, path: &[&str]| {
            str_field(data, path).map(|id| CacheKey::new(kind, id))
        };
        let scoped = |kind: EntityKind, path: &[&str]| {
            let guild_id = str_field(data, &["guild_id"])?;
            let id = str_field(data, path)?;
            Some(CacheKey::scoped(kind, guild_id, id))
        };
        let upsert = |key: Option<CacheKey>, delta: Value| match key {
            Some(key) => CacheOp::Upsert { key, delta },
            None => CacheOp::Emit,
        };
        let remove = |key: Option<CacheKey>| match key {
            Some(key) => CacheOp::Remove { key },
            None => CacheOp::Emit,
        };

        match self {
            Self::ChannelCreate | Self::ChannelUpdate => {
                upsert(keyed(EntityKind::Channel, &["id"]), data.clone())
            }
            Self::ChannelDelete => remove(keyed(EntityKind::Channel, &["id"])),
            Self::ThreadCreate | Self::ThreadUpdate => {
                upsert(keyed(EntityKind::Thread, &["id"]), data.clone())
            }
            Self::ThreadDelete => remove(keyed(EntityKind::Thread, &["id"])),
            Self::GuildUpdate => upsert(keyed(EntityKind::Guild, &["id"]), data.clone()),
            Self::GuildEmojisUpdate => upsert(
                keyed(EntityKind::Guild, &["guild_id"]),
                json!({ "emojis": data.get("emojis").cloned().unwrap_or(Value::Null) }),
            ),
            Self::GuildRoleCreate | Self::GuildRoleUpdate => upsert(
                scoped(EntityKind::Role, &["role", "id"]),
                data.get("role").cloned().unwrap_or(Value::Null),
            ),
            Self::GuildRoleDelete => remove(scoped(EntityKind::Role, &["role_id"])),
            Self::GuildMemberAdd | Self::GuildMemberUpdate => {
                upsert(scoped(EntityKind::Member, &["user", "id"]), data.clone())
            }
            Self::GuildMemberRemove => remove(scoped(EntityKind::Member, &["user", "id"])),
            Self::MessageCreate | Self::MessageUpdate => {
                upsert(keyed(EntityKind::Message, &["id"]), data.clone())
            }
            Self::MessageDelete => remove(keyed(EntityKind::Message, &["id"])),
            Self::PresenceUpdate => upsert(keyed(EntityKind::Presence, &["user", "id"]), data.clone()),
            Self::UserUpdate => upsert(keyed(EntityKind::User, &["id"]), data.clone()),
            Self::VoiceStateUpdate => {
                let key = scoped(EntityKind::VoiceState, &["user_id"]);
                if data.get("channel_id").map_or(true, Value::is_null) {
                    remove(key)
                } else {
                    upsert(key, data.clone())
                }
            }
            Self::GuildBanAdd
            | Self::GuildBanRemove
            | Self::MessageDeleteBulk
            | Self::MessageReactionAdd
            | Self::MessageReactionRemove
            | Self::TypingStart
            | Self::InteractionCreate => CacheOp::Emit,
        }
    }
}

impl std::fmt::Display for EntityEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded dispatch event
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    Ready(Ready),
    Resumed,
    GuildCreate(GuildCreate),
    GuildDelete(GuildDelete),
    GuildMembersChunk(MembersChunk),
    Entity { kind: EntityEvent, data: Value },
    /// Event name this client has no handler for
    Unknown { name: String, data: Value },
}

fn parse<T: for<'de> Deserialize<'de>>(name: &str, data: Value) -> Result<T, Error> {
    serde_json::from_value(data).map_err(|e| Error::Decode(format!("invalid {name}: {e}")))
}

impl DispatchEvent {
    /// Decode a dispatch by event name
    pub fn decode(name: &str, data: Value) -> Result<Self, Error> {
        match name {
            "READY" => parse(name, data).map(Self::Ready),
            "RESUMED" => Ok(Self::Resumed),
            "GUILD_CREATE" => {
                let mut guild: GuildCreate = parse(name, data.clone())?;
                guild.data = data;
                Ok(Self::GuildCreate(guild))
            }
            "GUILD_DELETE" => parse(name, data).map(Self::GuildDelete),
            "GUILD_MEMBERS_CHUNK" => parse(name, data).map(Self::GuildMembersChunk),
            _ => Ok(match EntityEvent::from_str(name) {
                Some(kind) => Self::Entity { kind, data },
                None => Self::Unknown {
                    name: name.to_string(),
                    data,
                },
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_event_names_roundtrip() {
        for name in ["CHANNEL_CREATE", "GUILD_MEMBER_REMOVE", "VOICE_STATE_UPDATE", "TYPING_START"] {
            let event = EntityEvent::from_str(name).unwrap();
            assert_eq!(event.as_str(), name);
        }
        assert!(EntityEvent::from_str("READY").is_none());
    }

    #[test]
    fn test_decode_ready() {
        let event = DispatchEvent::decode(
            "READY",
            json!({
                "session_id": "abc",
                "resume_gateway_url": "wss://resume.example",
                "guilds": [{"id": "1", "unavailable": true}, {"id": "2"}],
                "user": {"id": "9"}
            }),
        )
        .unwrap();
        let DispatchEvent::Ready(ready) = event else {
            panic!("expected READY");
        };
        assert_eq!(ready.session_id, "abc");
        assert_eq!(ready.guilds.len(), 2);
        assert!(ready.guilds[0].unavailable);
        assert!(!ready.guilds[1].unavailable);
    }

    #[test]
    fn test_decode_guild_create_keeps_body() {
        let body = json!({"id": "5", "large": true, "member_count": 300, "name": "big"});
        let DispatchEvent::GuildCreate(guild) = DispatchEvent::decode("GUILD_CREATE", body.clone()).unwrap() else {
            panic!("expected GUILD_CREATE");
        };
        assert!(guild.large);
        assert_eq!(guild.member_count, Some(300));
        assert_eq!(guild.data, body);
    }

    #[test]
    fn test_guild_large_by_member_count() {
        let body = json!({"id": "6", "member_count": 120});
        let DispatchEvent::GuildCreate(guild) = DispatchEvent::decode("GUILD_CREATE", body).unwrap() else {
            panic!("expected GUILD_CREATE");
        };
        assert!(!guild.large);
        assert!(guild.is_large(100));
        assert!(!guild.is_large(120));
    }

    #[test]
    fn test_decode_unknown_and_invalid() {
        let event = DispatchEvent::decode("SOMETHING_NEW", json!({"a": 1})).unwrap();
        assert!(matches!(event, DispatchEvent::Unknown { ref name, .. } if name == "SOMETHING_NEW"));

        assert!(DispatchEvent::decode("READY", json!({"guilds": []})).is_err());
    }

    #[test]
    fn test_members_chunk_is_last() {
        let chunk: MembersChunk = serde_json::from_value(json!({
            "guild_id": "1", "members": [], "chunk_index": 1, "chunk_count": 2
        }))
        .unwrap();
        assert!(chunk.is_last());
    }

    #[test]
    fn test_cache_ops() {
        let op = EntityEvent::GuildMemberAdd.cache_op(&json!({"guild_id": "1", "user": {"id": "2"}}));
        assert!(matches!(op, CacheOp::Upsert { ref key, .. } if *key == CacheKey::scoped(EntityKind::Member, "1", "2")));

        let op = EntityEvent::GuildRoleDelete.cache_op(&json!({"guild_id": "1", "role_id": "3"}));
        assert_eq!(op, CacheOp::Remove { key: CacheKey::scoped(EntityKind::Role, "1", "3") });

        let op = EntityEvent::VoiceStateUpdate.cache_op(&json!({"guild_id": "1", "user_id": "2", "channel_id": null}));
        assert!(matches!(op, CacheOp::Remove { .. }));

        assert_eq!(EntityEvent::MessageCreate.cache_op(&json!({"content": "no id"})), CacheOp::Emit);
        assert_eq!(EntityEvent::TypingStart.cache_op(&json!({})), CacheOp::Emit);
    }
}
