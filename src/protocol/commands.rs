//! Outbound command payloads

use super::intents::Intents;
use crate::error::Error;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;

/// Most explicit user ids a single member request may carry
pub const MAX_REQUESTED_USER_IDS: usize = 100;

/// Client connection properties sent in IDENTIFY
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: env!("CARGO_PKG_NAME").to_string(),
            device: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

/// Online status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Online,
    Dnd,
    Idle,
    Invisible,
    Offline,
}

/// A single activity shown in presence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Activity {
    /// "Playing {name}"
    pub fn playing(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: 0,
            url: None,
        }
    }
}

/// Desired presence, resent on every IDENTIFY
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Presence {
    pub since: Option<u64>,
    pub activities: Vec<Activity>,
    pub status: Status,
    pub afk: bool,
}

/// Body of op 2
#[derive(Debug, Clone, Serialize)]
pub struct IdentifyPayload {
    pub token: String,
    pub properties: IdentifyProperties,
    pub compress: bool,
    pub large_threshold: u16,
    pub shard: [u32; 2],
    pub presence: Presence,
    pub intents: Intents,
}

/// Body of op 6
#[derive(Debug, Clone, Serialize)]
pub struct ResumePayload {
    pub token: String,
    pub session_id: String,
    pub seq: u64,
}

/// Body of op 4
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoiceStateUpdate {
    pub guild_id: String,
    pub channel_id: Option<String>,
    pub self_mute: bool,
    pub self_deaf: bool,
}

/// Options for a member-list request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberRequest {
    /// Username prefix to match; `None` with no user ids requests every member
    pub query: Option<String>,
    /// Maximum members to return, 0 for no limit
    pub limit: u32,
    /// Explicit user ids to fetch
    pub user_ids: Option<Vec<String>>,
    /// Also return presences
    pub presences: bool,
    /// How long to wait for the final chunk, defaults to the configured request timeout
    pub timeout: Option<Duration>,
}

impl MemberRequest {
    /// Request every member of the guild
    pub fn all() -> Self {
        Self::default()
    }

    /// Request specific users
    pub fn users(user_ids: Vec<String>) -> Self {
        Self {
            user_ids: Some(user_ids),
            ..Self::default()
        }
    }

    /// Whether this asks for the whole member list
    pub fn is_full_list(&self) -> bool {
        self.query.as_deref().map_or(true, str::is_empty) && self.user_ids.is_none()
    }

    /// Reject requests the gateway would refuse, before anything is sent
    pub fn validate(&self, intents: Intents) -> Result<(), Error> {
        if self.is_full_list() && !intents.contains(Intents::GUILD_MEMBERS) {
            return Err(Error::InvalidRequest(
                "Cannot request all members without the GUILD_MEMBERS intent".to_string(),
            ));
        }
        if self.presences && !intents.contains(Intents::GUILD_PRESENCES) {
            return Err(Error::InvalidRequest(
                "Cannot request presences without the GUILD_PRESENCES intent".to_string(),
            ));
        }
        if let Some(ids) = &self.user_ids {
            if ids.len() > MAX_REQUESTED_USER_IDS {
                return Err(Error::InvalidRequest(format!(
                    "Cannot request more than {} members by ID ({} requested)",
                    MAX_REQUESTED_USER_IDS,
                    ids.len()
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn into_payload(self, guild_id: String, nonce: String) -> RequestGuildMembers {
        let query = match (&self.query, &self.user_ids) {
            (Some(query), _) => Some(query.clone()),
            (None, None) => Some(String::new()),
            (None, Some(_)) => None,
        };
        RequestGuildMembers {
            guild_id,
            query,
            limit: self.limit,
            presences: self.presences,
            user_ids: self.user_ids,
            nonce,
        }
    }
}

/// Body of op 8
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestGuildMembers {
    pub guild_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    pub limit: u32,
    pub presences: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_ids: Option<Vec<String>>,
    pub nonce: String,
}
