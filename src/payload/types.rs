use serde::{Deserialize, Serialize};
use serde_json::Value;

/// HELLO message data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    /// interval between heartbeats, in milliseconds
    pub heartbeat_interval: u64,
}

/// The subset of the READY dispatch the connection consumes for itself.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Ready {
    pub session_id: String,
    pub resume_gateway_url: String,
}

/// Client properties sent inside IDENTIFY.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionProperties {
    /// operating system name
    pub os: String,
    /// library or browser name
    pub browser: String,
    /// device name
    pub device: String,
}

/// Shard assignment as a `[shard_id, shard_count]` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard(
    /// shard id
    pub u32,
    /// total shard count
    pub u32,
);

/// IDENTIFY payload data (op 2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identify {
    /// authorization token
    pub token: String,
    /// intent bitset selecting which dispatches the session receives
    pub intents: u32,
    /// client properties
    pub properties: ConnectionProperties,
    /// enable per-payload compression for this session
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compress: Option<bool>,
    /// member count from which a guild is considered large, 50..=250
    #[serde(skip_serializing_if = "Option::is_none")]
    pub large_threshold: Option<u8>,
    /// shard assignment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard: Option<Shard>,
    /// initial presence
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<Value>,
}

impl Identify {
    /// Identify with only the required fields set.
    pub fn new(token: &str, intents: u32, properties: ConnectionProperties) -> Self {
        Self {
            token: token.to_string(),
            intents,
            properties,
            compress: None,
            large_threshold: None,
            shard: None,
            presence: None,
        }
    }
}

/// RESUME payload data (op 6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resume {
    /// authorization token
    pub token: String,
    /// session being continued
    pub session_id: String,
    /// last dispatch sequence processed
    pub seq: u64,
}

/// REQUEST_GUILD_MEMBERS payload data (op 8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestGuildMembers {
    /// guild to query
    pub guild_id: u64,
    /// maximum number of members to return
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    /// username prefix filter
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// include presence data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presences: Option<bool>,
    /// restrict to these user ids
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_ids: Option<Vec<u64>>,
    /// nonce echoed back in the response chunks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

impl RequestGuildMembers {
    /// Request every member of a guild.
    pub fn all_of(guild_id: u64) -> Self {
        Self {
            guild_id,
            limit: None,
            query: None,
            presences: None,
            user_ids: None,
            nonce: None,
        }
    }
}

/// VOICE_STATE_UPDATE payload data (op 4).
///
/// A `channel_id` of `None` disconnects from voice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceStateUpdate {
    /// guild whose voice state changes
    pub guild_id: u64,
    /// voice channel to join, null to leave
    pub channel_id: Option<u64>,
    /// whether the client is muted
    pub self_mute: bool,
    /// whether the client is deafened
    pub self_deaf: bool,
}

/// PRESENCE_UPDATE payload data (op 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePresence {
    /// unix time in milliseconds the client went idle, null when not idle
    pub since: Option<u64>,
    /// activities the client is engaged in
    pub activities: Vec<Value>,
    /// status icon, e.g. "online" or "dnd"
    pub status: String,
    /// whether the client is afk
    pub afk: bool,
}
