//! Gateway payload model: op-codes, the raw wire shape, and the typed
//! messages the server pushes.

mod types;

pub use types::{
    ConnectionProperties, Hello, Identify, RequestGuildMembers, Resume, Shard, UpdatePresence,
    VoiceStateUpdate,
};

pub(crate) use types::Ready;

use enum_as_inner::EnumAsInner;
use serde::de::Error as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::prelude::*;

use crate::error::{self, ProtocolError};

/// Gateway op-codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// an event is being pushed to the client
    Dispatch = 0,
    /// keep-alive, sent by the client on its interval or on demand
    Heartbeat = 1,
    /// start a new session
    Identify = 2,
    /// update the client presence
    PresenceUpdate = 3,
    /// join, move or leave a voice channel
    VoiceStateUpdate = 4,
    /// continue a previous session
    Resume = 6,
    /// the server wants the client to reconnect
    Reconnect = 7,
    /// request guild member chunks
    RequestGuildMembers = 8,
    /// the session was invalidated
    InvalidSession = 9,
    /// first message after the upgrade, carries the heartbeat interval
    Hello = 10,
    /// the server acknowledged a heartbeat
    HeartbeatAck = 11,
}

impl Opcode {
    /// Look an op-code up by its raw wire value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Dispatch),
            1 => Some(Self::Heartbeat),
            2 => Some(Self::Identify),
            3 => Some(Self::PresenceUpdate),
            4 => Some(Self::VoiceStateUpdate),
            6 => Some(Self::Resume),
            7 => Some(Self::Reconnect),
            8 => Some(Self::RequestGuildMembers),
            9 => Some(Self::InvalidSession),
            10 => Some(Self::Hello),
            11 => Some(Self::HeartbeatAck),
            _ => None,
        }
    }

    /// Raw wire value.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Protocol name of the op-code.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Dispatch => "DISPATCH",
            Self::Heartbeat => "HEARTBEAT",
            Self::Identify => "IDENTIFY",
            Self::PresenceUpdate => "PRESENCE_UPDATE",
            Self::VoiceStateUpdate => "VOICE_STATE_UPDATE",
            Self::Resume => "RESUME",
            Self::Reconnect => "RECONNECT",
            Self::RequestGuildMembers => "REQUEST_GUILD_MEMBERS",
            Self::InvalidSession => "INVALID_SESSION",
            Self::Hello => "HELLO",
            Self::HeartbeatAck => "HEARTBEAT_ACK",
        }
    }
}

/// The wire shape of every gateway payload:
/// `{"op": int, "d": any, "s": int|null, "t": string|null}`.
///
/// Commands sent by the client omit `s` and `t`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPayload {
    /// op-code as transmitted, unknown values included
    pub op: u8,
    /// payload data
    #[serde(default)]
    pub d: Value,
    /// dispatch sequence number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    /// dispatch event name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl RawPayload {
    /// Build a client command payload.
    pub(crate) fn command(op: Opcode, d: Value) -> Self {
        Self {
            op: op.as_u8(),
            d,
            s: None,
            t: None,
        }
    }
}

/// A server push drained from [`Connection::events`](crate::Connection::events).
#[derive(Debug, Clone)]
pub struct Event {
    /// event name: the dispatch `t` field, or the op-code name for
    /// non-dispatch messages
    pub name: String,
    /// event data as transmitted in `d`
    pub data: Value,
    /// dispatch sequence number, absent on non-dispatch messages
    pub sequence: Option<u64>,
}

/// A server-sent message, classified from its raw payload.
#[derive(Debug, Clone, EnumAsInner)]
pub enum ServerMessage {
    /// op 0, an event for the caller
    Dispatch(Event),
    /// op 1, the server wants a heartbeat right now
    HeartbeatRequest,
    /// op 7, the server wants the client to reconnect and resume
    Reconnect,
    /// op 9, the payload tells whether the session survived
    InvalidSession {
        /// whether the invalidated session can still be resumed
        resumable: bool,
    },
    /// op 10
    Hello {
        /// parsed heartbeat settings
        payload: Hello,
        /// the raw `d` value, forwarded as the HELLO event data
        data: Value,
    },
    /// op 11
    HeartbeatAck,
    /// an op-code this library does not know
    Unknown {
        /// op-code as transmitted
        op: u8,
    },
}

impl ServerMessage {
    /// Classify a decoded payload into a typed message.
    pub(crate) fn classify(raw: RawPayload) -> Result<Self, ProtocolError> {
        let Some(op) = Opcode::from_u8(raw.op) else {
            return Ok(Self::Unknown { op: raw.op });
        };

        let msg = match op {
            Opcode::Dispatch => {
                let name = raw.t.ok_or_else(|| ProtocolError::MalformedPayload {
                    source: serde_json::Error::custom("dispatch without event name"),
                })?;
                let sequence = raw.s.ok_or_else(|| ProtocolError::MalformedPayload {
                    source: serde_json::Error::custom("dispatch without sequence"),
                })?;

                Self::Dispatch(Event {
                    name,
                    data: raw.d,
                    sequence: Some(sequence),
                })
            }
            Opcode::Heartbeat => Self::HeartbeatRequest,
            Opcode::Reconnect => Self::Reconnect,
            Opcode::InvalidSession => {
                let resumable = raw.d.as_bool().ok_or_else(|| ProtocolError::MalformedPayload {
                    source: serde_json::Error::custom("invalid session without boolean data"),
                })?;
                Self::InvalidSession { resumable }
            }
            Opcode::Hello => {
                let payload =
                    serde_json::from_value(raw.d.clone()).context(error::MalformedPayload)?;
                Self::Hello {
                    payload,
                    data: raw.d,
                }
            }
            Opcode::HeartbeatAck => Self::HeartbeatAck,
            // client-to-server op-codes are never pushed by a conforming
            // server, surface them as unknown
            Opcode::Identify
            | Opcode::PresenceUpdate
            | Opcode::VoiceStateUpdate
            | Opcode::Resume
            | Opcode::RequestGuildMembers => Self::Unknown { op: raw.op },
        };

        Ok(msg)
    }
}
