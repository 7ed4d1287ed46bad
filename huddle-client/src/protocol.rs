//! JSON wire protocol between client and server.
//!
//! Every frame is a single JSON value; the server may batch several
//! messages into one frame as a JSON array. Message kinds are numeric
//! `type` codes:
//!
//! ```text
//! client → server            server → client
//! 100 UPDATE_PRESENCE        100 UPDATE_PRESENCE
//! 103 BROADCAST_EVENT        101 USER_JOINED
//! 200 FETCH_STORAGE          102 USER_LEFT
//! 201 UPDATE_STORAGE         103 BROADCAST_EVENT
//!                            104 ROOM_STATE
//!                            200 INITIAL_STORAGE_STATE
//!                            201 UPDATE_STORAGE
//! ```
//!
//! The heartbeat is carried by the literal text frames `"ping"` and
//! `"pong"`, outside the JSON message space.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use huddle_store::{ActorId, JsonObject, NodeId, Op, SerializedNode};

use crate::error::ProtocolError;

/// Heartbeat frames.
pub const PING_FRAME: &str = "ping";
pub const PONG_FRAME: &str = "pong";

/// Message codes shared by both directions.
pub const MSG_UPDATE_PRESENCE: u64 = 100;
pub const MSG_USER_JOINED: u64 = 101;
pub const MSG_USER_LEFT: u64 = 102;
pub const MSG_BROADCAST_EVENT: u64 = 103;
pub const MSG_ROOM_STATE: u64 = 104;
pub const MSG_FETCH_STORAGE: u64 = 200;
pub const MSG_INITIAL_STORAGE_STATE: u64 = 200;
pub const MSG_UPDATE_STORAGE: u64 = 201;

/// Static metadata the server knows about a connected user.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UserMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
}

/// A message emitted by this client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    UpdatePresence {
        data: JsonObject,
        /// Directs a full presence snapshot at one newly joined actor.
        target_actor: Option<ActorId>,
    },
    BroadcastEvent {
        event: Value,
    },
    FetchStorage,
    UpdateStorage {
        ops: Vec<Op>,
    },
}

impl ClientMessage {
    pub fn code(&self) -> u64 {
        match self {
            ClientMessage::UpdatePresence { .. } => MSG_UPDATE_PRESENCE,
            ClientMessage::BroadcastEvent { .. } => MSG_BROADCAST_EVENT,
            ClientMessage::FetchStorage => MSG_FETCH_STORAGE,
            ClientMessage::UpdateStorage { .. } => MSG_UPDATE_STORAGE,
        }
    }

    fn to_value(&self) -> Result<Value, ProtocolError> {
        let value = match self {
            ClientMessage::UpdatePresence { data, target_actor } => {
                let mut msg = json!({
                    "type": MSG_UPDATE_PRESENCE,
                    "data": Value::Object(data.clone()),
                });
                if let (Some(actor), Some(obj)) = (target_actor, msg.as_object_mut()) {
                    obj.insert("targetActor".into(), json!(actor));
                }
                msg
            }
            ClientMessage::BroadcastEvent { event } => {
                json!({ "type": MSG_BROADCAST_EVENT, "event": event })
            }
            ClientMessage::FetchStorage => json!({ "type": MSG_FETCH_STORAGE }),
            ClientMessage::UpdateStorage { ops } => {
                let ops = serde_json::to_value(ops)
                    .map_err(|e| ProtocolError::Storage(e.to_string()))?;
                json!({ "type": MSG_UPDATE_STORAGE, "ops": ops })
            }
        };
        Ok(value)
    }

    /// Serialize to a single text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let value = self.to_value()?;
        serde_json::to_string(&value).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// A message received from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    UpdatePresence {
        actor: ActorId,
        data: JsonObject,
        target_actor: Option<ActorId>,
    },
    UserJoined {
        actor: ActorId,
        info: Option<Value>,
        scopes: Vec<String>,
    },
    UserLeft {
        actor: ActorId,
    },
    BroadcastEvent {
        actor: ActorId,
        event: Value,
    },
    RoomState {
        users: BTreeMap<ActorId, UserMeta>,
    },
    InitialStorage {
        items: Vec<(NodeId, SerializedNode)>,
    },
    UpdateStorage {
        ops: Vec<Op>,
    },
}

impl ServerMessage {
    /// Decode one text frame into the messages it carries. A frame is
    /// either a single JSON object or an array of them (server batching).
    pub fn decode_frame(text: &str) -> Result<Vec<ServerMessage>, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        match value {
            Value::Array(values) => values.into_iter().map(Self::decode_value).collect(),
            value @ Value::Object(_) => Ok(vec![Self::decode_value(value)?]),
            other => Err(ProtocolError::Malformed(format!(
                "expected object or array, got {other}"
            ))),
        }
    }

    fn decode_value(value: Value) -> Result<ServerMessage, ProtocolError> {
        let obj = value
            .as_object()
            .ok_or_else(|| ProtocolError::Malformed("message is not an object".into()))?;
        let code = obj
            .get("type")
            .and_then(Value::as_u64)
            .ok_or_else(|| ProtocolError::Malformed("missing numeric `type`".into()))?;

        let actor = |field: &str| -> Result<ActorId, ProtocolError> {
            obj.get(field)
                .and_then(Value::as_u64)
                .and_then(|a| ActorId::try_from(a).ok())
                .ok_or_else(|| ProtocolError::Malformed(format!("missing actor field {field:?}")))
        };

        match code {
            MSG_UPDATE_PRESENCE => {
                let data = obj
                    .get("data")
                    .and_then(Value::as_object)
                    .cloned()
                    .ok_or_else(|| ProtocolError::Malformed("presence without data".into()))?;
                let target_actor = obj
                    .get("targetActor")
                    .and_then(Value::as_u64)
                    .and_then(|a| ActorId::try_from(a).ok());
                Ok(ServerMessage::UpdatePresence {
                    actor: actor("actor")?,
                    data,
                    target_actor,
                })
            }
            MSG_USER_JOINED => {
                let info = obj.get("info").filter(|v| !v.is_null()).cloned();
                let scopes = obj
                    .get("scopes")
                    .map(|v| {
                        serde_json::from_value(v.clone())
                            .map_err(|e| ProtocolError::Malformed(format!("bad scopes: {e}")))
                    })
                    .transpose()?
                    .unwrap_or_default();
                Ok(ServerMessage::UserJoined {
                    actor: actor("actor")?,
                    info,
                    scopes,
                })
            }
            MSG_USER_LEFT => Ok(ServerMessage::UserLeft {
                actor: actor("actor")?,
            }),
            MSG_BROADCAST_EVENT => Ok(ServerMessage::BroadcastEvent {
                actor: actor("actor")?,
                event: obj
                    .get("event")
                    .cloned()
                    .ok_or_else(|| ProtocolError::Malformed("broadcast without event".into()))?,
            }),
            MSG_ROOM_STATE => {
                let users = obj
                    .get("users")
                    .cloned()
                    .ok_or_else(|| ProtocolError::Malformed("room state without users".into()))?;
                // an empty roster may arrive as `[]` instead of `{}`
                let users = match users {
                    Value::Array(a) if a.is_empty() => BTreeMap::new(),
                    other => serde_json::from_value(other)
                        .map_err(|e| ProtocolError::Malformed(format!("bad users: {e}")))?,
                };
                Ok(ServerMessage::RoomState { users })
            }
            MSG_INITIAL_STORAGE_STATE => {
                let items = obj
                    .get("items")
                    .cloned()
                    .ok_or_else(|| ProtocolError::Storage("initial state without items".into()))?;
                let items = serde_json::from_value(items)
                    .map_err(|e| ProtocolError::Storage(format!("bad items: {e}")))?;
                Ok(ServerMessage::InitialStorage { items })
            }
            MSG_UPDATE_STORAGE => {
                let ops = obj
                    .get("ops")
                    .cloned()
                    .ok_or_else(|| ProtocolError::Storage("update without ops".into()))?;
                let ops = serde_json::from_value(ops)
                    .map_err(|e| ProtocolError::Storage(format!("bad ops: {e}")))?;
                Ok(ServerMessage::UpdateStorage { ops })
            }
            other => Err(ProtocolError::UnknownType(other)),
        }
    }
}
