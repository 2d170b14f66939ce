use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{domain::ThreadId, error::ApiError};

/// Push frame type carrying a chat message for the receiving actor.
pub const FRAME_RECEIVE_MESSAGE: &str = "receive_message";
/// Push frame type for the general broadcast group of an open thread.
pub const FRAME_BROADCAST: &str = "broadcast";
pub const FRAME_ERROR: &str = "error";

/// Identifier as the portal API emits it: sometimes a JSON string, sometimes a number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawId {
    Text(String),
    Number(i64),
}

impl RawId {
    pub fn into_string(self) -> String {
        match self {
            RawId::Text(text) => text,
            RawId::Number(number) => number.to_string(),
        }
    }
}

impl fmt::Display for RawId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawId::Text(text) => f.write_str(text),
            RawId::Number(number) => write!(f, "{number}"),
        }
    }
}

impl From<&str> for RawId {
    fn from(value: &str) -> Self {
        RawId::Text(value.to_string())
    }
}

/// One frame on the push channel. The payload is left untyped so the
/// transport layer never has to understand message content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl PushFrame {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    pub fn into_event(self) -> ServerEvent {
        match self.kind.as_str() {
            FRAME_RECEIVE_MESSAGE | FRAME_BROADCAST => ServerEvent::MessageReceived {
                payload: self.payload,
            },
            FRAME_ERROR => match serde_json::from_value::<ApiError>(self.payload) {
                Ok(error) => ServerEvent::Error(error),
                Err(err) => ServerEvent::Unknown {
                    kind: format!("{FRAME_ERROR} (undecodable: {err})"),
                },
            },
            _ => ServerEvent::Unknown { kind: self.kind },
        }
    }
}

#[derive(Debug, Clone)]
pub enum ServerEvent {
    MessageReceived { payload: Value },
    Error(ApiError),
    Unknown { kind: String },
}

/// Outbound RPC frames written by the client on the push channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    JoinThread {
        #[serde(rename = "threadId")]
        thread_id: ThreadId,
    },
}

/// Server-side thread record returned by `GET /threads-by-user/{userId}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadRecord {
    pub id: RawId,
    pub consultant_id: RawId,
    pub user_id: RawId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default)]
    pub messages: Vec<Value>,
}

/// Response body of `POST /messages`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RawId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
}

/// Directory entry returned by `GET /users/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: RawId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
}
