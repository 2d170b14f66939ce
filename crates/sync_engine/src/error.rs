use std::path::PathBuf;

use shared::{
    domain::{StaffRole, ThreadId},
    error::ErrorCode,
};
use thiserror::Error;

/// A raw payload that could not become a canonical message. Always dropped
/// and logged by the engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("message payload is not a JSON object")]
    NotAnObject,
    #[error("message payload has no id")]
    MissingId,
    #[error("message {id} has neither a thread id nor a sender id")]
    Unresolvable { id: String },
    #[error("message {id} has no sender id")]
    MissingSender { id: String },
    #[error("message {id} has no timestamp")]
    MissingTimestamp { id: String },
    #[error("message {id} has invalid timestamp '{raw}'")]
    InvalidTimestamp { id: String, raw: String },
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("message needs text or an attachment")]
    EmptyMessage,
    #[error("attachment '{file_name}' is not an allowed file type")]
    UnsupportedAttachment {
        file_name: String,
        extension: Option<String>,
    },
    #[error("attachment '{file_name}' is {size} bytes, above the {limit} byte limit")]
    AttachmentTooLarge {
        file_name: String,
        size: u64,
        limit: u64,
    },
    #[error("{role:?} console may not {action}")]
    NotPermitted { role: StaffRole, action: &'static str },
    #[error("thread {0} is not loaded")]
    UnknownThread(ThreadId),
    #[error("server rejected message ({status}, {code:?}): {message}")]
    Rejected {
        status: u16,
        code: ErrorCode,
        message: String,
    },
    #[error("message could not be delivered: {0}")]
    Transport(String),
    #[error("sync engine has shut down")]
    EngineClosed,
}

impl SendError {
    /// Validation failures need the draft changed; everything else may be
    /// retried as-is.
    pub fn is_retryable(&self) -> bool {
        match self {
            SendError::Transport(_) | SendError::EngineClosed => true,
            SendError::Rejected { code, .. } => {
                matches!(code, ErrorCode::RateLimited | ErrorCode::Internal)
            }
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("push channel is not connected")]
    NotConnected,
    #[error("push url must start with http://, https://, ws:// or wss://: {0}")]
    InvalidUrl(String),
    #[error("push transport failed: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value '{value}' for {key}")]
    InvalidEnv { key: String, value: String },
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("sync engine has shut down")]
pub struct EngineClosed;

impl From<EngineClosed> for SendError {
    fn from(_: EngineClosed) -> Self {
        SendError::EngineClosed
    }
}
