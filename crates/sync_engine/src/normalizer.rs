//! Turns the portal's heterogeneous message shapes into [`Message`].

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use shared::{
    domain::{MessageId, ThreadId, UserId},
    protocol::SendMessageResponse,
};
use tracing::debug;
use uuid::Uuid;

use crate::{
    attachment::AttachmentPolicy,
    error::NormalizeError,
    types::{Attachment, Message},
};

/// Prefix of locally generated ids for sends the server did not echo an id for.
pub const TEMP_ID_PREFIX: &str = "tmp-";

const ID_KEYS: &[&str] = &["id", "messageId"];
const THREAD_KEYS: &[&str] = &["chatThreadId", "threadId"];
const TEXT_KEYS: &[&str] = &["messageText", "text", "content", "message", "body"];
const TIMESTAMP_KEYS: &[&str] = &["createdAt", "sentAt", "timestamp"];
const READ_KEYS: &[&str] = &["isRead", "read"];

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
];

/// Parse a timestamp into an absolute UTC instant.
///
/// Strings carrying `Z` or a numeric offset are converted to UTC. Strings
/// without any zone marker are read as UTC, never as local time.
pub fn parse_utc_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = DateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(parsed.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(trimmed, format).ok())
        .map(|naive| naive.and_utc())
}

fn timestamp_from_value(value: &Value) -> Option<Result<DateTime<Utc>, String>> {
    match value {
        Value::String(raw) => Some(parse_utc_timestamp(raw).ok_or_else(|| raw.clone())),
        Value::Number(number) => Some(
            number
                .as_i64()
                .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
                .ok_or_else(|| number.to_string()),
        ),
        _ => None,
    }
}

fn id_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match obj.get(*key)? {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    })
}

fn text_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match obj.get(*key)? {
        Value::String(text) if !text.trim().is_empty() => Some(text.clone()),
        _ => None,
    })
}

fn size_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|key| match obj.get(*key)? {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    })
}

fn bool_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<bool> {
    keys.iter().find_map(|key| obj.get(*key)?.as_bool())
}

fn file_name_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    let name = path.rsplit('/').next()?;
    (!name.is_empty()).then(|| name.to_string())
}

/// Attachment metadata of a send, as known before the server responds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAttachment {
    pub file_name: String,
    pub mime_type: Option<String>,
    pub byte_size: u64,
}

/// A send the server accepted, before it has been echoed on the push channel.
#[derive(Debug, Clone)]
pub struct LocalSend<'a> {
    pub thread_id: &'a ThreadId,
    pub sender_id: &'a UserId,
    pub text: Option<&'a str>,
    pub attachment: Option<&'a LocalAttachment>,
    pub response: &'a SendMessageResponse,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    policy: AttachmentPolicy,
}

impl Normalizer {
    pub fn new(policy: AttachmentPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &AttachmentPolicy {
        &self.policy
    }

    /// One entry of a hydrated thread record. Entries without their own
    /// thread id inherit the record's.
    pub fn from_history(
        &self,
        raw: &Value,
        thread_id: &ThreadId,
    ) -> Result<Message, NormalizeError> {
        self.normalize(raw, Some(thread_id), None)
    }

    /// A live push payload. A missing timestamp falls back to `received_at`.
    pub fn from_push(
        &self,
        raw: &Value,
        received_at: DateTime<Utc>,
    ) -> Result<Message, NormalizeError> {
        self.normalize(raw, None, Some(received_at))
    }

    /// Synthesize the provisional message for an accepted send. Returns the
    /// message and whether its id is a temporary local one.
    pub fn from_send(&self, send: &LocalSend<'_>) -> (Message, bool) {
        let server_id = send
            .response
            .id
            .clone()
            .map(|id| id.into_string())
            .filter(|id| !id.trim().is_empty());
        let provisional = server_id.is_none();
        let id = server_id.unwrap_or_else(|| format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4()));
        let created_at = send
            .response
            .sent_at
            .as_deref()
            .and_then(parse_utc_timestamp)
            .unwrap_or(send.sent_at);

        let attachment = send.attachment.map(|local| Attachment {
            file_name: local.file_name.clone(),
            byte_size: Some(local.byte_size),
            mime_type: local.mime_type.clone(),
            is_image: self
                .policy
                .is_image(&local.file_name, local.mime_type.as_deref()),
            url: send.response.attachment_url.clone(),
        });

        let message = Message {
            id: MessageId::new(id),
            thread_id: Some(send.thread_id.clone()),
            sender_id: send.sender_id.clone(),
            receiver_id: None,
            text: send
                .text
                .map(str::to_string)
                .filter(|text| !text.trim().is_empty()),
            attachment,
            created_at,
            is_read: true,
        };
        (message, provisional)
    }

    fn normalize(
        &self,
        raw: &Value,
        fallback_thread: Option<&ThreadId>,
        fallback_time: Option<DateTime<Utc>>,
    ) -> Result<Message, NormalizeError> {
        let obj = raw.as_object().ok_or(NormalizeError::NotAnObject)?;
        let id = id_field(obj, ID_KEYS).ok_or(NormalizeError::MissingId)?;
        let thread_id = id_field(obj, THREAD_KEYS)
            .map(ThreadId::new)
            .or_else(|| fallback_thread.cloned());
        let sender_id = id_field(obj, &["senderId"]).map(UserId::new);
        let receiver_id = id_field(obj, &["receiverId"]).map(UserId::new);

        let sender_id = match (sender_id, &thread_id) {
            (Some(sender), _) => sender,
            (None, None) => return Err(NormalizeError::Unresolvable { id }),
            (None, Some(_)) => return Err(NormalizeError::MissingSender { id }),
        };

        let timestamp = TIMESTAMP_KEYS
            .iter()
            .find_map(|key| obj.get(*key).and_then(timestamp_from_value));
        let created_at = match timestamp {
            Some(Ok(instant)) => instant,
            Some(Err(raw)) => return Err(NormalizeError::InvalidTimestamp { id, raw }),
            None => match fallback_time {
                Some(instant) => {
                    debug!(message_id = %id, "normalize: no timestamp; using receive time");
                    instant
                }
                None => return Err(NormalizeError::MissingTimestamp { id }),
            },
        };

        Ok(Message {
            id: MessageId::new(id),
            thread_id,
            sender_id,
            receiver_id,
            text: text_field(obj, TEXT_KEYS),
            attachment: self.attachment(obj),
            created_at,
            is_read: bool_field(obj, READ_KEYS).unwrap_or(false),
        })
    }

    fn attachment(&self, obj: &Map<String, Value>) -> Option<Attachment> {
        if let Some(Value::Object(explicit)) = obj.get("attachment") {
            if let Some(attachment) = self.attachment_from_object(explicit) {
                return Some(attachment);
            }
        }

        let url_style = text_field(obj, &["attachmentUrl", "fileUrl"]).map(|url| {
            let file_name = text_field(obj, &["attachmentFileName", "fileName"])
                .or_else(|| file_name_from_url(&url))
                .unwrap_or_else(|| "attachment".to_string());
            let mime_type = text_field(obj, &["attachmentFileType", "fileType"]);
            let byte_size = size_field(obj, &["attachmentFileSize", "fileSize"]);
            self.build_attachment(file_name, mime_type, byte_size, Some(url))
        });
        if url_style.is_some() {
            return url_style;
        }

        obj.get("media")
            .and_then(Value::as_array)
            .and_then(|media| media.first())
            .and_then(Value::as_object)
            .and_then(|first| self.attachment_from_object(first))
    }

    fn attachment_from_object(&self, obj: &Map<String, Value>) -> Option<Attachment> {
        let url = text_field(obj, &["fileUrl", "url"]);
        let file_name = text_field(obj, &["fileName", "name"])
            .or_else(|| url.as_deref().and_then(file_name_from_url))?;
        let mime_type = text_field(obj, &["fileType", "mimeType", "contentType"]);
        let byte_size = size_field(obj, &["fileSize", "byteSize", "size"]);
        Some(self.build_attachment(file_name, mime_type, byte_size, url))
    }

    fn build_attachment(
        &self,
        file_name: String,
        mime_type: Option<String>,
        byte_size: Option<u64>,
        url: Option<String>,
    ) -> Attachment {
        let is_image = self.policy.is_image(&file_name, mime_type.as_deref());
        Attachment {
            file_name,
            byte_size,
            mime_type,
            is_image,
            url,
        }
    }
}

#[cfg(test)]
#[path = "tests/normalizer_tests.rs"]
mod tests;
