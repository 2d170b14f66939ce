use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{ConnectionState, MessageId, ThreadId, UserId},
    error::ApiError,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub file_name: String,
    pub byte_size: Option<u64>,
    pub mime_type: Option<String>,
    pub is_image: bool,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    /// Server thread id when the source carried one; push events often do not.
    pub thread_id: Option<ThreadId>,
    pub sender_id: UserId,
    /// Only used to resolve the thread of self-authored push events.
    pub receiver_id: Option<UserId>,
    pub text: Option<String>,
    pub attachment: Option<Attachment>,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
}

impl Message {
    /// Counterpart of this message from the point of view of `actor`.
    pub fn counterpart_for(&self, actor: &UserId) -> Option<&UserId> {
        if &self.sender_id == actor {
            self.receiver_id.as_ref()
        } else {
            Some(&self.sender_id)
        }
    }

    pub(crate) fn attachment_name(&self) -> Option<&str> {
        self.attachment.as_ref().map(|a| a.file_name.as_str())
    }
}

/// One server thread record after normalization, ready for a hydrate merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HydratedThread {
    pub thread_id: ThreadId,
    pub counterpart_id: UserId,
    pub last_activity: Option<DateTime<Utc>>,
    pub messages: Vec<Message>,
}

/// Participant display metadata, fetched once per counterpart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterpartMeta {
    pub display_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thread {
    pub id: ThreadId,
    counterpart_id: UserId,
    pub counterpart_meta: Option<CounterpartMeta>,
    pub messages: Vec<Message>,
    pub last_activity: DateTime<Utc>,
    pub unread_count: u32,
    message_ids: HashSet<MessageId>,
}

impl Thread {
    pub(crate) fn new(id: ThreadId, counterpart_id: UserId, last_activity: DateTime<Utc>) -> Self {
        Self {
            id,
            counterpart_id,
            counterpart_meta: None,
            messages: Vec::new(),
            last_activity,
            unread_count: 0,
            message_ids: HashSet::new(),
        }
    }

    pub fn counterpart_id(&self) -> &UserId {
        &self.counterpart_id
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.message_ids.contains(id)
    }

    /// Display label for the counterpart, falling back to their id.
    pub fn title(&self) -> &str {
        self.counterpart_meta
            .as_ref()
            .map(|meta| meta.display_name.as_str())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| self.counterpart_id.as_str())
    }

    /// Insert keeping `created_at` order; equal timestamps keep arrival order.
    pub(crate) fn insert_ordered(&mut self, message: Message) -> usize {
        let index = self
            .messages
            .partition_point(|existing| existing.created_at <= message.created_at);
        if message.created_at > self.last_activity {
            self.last_activity = message.created_at;
        }
        self.message_ids.insert(message.id.clone());
        self.messages.insert(index, message);
        self.recount_unread();
        index
    }

    pub(crate) fn remove_message(&mut self, index: usize) -> Message {
        let message = self.messages.remove(index);
        self.message_ids.remove(&message.id);
        message
    }

    pub(crate) fn recount_unread(&mut self) {
        let counterpart = &self.counterpart_id;
        self.unread_count = self
            .messages
            .iter()
            .filter(|m| &m.sender_id == counterpart && !m.is_read)
            .count() as u32;
    }
}

/// Out-of-band signals for the console, alongside snapshot updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineNotice {
    ConnectionChanged(ConnectionState),
    /// The active thread could not be joined within the retry window.
    ConnectivityWarning { thread_id: ThreadId },
    /// An `error` frame pushed by the server.
    ServerError(ApiError),
}

/// File picked for an outgoing message. Bytes are only held for the upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentUpload {
    pub file_name: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl AttachmentUpload {
    pub fn byte_size(&self) -> u64 {
        self.bytes.len() as u64
    }
}
