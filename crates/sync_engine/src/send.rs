//! Compose, validate, submit, then merge optimistically.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use shared::domain::{ThreadId, UserId};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    api::{OutgoingMessage, PortalApi},
    attachment::AttachmentPolicy,
    error::{EngineClosed, SendError},
    normalizer::{LocalAttachment, LocalSend, Normalizer},
    store::MergeOutcome,
    types::{AttachmentUpload, Message},
};

pub const DEFAULT_MAX_ATTACHMENT_BYTES: u64 = 10 * 1024 * 1024;

/// What the staff member typed and picked. The pipeline only borrows it, so a
/// failed send leaves it intact for a retry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComposeDraft {
    pub text: String,
    pub attachment: Option<AttachmentUpload>,
}

impl ComposeDraft {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachment: None,
        }
    }

    pub fn with_attachment(mut self, attachment: AttachmentUpload) -> Self {
        self.attachment = Some(attachment);
        self
    }
}

/// Where an accepted send is merged. Implemented by the engine handle.
#[async_trait]
pub trait OptimisticSink: Send + Sync {
    async fn merge_optimistic(
        &self,
        message: Message,
        provisional: bool,
    ) -> Result<MergeOutcome, EngineClosed>;
}

#[derive(Debug, Clone, Copy)]
struct ValidDraft<'a> {
    text: Option<&'a str>,
    attachment: Option<&'a AttachmentUpload>,
}

pub struct SendPipeline {
    api: Arc<dyn PortalApi>,
    normalizer: Normalizer,
    max_attachment_bytes: u64,
    in_flight: Mutex<HashMap<ThreadId, Arc<Mutex<()>>>>,
}

impl SendPipeline {
    pub fn new(api: Arc<dyn PortalApi>, normalizer: Normalizer, max_attachment_bytes: u64) -> Self {
        Self {
            api,
            normalizer,
            max_attachment_bytes,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    fn policy(&self) -> &AttachmentPolicy {
        self.normalizer.policy()
    }

    /// Check a draft without submitting it.
    pub fn validate(&self, draft: &ComposeDraft) -> Result<(), SendError> {
        self.validated(draft).map(|_| ())
    }

    fn validated<'a>(&self, draft: &'a ComposeDraft) -> Result<ValidDraft<'a>, SendError> {
        let text = Some(draft.text.trim()).filter(|text| !text.is_empty());
        let attachment = draft.attachment.as_ref();
        if let Some(upload) = attachment {
            if !self.policy().is_allowed(&upload.file_name) {
                return Err(SendError::UnsupportedAttachment {
                    file_name: upload.file_name.clone(),
                    extension: AttachmentPolicy::extension(&upload.file_name),
                });
            }
            if upload.byte_size() > self.max_attachment_bytes {
                return Err(SendError::AttachmentTooLarge {
                    file_name: upload.file_name.clone(),
                    size: upload.byte_size(),
                    limit: self.max_attachment_bytes,
                });
            }
        }
        if text.is_none() && attachment.is_none() {
            return Err(SendError::EmptyMessage);
        }
        Ok(ValidDraft { text, attachment })
    }

    async fn thread_lock(&self, thread_id: &ThreadId) -> Arc<Mutex<()>> {
        let mut in_flight = self.in_flight.lock().await;
        Arc::clone(in_flight.entry(thread_id.clone()).or_default())
    }

    /// Submit `draft` to `thread_id` and merge the accepted message into the
    /// store through `sink`. Sends to one thread run one at a time.
    pub async fn send(
        &self,
        thread_id: &ThreadId,
        sender_id: &UserId,
        draft: &ComposeDraft,
        sink: &dyn OptimisticSink,
    ) -> Result<Message, SendError> {
        let valid = self.validated(draft)?;
        let lock = self.thread_lock(thread_id).await;
        let _guard = lock.lock().await;

        let response = self
            .api
            .send_message(OutgoingMessage {
                thread_id,
                sender_id,
                text: valid.text,
                attachment: valid.attachment,
            })
            .await
            .inspect_err(|err| warn!(thread_id = %thread_id, "send: message not delivered: {err}"))?;

        let local_attachment = valid.attachment.map(|upload| LocalAttachment {
            file_name: upload.file_name.clone(),
            mime_type: upload.mime_type.clone(),
            byte_size: upload.byte_size(),
        });
        let (message, provisional) = self.normalizer.from_send(&LocalSend {
            thread_id,
            sender_id,
            text: valid.text,
            attachment: local_attachment.as_ref(),
            response: &response,
            sent_at: Utc::now(),
        });

        let outcome = sink.merge_optimistic(message.clone(), provisional).await?;
        info!(
            thread_id = %thread_id,
            message_id = %message.id,
            provisional,
            ?outcome,
            "send: message accepted"
        );
        Ok(message)
    }
}

#[cfg(test)]
#[path = "tests/send_tests.rs"]
mod tests;
