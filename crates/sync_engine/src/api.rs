//! REST plumbing for the portal API.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{
    multipart::{Form, Part},
    Client, StatusCode,
};
use shared::{
    domain::{ThreadId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{SendMessageResponse, ThreadRecord, UserProfile},
};
use tracing::debug;

use crate::{
    error::SendError,
    types::{AttachmentUpload, CounterpartMeta},
};

/// A validated send, ready for `POST /messages`.
#[derive(Debug, Clone, Copy)]
pub struct OutgoingMessage<'a> {
    pub thread_id: &'a ThreadId,
    pub sender_id: &'a UserId,
    pub text: Option<&'a str>,
    pub attachment: Option<&'a AttachmentUpload>,
}

#[async_trait]
pub trait PortalApi: Send + Sync {
    async fn threads_by_user(&self, user_id: &UserId) -> Result<Vec<ThreadRecord>>;
    async fn send_message(
        &self,
        message: OutgoingMessage<'_>,
    ) -> std::result::Result<SendMessageResponse, SendError>;
}

/// Participant metadata lookup. `Ok(None)` means the directory has no entry.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn lookup(&self, user_id: &UserId) -> Result<Option<CounterpartMeta>>;
}

pub fn counterpart_meta(profile: UserProfile) -> CounterpartMeta {
    let non_blank = |value: Option<String>| value.filter(|v| !v.trim().is_empty());
    let display_name = non_blank(profile.full_name)
        .or_else(|| non_blank(profile.user_name))
        .unwrap_or_else(|| profile.id.to_string());
    CounterpartMeta {
        display_name,
        email: non_blank(profile.email),
        phone: non_blank(profile.phone_number),
    }
}

#[derive(Clone)]
pub struct RestClient {
    http: Client,
    server_url: String,
}

impl RestClient {
    pub fn new(server_url: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self::with_client(http, server_url))
    }

    pub fn with_client(http: Client, server_url: &str) -> Self {
        Self {
            http,
            server_url: server_url.trim().trim_end_matches('/').to_string(),
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    fn message_form(message: OutgoingMessage<'_>) -> Form {
        let mut form = Form::new()
            .text("ChatThreadId", message.thread_id.to_string())
            .text("SenderId", message.sender_id.to_string());
        if let Some(text) = message.text {
            form = form.text("MessageText", text.to_string());
        }
        if let Some(upload) = message.attachment {
            let part = Part::bytes(upload.bytes.clone()).file_name(upload.file_name.clone());
            let part = match upload.mime_type.as_deref() {
                Some(mime) => match part.mime_str(mime) {
                    Ok(part) => part,
                    Err(_) => Part::bytes(upload.bytes.clone()).file_name(upload.file_name.clone()),
                },
                None => part,
            };
            form = form
                .part("Attachments", part)
                .text("AttachmentFileName", upload.file_name.clone())
                .text("AttachmentFileSize", upload.byte_size().to_string());
            if let Some(mime) = &upload.mime_type {
                form = form.text("AttachmentFileType", mime.clone());
            }
        }
        form
    }
}

fn rejection(status: StatusCode, body: &str) -> SendError {
    match serde_json::from_str::<ApiError>(body) {
        Ok(api_error) => SendError::Rejected {
            status: status.as_u16(),
            code: api_error.code,
            message: api_error.message,
        },
        Err(_) => SendError::Rejected {
            status: status.as_u16(),
            code: ErrorCode::from_status(status.as_u16()),
            message: if body.trim().is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            } else {
                body.trim().to_string()
            },
        },
    }
}

#[async_trait]
impl PortalApi for RestClient {
    async fn threads_by_user(&self, user_id: &UserId) -> Result<Vec<ThreadRecord>> {
        let server_url = &self.server_url;
        let records: Vec<ThreadRecord> = self
            .http
            .get(format!("{server_url}/threads-by-user/{user_id}"))
            .send()
            .await
            .with_context(|| format!("failed to fetch threads for {user_id}"))?
            .error_for_status()?
            .json()
            .await
            .context("invalid thread list from server")?;
        debug!(user_id = %user_id, threads = records.len(), "hydrate: fetched thread records");
        Ok(records)
    }

    async fn send_message(
        &self,
        message: OutgoingMessage<'_>,
    ) -> std::result::Result<SendMessageResponse, SendError> {
        let server_url = &self.server_url;
        let response = self
            .http
            .post(format!("{server_url}/messages"))
            .multipart(Self::message_form(message))
            .send()
            .await
            .map_err(|err| SendError::Transport(err.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| SendError::Transport(err.to_string()))?;
        if !status.is_success() {
            return Err(rejection(status, &body));
        }
        if body.trim().is_empty() {
            return Ok(SendMessageResponse::default());
        }
        serde_json::from_str(&body)
            .map_err(|err| SendError::Transport(format!("invalid send response: {err}")))
    }
}

#[async_trait]
impl UserDirectory for RestClient {
    async fn lookup(&self, user_id: &UserId) -> Result<Option<CounterpartMeta>> {
        let server_url = &self.server_url;
        let response = self
            .http
            .get(format!("{server_url}/users/{user_id}"))
            .send()
            .await
            .with_context(|| format!("failed to look up user {user_id}"))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let profile: UserProfile = response
            .error_for_status()?
            .json()
            .await
            .context("invalid user profile from server")?;
        Ok(Some(counterpart_meta(profile)))
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
