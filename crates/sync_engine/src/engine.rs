//! The single-writer engine loop and its public handle.
//!
//! One task owns the [`ThreadStore`]. It reacts to commands from
//! [`EngineHandle`], to raw frames from the [`ConnectionManager`] and to
//! the ledger sweep timer. REST calls run on the caller's task and hand
//! their results to the loop as commands.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use shared::{
    domain::{ConnectionState, StaffRole, ThreadId, UserId},
    protocol::{PushFrame, ServerEvent, ThreadRecord},
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use crate::{
    api::{PortalApi, RestClient, UserDirectory},
    config::EngineConfig,
    connection::{ConnectionManager, PushTransport, WebSocketTransport},
    error::{EngineClosed, SendError},
    join::{JoinHandler, JoinRpc},
    ledger::DedupLedger,
    normalizer::{parse_utc_timestamp, Normalizer},
    send::{ComposeDraft, OptimisticSink, SendPipeline},
    store::{HydrateReport, MergeOutcome, StoreSnapshot, ThreadStore},
    types::{CounterpartMeta, EngineNotice, HydratedThread, Message, Thread},
};

/// The local staff member the engine runs for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub actor: UserId,
    pub role: StaffRole,
}

impl Identity {
    pub fn new(actor: impl Into<UserId>, role: StaffRole) -> Self {
        Self {
            actor: actor.into(),
            role,
        }
    }
}

/// External collaborators the engine talks to.
pub struct EngineSeams {
    pub api: Arc<dyn PortalApi>,
    pub directory: Arc<dyn UserDirectory>,
    pub transport: Arc<dyn PushTransport>,
}

impl EngineSeams {
    /// REST client plus websocket transport built from `config`.
    pub fn from_config(config: &EngineConfig, actor: &UserId) -> Result<Self> {
        let rest = Arc::new(RestClient::new(&config.server_url, config.request_timeout())?);
        let push_url = config
            .push_endpoint(actor)
            .context("invalid push endpoint")?;
        Ok(Self {
            api: rest.clone(),
            directory: rest,
            transport: Arc::new(WebSocketTransport::new(push_url)),
        })
    }
}

enum EngineCommand {
    BeginHydrate,
    CompleteHydrate {
        batch: Vec<HydratedThread>,
        reply: oneshot::Sender<HydrateReport>,
    },
    AbortHydrate,
    MergeOptimistic {
        message: Message,
        provisional: bool,
        reply: oneshot::Sender<MergeOutcome>,
    },
    MarkRead {
        thread_id: ThreadId,
        reply: oneshot::Sender<bool>,
    },
    MissingMeta {
        reply: oneshot::Sender<Vec<UserId>>,
    },
    SetMeta {
        counterpart: UserId,
        meta: CounterpartMeta,
        reply: oneshot::Sender<bool>,
    },
    Shutdown,
}

struct EngineLoop {
    store: ThreadStore,
    normalizer: Normalizer,
    commands: mpsc::Receiver<EngineCommand>,
    frames: broadcast::Receiver<String>,
    notices: broadcast::Sender<EngineNotice>,
    sweep_interval: Duration,
}

impl EngineLoop {
    async fn run(mut self) {
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep.tick().await;
        let mut frames_open = true;

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(EngineCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                frame = self.frames.recv(), if frames_open => match frame {
                    Ok(frame) => self.handle_frame(&frame),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "push: inbound frames lagged; re-hydrate to recover");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("push: inbound frame stream closed");
                        frames_open = false;
                    }
                },
                _ = sweep.tick() => {
                    let dropped = self.store.sweep_ledger();
                    if dropped > 0 {
                        info!(dropped, "store: dedup ledger swept");
                    }
                }
            }
        }
        debug!("store: engine loop stopped");
    }

    fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::BeginHydrate => self.store.begin_hydrate(),
            EngineCommand::CompleteHydrate { batch, reply } => {
                let _ = reply.send(self.store.hydrate(batch));
            }
            EngineCommand::AbortHydrate => {
                self.store.abort_hydrate();
            }
            EngineCommand::MergeOptimistic {
                message,
                provisional,
                reply,
            } => {
                let _ = reply.send(self.store.merge_optimistic(message, provisional));
            }
            EngineCommand::MarkRead { thread_id, reply } => {
                let _ = reply.send(self.store.mark_read(&thread_id));
            }
            EngineCommand::MissingMeta { reply } => {
                let _ = reply.send(self.store.threads_missing_meta());
            }
            EngineCommand::SetMeta {
                counterpart,
                meta,
                reply,
            } => {
                let _ = reply.send(self.store.set_counterpart_meta(&counterpart, meta));
            }
            EngineCommand::Shutdown => {}
        }
    }

    fn handle_frame(&mut self, raw: &str) {
        let frame: PushFrame = match serde_json::from_str(raw) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("push: undecodable frame dropped: {err}");
                return;
            }
        };
        match frame.into_event() {
            ServerEvent::MessageReceived { payload } => {
                match self.normalizer.from_push(&payload, Utc::now()) {
                    Ok(message) => {
                        let message_id = message.id.clone();
                        let outcome = self.store.merge_live(message);
                        debug!(message_id = %message_id, ?outcome, "store: live merge");
                    }
                    Err(err) => warn!("store: malformed push message dropped: {err}"),
                }
            }
            ServerEvent::Error(error) => {
                warn!(code = ?error.code, "push: server error: {}", error.message);
                let _ = self.notices.send(EngineNotice::ServerError(error));
            }
            ServerEvent::Unknown { kind } => debug!(kind, "push: ignoring frame"),
        }
    }
}

struct EngineInner {
    identity: Identity,
    commands: mpsc::Sender<EngineCommand>,
    snapshots: watch::Receiver<Arc<StoreSnapshot>>,
    notices: broadcast::Sender<EngineNotice>,
    connection: Arc<ConnectionManager>,
    join: JoinHandler,
    pipeline: SendPipeline,
    api: Arc<dyn PortalApi>,
    directory: Arc<dyn UserDirectory>,
    normalizer: Normalizer,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Cheap-to-clone entry point shared by every console.
#[derive(Clone)]
pub struct EngineHandle {
    inner: Arc<EngineInner>,
}

impl EngineHandle {
    /// Spawn the engine loop. Must be called inside a tokio runtime.
    pub fn start(config: &EngineConfig, identity: Identity, seams: EngineSeams) -> Self {
        let normalizer = Normalizer::new(config.attachment_policy());
        let store = ThreadStore::new(
            identity.actor.clone(),
            DedupLedger::new(config.ledger_capacity),
        )
        .with_live_buffer_limit(config.live_buffer_limit);
        let snapshots = store.subscribe();
        let connection = ConnectionManager::new(
            seams.transport,
            config.retry_policy(),
            config.event_buffer,
        );
        let (notices, _) = broadcast::channel(config.event_buffer.max(1));
        let join = JoinHandler::new(
            Arc::clone(&connection) as Arc<dyn JoinRpc>,
            connection.status(),
            config.join_retry_window(),
            notices.clone(),
        );
        let pipeline = SendPipeline::new(
            Arc::clone(&seams.api),
            normalizer.clone(),
            config.max_attachment_bytes,
        );
        let (commands, command_rx) = mpsc::channel(config.command_buffer.max(1));

        let engine_loop = EngineLoop {
            store,
            normalizer: normalizer.clone(),
            commands: command_rx,
            frames: connection.subscribe_frames(),
            notices: notices.clone(),
            sweep_interval: config.ledger_sweep_interval(),
        };
        let loop_task = tokio::spawn(engine_loop.run());

        let mut states = connection.subscribe_states();
        let state_notices = notices.clone();
        let status_task = tokio::spawn(async move {
            loop {
                match states.recv().await {
                    Ok(state) => {
                        let _ = state_notices.send(EngineNotice::ConnectionChanged(state));
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        info!(actor = %identity.actor, role = identity.role.label(), "engine: started");
        Self {
            inner: Arc::new(EngineInner {
                identity,
                commands,
                snapshots,
                notices,
                connection,
                join,
                pipeline,
                api: seams.api,
                directory: seams.directory,
                normalizer,
                tasks: Mutex::new(vec![loop_task, status_task]),
            }),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    pub fn actor(&self) -> &UserId {
        &self.inner.identity.actor
    }

    pub fn role(&self) -> StaffRole {
        self.inner.identity.role
    }

    pub async fn connect(&self) {
        self.inner.connection.connect().await;
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub fn subscribe_connection(&self) -> broadcast::Receiver<ConnectionState> {
        self.inner.connection.subscribe_states()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<EngineNotice> {
        self.inner.notices.subscribe()
    }

    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        self.inner.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<StoreSnapshot>> {
        self.inner.snapshots.clone()
    }

    async fn command(&self, command: EngineCommand) -> Result<(), EngineClosed> {
        self.inner
            .commands
            .send(command)
            .await
            .map_err(|_| EngineClosed)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineCommand,
    ) -> Result<T, EngineClosed> {
        let (reply, response) = oneshot::channel();
        self.command(build(reply)).await?;
        response.await.map_err(|_| EngineClosed)
    }

    /// Fetch the actor's threads over REST and merge them. Live events that
    /// arrive meanwhile are held and replayed after the merge.
    pub async fn hydrate(&self) -> Result<HydrateReport> {
        self.command(EngineCommand::BeginHydrate).await?;
        let records = match self.inner.api.threads_by_user(self.actor()).await {
            Ok(records) => records,
            Err(err) => {
                let _ = self.command(EngineCommand::AbortHydrate).await;
                return Err(err.context("hydrate failed"));
            }
        };
        let batch = self.hydrated_threads(records);
        let report = self
            .request(|reply| EngineCommand::CompleteHydrate { batch, reply })
            .await?;
        self.fill_counterpart_meta().await?;
        Ok(report)
    }

    fn hydrated_threads(&self, records: Vec<ThreadRecord>) -> Vec<HydratedThread> {
        let actor = self.actor();
        records
            .into_iter()
            .filter_map(|record| {
                let thread_id = ThreadId::new(record.id.into_string());
                let consultant = UserId::new(record.consultant_id.into_string());
                let user = UserId::new(record.user_id.into_string());
                let counterpart = if &consultant == actor {
                    user
                } else if &user == actor {
                    consultant
                } else {
                    warn!(thread_id = %thread_id, "hydrate: thread record does not involve the actor; skipping");
                    return None;
                };
                let last_activity = record
                    .updated_at
                    .as_deref()
                    .or(record.created_at.as_deref())
                    .and_then(parse_utc_timestamp);
                let messages = record
                    .messages
                    .iter()
                    .filter_map(|raw| match self.inner.normalizer.from_history(raw, &thread_id) {
                        Ok(message) => Some(message),
                        Err(err) => {
                            warn!(thread_id = %thread_id, "hydrate: malformed message dropped: {err}");
                            None
                        }
                    })
                    .collect();
                Some(HydratedThread {
                    thread_id,
                    counterpart_id: counterpart,
                    last_activity,
                    messages,
                })
            })
            .collect()
    }

    /// Look up directory metadata for every thread still missing it.
    /// Lookup failures are logged and retried on the next hydrate.
    pub async fn fill_counterpart_meta(&self) -> Result<usize, EngineClosed> {
        let missing = self
            .request(|reply| EngineCommand::MissingMeta { reply })
            .await?;
        let directory = &self.inner.directory;
        let lookups = missing.into_iter().map(|counterpart| async move {
            let found = directory.lookup(&counterpart).await;
            (counterpart, found)
        });

        let mut filled = 0;
        for (counterpart, found) in join_all(lookups).await {
            match found {
                Ok(Some(meta)) => {
                    let applied = self
                        .request(|reply| EngineCommand::SetMeta {
                            counterpart,
                            meta,
                            reply,
                        })
                        .await?;
                    if applied {
                        filled += 1;
                    }
                }
                Ok(None) => debug!(counterpart_id = %counterpart, "hydrate: no directory entry"),
                Err(err) => {
                    warn!(counterpart_id = %counterpart, "hydrate: directory lookup failed: {err:#}")
                }
            }
        }
        Ok(filled)
    }

    /// Make `thread_id` the active thread and subscribe it to its server
    /// group. Returns `None` for a thread the store does not hold.
    pub async fn open_thread(&self, thread_id: &ThreadId) -> Option<Thread> {
        let Some(thread) = self.snapshot().thread_by_id(thread_id).cloned() else {
            warn!(thread_id = %thread_id, "engine: cannot open unknown thread");
            return None;
        };
        self.inner.join.select(thread_id.clone()).await;
        Some(thread)
    }

    pub async fn close_thread(&self) {
        self.inner.join.clear().await;
    }

    pub async fn active_thread(&self) -> Option<ThreadId> {
        self.inner.join.active_thread().await
    }

    pub fn validate(&self, draft: &ComposeDraft) -> Result<(), SendError> {
        self.inner.pipeline.validate(draft)
    }

    pub async fn send(&self, thread_id: &ThreadId, draft: &ComposeDraft) -> Result<Message, SendError> {
        if self.snapshot().thread_by_id(thread_id).is_none() {
            return Err(SendError::UnknownThread(thread_id.clone()));
        }
        self.inner
            .pipeline
            .send(thread_id, self.actor(), draft, self)
            .await
    }

    pub async fn mark_read(&self, thread_id: &ThreadId) -> Result<bool, EngineClosed> {
        let thread_id = thread_id.clone();
        self.request(|reply| EngineCommand::MarkRead { thread_id, reply })
            .await
    }

    /// Stop the push channel and the engine loop.
    pub async fn shutdown(&self) {
        self.inner.join.clear().await;
        self.inner.connection.disconnect().await;
        let _ = self.inner.commands.send(EngineCommand::Shutdown).await;
        let tasks = std::mem::take(&mut *self.inner.tasks.lock().await);
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
        info!("engine: stopped");
    }
}

#[async_trait]
impl OptimisticSink for EngineHandle {
    async fn merge_optimistic(
        &self,
        message: Message,
        provisional: bool,
    ) -> Result<MergeOutcome, EngineClosed> {
        self.request(|reply| EngineCommand::MergeOptimistic {
            message,
            provisional,
            reply,
        })
        .await
    }
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
