use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use shared::{
    domain::{ConnectionState, ThreadId},
    protocol::ClientRequest,
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    connection::{ConnectionManager, ConnectionStatus},
    error::ConnectionError,
    types::EngineNotice,
};

pub const DEFAULT_JOIN_RETRY_WINDOW: Duration = Duration::from_secs(10);

#[async_trait]
pub trait JoinRpc: Send + Sync {
    async fn join_thread(&self, thread_id: &ThreadId) -> Result<(), ConnectionError>;
}

#[async_trait]
impl JoinRpc for ConnectionManager {
    async fn join_thread(&self, thread_id: &ThreadId) -> Result<(), ConnectionError> {
        self.invoke(&ClientRequest::JoinThread {
            thread_id: thread_id.clone(),
        })
        .await
    }
}

struct ActiveJoin {
    thread_id: ThreadId,
    task: JoinHandle<()>,
}

/// Keeps the open thread subscribed to its server broadcast group.
pub struct JoinHandler {
    rpc: Arc<dyn JoinRpc>,
    status: ConnectionStatus,
    window: Duration,
    notices: broadcast::Sender<EngineNotice>,
    active: Mutex<Option<ActiveJoin>>,
}

impl JoinHandler {
    pub fn new(
        rpc: Arc<dyn JoinRpc>,
        status: ConnectionStatus,
        window: Duration,
        notices: broadcast::Sender<EngineNotice>,
    ) -> Self {
        Self {
            rpc,
            status,
            window,
            notices,
            active: Mutex::new(None),
        }
    }

    /// Make `thread_id` the active thread, replacing any previous one.
    pub async fn select(&self, thread_id: ThreadId) {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            previous.task.abort();
            debug!(thread_id = %previous.thread_id, "join: released previous thread");
        }

        // Subscribe before spawning so no transition after selection is missed.
        let watcher = JoinWatcher {
            rpc: Arc::clone(&self.rpc),
            transitions: self.status.subscribe(),
            status: self.status.clone(),
            thread_id: thread_id.clone(),
            window: self.window,
            notices: self.notices.clone(),
        };
        let task = tokio::spawn(watcher.run());
        *active = Some(ActiveJoin { thread_id, task });
    }

    pub async fn clear(&self) {
        if let Some(previous) = self.active.lock().await.take() {
            previous.task.abort();
            debug!(thread_id = %previous.thread_id, "join: cleared active thread");
        }
    }

    pub async fn active_thread(&self) -> Option<ThreadId> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|active| active.thread_id.clone())
    }
}

impl Drop for JoinHandler {
    fn drop(&mut self) {
        if let Some(active) = self.active.get_mut().take() {
            active.task.abort();
        }
    }
}

enum Phase {
    /// Not joined yet. `None` once the window ran out and the warning was sent.
    Pending { deadline: Option<Instant> },
    Joined,
}

struct JoinWatcher {
    rpc: Arc<dyn JoinRpc>,
    transitions: broadcast::Receiver<ConnectionState>,
    status: ConnectionStatus,
    thread_id: ThreadId,
    window: Duration,
    notices: broadcast::Sender<EngineNotice>,
}

impl JoinWatcher {
    async fn run(mut self) {
        let mut phase = Phase::Pending {
            deadline: Some(Instant::now() + self.window),
        };
        if self.status.current().is_connected() && self.attempt().await {
            phase = Phase::Joined;
        }

        loop {
            let transition = match phase {
                Phase::Pending {
                    deadline: Some(deadline),
                } => {
                    tokio::select! {
                        transition = self.transitions.recv() => transition,
                        _ = sleep_until(deadline) => {
                            warn!(
                                thread_id = %self.thread_id,
                                window_ms = self.window.as_millis() as u64,
                                "join: thread not joined within retry window"
                            );
                            let _ = self.notices.send(EngineNotice::ConnectivityWarning {
                                thread_id: self.thread_id.clone(),
                            });
                            phase = Phase::Pending { deadline: None };
                            continue;
                        }
                    }
                }
                _ => self.transitions.recv().await,
            };

            let connected = match transition {
                Ok(state) => state.is_connected(),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "join: state stream lagged");
                    self.status.current().is_connected()
                }
                Err(broadcast::error::RecvError::Closed) => return,
            };
            if !connected {
                continue;
            }

            phase = match phase {
                Phase::Pending { deadline: Some(deadline) } => {
                    if self.attempt().await {
                        Phase::Joined
                    } else {
                        Phase::Pending {
                            deadline: Some(deadline),
                        }
                    }
                }
                // A Connected transition re-arms an exhausted window, and a
                // new link needs the group membership again.
                Phase::Pending { deadline: None } | Phase::Joined => {
                    let deadline = Instant::now() + self.window;
                    if self.attempt().await {
                        Phase::Joined
                    } else {
                        Phase::Pending {
                            deadline: Some(deadline),
                        }
                    }
                }
            };
        }
    }

    async fn attempt(&self) -> bool {
        match self.rpc.join_thread(&self.thread_id).await {
            Ok(()) => {
                info!(thread_id = %self.thread_id, "join: joined thread");
                true
            }
            Err(err) => {
                warn!(thread_id = %self.thread_id, "join: join failed: {err}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::connection::StatusPublisher;

    #[derive(Default)]
    struct RecordingRpc {
        calls: std::sync::Mutex<Vec<ThreadId>>,
        fail: AtomicBool,
    }

    impl RecordingRpc {
        fn calls(&self) -> Vec<String> {
            self.calls
                .lock()
                .expect("calls lock")
                .iter()
                .map(|id| id.to_string())
                .collect()
        }
    }

    #[async_trait]
    impl JoinRpc for RecordingRpc {
        async fn join_thread(&self, thread_id: &ThreadId) -> Result<(), ConnectionError> {
            self.calls.lock().expect("calls lock").push(thread_id.clone());
            if self.fail.load(Ordering::SeqCst) {
                Err(ConnectionError::NotConnected)
            } else {
                Ok(())
            }
        }
    }

    struct Harness {
        rpc: Arc<RecordingRpc>,
        publisher: StatusPublisher,
        handler: JoinHandler,
        notices: broadcast::Receiver<EngineNotice>,
    }

    fn harness() -> Harness {
        let rpc = Arc::new(RecordingRpc::default());
        let publisher = StatusPublisher::new(16);
        let (notice_tx, notices) = broadcast::channel(16);
        let handler = JoinHandler::new(
            Arc::clone(&rpc) as Arc<dyn JoinRpc>,
            publisher.status(),
            DEFAULT_JOIN_RETRY_WINDOW,
            notice_tx,
        );
        Harness {
            rpc,
            publisher,
            handler,
            notices,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn drain(rx: &mut broadcast::Receiver<EngineNotice>) -> Vec<EngineNotice> {
        let mut notices = Vec::new();
        while let Ok(notice) = rx.try_recv() {
            notices.push(notice);
        }
        notices
    }

    #[tokio::test(start_paused = true)]
    async fn joins_immediately_when_connected() {
        let mut h = harness();
        h.publisher.set(ConnectionState::Connected);
        h.handler.select(ThreadId::new("t-1")).await;
        settle().await;

        assert_eq!(h.rpc.calls(), ["t-1"]);
        assert_eq!(
            h.handler.active_thread().await,
            Some(ThreadId::new("t-1"))
        );
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(drain(&mut h.notices).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_a_connected_transition() {
        let mut h = harness();
        h.handler.select(ThreadId::new("t-1")).await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(h.rpc.calls().is_empty());

        h.publisher.set(ConnectionState::Connecting);
        settle().await;
        assert!(h.rpc.calls().is_empty());

        h.publisher.set(ConnectionState::Connected);
        settle().await;
        assert_eq!(h.rpc.calls(), ["t-1"]);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(drain(&mut h.notices).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_window_warns_exactly_once() {
        let mut h = harness();
        h.handler.select(ThreadId::new("t-1")).await;
        tokio::time::sleep(Duration::from_secs(45)).await;

        assert_eq!(
            drain(&mut h.notices),
            [EngineNotice::ConnectivityWarning {
                thread_id: ThreadId::new("t-1")
            }]
        );
        assert!(h.rpc.calls().is_empty());

        h.publisher.set(ConnectionState::Reconnecting);
        tokio::time::sleep(Duration::from_secs(45)).await;
        assert!(h.rpc.calls().is_empty());
        assert!(drain(&mut h.notices).is_empty());

        h.publisher.set(ConnectionState::Connected);
        settle().await;
        assert_eq!(h.rpc.calls(), ["t-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn rejoins_after_every_reconnect() {
        let h = harness();
        h.publisher.set(ConnectionState::Connected);
        h.handler.select(ThreadId::new("t-1")).await;
        settle().await;

        for _ in 0..2 {
            h.publisher.set(ConnectionState::Reconnecting);
            settle().await;
            h.publisher.set(ConnectionState::Connected);
            settle().await;
        }
        assert_eq!(h.rpc.calls(), ["t-1", "t-1", "t-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn switching_threads_abandons_the_previous_join() {
        let mut h = harness();
        h.handler.select(ThreadId::new("t-1")).await;
        settle().await;
        h.handler.select(ThreadId::new("t-2")).await;
        settle().await;

        h.publisher.set(ConnectionState::Connected);
        settle().await;
        assert_eq!(h.rpc.calls(), ["t-2"]);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(drain(&mut h.notices).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_join_while_connected_waits_out_the_window() {
        let mut h = harness();
        h.rpc.fail.store(true, Ordering::SeqCst);
        h.publisher.set(ConnectionState::Connected);
        h.handler.select(ThreadId::new("t-1")).await;
        tokio::time::sleep(Duration::from_secs(15)).await;

        assert_eq!(h.rpc.calls(), ["t-1"]);
        assert_eq!(
            drain(&mut h.notices),
            [EngineNotice::ConnectivityWarning {
                thread_id: ThreadId::new("t-1")
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn clear_stops_pending_joins() {
        let mut h = harness();
        h.handler.select(ThreadId::new("t-1")).await;
        h.handler.clear().await;
        assert_eq!(h.handler.active_thread().await, None);

        h.publisher.set(ConnectionState::Connected);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(h.rpc.calls().is_empty());
        assert!(drain(&mut h.notices).is_empty());
    }
}
