//! Push-channel lifecycle.
//!
//! [`ConnectionManager`] owns the single logical connection. It publishes
//! every state transition and every raw inbound frame on broadcast channels
//! and never looks inside a frame.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{stream::BoxStream, SinkExt, StreamExt};
use shared::{
    domain::{ConnectionState, UserId},
    protocol::ClientRequest,
};
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};
use url::Url;

use crate::{error::ConnectionError, retry::RetryPolicy};

const OUTBOUND_BUFFER: usize = 64;

/// One live transport link: inbound text frames plus a sender for outbound frames.
pub struct PushLink {
    pub inbound: BoxStream<'static, Result<String, ConnectionError>>,
    pub outbound: mpsc::Sender<String>,
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn open(&self) -> Result<PushLink, ConnectionError>;
}

/// Build the websocket endpoint for `actor`. `http(s)` schemes are mapped to
/// `ws(s)`; `append_ws_path` adds the `/ws` route used when only the REST
/// base url is configured.
pub fn websocket_url(
    base: &str,
    actor: &UserId,
    append_ws_path: bool,
) -> Result<Url, ConnectionError> {
    let mut url = Url::parse(base.trim()).map_err(|_| ConnectionError::InvalidUrl(base.into()))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        _ => return Err(ConnectionError::InvalidUrl(base.into())),
    };
    url.set_scheme(scheme)
        .map_err(|_| ConnectionError::InvalidUrl(base.into()))?;
    if append_ws_path {
        let path = format!("{}/ws", url.path().trim_end_matches('/'));
        url.set_path(&path);
    }
    url.query_pairs_mut().append_pair("user_id", actor.as_str());
    Ok(url)
}

pub struct WebSocketTransport {
    url: Url,
}

impl WebSocketTransport {
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl PushTransport for WebSocketTransport {
    async fn open(&self) -> Result<PushLink, ConnectionError> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|err| ConnectionError::Transport(format!("connect {}: {err}", self.url)))?;
        let (mut ws_writer, ws_reader) = ws_stream.split();

        let (outbound, mut outbound_rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(err) = ws_writer.send(WsMessage::Text(frame)).await {
                    debug!("push: websocket write failed: {err}");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let inbound = ws_reader
            .take_while(|msg| futures::future::ready(!matches!(msg, Ok(WsMessage::Close(_)))))
            .filter_map(|msg| async move {
                match msg {
                    Ok(WsMessage::Text(text)) => Some(Ok(text)),
                    Ok(WsMessage::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => Some(Ok(text)),
                        Err(_) => {
                            debug!("push: ignoring non-utf8 binary frame");
                            None
                        }
                    },
                    Ok(_) => None,
                    Err(err) => Some(Err(ConnectionError::Transport(format!(
                        "websocket receive failed: {err}"
                    )))),
                }
            })
            .boxed();

        Ok(PushLink { inbound, outbound })
    }
}

/// Read side of the connection state: the current value plus a transition
/// stream that every subscriber sees in the same order.
#[derive(Clone)]
pub struct ConnectionStatus {
    current: watch::Receiver<ConnectionState>,
    transitions: broadcast::Sender<ConnectionState>,
}

impl ConnectionStatus {
    pub fn current(&self) -> ConnectionState {
        *self.current.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionState> {
        self.transitions.subscribe()
    }
}

/// Write side of [`ConnectionStatus`].
pub struct StatusPublisher {
    current: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<ConnectionState>,
}

impl StatusPublisher {
    pub fn new(buffer: usize) -> Self {
        let (current, _) = watch::channel(ConnectionState::Disconnected);
        let (transitions, _) = broadcast::channel(buffer.max(1));
        Self {
            current,
            transitions,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            current: self.current.subscribe(),
            transitions: self.transitions.clone(),
        }
    }

    /// Publish `state` if it differs from the current one.
    pub fn set(&self, state: ConnectionState) -> bool {
        let previous = self.current.send_replace(state);
        if previous == state {
            return false;
        }
        debug!(from = %previous, to = %state, "push: state transition");
        let _ = self.transitions.send(state);
        true
    }
}

enum LinkEnd {
    Shutdown,
    Lost,
}

struct RunningChannel {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct ConnectionManager {
    transport: Arc<dyn PushTransport>,
    retry: RetryPolicy,
    status: StatusPublisher,
    frames: broadcast::Sender<String>,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    running: Mutex<Option<RunningChannel>>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn PushTransport>,
        retry: RetryPolicy,
        event_buffer: usize,
    ) -> Arc<Self> {
        let (frames, _) = broadcast::channel(event_buffer.max(1));
        Arc::new(Self {
            transport,
            retry,
            status: StatusPublisher::new(event_buffer),
            frames,
            outbound: Mutex::new(None),
            running: Mutex::new(None),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.status.current.borrow()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.status()
    }

    pub fn subscribe_states(&self) -> broadcast::Receiver<ConnectionState> {
        self.status.transitions.subscribe()
    }

    pub fn subscribe_frames(&self) -> broadcast::Receiver<String> {
        self.frames.subscribe()
    }

    /// Start the channel task. A second call while running does nothing.
    pub async fn connect(self: &Arc<Self>) {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|run| !run.task.is_finished()) {
            return;
        }
        let (shutdown, shutdown_rx) = watch::channel(false);
        let manager = Arc::clone(self);
        let task = tokio::spawn(async move { manager.run(shutdown_rx).await });
        *running = Some(RunningChannel { shutdown, task });
    }

    /// Stop retrying, drop the link and settle in `Disconnected`.
    pub async fn disconnect(&self) {
        let running = self.running.lock().await.take();
        if let Some(run) = running {
            let _ = run.shutdown.send(true);
            let _ = run.task.await;
        }
        *self.outbound.lock().await = None;
        self.status.set(ConnectionState::Disconnected);
    }

    /// Write one RPC frame on the live link.
    pub async fn invoke(&self, request: &ClientRequest) -> Result<(), ConnectionError> {
        let frame = serde_json::to_string(request)
            .map_err(|err| ConnectionError::Transport(format!("encode request: {err}")))?;
        let sender = self
            .outbound
            .lock()
            .await
            .clone()
            .ok_or(ConnectionError::NotConnected)?;
        sender
            .send(frame)
            .await
            .map_err(|_| ConnectionError::NotConnected)
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut attempt: u32 = 0;
        self.status.set(ConnectionState::Connecting);
        loop {
            let opened = tokio::select! {
                _ = shutdown.changed() => break,
                opened = self.transport.open() => opened,
            };

            match opened {
                Ok(link) => {
                    attempt = 0;
                    *self.outbound.lock().await = Some(link.outbound.clone());
                    self.status.set(ConnectionState::Connected);
                    info!("push: connected");
                    let end = self.pump(link.inbound, &mut shutdown).await;
                    *self.outbound.lock().await = None;
                    if let LinkEnd::Shutdown = end {
                        break;
                    }
                    warn!("push: link lost");
                }
                Err(err) => {
                    warn!(attempt, "push: connect failed: {err}");
                }
            }

            self.status.set(ConnectionState::Reconnecting);
            let delay = self.retry.delay_for_attempt(attempt);
            attempt = attempt.saturating_add(1);
            info!(attempt, delay_ms = delay.as_millis() as u64, "push: reconnect scheduled");
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        *self.outbound.lock().await = None;
        self.status.set(ConnectionState::Disconnected);
        info!("push: disconnected");
    }

    async fn pump(
        &self,
        mut inbound: BoxStream<'static, Result<String, ConnectionError>>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> LinkEnd {
        loop {
            tokio::select! {
                _ = shutdown.changed() => return LinkEnd::Shutdown,
                next = inbound.next() => match next {
                    Some(Ok(frame)) => {
                        let _ = self.frames.send(frame);
                    }
                    Some(Err(err)) => {
                        warn!("push: {err}");
                        return LinkEnd::Lost;
                    }
                    None => return LinkEnd::Lost,
                },
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
