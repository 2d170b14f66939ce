use super::*;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
};

use futures::StreamExt;
use serde_json::{json, Value};
use shared::{
    error::{ApiError, ErrorCode},
    protocol::SendMessageResponse,
};
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    api::OutgoingMessage,
    connection::PushLink,
    error::ConnectionError,
    normalizer::TEMP_ID_PREFIX,
};

const ACTOR: &str = "consultant-1";
const MOTHER: &str = "mother-1";

struct FakePortal {
    history: Vec<Value>,
    send_reply: SendMessageResponse,
    fail_hydrate: AtomicBool,
}

impl FakePortal {
    fn new(history: Vec<Value>) -> Self {
        Self {
            history,
            send_reply: SendMessageResponse::default(),
            fail_hydrate: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl PortalApi for FakePortal {
    async fn threads_by_user(&self, user_id: &UserId) -> Result<Vec<ThreadRecord>> {
        if self.fail_hydrate.load(Ordering::SeqCst) {
            anyhow::bail!("portal unavailable");
        }
        let record = serde_json::from_value(json!({
            "id": "t-1",
            "consultantId": user_id.as_str(),
            "userId": MOTHER,
            "updatedAt": "2024-03-01T09:00:00Z",
            "messages": self.history,
        }))?;
        Ok(vec![record])
    }

    async fn send_message(
        &self,
        _message: OutgoingMessage<'_>,
    ) -> std::result::Result<SendMessageResponse, SendError> {
        Ok(self.send_reply.clone())
    }
}

#[derive(Default)]
struct FakeDirectory {
    entries: HashMap<String, CounterpartMeta>,
}

#[async_trait]
impl UserDirectory for FakeDirectory {
    async fn lookup(&self, user_id: &UserId) -> Result<Option<CounterpartMeta>> {
        Ok(self.entries.get(user_id.as_str()).cloned())
    }
}

/// Hands out one link, then never opens again.
struct OneLinkTransport {
    link: std::sync::Mutex<Option<PushLink>>,
}

#[async_trait]
impl PushTransport for OneLinkTransport {
    async fn open(&self) -> std::result::Result<PushLink, ConnectionError> {
        let link = self.link.lock().expect("link lock").take();
        match link {
            Some(link) => Ok(link),
            None => std::future::pending().await,
        }
    }
}

struct Remote {
    inbound: mpsc::Sender<std::result::Result<String, ConnectionError>>,
    outbound: mpsc::Receiver<String>,
}

impl Remote {
    async fn push(&self, frame: Value) {
        self.push_raw(frame.to_string()).await;
    }

    async fn push_raw(&self, raw: String) {
        self.inbound.send(Ok(raw)).await.expect("push frame");
    }
}

fn history_entry(id: &str, sender: &str, text: &str, time: &str) -> Value {
    json!({
        "id": id,
        "senderId": sender,
        "messageText": text,
        "createdAt": format!("2024-03-01T{time}Z"),
    })
}

fn receive(payload: Value) -> Value {
    json!({ "type": "receive_message", "payload": payload })
}

fn start_engine(portal: FakePortal, directory: FakeDirectory) -> (EngineHandle, Remote) {
    let (inbound_tx, inbound_rx) = mpsc::channel(16);
    let (outbound_tx, outbound_rx) = mpsc::channel(16);
    let link = PushLink {
        inbound: ReceiverStream::new(inbound_rx).boxed(),
        outbound: outbound_tx,
    };
    let seams = EngineSeams {
        api: Arc::new(portal),
        directory: Arc::new(directory),
        transport: Arc::new(OneLinkTransport {
            link: std::sync::Mutex::new(Some(link)),
        }),
    };
    let engine = EngineHandle::start(
        &EngineConfig::default(),
        Identity::new(ACTOR, StaffRole::ClinicConsultant),
        seams,
    );
    (
        engine,
        Remote {
            inbound: inbound_tx,
            outbound: outbound_rx,
        },
    )
}

async fn connected(engine: &EngineHandle) {
    let mut states = engine.subscribe_connection();
    engine.connect().await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while engine.connection_state() != ConnectionState::Connected {
            let _ = states.recv().await;
        }
    })
    .await
    .expect("connected in time");
}

async fn wait_for(
    engine: &EngineHandle,
    condition: impl Fn(&StoreSnapshot) -> bool,
) -> Arc<StoreSnapshot> {
    let mut snapshots = engine.subscribe();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let snapshot = snapshots.borrow_and_update().clone();
            if condition(&snapshot) {
                return snapshot;
            }
            snapshots.changed().await.expect("engine running");
        }
    })
    .await
    .expect("condition in time")
}

fn ids(snapshot: &StoreSnapshot) -> Vec<String> {
    snapshot
        .thread_by_id(&ThreadId::new("t-1"))
        .map(|thread| thread.messages.iter().map(|m| m.id.to_string()).collect())
        .unwrap_or_default()
}

#[tokio::test(start_paused = true)]
async fn live_event_before_hydrate_is_replayed_in_order() {
    let portal = FakePortal::new(vec![
        history_entry("m1", MOTHER, "first", "10:00:00"),
        history_entry("m3", MOTHER, "third", "10:00:02"),
    ]);
    let (engine, remote) = start_engine(portal, FakeDirectory::default());
    connected(&engine).await;

    remote
        .push(receive(history_entry("m2", MOTHER, "second", "10:00:01")))
        .await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!engine.snapshot().hydrated);

    let report = engine.hydrate().await.expect("hydrate");
    assert_eq!(report.messages_merged, 2);
    assert_eq!(report.replayed, 1);
    assert_eq!(ids(&engine.snapshot()), ["m1", "m2", "m3"]);

    remote
        .push(receive(history_entry("m2", MOTHER, "second", "10:00:01")))
        .await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(ids(&engine.snapshot()), ["m1", "m2", "m3"]);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn optimistic_send_is_superseded_by_its_echo() {
    let portal = FakePortal::new(vec![history_entry("m1", MOTHER, "first", "10:00:00")]);
    let (engine, remote) = start_engine(portal, FakeDirectory::default());
    connected(&engine).await;
    engine.hydrate().await.expect("hydrate");

    let thread_id = ThreadId::new("t-1");
    let sent = engine
        .send(&thread_id, &ComposeDraft::text("hello"))
        .await
        .expect("send");
    assert!(sent.id.as_str().starts_with(TEMP_ID_PREFIX));
    assert_eq!(ids(&engine.snapshot()), ["m1", sent.id.as_str()]);

    remote
        .push(receive(json!({
            "id": 42,
            "senderId": ACTOR,
            "receiverId": MOTHER,
            "messageText": "hello",
            "createdAt": "2024-03-01T10:05:00Z",
        })))
        .await;
    let snapshot = wait_for(&engine, |snapshot| ids(snapshot).contains(&"42".to_string())).await;

    assert_eq!(ids(&snapshot), ["m1", "42"]);
    let thread = snapshot.thread_by_id(&thread_id).expect("thread");
    let hellos = thread
        .messages
        .iter()
        .filter(|m| m.text.as_deref() == Some("hello"))
        .count();
    assert_eq!(hellos, 1);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn opening_a_thread_joins_its_group() {
    let (engine, mut remote) = start_engine(FakePortal::new(Vec::new()), FakeDirectory::default());
    connected(&engine).await;
    engine.hydrate().await.expect("hydrate");

    assert!(engine.open_thread(&ThreadId::new("t-404")).await.is_none());
    let thread = engine
        .open_thread(&ThreadId::new("t-1"))
        .await
        .expect("thread");
    assert_eq!(thread.counterpart_id().as_str(), MOTHER);

    let frame = tokio::time::timeout(Duration::from_secs(5), remote.outbound.recv())
        .await
        .expect("join in time")
        .expect("join frame");
    let value: Value = serde_json::from_str(&frame).expect("json");
    assert_eq!(value, json!({ "type": "join_thread", "payload": { "threadId": "t-1" } }));
    assert_eq!(engine.active_thread().await, Some(ThreadId::new("t-1")));

    engine.close_thread().await;
    assert_eq!(engine.active_thread().await, None);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn connection_changes_and_server_errors_become_notices() {
    let (engine, remote) = start_engine(FakePortal::new(Vec::new()), FakeDirectory::default());
    let mut notices = engine.subscribe_notices();
    connected(&engine).await;

    assert_eq!(
        notices.recv().await.expect("notice"),
        EngineNotice::ConnectionChanged(ConnectionState::Connecting)
    );
    assert_eq!(
        notices.recv().await.expect("notice"),
        EngineNotice::ConnectionChanged(ConnectionState::Connected)
    );

    remote
        .push(json!({ "type": "error", "payload": { "code": "forbidden", "message": "not your thread" } }))
        .await;
    assert_eq!(
        notices.recv().await.expect("notice"),
        EngineNotice::ServerError(ApiError::new(ErrorCode::Forbidden, "not your thread"))
    );
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn hydrate_fills_counterpart_metadata() {
    let mut directory = FakeDirectory::default();
    directory.entries.insert(
        MOTHER.into(),
        CounterpartMeta {
            display_name: "Amina Said".into(),
            email: None,
            phone: Some("+254700000000".into()),
        },
    );
    let (engine, _remote) = start_engine(FakePortal::new(Vec::new()), directory);
    engine.hydrate().await.expect("hydrate");

    let snapshot = engine.snapshot();
    let thread = snapshot.thread(&UserId::new(MOTHER)).expect("thread");
    assert_eq!(thread.title(), "Amina Said");
    assert_eq!(engine.fill_counterpart_meta().await.expect("fill"), 0);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn malformed_frames_do_not_stop_the_engine() {
    let (engine, remote) = start_engine(FakePortal::new(Vec::new()), FakeDirectory::default());
    connected(&engine).await;
    engine.hydrate().await.expect("hydrate");

    remote.push_raw("not json".into()).await;
    remote
        .push(receive(json!({ "senderId": MOTHER, "messageText": "no id" })))
        .await;
    remote.push(json!({ "type": "typing", "payload": {} })).await;
    remote
        .push(receive(history_entry("m9", MOTHER, "still here", "10:00:09")))
        .await;

    let snapshot = wait_for(&engine, |snapshot| !ids(snapshot).is_empty()).await;
    assert_eq!(ids(&snapshot), ["m9"]);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn mark_read_clears_unread_counterpart_messages() {
    let portal = FakePortal::new(vec![
        history_entry("m1", MOTHER, "first", "10:00:00"),
        history_entry("m2", MOTHER, "second", "10:00:01"),
        history_entry("o1", ACTOR, "reply", "10:00:02"),
    ]);
    let (engine, _remote) = start_engine(portal, FakeDirectory::default());
    engine.hydrate().await.expect("hydrate");
    assert_eq!(engine.snapshot().total_unread(), 2);

    assert!(engine.mark_read(&ThreadId::new("t-1")).await.expect("mark read"));
    assert_eq!(engine.snapshot().total_unread(), 0);
    assert!(!engine.mark_read(&ThreadId::new("t-1")).await.expect("mark read"));
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn send_to_unknown_thread_is_rejected() {
    let (engine, _remote) = start_engine(FakePortal::new(Vec::new()), FakeDirectory::default());
    engine.hydrate().await.expect("hydrate");

    let err = engine
        .send(&ThreadId::new("t-404"), &ComposeDraft::text("hello"))
        .await
        .expect_err("unknown thread");
    assert!(matches!(err, SendError::UnknownThread(_)));
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_hydrate_is_reported_and_can_be_retried() {
    let portal = FakePortal::new(vec![history_entry("m1", MOTHER, "first", "10:00:00")]);
    portal.fail_hydrate.store(true, Ordering::SeqCst);
    let portal = Arc::new(portal);
    let (inbound_tx, inbound_rx) = mpsc::channel(16);
    let (outbound_tx, _outbound_rx) = mpsc::channel(16);
    let engine = EngineHandle::start(
        &EngineConfig::default(),
        Identity::new(ACTOR, StaffRole::HealthExpert),
        EngineSeams {
            api: Arc::clone(&portal) as Arc<dyn PortalApi>,
            directory: Arc::new(FakeDirectory::default()),
            transport: Arc::new(OneLinkTransport {
                link: std::sync::Mutex::new(Some(PushLink {
                    inbound: ReceiverStream::new(inbound_rx).boxed(),
                    outbound: outbound_tx,
                })),
            }),
        },
    );
    connected(&engine).await;

    let err = engine.hydrate().await.expect_err("portal down");
    assert!(format!("{err:#}").contains("portal unavailable"));

    inbound_tx
        .send(Ok(receive(history_entry("m2", MOTHER, "second", "10:00:01")).to_string()))
        .await
        .expect("push");
    tokio::time::sleep(Duration::from_millis(10)).await;

    portal.fail_hydrate.store(false, Ordering::SeqCst);
    engine.hydrate().await.expect("hydrate");
    assert_eq!(ids(&engine.snapshot()), ["m1", "m2"]);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn commands_after_shutdown_report_engine_closed() {
    let (engine, _remote) = start_engine(FakePortal::new(Vec::new()), FakeDirectory::default());
    engine.hydrate().await.expect("hydrate");
    engine.shutdown().await;

    assert_eq!(engine.connection_state(), ConnectionState::Disconnected);
    assert!(engine.mark_read(&ThreadId::new("t-1")).await.is_err());
}
