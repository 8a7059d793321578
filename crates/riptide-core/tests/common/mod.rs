//! Shared harness for the integration tests: a JSON codec, a counter view
//! whose behavior the tests can steer, and helpers to stand up a manager
//! and connect in-memory clients to it.

// each test binary uses a different slice of this module
#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{json, Value};

use riptide_core::config::EngineConfig;
use riptide_core::frame::{
    ErrorFrame, EventFrame, FrameCodec, HandshakeRequest, InboundFrame, OutboundFrame,
    ProtocolError,
};
use riptide_core::manager::{ConnectRequest, Connected, CreateParams, ResumeClaim, SessionManager};
use riptide_core::session::EventContext;
use riptide_core::store::{MemorySessionStore, SessionStore};
use riptide_core::transport::{pair, DuplexTransport, Transport};
use riptide_core::view::{RootView, ViewError, ViewFactory};

/// Counter view: each handled event bumps a counter, mirrors it into the
/// session kv store and requests a render. Renders report the counter and
/// whether the frame is a full document.
pub struct TestView {
    count: AtomicU64,
    dirty: AtomicBool,
    full_next: AtomicBool,
    resyncs: AtomicUsize,
    disposed: AtomicUsize,
    memory: AtomicUsize,
    panic_on: Mutex<Option<String>>,
}

impl TestView {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            count: AtomicU64::new(0),
            // first render is the initial full document
            dirty: AtomicBool::new(true),
            full_next: AtomicBool::new(true),
            resyncs: AtomicUsize::new(0),
            disposed: AtomicUsize::new(0),
            memory: AtomicUsize::new(0),
            panic_on: Mutex::new(None),
        })
    }

    pub fn panic_on(&self, name: &str) {
        *self.panic_on.lock() = Some(name.to_string());
    }

    pub fn set_memory(&self, bytes: usize) {
        self.memory.store(bytes, Ordering::Release);
    }

    pub fn resyncs(&self) -> usize {
        self.resyncs.load(Ordering::Acquire)
    }

    pub fn disposed(&self) -> usize {
        self.disposed.load(Ordering::Acquire)
    }
}

impl RootView for TestView {
    fn handle_event(&self, event: &EventFrame, ctx: &EventContext<'_>) -> Result<(), ViewError> {
        if self.panic_on.lock().as_deref() == Some(event.name.as_str()) {
            panic!("handler exploded on {}", event.name);
        }
        let count = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        ctx.put("events_handled", json!(count));
        self.dirty.store(true, Ordering::Release);
        ctx.request_render();
        Ok(())
    }

    fn render(&self) -> Result<Option<Bytes>, ViewError> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(None);
        }
        let body = json!({
            "count": self.count.load(Ordering::Acquire),
            "full": self.full_next.swap(false, Ordering::AcqRel),
        });
        Ok(Some(Bytes::from(serde_json::to_vec(&body).unwrap())))
    }

    fn resync(&self) {
        self.resyncs.fetch_add(1, Ordering::AcqRel);
        self.full_next.store(true, Ordering::Release);
        self.dirty.store(true, Ordering::Release);
    }

    fn memory_usage(&self) -> usize {
        self.memory.load(Ordering::Acquire)
    }

    fn dispose(&self) {
        self.disposed.fetch_add(1, Ordering::AcqRel);
    }
}

/// Factory that remembers every view it built so tests can reach them.
#[derive(Default)]
pub struct TestViews {
    views: Mutex<Vec<Arc<TestView>>>,
}

impl TestViews {
    pub fn created(&self) -> Vec<Arc<TestView>> {
        self.views.lock().clone()
    }

    pub fn last(&self) -> Arc<TestView> {
        self.views.lock().last().expect("no view built yet").clone()
    }
}

impl ViewFactory for TestViews {
    fn create(&self, _route: &str) -> Result<Arc<dyn RootView>, ViewError> {
        let view = TestView::new();
        self.views.lock().push(view.clone());
        Ok(view)
    }
}

/// Tagged-JSON wire format, the same shape the gateway speaks.
pub struct TestCodec;

impl FrameCodec for TestCodec {
    fn encode(&self, frame: &OutboundFrame) -> Bytes {
        let value = match frame {
            OutboundFrame::HandshakeAck { session_id, base_seq, resumed, replayed } => json!({
                "type": "handshake_ack",
                "session_id": session_id,
                "base_seq": base_seq,
                "resumed": resumed,
                "replayed": replayed,
            }),
            OutboundFrame::Patch { seq, payload } => {
                let body: Value = serde_json::from_slice(payload).unwrap_or(Value::Null);
                json!({ "type": "patch", "seq": seq, "payload": body })
            }
            OutboundFrame::Error(ErrorFrame { code, message }) => json!({
                "type": "error",
                "code": code,
                "message": message,
            }),
            OutboundFrame::Pong => json!({ "type": "pong" }),
        };
        Bytes::from(serde_json::to_vec(&value).unwrap())
    }

    fn decode(&self, bytes: &[u8]) -> Result<InboundFrame, ProtocolError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|err| ProtocolError::malformed("envelope", err.to_string()))?;
        match value.get("type").and_then(Value::as_str) {
            Some("handshake") => serde_json::from_value::<HandshakeRequest>(value)
                .map(InboundFrame::Handshake)
                .map_err(|err| ProtocolError::malformed("handshake", err.to_string())),
            Some("event") => serde_json::from_value::<EventFrame>(value)
                .map(InboundFrame::Event)
                .map_err(|err| ProtocolError::malformed("event", err.to_string())),
            Some("ping") => Ok(InboundFrame::Ping),
            Some("pong") => Ok(InboundFrame::Pong),
            other => Err(ProtocolError::malformed("envelope", format!("unknown type {other:?}"))),
        }
    }
}

/// The client half of an in-memory connection.
pub struct TestClient {
    end: DuplexTransport,
}

impl TestClient {
    pub fn new(end: DuplexTransport) -> Self {
        Self { end }
    }

    pub async fn recv(&self) -> Value {
        let bytes = self.end.recv().await.expect("transport closed");
        serde_json::from_slice(&bytes).expect("client received invalid json")
    }

    /// Receives until a patch frame arrives; returns `(seq, payload)`.
    pub async fn recv_patch(&self) -> (u64, Value) {
        loop {
            let frame = self.recv().await;
            if frame["type"] == "patch" {
                return (frame["seq"].as_u64().unwrap(), frame["payload"].clone());
            }
        }
    }

    pub async fn send_event(&self, handler: &str, name: &str, payload: Value) {
        let frame =
            json!({ "type": "event", "handler": handler, "name": name, "payload": payload });
        self.send_raw(frame).await;
    }

    pub async fn send_ping(&self) {
        self.send_raw(json!({ "type": "ping" })).await;
    }

    pub async fn send_raw(&self, frame: Value) {
        self.end.send(&serde_json::to_vec(&frame).unwrap()).await.expect("send failed");
    }

    pub fn shutdown(&self) {
        self.end.shutdown();
    }
}

pub struct Harness {
    pub manager: SessionManager,
    pub views: Arc<TestViews>,
}

pub fn engine_config() -> EngineConfig {
    EngineConfig {
        max_sessions: 32,
        max_sessions_per_ip: 4,
        patch_history_capacity: 16,
        write_timeout: Duration::from_millis(500),
        error_frame_interval: Duration::from_millis(50),
        // sweeps are driven manually in tests
        cleanup_interval: Duration::from_secs(3600),
        ..EngineConfig::default()
    }
}

pub fn harness(config: EngineConfig) -> Harness {
    harness_with_store(config, None)
}

pub fn harness_with_store(
    config: EngineConfig,
    store: Option<Arc<MemorySessionStore>>,
) -> Harness {
    let views = Arc::new(TestViews::default());
    let manager = SessionManager::new(
        config,
        views.clone(),
        Arc::new(TestCodec),
        store.map(|store| store as Arc<dyn SessionStore>),
    );
    Harness { manager, views }
}

pub fn test_ip(last: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(192, 0, 2, last))
}

pub fn create_params(ip_last: u8) -> CreateParams {
    CreateParams { user_id: "user-1".into(), ip: test_ip(ip_last), route: "/app".into() }
}

pub async fn open(
    manager: &SessionManager,
    ip_last: u8,
    resume: Option<ResumeClaim>,
) -> (Connected, TestClient) {
    open_with_capacity(manager, ip_last, resume, 32).await
}

pub async fn open_with_capacity(
    manager: &SessionManager,
    ip_last: u8,
    resume: Option<ResumeClaim>,
    capacity: usize,
) -> (Connected, TestClient) {
    let (client_end, engine_end) = pair(capacity);
    let connected = manager
        .connect(ConnectRequest {
            resume,
            user_id: "user-1".into(),
            ip: test_ip(ip_last),
            route: "/app".into(),
            transport: Arc::new(engine_end),
        })
        .await
        .expect("connect failed");
    (connected, TestClient::new(client_end))
}

pub async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
