//! Session: the per-client state machine and its workers.
//!
//! A session owns the authoritative UI state for one logical client across
//! any number of physical connections. Three workers serve it: a read loop
//! bound to the current transport, a dispatch loop that serializes event
//! handlers and scheduled jobs, and a writer loop that owns rendering,
//! sequence assignment and every byte written outbound. Because the writer
//! loop is the only patch producer, replayed history and fresh patches can
//! never interleave out of order.

mod runtime;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

use crate::frame::{EventFrame, FrameCodec, Seq};
use crate::history::PatchHistory;
use crate::now_ms;
use crate::transport::{Transport, TransportError};
use crate::view::RootView;

pub use runtime::AttachOutcome;

/// Exactly one of these at any instant. `Closed` is terminal; `Detached`
/// re-enters `Active` through a successful resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Registered but never attached.
    Connecting,
    Active,
    /// Transport lost; state retained until the resume window elapses.
    Detached { at: u64 },
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachReason {
    ReadFailed,
    WriteFailed,
    WriteTimeout,
    /// A newer transport took over this session.
    Superseded,
    /// Malformed inbound traffic.
    Protocol,
    Requested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Requested,
    IdleTimeout,
    ResumeWindowElapsed,
    MemoryPressure,
    IpLimit,
    Lru,
    Shutdown,
}

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("session is closed")]
    Closed,
    #[error("transport failed during attach: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("dispatch queue is full")]
    QueueFull,
    #[error("session is closed")]
    Closed,
}

/// Identity snapshot published to observers.
#[derive(Debug, Clone)]
pub struct SessionMeta {
    pub id: String,
    pub user_id: String,
    pub ip: IpAddr,
    pub created_at: u64,
}

/// Work executed on the session's dispatch worker, serialized with event
/// handlers.
pub type DispatchJob = Box<dyn FnOnce(&EventContext<'_>) + Send + 'static>;

pub(crate) enum LifecycleEvent {
    Detached { id: String, reason: DetachReason },
    Closed { meta: SessionMeta, reason: CloseReason },
}

/// Queue sizes and deadlines a session is built with.
#[derive(Debug, Clone)]
pub(crate) struct SessionTuning {
    pub event_queue_capacity: usize,
    pub dispatch_queue_capacity: usize,
    pub patch_history_capacity: usize,
    pub write_timeout: Duration,
    pub error_frame_interval: Duration,
}

/// State carried over when rebuilding a session from a persisted record.
pub(crate) struct RestoredState {
    pub created_at: u64,
    pub last_seq: Seq,
    pub data: HashMap<String, Value>,
}

pub(crate) struct SessionParams {
    pub id: String,
    pub user_id: String,
    pub ip: IpAddr,
    pub route: String,
    pub owner: Arc<dyn RootView>,
    pub codec: Arc<dyn FrameCodec>,
    pub tuning: SessionTuning,
    pub lifecycle: mpsc::UnboundedSender<LifecycleEvent>,
    pub restore: Option<RestoredState>,
}

struct Lifecycle {
    phase: Phase,
    /// Bumped on every transition away from the current transport; stale
    /// read loops compare against it and stand down.
    epoch: u64,
}

struct Channels {
    event_tx: Mutex<Option<mpsc::Sender<EventFrame>>>,
    dispatch_tx: Mutex<Option<mpsc::Sender<DispatchJob>>>,
    render_tx: Mutex<Option<mpsc::Sender<()>>>,
    writer_tx: Mutex<Option<mpsc::Sender<runtime::WriterCommand>>>,
}

struct ErrorLimiter {
    min_interval: Duration,
    last: Mutex<Option<std::time::Instant>>,
}

impl ErrorLimiter {
    fn new(min_interval: Duration) -> Self {
        Self { min_interval, last: Mutex::new(None) }
    }

    fn allow(&self) -> bool {
        let mut last = self.last.lock();
        match *last {
            Some(at) if at.elapsed() < self.min_interval => false,
            _ => {
                *last = Some(std::time::Instant::now());
                true
            }
        }
    }
}

pub struct Session {
    id: String,
    user_id: String,
    ip: Mutex<IpAddr>,
    route: Mutex<String>,
    created_at: u64,
    last_active: AtomicU64,
    state: Mutex<Lifecycle>,
    owner: Arc<dyn RootView>,
    codec: Arc<dyn FrameCodec>,
    history: PatchHistory,
    seq: AtomicU64,
    data: RwLock<HashMap<String, Value>>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    channels: Channels,
    pending: Mutex<Option<runtime::RuntimeChannels>>,
    lifecycle_tx: mpsc::UnboundedSender<LifecycleEvent>,
    event_drops: AtomicU64,
    limiter: ErrorLimiter,
    /// Set on sessions rebuilt from a persisted record: the replay buffer
    /// did not survive, so the first bind must resync whatever the client
    /// claims to have.
    force_resync: AtomicBool,
    tuning: SessionTuning,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Builds the session without starting its workers. Only tests use the
    /// un-started form; [`Session::spawn`] is the real entry point.
    pub(crate) fn new(params: SessionParams) -> Arc<Self> {
        let tuning = params.tuning;
        let (event_tx, event_rx) = mpsc::channel(tuning.event_queue_capacity);
        let (dispatch_tx, dispatch_rx) = mpsc::channel(tuning.dispatch_queue_capacity);
        let (render_tx, render_rx) = mpsc::channel(1);
        let (writer_tx, writer_rx) = mpsc::channel(4);
        let now = now_ms();
        let restored = params.restore.is_some();
        let (created_at, last_seq, data) = match params.restore {
            Some(restored) => (restored.created_at, restored.last_seq, restored.data),
            None => (now, 0, HashMap::new()),
        };
        Arc::new(Self {
            id: params.id,
            user_id: params.user_id,
            ip: Mutex::new(params.ip),
            route: Mutex::new(params.route),
            created_at,
            last_active: AtomicU64::new(now),
            state: Mutex::new(Lifecycle { phase: Phase::Connecting, epoch: 0 }),
            owner: params.owner,
            codec: params.codec,
            history: PatchHistory::new(tuning.patch_history_capacity),
            seq: AtomicU64::new(last_seq),
            data: RwLock::new(data),
            transport: Mutex::new(None),
            channels: Channels {
                event_tx: Mutex::new(Some(event_tx)),
                dispatch_tx: Mutex::new(Some(dispatch_tx)),
                render_tx: Mutex::new(Some(render_tx)),
                writer_tx: Mutex::new(Some(writer_tx)),
            },
            pending: Mutex::new(Some(runtime::RuntimeChannels {
                event_rx,
                dispatch_rx,
                render_rx,
                writer_rx,
            })),
            lifecycle_tx: params.lifecycle,
            event_drops: AtomicU64::new(0),
            limiter: ErrorLimiter::new(tuning.error_frame_interval),
            force_resync: AtomicBool::new(restored),
            tuning,
        })
    }

    pub(crate) fn spawn(params: SessionParams) -> Arc<Self> {
        let session = Self::new(params);
        session.start_workers();
        session
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn ip(&self) -> IpAddr {
        *self.ip.lock()
    }

    pub(crate) fn set_ip(&self, ip: IpAddr) {
        *self.ip.lock() = ip;
    }

    pub fn route(&self) -> String {
        self.route.lock().clone()
    }

    fn set_route(&self, route: String) {
        *self.route.lock() = route;
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Epoch millis of the last inbound activity.
    pub fn last_active(&self) -> u64 {
        self.last_active.load(Ordering::Acquire)
    }

    pub fn touch(&self) {
        self.last_active.store(now_ms(), Ordering::Release);
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.phase(), Phase::Closed)
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Highest sequence assigned so far.
    pub fn seq(&self) -> Seq {
        self.seq.load(Ordering::Acquire)
    }

    pub fn history(&self) -> &PatchHistory {
        &self.history
    }

    /// Events dropped because the inbound queue was full.
    pub fn event_drops(&self) -> u64 {
        self.event_drops.load(Ordering::Relaxed)
    }

    pub fn meta(&self) -> SessionMeta {
        SessionMeta {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            ip: self.ip(),
            created_at: self.created_at,
        }
    }

    pub fn get_data(&self, key: &str) -> Option<Value> {
        self.data.read().get(key).cloned()
    }

    pub fn put_data(&self, key: impl Into<String>, value: Value) {
        self.data.write().insert(key.into(), value);
    }

    pub fn remove_data(&self, key: &str) -> Option<Value> {
        self.data.write().remove(key)
    }

    /// Requests a render pass. Requests coalesce: however many arrive while
    /// the writer is busy, one pass runs.
    pub fn mark_dirty(&self) {
        if let Some(tx) = &*self.channels.render_tx.lock() {
            let _ = tx.try_send(());
        }
    }

    /// Queues work onto the dispatch worker, serialized with event handlers.
    pub fn schedule(&self, job: DispatchJob) -> Result<(), ScheduleError> {
        match &*self.channels.dispatch_tx.lock() {
            Some(tx) => tx.try_send(job).map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => ScheduleError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => ScheduleError::Closed,
            }),
            None => Err(ScheduleError::Closed),
        }
    }

    fn offer_event(&self, event: EventFrame) -> Result<(), mpsc::error::TrySendError<EventFrame>> {
        match &*self.channels.event_tx.lock() {
            Some(tx) => tx.try_send(event),
            None => Err(mpsc::error::TrySendError::Closed(event)),
        }
    }

    /// Transport gone, state kept. Returns false when the session was
    /// already detached or closed.
    pub fn detach(&self, reason: DetachReason) -> bool {
        self.detach_inner(None, reason)
    }

    /// Detach requested by a worker that observed the session at `epoch`.
    /// A no-op if a newer transport has been bound since — the failure
    /// belonged to a superseded connection.
    pub(crate) fn detach_if_epoch(&self, epoch: u64, reason: DetachReason) -> bool {
        self.detach_inner(Some(epoch), reason)
    }

    fn detach_inner(&self, expected_epoch: Option<u64>, reason: DetachReason) -> bool {
        {
            let mut state = self.state.lock();
            if let Some(expected) = expected_epoch {
                if state.epoch != expected {
                    return false;
                }
            }
            match state.phase {
                Phase::Active | Phase::Connecting => {
                    state.phase = Phase::Detached { at: now_ms() };
                    state.epoch += 1;
                }
                Phase::Detached { .. } | Phase::Closed => return false,
            }
        }
        if let Some(transport) = self.transport.lock().take() {
            transport.shutdown();
        }
        info!(
            target: "riptide::session",
            session = %self.id,
            reason = ?reason,
            "session detached"
        );
        let _ = self
            .lifecycle_tx
            .send(LifecycleEvent::Detached { id: self.id.clone(), reason });
        true
    }

    /// Terminal teardown. Idempotent and safe to race with detach; exactly
    /// one caller wins and runs the teardown once.
    pub fn close(&self, reason: CloseReason) -> bool {
        {
            let mut state = self.state.lock();
            if matches!(state.phase, Phase::Closed) {
                return false;
            }
            state.phase = Phase::Closed;
            state.epoch += 1;
        }
        // Dropping the senders ends the dispatch and writer loops.
        self.channels.event_tx.lock().take();
        self.channels.dispatch_tx.lock().take();
        self.channels.render_tx.lock().take();
        self.channels.writer_tx.lock().take();
        if let Some(transport) = self.transport.lock().take() {
            transport.shutdown();
        }
        self.owner.dispose();
        info!(
            target: "riptide::session",
            session = %self.id,
            reason = ?reason,
            "session closed"
        );
        let _ = self
            .lifecycle_tx
            .send(LifecycleEvent::Closed { meta: self.meta(), reason });
        true
    }

    /// Approximate retained bytes: owner estimate + replay buffer + kv data
    /// + fixed structural overhead. Feeds eviction decisions only.
    pub fn memory_usage(&self) -> usize {
        const STRUCTURAL_OVERHEAD: usize = 4096;
        let data_bytes: usize = {
            let data = self.data.read();
            data.iter().map(|(key, value)| key.len() + estimate_json(value)).sum()
        };
        self.owner.memory_usage() + self.history.byte_size() + data_bytes + STRUCTURAL_OVERHEAD
    }

    /// Serialized form handed to the persistence bridge. The replay buffer
    /// is intentionally left out; restore always resyncs.
    pub fn snapshot_record(&self) -> crate::store::SessionRecord {
        let detached_at = match self.phase() {
            Phase::Detached { at } => at,
            _ => 0,
        };
        crate::store::SessionRecord {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            ip: self.ip(),
            route: self.route(),
            created_at: self.created_at,
            last_active: self.last_active(),
            detached_at,
            last_seq: self.seq(),
            data: self.data.read().clone(),
        }
    }

    pub fn store_meta(&self) -> crate::store::StoreMeta {
        crate::store::StoreMeta {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            ip: self.ip(),
            created_at: self.created_at,
            last_active: self.last_active(),
        }
    }
}

/// Handle given to event handlers and scheduled jobs; the only sanctioned
/// way for view code to reach back into its session.
pub struct EventContext<'a> {
    session: &'a Session,
}

impl<'a> EventContext<'a> {
    pub(crate) fn new(session: &'a Session) -> Self {
        Self { session }
    }

    pub fn session_id(&self) -> &str {
        self.session.id()
    }

    pub fn route(&self) -> String {
        self.session.route()
    }

    /// Records a navigation; the view is expected to re-render for the new
    /// route on its next pass.
    pub fn set_route(&self, route: impl Into<String>) {
        self.session.set_route(route.into());
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.session.get_data(key)
    }

    pub fn put(&self, key: impl Into<String>, value: Value) {
        self.session.put_data(key, value);
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.session.remove_data(key)
    }

    pub fn request_render(&self) {
        self.session.mark_dirty();
    }
}

fn estimate_json(value: &Value) -> usize {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) => 8,
        Value::String(text) => 24 + text.len(),
        Value::Array(items) => 24 + items.iter().map(estimate_json).sum::<usize>(),
        Value::Object(map) => {
            32 + map.iter().map(|(key, item)| key.len() + estimate_json(item)).sum::<usize>()
        }
    }
}
