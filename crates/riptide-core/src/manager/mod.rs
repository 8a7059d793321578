//! Process-wide session registry.
//!
//! One [`SessionManager`] owns every live [`Session`]: it admits new ones
//! against global and per-IP ceilings, routes reconnects to the session
//! they belong to, persists detached sessions through the store bridge,
//! reaps idle and expired ones on a ticker, and tears everything down on a
//! deadline at shutdown.
//!
//! All registry state sits behind a single `RwLock`. Decisions (who gets
//! admitted, who gets evicted) happen under that lock; the evictions
//! themselves run outside it so view `dispose` hooks and transport
//! teardown never block admission.

mod stats;

pub use stats::{ManagerStats, ShutdownReport};

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::frame::{FrameCodec, Seq};
use crate::now_ms;
use crate::session::{
    AttachError, AttachOutcome, CloseReason, LifecycleEvent, Phase, RestoredState, Session,
    SessionMeta, SessionParams, SessionTuning,
};
use crate::store::{SessionRecord, SessionStore, StoreError};
use crate::transport::Transport;
use crate::view::{RootView, ViewError, ViewFactory};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("maximum session count reached")]
    MaxSessionsReached,
    #[error("too many sessions from {ip}")]
    TooManySessionsFromIp { ip: IpAddr },
    #[error("manager is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error("session store: {0}")]
    Store(#[from] StoreError),
    #[error("view: {0}")]
    View(#[from] ViewError),
    #[error("attach: {0}")]
    Attach(#[from] AttachError),
}

#[derive(Debug, Error)]
pub enum IpUpdateError {
    #[error("unknown session {id}")]
    UnknownSession { id: String },
    #[error(transparent)]
    Admission(#[from] AdmissionError),
}

#[derive(Debug, Clone)]
pub struct CreateParams {
    pub user_id: String,
    pub ip: IpAddr,
    pub route: String,
}

/// Client claim to pick an earlier session back up.
#[derive(Debug, Clone)]
pub struct ResumeClaim {
    pub session_id: String,
    /// Highest patch sequence the client applied before it lost the link.
    pub last_ack: Seq,
}

pub struct ConnectRequest {
    pub resume: Option<ResumeClaim>,
    pub user_id: String,
    pub ip: IpAddr,
    pub route: String,
    pub transport: Arc<dyn Transport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectKind {
    Created,
    /// Live session; the gap was replayed from the patch buffer.
    Resumed { replayed: u32 },
    /// Live session, but the gap was gone; the client got a full resync.
    Resynced,
    /// Rebuilt from a persisted record. Always implies a resync.
    Restored,
}

pub struct Connected {
    pub session: Arc<Session>,
    pub kind: ConnectKind,
    /// Sequence the client should treat as current before new patches flow.
    pub base_seq: Seq,
}

/// Hook points for the hosting binary (metrics, audit trails). Callbacks
/// run on manager tasks and must not block.
pub trait SessionObserver: Send + Sync {
    fn on_created(&self, _meta: &SessionMeta) {}
    fn on_closed(&self, _meta: &SessionMeta, _reason: CloseReason) {}
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<String, Arc<Session>>,
    per_ip: HashMap<IpAddr, usize>,
}

impl Registry {
    fn register(&mut self, session: Arc<Session>) {
        *self.per_ip.entry(session.ip()).or_insert(0) += 1;
        self.sessions.insert(session.id().to_string(), session);
    }

    fn remove(&mut self, id: &str) -> Option<Arc<Session>> {
        let session = self.sessions.remove(id)?;
        self.release_ip(session.ip());
        Some(session)
    }

    fn release_ip(&mut self, ip: IpAddr) {
        if let Some(count) = self.per_ip.get_mut(&ip) {
            *count -= 1;
            if *count == 0 {
                self.per_ip.remove(&ip);
            }
        }
    }

    fn ip_count(&self, ip: IpAddr) -> usize {
        self.per_ip.get(&ip).copied().unwrap_or(0)
    }

    /// Eviction candidate when an IP is at its ceiling: the session that
    /// detached first, ties broken by least recent activity.
    fn oldest_detached(&self, ip: IpAddr) -> Option<Arc<Session>> {
        self.sessions
            .values()
            .filter(|session| session.ip() == ip)
            .filter_map(|session| match session.phase() {
                Phase::Detached { at } => Some((at, session.last_active(), session.clone())),
                _ => None,
            })
            .min_by_key(|(detached_at, last_active, _)| (*detached_at, *last_active))
            .map(|(_, _, session)| session)
    }
}

struct ManagerInner {
    config: EngineConfig,
    views: Arc<dyn ViewFactory>,
    codec: Arc<dyn FrameCodec>,
    store: Option<Arc<dyn SessionStore>>,
    registry: RwLock<Registry>,
    observers: RwLock<Vec<Arc<dyn SessionObserver>>>,
    /// Taken by `shutdown` so the lifecycle pump can drain to completion
    /// once the last session drops its clone.
    lifecycle_tx: Mutex<Option<mpsc::UnboundedSender<LifecycleEvent>>>,
    created: AtomicU64,
    closed: AtomicU64,
    evicted: AtomicU64,
    peak: AtomicUsize,
    shutting_down: AtomicBool,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

/// Cheap to clone; all clones share one registry. Construction and the
/// admission paths spawn tasks, so the manager must live inside a tokio
/// runtime.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

struct SessionSpec {
    id: String,
    user_id: String,
    ip: IpAddr,
    route: String,
    restore: Option<RestoredState>,
}

enum Admitted {
    New { session: Arc<Session>, victim: Option<Arc<Session>> },
    /// A session with this id is already registered (two transports racing
    /// to restore the same record); reuse it.
    Existing(Arc<Session>),
}

impl SessionManager {
    pub fn new(
        config: EngineConfig,
        views: Arc<dyn ViewFactory>,
        codec: Arc<dyn FrameCodec>,
        store: Option<Arc<dyn SessionStore>>,
    ) -> Self {
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        let manager = Self {
            inner: Arc::new(ManagerInner {
                config,
                views,
                codec,
                store,
                registry: RwLock::new(Registry::default()),
                observers: RwLock::new(Vec::new()),
                lifecycle_tx: Mutex::new(Some(lifecycle_tx)),
                created: AtomicU64::new(0),
                closed: AtomicU64::new(0),
                evicted: AtomicU64::new(0),
                peak: AtomicUsize::new(0),
                shutting_down: AtomicBool::new(false),
                cleanup_task: Mutex::new(None),
            }),
        };
        tokio::spawn(lifecycle_pump(manager.clone(), lifecycle_rx));
        let ticker = tokio::spawn(cleanup_loop(manager.clone()));
        *manager.inner.cleanup_task.lock() = Some(ticker);
        manager
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.inner.registry.read().sessions.get(session_id).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.inner.registry.read().sessions.len()
    }

    pub fn add_observer(&self, observer: Arc<dyn SessionObserver>) {
        self.inner.observers.write().push(observer);
    }

    /// Admits and registers a fresh session. The view is built before the
    /// registry lock is taken; if admission rejects, it is disposed and the
    /// error surfaces to the caller.
    pub fn create(&self, params: CreateParams) -> Result<Arc<Session>, ConnectError> {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return Err(AdmissionError::ShuttingDown.into());
        }
        let owner = self.inner.views.create(&params.route)?;
        let spec = SessionSpec {
            id: Uuid::new_v4().to_string(),
            user_id: params.user_id,
            ip: params.ip,
            route: params.route,
            restore: None,
        };
        match self.admit(spec, owner.clone()) {
            Ok(Admitted::New { session, victim }) => {
                self.inner.created.fetch_add(1, Ordering::Relaxed);
                info!(
                    target: "riptide::manager",
                    session = %session.id(),
                    ip = %session.ip(),
                    route = %session.route(),
                    "session created"
                );
                if let Some(victim) = victim {
                    self.evict(victim, CloseReason::IpLimit);
                }
                self.notify_created(&session.meta());
                Ok(session)
            }
            // Fresh uuids do not collide with registered ids.
            Ok(Admitted::Existing(session)) => Ok(session),
            Err(err) => {
                owner.dispose();
                Err(err.into())
            }
        }
    }

    /// Single entry point for a new transport: resume the live session the
    /// claim names, fall back to the persistence bridge, else create fresh.
    /// The handshake ack (and any replay) has already been written to
    /// `transport` when this returns.
    pub async fn connect(&self, request: ConnectRequest) -> Result<Connected, ConnectError> {
        let ConnectRequest { resume, user_id, ip, route, transport } = request;
        if let Some(claim) = resume {
            if let Some(session) = self.get(&claim.session_id) {
                match session.attach(transport.clone(), Some(claim.last_ack)).await {
                    Ok(outcome) => {
                        session.touch();
                        let (kind, base_seq) = match outcome {
                            AttachOutcome::Replayed { frames } => {
                                (ConnectKind::Resumed { replayed: frames }, claim.last_ack)
                            }
                            AttachOutcome::Resynced { base_seq } => {
                                (ConnectKind::Resynced, base_seq)
                            }
                        };
                        info!(
                            target: "riptide::manager",
                            session = %session.id(),
                            kind = ?kind,
                            "session resumed"
                        );
                        return Ok(Connected { session, kind, base_seq });
                    }
                    // Closed between lookup and attach; the store may still
                    // hold a usable record.
                    Err(AttachError::Closed) => {}
                    Err(err) => return Err(err.into()),
                }
            }
            if let Some(record) = self.load_record(&claim.session_id).await {
                let session = self.restore(record, ip)?;
                let outcome = session.attach(transport, Some(claim.last_ack)).await?;
                let base_seq = match outcome {
                    AttachOutcome::Resynced { base_seq } => base_seq,
                    AttachOutcome::Replayed { .. } => claim.last_ack,
                };
                info!(
                    target: "riptide::manager",
                    session = %session.id(),
                    base_seq,
                    "session restored from store"
                );
                return Ok(Connected { session, kind: ConnectKind::Restored, base_seq });
            }
        }
        let session = self.create(CreateParams { user_id, ip, route })?;
        session.attach(transport, None).await?;
        // A new session has produced nothing before its first attach; reading
        // seq() here would race the initial render pass.
        Ok(Connected { session, kind: ConnectKind::Created, base_seq: 0 })
    }

    /// Admission and registration in one write-lock critical section:
    /// duplicate-id check, global cap, per-IP cap (with optional eviction
    /// of that IP's oldest detached session) and registration are atomic
    /// with respect to concurrent connects. The victim, if any, is handed
    /// back for teardown outside the lock.
    fn admit(
        &self,
        spec: SessionSpec,
        owner: Arc<dyn RootView>,
    ) -> Result<Admitted, AdmissionError> {
        let config = &self.inner.config;
        let lifecycle = self
            .inner
            .lifecycle_tx
            .lock()
            .clone()
            .ok_or(AdmissionError::ShuttingDown)?;
        let mut registry = self.inner.registry.write();
        if let Some(existing) = registry.sessions.get(&spec.id) {
            return Ok(Admitted::Existing(existing.clone()));
        }
        if registry.sessions.len() >= config.max_sessions {
            return Err(AdmissionError::MaxSessionsReached);
        }
        let mut victim = None;
        if registry.ip_count(spec.ip) >= config.max_sessions_per_ip {
            let candidate = config
                .evict_on_ip_limit
                .then(|| registry.oldest_detached(spec.ip))
                .flatten();
            match candidate {
                Some(candidate) => {
                    registry.remove(candidate.id());
                    victim = Some(candidate);
                }
                None => return Err(AdmissionError::TooManySessionsFromIp { ip: spec.ip }),
            }
        }
        let session = Session::spawn(SessionParams {
            id: spec.id,
            user_id: spec.user_id,
            ip: spec.ip,
            route: spec.route,
            owner,
            codec: self.inner.codec.clone(),
            tuning: tuning(config),
            lifecycle,
            restore: spec.restore,
        });
        registry.register(session.clone());
        let active = registry.sessions.len();
        drop(registry);
        self.inner.peak.fetch_max(active, Ordering::Relaxed);
        Ok(Admitted::New { session, victim })
    }

    /// Store lookup that degrades to a miss on backend failure: an outage
    /// in the bridge costs resumability, not availability.
    async fn load_record(&self, session_id: &str) -> Option<SessionRecord> {
        let store = self.inner.store.as_ref()?;
        match store.load(session_id).await {
            Ok(Some(bytes)) => match SessionRecord::from_bytes(&bytes) {
                Ok(record) => Some(record),
                Err(err) => {
                    warn!(
                        target: "riptide::manager",
                        session = %session_id,
                        error = %err,
                        "discarding corrupt session record"
                    );
                    None
                }
            },
            Ok(None) => {
                debug!(
                    target: "riptide::manager",
                    session = %session_id,
                    "resume claim matched nothing"
                );
                None
            }
            Err(err) => {
                warn!(
                    target: "riptide::manager",
                    session = %session_id,
                    error = %err,
                    "session store load failed"
                );
                None
            }
        }
    }

    /// Rebuilds a session from a persisted record under the connecting
    /// client's IP. The replay buffer was never persisted, so the follow-up
    /// attach always resyncs.
    fn restore(&self, record: SessionRecord, ip: IpAddr) -> Result<Arc<Session>, ConnectError> {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return Err(AdmissionError::ShuttingDown.into());
        }
        let owner = self.inner.views.create(&record.route)?;
        let SessionRecord { id, user_id, route, created_at, last_seq, data, .. } = record;
        let spec = SessionSpec {
            id,
            user_id,
            ip,
            route,
            restore: Some(RestoredState { created_at, last_seq, data }),
        };
        match self.admit(spec, owner.clone()) {
            Ok(Admitted::New { session, victim }) => {
                self.inner.created.fetch_add(1, Ordering::Relaxed);
                if let Some(victim) = victim {
                    self.evict(victim, CloseReason::IpLimit);
                }
                self.notify_created(&session.meta());
                Ok(session)
            }
            Ok(Admitted::Existing(session)) => {
                // Lost the restore race to another transport; reuse the
                // winner's session.
                owner.dispose();
                Ok(session)
            }
            Err(err) => {
                owner.dispose();
                Err(err.into())
            }
        }
    }

    /// Moves a session between per-IP buckets, enforcing the destination
    /// cap first. Nothing is mutated unless every check passes.
    pub fn update_session_ip(
        &self,
        session_id: &str,
        new_ip: IpAddr,
    ) -> Result<(), IpUpdateError> {
        let victim = {
            let mut registry = self.inner.registry.write();
            let session = registry
                .sessions
                .get(session_id)
                .cloned()
                .ok_or_else(|| IpUpdateError::UnknownSession { id: session_id.to_string() })?;
            let old_ip = session.ip();
            if old_ip == new_ip {
                return Ok(());
            }
            let mut victim = None;
            if registry.ip_count(new_ip) >= self.inner.config.max_sessions_per_ip {
                // The mover sits in a different bucket, so it can never be
                // its own victim here.
                let candidate = self
                    .inner
                    .config
                    .evict_on_ip_limit
                    .then(|| registry.oldest_detached(new_ip))
                    .flatten();
                match candidate {
                    Some(candidate) => {
                        registry.remove(candidate.id());
                        victim = Some(candidate);
                    }
                    None => {
                        return Err(AdmissionError::TooManySessionsFromIp { ip: new_ip }.into())
                    }
                }
            }
            registry.release_ip(old_ip);
            *registry.per_ip.entry(new_ip).or_insert(0) += 1;
            session.set_ip(new_ip);
            info!(
                target: "riptide::manager",
                session = %session_id,
                from = %old_ip,
                to = %new_ip,
                "session ip updated"
            );
            victim
        };
        if let Some(victim) = victim {
            self.evict(victim, CloseReason::IpLimit);
        }
        Ok(())
    }

    /// Tears a session down on behalf of its client. `Requested` also
    /// deletes the persisted record, so the id becomes unresumable.
    pub fn close_session(&self, session_id: &str, reason: CloseReason) -> bool {
        match self.get(session_id) {
            Some(session) => session.close(reason),
            None => false,
        }
    }

    /// One cleanup pass: reap idle attached sessions and expired detached
    /// ones, then enforce the memory ceilings. Runs on the cleanup ticker;
    /// public for hosts that want an explicit pass.
    pub fn sweep(&self) -> usize {
        let now = now_ms();
        let candidates: Vec<Arc<Session>> = {
            let registry = self.inner.registry.read();
            registry
                .sessions
                .values()
                .filter(|session| self.expired(session, now).is_some())
                .cloned()
                .collect()
        };
        let mut evicted = self.reap(candidates, now);
        evicted += self.enforce_memory_caps();
        evicted
    }

    fn expired(&self, session: &Session, now: u64) -> Option<CloseReason> {
        let config = &self.inner.config;
        match session.phase() {
            Phase::Connecting | Phase::Active => {
                let idle_ms = config.idle_timeout.as_millis() as u64;
                (now.saturating_sub(session.last_active()) > idle_ms)
                    .then_some(CloseReason::IdleTimeout)
            }
            Phase::Detached { at } => {
                let resume_ms = config.resume_window.as_millis() as u64;
                (now.saturating_sub(at) > resume_ms).then_some(CloseReason::ResumeWindowElapsed)
            }
            // The lifecycle pump owns removal of closed sessions.
            Phase::Closed => None,
        }
    }

    /// Removal happens on a second look under the write lock: a session
    /// that resumed or saw activity after the scan keeps its slot.
    fn reap(&self, candidates: Vec<Arc<Session>>, now: u64) -> usize {
        if candidates.is_empty() {
            return 0;
        }
        let victims: Vec<(Arc<Session>, CloseReason)> = {
            let mut registry = self.inner.registry.write();
            candidates
                .into_iter()
                .filter_map(|session| {
                    let reason = self.expired(&session, now)?;
                    registry.remove(session.id());
                    Some((session, reason))
                })
                .collect()
        };
        let evicted = victims.len();
        for (session, reason) in victims {
            self.evict(session, reason);
        }
        evicted
    }

    /// Applies the per-session memory ceiling, then the aggregate one.
    /// Aggregate overage is converted into an eviction count using the
    /// current average footprint; least recently active sessions go first.
    pub fn enforce_memory_caps(&self) -> usize {
        let per_limit = self.inner.config.session_memory_limit;
        let total_limit = self.inner.config.total_memory_limit;
        let sessions: Vec<Arc<Session>> = {
            let registry = self.inner.registry.read();
            registry.sessions.values().cloned().collect()
        };
        if sessions.is_empty() {
            return 0;
        }
        // Usage estimates call into view code, so the bulk pass samples
        // outside the lock; only confirmed offenders pay for a re-sample
        // during removal.
        let sized: Vec<(Arc<Session>, usize)> = sessions
            .into_iter()
            .map(|session| {
                let usage = session.memory_usage();
                (session, usage)
            })
            .collect();
        let (over, within): (Vec<_>, Vec<_>) =
            sized.into_iter().partition(|(_, usage)| *usage > per_limit);
        let offenders: Vec<Arc<Session>> =
            over.into_iter().map(|(session, _)| session).collect();
        let mut evicted = self.reap_over_limit(offenders);
        let total: usize = within.iter().map(|(_, usage)| *usage).sum();
        if total > total_limit && !within.is_empty() {
            let average = (total / within.len()).max(1);
            let count = (total - total_limit).div_ceil(average);
            evicted += self.evict_oldest(count, CloseReason::MemoryPressure);
        }
        evicted
    }

    /// Second look for per-session offenders: one whose footprint dropped
    /// back under the ceiling (a resync cleared its replay buffer, the
    /// view shed state) since the sample keeps its slot.
    fn reap_over_limit(&self, candidates: Vec<Arc<Session>>) -> usize {
        if candidates.is_empty() {
            return 0;
        }
        let per_limit = self.inner.config.session_memory_limit;
        let victims: Vec<(Arc<Session>, usize)> = {
            let mut registry = self.inner.registry.write();
            candidates
                .into_iter()
                .filter_map(|session| {
                    if matches!(session.phase(), Phase::Closed) {
                        return None;
                    }
                    let usage = session.memory_usage();
                    if usage <= per_limit {
                        return None;
                    }
                    registry.remove(session.id());
                    Some((session, usage))
                })
                .collect()
        };
        let evicted = victims.len();
        for (session, usage) in victims {
            warn!(
                target: "riptide::manager",
                session = %session.id(),
                usage,
                limit = per_limit,
                "session exceeds memory ceiling"
            );
            self.evict(session, CloseReason::MemoryPressure);
        }
        evicted
    }

    /// Removes and closes the `count` least recently active sessions.
    pub fn evict_lru(&self, count: usize) -> usize {
        self.evict_oldest(count, CloseReason::Lru)
    }

    fn evict_oldest(&self, count: usize, reason: CloseReason) -> usize {
        if count == 0 {
            return 0;
        }
        let victims: Vec<Arc<Session>> = {
            let mut registry = self.inner.registry.write();
            let mut candidates: Vec<Arc<Session>> =
                registry.sessions.values().cloned().collect();
            candidates.sort_by_key(|session| session.last_active());
            let victims: Vec<Arc<Session>> = candidates.into_iter().take(count).collect();
            for victim in &victims {
                registry.remove(victim.id());
            }
            victims
        };
        let evicted = victims.len();
        for victim in victims {
            self.evict(victim, reason);
        }
        evicted
    }

    /// Teardown outside the registry lock. `dispose` and transport shutdown
    /// run on a spawned task so sweeps never block on view code.
    fn evict(&self, session: Arc<Session>, reason: CloseReason) {
        self.inner.evicted.fetch_add(1, Ordering::Relaxed);
        info!(
            target: "riptide::manager",
            session = %session.id(),
            reason = ?reason,
            "session evicted"
        );
        tokio::spawn(async move {
            session.close(reason);
        });
    }

    async fn persist(&self, session_id: &str) {
        let Some(store) = self.inner.store.clone() else {
            return;
        };
        let Some(session) = self.get(session_id) else {
            return;
        };
        let bytes = match session.snapshot_record().to_bytes() {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(
                    target: "riptide::manager",
                    session = %session_id,
                    error = %err,
                    "failed to serialize session record"
                );
                return;
            }
        };
        match store.save(session_id, bytes, &session.store_meta()).await {
            Ok(()) => {
                debug!(target: "riptide::manager", session = %session_id, "session persisted")
            }
            Err(err) => warn!(
                target: "riptide::manager",
                session = %session_id,
                error = %err,
                "failed to persist session"
            ),
        }
    }

    fn notify_created(&self, meta: &SessionMeta) {
        let observers = self.inner.observers.read().clone();
        for observer in observers {
            observer.on_created(meta);
        }
    }

    fn notify_closed(&self, meta: &SessionMeta, reason: CloseReason) {
        let observers = self.inner.observers.read().clone();
        for observer in observers {
            observer.on_closed(meta, reason);
        }
    }

    pub fn stats(&self) -> ManagerStats {
        let sessions: Vec<Arc<Session>> = {
            let registry = self.inner.registry.read();
            registry.sessions.values().cloned().collect()
        };
        let total_memory = sessions.iter().map(|session| session.memory_usage()).sum();
        ManagerStats {
            active: sessions.len(),
            created: self.inner.created.load(Ordering::Relaxed),
            closed: self.inner.closed.load(Ordering::Relaxed),
            evicted: self.inner.evicted.load(Ordering::Relaxed),
            peak: self.inner.peak.load(Ordering::Relaxed),
            total_memory,
        }
    }

    /// Stops admission, persists every session then closes them, all
    /// bounded by `shutdown_timeout`. Only the first caller does the work;
    /// later calls get an empty report.
    pub async fn shutdown(&self) -> ShutdownReport {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return ShutdownReport::default();
        }
        if let Some(ticker) = self.inner.cleanup_task.lock().take() {
            ticker.abort();
        }
        drop(self.inner.lifecycle_tx.lock().take());
        let sessions: Vec<Arc<Session>> = {
            let mut registry = self.inner.registry.write();
            registry.per_ip.clear();
            registry.sessions.drain().map(|(_, session)| session).collect()
        };
        let total = sessions.len();
        info!(target: "riptide::manager", sessions = total, "shutting down");
        let persisted = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let work = {
            let store = self.inner.store.clone();
            let persisted = persisted.clone();
            let closed = closed.clone();
            let sessions = sessions.clone();
            async move {
                if let Some(store) = store {
                    for session in &sessions {
                        let Ok(bytes) = session.snapshot_record().to_bytes() else {
                            continue;
                        };
                        if store.save(session.id(), bytes, &session.store_meta()).await.is_ok() {
                            persisted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                let closes: Vec<JoinHandle<()>> = sessions
                    .into_iter()
                    .map(|session| {
                        let closed = closed.clone();
                        tokio::spawn(async move {
                            if session.close(CloseReason::Shutdown) {
                                closed.fetch_add(1, Ordering::Relaxed);
                            }
                        })
                    })
                    .collect();
                futures::future::join_all(closes).await;
            }
        };
        let timed_out = tokio::time::timeout(self.inner.config.shutdown_timeout, work)
            .await
            .is_err();
        let report = ShutdownReport {
            sessions: total,
            persisted: persisted.load(Ordering::Relaxed),
            closed: closed.load(Ordering::Relaxed),
            timed_out,
        };
        info!(
            target: "riptide::manager",
            persisted = report.persisted,
            closed = report.closed,
            timed_out = report.timed_out,
            "shutdown complete"
        );
        report
    }
}

/// Applies lifecycle transitions to the registry: detaches trigger
/// persistence; closes settle counters, registration, observers and the
/// stored record.
async fn lifecycle_pump(
    manager: SessionManager,
    mut events: mpsc::UnboundedReceiver<LifecycleEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            LifecycleEvent::Detached { id, reason } => {
                debug!(
                    target: "riptide::manager",
                    session = %id,
                    reason = ?reason,
                    "session detached"
                );
                manager.persist(&id).await;
            }
            LifecycleEvent::Closed { meta, reason } => {
                manager.inner.closed.fetch_add(1, Ordering::Relaxed);
                {
                    let mut registry = manager.inner.registry.write();
                    registry.remove(&meta.id);
                }
                if matches!(reason, CloseReason::Requested) {
                    if let Some(store) = &manager.inner.store {
                        if let Err(err) = store.remove(&meta.id).await {
                            warn!(
                                target: "riptide::manager",
                                session = %meta.id,
                                error = %err,
                                "failed to remove stored session record"
                            );
                        }
                    }
                }
                manager.notify_closed(&meta, reason);
            }
        }
    }
}

async fn cleanup_loop(manager: SessionManager) {
    let mut ticker = tokio::time::interval(manager.inner.config.cleanup_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // interval fires immediately; skip the startup tick
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if manager.inner.shutting_down.load(Ordering::Acquire) {
            break;
        }
        let evicted = manager.sweep();
        if evicted > 0 {
            debug!(target: "riptide::manager", evicted, "cleanup pass evicted sessions");
        }
    }
}

fn tuning(config: &EngineConfig) -> SessionTuning {
    SessionTuning {
        event_queue_capacity: config.event_queue_capacity,
        dispatch_queue_capacity: config.dispatch_queue_capacity,
        patch_history_capacity: config.patch_history_capacity,
        write_timeout: config.write_timeout,
        error_frame_interval: config.error_frame_interval,
    }
}
