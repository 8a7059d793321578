//! Engine tunables. Everything has a sane default and an environment
//! override so deployments can retune without a rebuild.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Global admission ceiling across all sessions.
    pub max_sessions: usize,
    /// Admission ceiling per client IP.
    pub max_sessions_per_ip: usize,
    /// When an IP is at its ceiling, evict that IP's oldest detached
    /// session instead of rejecting the new one.
    pub evict_on_ip_limit: bool,
    /// Bounded inbound event queue per session.
    pub event_queue_capacity: usize,
    /// Bounded queue for jobs scheduled onto a session's dispatch worker.
    pub dispatch_queue_capacity: usize,
    /// Replay ring size, in patches.
    pub patch_history_capacity: usize,
    /// Attached sessions idle longer than this are evicted.
    pub idle_timeout: Duration,
    /// Detached sessions older than this can no longer be resumed.
    pub resume_window: Duration,
    /// Cleanup ticker period.
    pub cleanup_interval: Duration,
    /// Deadline for a single frame write before the peer is declared stalled.
    pub write_timeout: Duration,
    /// Minimum spacing between backpressure error frames to one client.
    pub error_frame_interval: Duration,
    /// Per-session memory ceiling, bytes.
    pub session_memory_limit: usize,
    /// Aggregate memory ceiling across sessions, bytes.
    pub total_memory_limit: usize,
    /// Bound on how long shutdown waits for persistence and closes.
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_sessions: 10_000,
            max_sessions_per_ip: 20,
            evict_on_ip_limit: true,
            event_queue_capacity: 128,
            dispatch_queue_capacity: 64,
            patch_history_capacity: 256,
            idle_timeout: Duration::from_secs(30 * 60),
            resume_window: Duration::from_secs(5 * 60),
            cleanup_interval: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
            error_frame_interval: Duration::from_secs(1),
            session_memory_limit: 16 * 1024 * 1024,
            total_memory_limit: 1024 * 1024 * 1024,
            shutdown_timeout: Duration::from_secs(15),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_sessions: env_parse("RIPTIDE_MAX_SESSIONS", defaults.max_sessions),
            max_sessions_per_ip: env_parse("RIPTIDE_MAX_SESSIONS_PER_IP", defaults.max_sessions_per_ip),
            evict_on_ip_limit: env_flag("RIPTIDE_EVICT_ON_IP_LIMIT", defaults.evict_on_ip_limit),
            event_queue_capacity: env_parse("RIPTIDE_EVENT_QUEUE", defaults.event_queue_capacity),
            dispatch_queue_capacity: env_parse("RIPTIDE_DISPATCH_QUEUE", defaults.dispatch_queue_capacity),
            patch_history_capacity: env_parse("RIPTIDE_PATCH_HISTORY", defaults.patch_history_capacity),
            idle_timeout: env_secs("RIPTIDE_IDLE_TIMEOUT_SECS", defaults.idle_timeout),
            resume_window: env_secs("RIPTIDE_RESUME_WINDOW_SECS", defaults.resume_window),
            cleanup_interval: env_secs("RIPTIDE_CLEANUP_INTERVAL_SECS", defaults.cleanup_interval),
            write_timeout: env_secs("RIPTIDE_WRITE_TIMEOUT_SECS", defaults.write_timeout),
            error_frame_interval: env_millis("RIPTIDE_ERROR_FRAME_INTERVAL_MS", defaults.error_frame_interval),
            session_memory_limit: env_parse("RIPTIDE_SESSION_MEMORY_LIMIT", defaults.session_memory_limit),
            total_memory_limit: env_parse("RIPTIDE_TOTAL_MEMORY_LIMIT", defaults.total_memory_limit),
            shutdown_timeout: env_secs("RIPTIDE_SHUTDOWN_TIMEOUT_SECS", defaults.shutdown_timeout),
        }
    }
}

pub(crate) fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|val| val.parse().ok()).unwrap_or(default)
}

pub(crate) fn env_flag(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

pub(crate) fn env_secs(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|val| val.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

pub(crate) fn env_millis(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|val| val.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}
