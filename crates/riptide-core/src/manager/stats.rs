//! Read-only projections of manager state.

use serde::Serialize;

/// Point-in-time aggregates. `total_memory` sums per-session estimates and
/// inherits their best-effort accuracy.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub active: usize,
    pub created: u64,
    pub closed: u64,
    pub evicted: u64,
    pub peak: usize,
    pub total_memory: usize,
}

/// What shutdown managed to do before its deadline.
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    /// Sessions registered when shutdown began.
    pub sessions: usize,
    pub persisted: usize,
    pub closed: usize,
    /// True when the deadline cut persistence or closes short.
    pub timed_out: bool,
}
