//! Riptide core: resumable server-driven UI sessions.
//!
//! The engine keeps one [`session::Session`] per connected client. A
//! session owns an application [`view::RootView`], renders it into encoded
//! patches with strictly increasing sequence numbers, and keeps a bounded
//! replay buffer so a client that drops and returns can be caught up
//! without rebuilding its state. The [`manager::SessionManager`] is the
//! process-wide registry: admission, reconnect routing, idle cleanup,
//! memory-pressure eviction, persistence and shutdown.
//!
//! Nothing in this crate touches sockets. Hosts bridge their connections
//! through [`transport::Transport`] and their wire format through
//! [`frame::FrameCodec`]; `riptide-gate` is the reference WebSocket host.

pub mod config;
pub mod frame;
pub mod history;
pub mod manager;
pub mod memory;
pub mod session;
pub mod store;
pub mod transport;
pub mod view;

pub use config::EngineConfig;
pub use manager::{
    ConnectKind, ConnectRequest, Connected, CreateParams, ResumeClaim, SessionManager,
    SessionObserver,
};
pub use session::{
    AttachOutcome, CloseReason, DetachReason, EventContext, Phase, Session, SessionMeta,
};
pub use view::{RootView, ViewFactory};

/// Milliseconds since the unix epoch; the clock every timestamp in the
/// crate shares.
pub(crate) fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
