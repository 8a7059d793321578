//! Seam between the engine and the application's component tree.
//!
//! The engine never inspects UI state. It hands events to a [`RootView`],
//! asks it to render (a diff against whatever it last rendered), and tells
//! it when the next render must be a full document because the client lost
//! its baseline. All calls arrive on the session's own workers, never
//! concurrently with each other.

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::frame::EventFrame;
use crate::session::EventContext;

#[derive(Debug, Error)]
pub enum ViewError {
    #[error("no view registered for route {route}")]
    UnknownRoute { route: String },
    #[error("event handler failed: {0}")]
    Handler(String),
    #[error("render failed: {0}")]
    Render(String),
}

/// Owner of one session's authoritative UI state.
pub trait RootView: Send + Sync {
    /// Applies one client event. State mutation here is never concurrent
    /// with another handler or with `render` for the same session.
    fn handle_event(&self, event: &EventFrame, ctx: &EventContext<'_>) -> Result<(), ViewError>;

    /// Produces the next encoded patch, or `None` when nothing changed
    /// since the previous render.
    fn render(&self) -> Result<Option<Bytes>, ViewError>;

    /// Drops the diff baseline: the next `render` must emit a full document.
    fn resync(&self);

    /// Approximate retained bytes. An estimate, never exact accounting.
    fn memory_usage(&self) -> usize;

    /// Releases resources. Must be idempotent; the engine may call it from
    /// concurrent shutdown paths.
    fn dispose(&self);
}

/// Builds the root view for a newly created or restored session.
pub trait ViewFactory: Send + Sync {
    fn create(&self, route: &str) -> Result<Arc<dyn RootView>, ViewError>;
}
