//! Transport seam between a session and whatever carries its bytes.
//!
//! Sessions never see sockets; they hold an `Arc<dyn Transport>` and the
//! hosting binary bridges it to a WebSocket (or anything else). The in-memory
//! [`pair`] is the same abstraction over a bounded channel, used by the
//! gateway's socket pump and by tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, Notify};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("transport write timed out")]
    Timeout,
    #[error("transport failure: {0}")]
    Failed(String),
}

/// Bidirectional byte-frame carrier bound to a session.
///
/// `send` may apply backpressure; callers wrap it in a deadline. `shutdown`
/// must be idempotent and must cause in-flight and future `recv` calls on
/// both ends to fail with [`TransportError::Closed`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, frame: &[u8]) -> Result<(), TransportError>;
    async fn recv(&self) -> Result<Bytes, TransportError>;
    fn is_connected(&self) -> bool;
    fn shutdown(&self);
}

struct Link {
    open: AtomicBool,
    closed: Notify,
}

/// One end of an in-memory duplex transport.
pub struct DuplexTransport {
    tx: mpsc::Sender<Bytes>,
    rx: Mutex<mpsc::Receiver<Bytes>>,
    link: Arc<Link>,
}

/// Builds a connected transport pair sharing a single shutdown state.
/// `capacity` bounds each direction; a full buffer makes `send` wait, which
/// is what lets a session's write deadline detect a stalled peer.
pub fn pair(capacity: usize) -> (DuplexTransport, DuplexTransport) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    let link = Arc::new(Link { open: AtomicBool::new(true), closed: Notify::new() });
    let left = DuplexTransport { tx: a_tx, rx: Mutex::new(b_rx), link: link.clone() };
    let right = DuplexTransport { tx: b_tx, rx: Mutex::new(a_rx), link };
    (left, right)
}

impl DuplexTransport {
    /// Non-blocking send used where backpressure should surface immediately
    /// instead of waiting for buffer space.
    pub fn try_send(&self, frame: &[u8]) -> Result<(), TransportError> {
        if !self.link.open.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        match self.tx.try_send(Bytes::copy_from_slice(frame)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(TransportError::Failed("buffer full".into())),
            Err(TrySendError::Closed(_)) => Err(TransportError::Closed),
        }
    }
}

#[async_trait]
impl Transport for DuplexTransport {
    async fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        if !self.link.open.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.tx
            .send(Bytes::copy_from_slice(frame))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Result<Bytes, TransportError> {
        let mut rx = self.rx.lock().await;
        let closed = self.link.closed.notified();
        tokio::pin!(closed);
        // Register before re-checking the flag so a shutdown racing this
        // call cannot slip between the check and the select.
        closed.as_mut().enable();
        if !self.link.open.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        tokio::select! {
            frame = rx.recv() => frame.ok_or(TransportError::Closed),
            _ = &mut closed => Err(TransportError::Closed),
        }
    }

    fn is_connected(&self) -> bool {
        self.link.open.load(Ordering::Acquire)
    }

    fn shutdown(&self) {
        if self.link.open.swap(false, Ordering::AcqRel) {
            self.link.closed.notify_waiters();
        }
    }
}
