//! Session workers: the read loop bound to the current transport, the
//! dispatch loop serializing handlers, and the writer loop that owns
//! rendering, sequence assignment and all outbound traffic.
//!
//! Transport binds are writer-loop commands. Because the same loop also
//! produces patches, the handshake ack and any replayed history are always
//! written before the next freshly rendered frame — the ordering guarantee
//! falls out of the structure instead of a gate flag.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, trace, warn};

use crate::frame::{
    ErrorCode, ErrorFrame, EventFrame, InboundFrame, OutboundFrame, Seq,
};
use crate::session::{DetachReason, DispatchJob, EventContext, Phase, Session};
use crate::session::AttachError;
use crate::transport::{Transport, TransportError};

/// How an attach caught the client up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    /// History covered the gap; `frames` buffered frames were re-sent.
    /// Zero means the client was already current (or brand new).
    Replayed { frames: u32 },
    /// The gap could not be served. History was cleared, the owner rebased,
    /// and the next patch is a full document carrying `base_seq + 1`.
    Resynced { base_seq: Seq },
}

pub(crate) struct RuntimeChannels {
    pub event_rx: mpsc::Receiver<EventFrame>,
    pub dispatch_rx: mpsc::Receiver<DispatchJob>,
    pub render_rx: mpsc::Receiver<()>,
    pub writer_rx: mpsc::Receiver<WriterCommand>,
}

pub(crate) enum WriterCommand {
    Bind {
        transport: Arc<dyn Transport>,
        last_ack: Option<Seq>,
        ack: oneshot::Sender<Result<BindAck, AttachError>>,
    },
}

pub(crate) struct BindAck {
    pub outcome: AttachOutcome,
    pub epoch: u64,
}

enum CatchUp {
    Fresh,
    CaughtUp { base: Seq },
    Replay { base: Seq, frames: Vec<Bytes> },
    Resync,
}

impl Session {
    pub(crate) fn start_workers(self: &Arc<Self>) {
        let Some(channels) = self.pending.lock().take() else {
            return; // already started
        };
        let dispatcher = Arc::clone(self);
        tokio::spawn(dispatch_loop(dispatcher, channels.event_rx, channels.dispatch_rx));
        let writer = Arc::clone(self);
        tokio::spawn(writer_loop(writer, channels.writer_rx, channels.render_rx));
    }

    /// Binds a transport to this session. Replies with a handshake ack and
    /// either replays the missing frames or forces a resync, then starts a
    /// read loop for the new transport. If the session is currently active
    /// the old transport is superseded first.
    pub async fn attach(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
        last_ack: Option<Seq>,
    ) -> Result<AttachOutcome, AttachError> {
        if self.is_closed() {
            return Err(AttachError::Closed);
        }
        if matches!(self.phase(), Phase::Active) {
            self.detach(DetachReason::Superseded);
        }
        let writer = self.channels.writer_tx.lock().clone();
        let Some(writer) = writer else {
            return Err(AttachError::Closed);
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        writer
            .send(WriterCommand::Bind { transport: transport.clone(), last_ack, ack: ack_tx })
            .await
            .map_err(|_| AttachError::Closed)?;
        let BindAck { outcome, epoch } = ack_rx.await.map_err(|_| AttachError::Closed)??;
        self.spawn_read_loop(transport, epoch);
        self.touch();
        Ok(outcome)
    }

    /// Runs on the writer loop, so no patch can be produced while a bind is
    /// in progress.
    async fn bind(
        &self,
        transport: Arc<dyn Transport>,
        last_ack: Option<Seq>,
    ) -> Result<BindAck, AttachError> {
        if self.is_closed() {
            return Err(AttachError::Closed);
        }
        if let Some(previous) = self.transport.lock().replace(transport.clone()) {
            previous.shutdown();
        }
        let current = self.seq();
        let plan = if self.force_resync.swap(false, Ordering::AcqRel) {
            CatchUp::Resync
        } else {
            match last_ack {
                None => CatchUp::Fresh,
                Some(ack) if ack == current => CatchUp::CaughtUp { base: ack },
                Some(ack) if ack < current && self.history.can_recover(ack) => {
                    match self.history.frames_between(ack, current) {
                        Some(frames) => CatchUp::Replay { base: ack, frames },
                        None => CatchUp::Resync,
                    }
                }
                Some(_) => CatchUp::Resync,
            }
        };
        let (outcome, resumed, base_seq, replay) = match plan {
            CatchUp::Fresh => {
                // Initial full document comes from the first render pass.
                self.mark_dirty();
                (AttachOutcome::Replayed { frames: 0 }, false, current, Vec::new())
            }
            CatchUp::CaughtUp { base } => {
                (AttachOutcome::Replayed { frames: 0 }, true, base, Vec::new())
            }
            CatchUp::Replay { base, frames } => {
                let count = frames.len() as u32;
                (AttachOutcome::Replayed { frames: count }, true, base, frames)
            }
            CatchUp::Resync => {
                // Old deltas are invalid against the new baseline.
                self.history.clear();
                self.owner.resync();
                self.mark_dirty();
                debug!(
                    target: "riptide::session",
                    session = %self.id,
                    base_seq = current,
                    "replay gap not coverable, forcing resync"
                );
                (AttachOutcome::Resynced { base_seq: current }, true, current, Vec::new())
            }
        };
        let replayed = replay.len() as u32;
        let ack_frame = self.codec.encode(&OutboundFrame::HandshakeAck {
            session_id: self.id.clone(),
            base_seq,
            resumed,
            replayed,
        });
        if let Err(err) = self.write_frame(&transport, &ack_frame).await {
            return Err(self.abort_bind(err));
        }
        for frame in &replay {
            if let Err(err) = self.write_frame(&transport, frame).await {
                return Err(self.abort_bind(err));
            }
        }
        if replayed > 0 {
            debug!(
                target: "riptide::session",
                session = %self.id,
                replayed,
                from = base_seq + 1,
                to = current,
                "replayed history to resumed client"
            );
        }
        let epoch = {
            let mut state = self.state.lock();
            if matches!(state.phase, Phase::Closed) {
                drop(state);
                self.clear_transport();
                return Err(AttachError::Closed);
            }
            state.phase = Phase::Active;
            state.epoch += 1;
            state.epoch
        };
        Ok(BindAck { outcome, epoch })
    }

    fn abort_bind(&self, err: TransportError) -> AttachError {
        self.clear_transport();
        AttachError::Transport(err)
    }

    fn clear_transport(&self) {
        if let Some(transport) = self.transport.lock().take() {
            transport.shutdown();
        }
    }

    /// One coalesced render pass: diff, assign the next sequence, record to
    /// history, write to the transport if attached.
    async fn render_once(&self) {
        if self.is_closed() {
            return;
        }
        let rendered = catch_unwind(AssertUnwindSafe(|| self.owner.render()));
        let payload = match rendered {
            Ok(Ok(Some(payload))) => payload,
            Ok(Ok(None)) => return,
            Ok(Err(err)) => {
                warn!(
                    target: "riptide::session",
                    session = %self.id,
                    error = %err,
                    "render failed"
                );
                return;
            }
            Err(payload) => {
                error!(
                    target: "riptide::session",
                    session = %self.id,
                    panic = %panic_message(payload.as_ref()),
                    "render panicked"
                );
                return;
            }
        };
        let seq = self.seq.fetch_add(1, Ordering::AcqRel) + 1;
        let frame = self.codec.encode(&OutboundFrame::Patch { seq, payload });
        self.history.add(seq, &frame);
        let attached = matches!(self.phase(), Phase::Active);
        let transport = if attached { self.transport.lock().clone() } else { None };
        let Some(transport) = transport else {
            trace!(target: "riptide::session", session = %self.id, seq, "patch buffered while detached");
            return;
        };
        match self.write_frame(&transport, &frame).await {
            Ok(()) => {
                trace!(target: "riptide::session", session = %self.id, seq, bytes = frame.len(), "patch sent");
            }
            Err(err) => {
                warn!(
                    target: "riptide::session",
                    session = %self.id,
                    seq,
                    error = %err,
                    "patch write failed"
                );
                let reason = match err {
                    TransportError::Timeout => DetachReason::WriteTimeout,
                    _ => DetachReason::WriteFailed,
                };
                self.detach(reason);
            }
        }
    }

    async fn write_frame(
        &self,
        transport: &Arc<dyn Transport>,
        bytes: &[u8],
    ) -> Result<(), TransportError> {
        match timeout(self.tuning.write_timeout, transport.send(bytes)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    fn run_handler(&self, event: EventFrame) {
        self.touch();
        let ctx = EventContext::new(self);
        let result = catch_unwind(AssertUnwindSafe(|| self.owner.handle_event(&event, &ctx)));
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(
                    target: "riptide::session",
                    session = %self.id,
                    handler = %event.handler,
                    event = %event.name,
                    error = %err,
                    "event handler failed"
                );
            }
            Err(payload) => {
                error!(
                    target: "riptide::session",
                    session = %self.id,
                    handler = %event.handler,
                    event = %event.name,
                    panic = %panic_message(payload.as_ref()),
                    backtrace = %std::backtrace::Backtrace::force_capture(),
                    "event handler panicked"
                );
            }
        }
    }

    fn run_job(&self, job: DispatchJob) {
        let ctx = EventContext::new(self);
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| job(&ctx))) {
            error!(
                target: "riptide::session",
                session = %self.id,
                panic = %panic_message(payload.as_ref()),
                "scheduled job panicked"
            );
        }
    }

    async fn ingest_event(&self, event: EventFrame, transport: &Arc<dyn Transport>) {
        self.touch();
        match self.offer_event(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                let dropped = self.event_drops.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    target: "riptide::session",
                    session = %self.id,
                    handler = %event.handler,
                    event = %event.name,
                    dropped,
                    "event queue full, dropping event"
                );
                if self.limiter.allow() {
                    let frame = self.codec.encode(&OutboundFrame::Error(ErrorFrame::new(
                        ErrorCode::EventQueueFull,
                        "event queue full, retry shortly",
                    )));
                    let _ = self.write_frame(transport, &frame).await;
                }
            }
            // Session is closing; nothing useful to tell the client.
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    fn spawn_read_loop(self: &Arc<Self>, transport: Arc<dyn Transport>, epoch: u64) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let bytes = match transport.recv().await {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        debug!(
                            target: "riptide::session",
                            session = %session.id,
                            error = %err,
                            "transport read ended"
                        );
                        session.detach_if_epoch(epoch, DetachReason::ReadFailed);
                        break;
                    }
                };
                if session.epoch() != epoch {
                    break; // superseded by a newer transport
                }
                match session.codec.decode(&bytes) {
                    Ok(InboundFrame::Event(event)) => {
                        session.ingest_event(event, &transport).await;
                    }
                    Ok(InboundFrame::Ping) => {
                        session.touch();
                        let pong = session.codec.encode(&OutboundFrame::Pong);
                        let _ = session.write_frame(&transport, &pong).await;
                    }
                    Ok(InboundFrame::Pong) => session.touch(),
                    Ok(InboundFrame::Handshake(_)) => {
                        warn!(
                            target: "riptide::session",
                            session = %session.id,
                            op = "read",
                            "handshake frame on established connection"
                        );
                        session.detach_if_epoch(epoch, DetachReason::Protocol);
                        break;
                    }
                    Err(err) => {
                        warn!(
                            target: "riptide::session",
                            session = %session.id,
                            op = "decode",
                            error = %err,
                            "malformed frame"
                        );
                        session.detach_if_epoch(epoch, DetachReason::Protocol);
                        break;
                    }
                }
            }
            trace!(target: "riptide::session", session = %session.id, "read loop stopped");
        });
    }
}

async fn dispatch_loop(
    session: Arc<Session>,
    mut event_rx: mpsc::Receiver<EventFrame>,
    mut dispatch_rx: mpsc::Receiver<DispatchJob>,
) {
    loop {
        tokio::select! {
            biased;
            maybe_event = event_rx.recv() => match maybe_event {
                Some(event) => session.run_handler(event),
                None => break,
            },
            maybe_job = dispatch_rx.recv() => match maybe_job {
                Some(job) => session.run_job(job),
                None => break,
            },
        }
    }
    trace!(target: "riptide::session", session = %session.id, "dispatch worker stopped");
}

async fn writer_loop(
    session: Arc<Session>,
    mut writer_rx: mpsc::Receiver<WriterCommand>,
    mut render_rx: mpsc::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            command = writer_rx.recv() => match command {
                Some(WriterCommand::Bind { transport, last_ack, ack }) => {
                    let result = session.bind(transport, last_ack).await;
                    let _ = ack.send(result);
                }
                None => break,
            },
            signal = render_rx.recv() => match signal {
                Some(()) => session.render_once().await,
                None => break,
            },
        }
    }
    trace!(target: "riptide::session", session = %session.id, "writer stopped");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::frame::ProtocolError;
    use crate::session::{SessionParams, SessionTuning};
    use crate::transport::pair;
    use crate::view::{RootView, ViewError};

    struct SilentView;

    impl RootView for SilentView {
        fn handle_event(
            &self,
            _event: &EventFrame,
            _ctx: &EventContext<'_>,
        ) -> Result<(), ViewError> {
            Ok(())
        }

        fn render(&self) -> Result<Option<Bytes>, ViewError> {
            Ok(None)
        }

        fn resync(&self) {}

        fn memory_usage(&self) -> usize {
            0
        }

        fn dispose(&self) {}
    }

    struct TagCodec;

    impl crate::frame::FrameCodec for TagCodec {
        fn encode(&self, frame: &OutboundFrame) -> Bytes {
            match frame {
                OutboundFrame::Error(err) => Bytes::from(format!("error:{:?}", err.code)),
                OutboundFrame::Patch { seq, .. } => Bytes::from(format!("patch:{seq}")),
                OutboundFrame::HandshakeAck { .. } => Bytes::from_static(b"ack"),
                OutboundFrame::Pong => Bytes::from_static(b"pong"),
            }
        }

        fn decode(&self, _bytes: &[u8]) -> Result<InboundFrame, ProtocolError> {
            Ok(InboundFrame::Ping)
        }
    }

    fn event(name: &str) -> EventFrame {
        EventFrame { handler: "h".into(), name: name.into(), payload: serde_json::Value::Null }
    }

    #[test_timeout::tokio_timeout_test]
    async fn full_queue_sends_rate_limited_error_frame() {
        let (lifecycle_tx, _lifecycle_rx) = mpsc::unbounded_channel();
        let session = Session::new(SessionParams {
            id: "s-backpressure".into(),
            user_id: "u1".into(),
            ip: "127.0.0.1".parse().unwrap(),
            route: "/".into(),
            owner: Arc::new(SilentView),
            codec: Arc::new(TagCodec),
            tuning: SessionTuning {
                event_queue_capacity: 1,
                dispatch_queue_capacity: 1,
                patch_history_capacity: 4,
                write_timeout: Duration::from_millis(200),
                error_frame_interval: Duration::from_millis(60),
            },
            lifecycle: lifecycle_tx,
            restore: None,
        });
        let (client_end, engine_end) = pair(8);
        let engine_end: Arc<dyn Transport> = Arc::new(engine_end);

        // Workers deliberately not started: the first event occupies the
        // queue and everything after it overflows.
        session.ingest_event(event("first"), &engine_end).await;
        assert_eq!(session.event_drops(), 0);

        session.ingest_event(event("second"), &engine_end).await;
        assert_eq!(session.event_drops(), 1);
        let frame = client_end.recv().await.unwrap();
        assert_eq!(&frame[..], b"error:EventQueueFull");

        // Inside the interval the limiter swallows the repeat notice.
        session.ingest_event(event("third"), &engine_end).await;
        assert_eq!(session.event_drops(), 2);
        let quiet = tokio::time::timeout(Duration::from_millis(30), client_end.recv()).await;
        assert!(quiet.is_err(), "unexpected frame during rate-limit interval");

        tokio::time::sleep(Duration::from_millis(60)).await;
        session.ingest_event(event("fourth"), &engine_end).await;
        assert_eq!(session.event_drops(), 3);
        let frame = client_end.recv().await.unwrap();
        assert_eq!(&frame[..], b"error:EventQueueFull");
    }
}
