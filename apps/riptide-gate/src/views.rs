//! Demo component tree and the metrics hook.
//!
//! A real deployment registers its own [`ViewFactory`]; the counter here
//! exists so the gate runs end to end out of the box.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use metrics::counter;
use riptide_core::frame::EventFrame;
use riptide_core::session::EventContext;
use riptide_core::view::{RootView, ViewError, ViewFactory};
use riptide_core::{CloseReason, SessionMeta, SessionObserver};
use serde_json::json;
use tracing::debug;

/// One counter, rendered as a full JSON document whenever it changes.
pub struct CounterView {
    count: AtomicI64,
    dirty: AtomicBool,
    baseline_lost: AtomicBool,
}

impl CounterView {
    fn new() -> Self {
        Self {
            count: AtomicI64::new(0),
            dirty: AtomicBool::new(true),
            baseline_lost: AtomicBool::new(true),
        }
    }
}

impl RootView for CounterView {
    fn handle_event(&self, event: &EventFrame, ctx: &EventContext<'_>) -> Result<(), ViewError> {
        let step = event.payload.get("by").and_then(|value| value.as_i64()).unwrap_or(1);
        match event.name.as_str() {
            "increment" => {
                self.count.fetch_add(step, Ordering::SeqCst);
            }
            "decrement" => {
                self.count.fetch_sub(step, Ordering::SeqCst);
            }
            "reset" => self.count.store(0, Ordering::SeqCst),
            other => return Err(ViewError::Handler(format!("no handler for {other}"))),
        }
        ctx.put("count", json!(self.count.load(Ordering::SeqCst)));
        self.dirty.store(true, Ordering::SeqCst);
        ctx.request_render();
        Ok(())
    }

    fn render(&self) -> Result<Option<Bytes>, ViewError> {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(None);
        }
        let full = self.baseline_lost.swap(false, Ordering::SeqCst);
        let doc = json!({
            "view": "counter",
            "count": self.count.load(Ordering::SeqCst),
            "full": full,
        });
        serde_json::to_vec(&doc)
            .map(|raw| Some(Bytes::from(raw)))
            .map_err(|err| ViewError::Render(err.to_string()))
    }

    fn resync(&self) {
        self.baseline_lost.store(true, Ordering::SeqCst);
        self.dirty.store(true, Ordering::SeqCst);
    }

    fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>()
    }

    fn dispose(&self) {}
}

pub struct DemoViews;

impl ViewFactory for DemoViews {
    fn create(&self, route: &str) -> Result<Arc<dyn RootView>, ViewError> {
        match route {
            "/" | "/counter" => Ok(Arc::new(CounterView::new())),
            other => Err(ViewError::UnknownRoute { route: other.to_string() }),
        }
    }
}

/// Feeds session lifecycle into the Prometheus recorder.
pub struct MetricsObserver;

impl SessionObserver for MetricsObserver {
    fn on_created(&self, meta: &SessionMeta) {
        counter!("riptide_gate_sessions_created_total", 1);
        debug!(
            target: "riptide::gate",
            session_id = %meta.id,
            user_id = %meta.user_id,
            "session created"
        );
    }

    fn on_closed(&self, meta: &SessionMeta, reason: CloseReason) {
        counter!("riptide_gate_sessions_closed_total", 1, "reason" => close_label(reason));
        debug!(target: "riptide::gate", session_id = %meta.id, ?reason, "session closed");
    }
}

fn close_label(reason: CloseReason) -> &'static str {
    match reason {
        CloseReason::Requested => "requested",
        CloseReason::IdleTimeout => "idle_timeout",
        CloseReason::ResumeWindowElapsed => "resume_window",
        CloseReason::MemoryPressure => "memory_pressure",
        CloseReason::IpLimit => "ip_limit",
        CloseReason::Lru => "lru",
        CloseReason::Shutdown => "shutdown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use riptide_core::transport::{pair, Transport};
    use riptide_core::{ConnectKind, ConnectRequest, EngineConfig, SessionManager};
    use serde_json::Value;

    #[test_timeout::timeout]
    fn unknown_routes_are_rejected() {
        match DemoViews.create("/missing") {
            Err(ViewError::UnknownRoute { route }) => assert_eq!(route, "/missing"),
            other => panic!("expected unknown route, got {:?}", other.map(|_| "view")),
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn counter_streams_patches_end_to_end() {
        let manager = SessionManager::new(
            EngineConfig::default(),
            Arc::new(DemoViews),
            Arc::new(JsonCodec::new()),
            None,
        );
        let (client, server) = pair(32);
        let connected = manager
            .connect(ConnectRequest {
                resume: None,
                user_id: "alice".into(),
                ip: "127.0.0.1".parse().unwrap(),
                route: "/counter".into(),
                transport: Arc::new(server),
            })
            .await
            .unwrap();
        assert_eq!(connected.kind, ConnectKind::Created);

        let ack: Value = serde_json::from_slice(&client.recv().await.unwrap()).unwrap();
        assert_eq!(ack["type"], "handshake_ack");
        assert_eq!(ack["resumed"], false);

        let patch: Value = serde_json::from_slice(&client.recv().await.unwrap()).unwrap();
        assert_eq!(patch["seq"], 1);
        assert_eq!(patch["payload"]["count"], 0);
        assert_eq!(patch["payload"]["full"], true);

        client
            .send(br#"{"type":"event","handler":"counter","name":"increment","payload":{"by":5}}"#)
            .await
            .unwrap();
        let patch: Value = serde_json::from_slice(&client.recv().await.unwrap()).unwrap();
        assert_eq!(patch["seq"], 2);
        assert_eq!(patch["payload"]["count"], 5);
        assert_eq!(patch["payload"]["full"], false);

        // An unknown event name fails its handler; nothing renders for it.
        client
            .send(br#"{"type":"event","handler":"counter","name":"explode"}"#)
            .await
            .unwrap();
        client
            .send(br#"{"type":"event","handler":"counter","name":"decrement"}"#)
            .await
            .unwrap();
        let patch: Value = serde_json::from_slice(&client.recv().await.unwrap()).unwrap();
        assert_eq!(patch["seq"], 3);
        assert_eq!(patch["payload"]["count"], 4);

        connected.session.close(CloseReason::Requested);
    }
}
