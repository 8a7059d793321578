//! WebSocket bridge between browser clients and the session engine.
//!
//! The gate owns the handshake (deadline, decode, CSRF) and then gets out
//! of the way: raw frames are pumped between the socket and the session's
//! transport, and the engine does all interpretation.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::response::Response;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use riptide_core::frame::{ErrorCode, ErrorFrame, FrameCodec, InboundFrame, OutboundFrame};
use riptide_core::manager::{AdmissionError, ConnectError};
use riptide_core::transport::{pair, Transport};
use riptide_core::view::ViewError;
use riptide_core::{ConnectKind, ConnectRequest, ResumeClaim};
use tracing::{debug, info, warn};

use crate::handlers::GateState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<GateState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
}

async fn handle_socket(socket: WebSocket, state: GateState, addr: SocketAddr) {
    let (mut sender, mut receiver) = socket.split();

    // The first frame must be a handshake, and it must arrive promptly.
    let raw = match tokio::time::timeout(state.config.handshake_timeout, next_frame(&mut receiver))
        .await
    {
        Ok(Some(raw)) => raw,
        Ok(None) => return,
        Err(_) => {
            debug!(target: "riptide::gate", %addr, "handshake deadline elapsed");
            return;
        }
    };
    let handshake = match state.codec.decode(&raw) {
        Ok(InboundFrame::Handshake(handshake)) => handshake,
        Ok(_) | Err(_) => {
            reject(&mut sender, &state, ErrorCode::InvalidHandshake, "expected a handshake frame")
                .await;
            return;
        }
    };
    let user_id = match state.csrf.verify(&handshake.csrf) {
        Ok(user_id) => user_id,
        Err(err) => {
            debug!(target: "riptide::gate", %addr, error = %err, "csrf rejected");
            reject(&mut sender, &state, ErrorCode::InvalidCsrf, "csrf verification failed").await;
            return;
        }
    };

    // Bridge before connecting: attach replays history through the
    // transport, and nothing drains it until the pump is running.
    let (socket_end, engine_end) = pair(state.config.transport_buffer);
    let socket_end = Arc::new(socket_end);
    let engine_end = Arc::new(engine_end);

    let pump_end = socket_end.clone();
    let mut pump = tokio::spawn(async move {
        while let Ok(frame) = pump_end.recv().await {
            let message = match std::str::from_utf8(&frame) {
                Ok(text) => Message::Text(text.to_string()),
                Err(_) => Message::Binary(frame.to_vec()),
            };
            if sender.send(message).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let request = ConnectRequest {
        resume: handshake.session_id.map(|session_id| ResumeClaim {
            session_id,
            last_ack: handshake.last_ack,
        }),
        user_id,
        ip: addr.ip(),
        route: handshake.route,
        transport: engine_end.clone() as Arc<dyn Transport>,
    };
    let connected = match state.manager.connect(request).await {
        Ok(connected) => connected,
        Err(err) => {
            warn!(target: "riptide::gate", %addr, error = %err, "connect rejected");
            let (code, message) = describe(&err);
            counter!("riptide_gate_rejects_total", 1, "code" => code_label(code));
            let frame =
                state.codec.encode(&OutboundFrame::Error(ErrorFrame::new(code, message)));
            let _ = engine_end.send(&frame).await;
            // Dropping the engine end lets the pump drain the buffered
            // error before it closes the socket.
            return;
        }
    };
    counter!("riptide_gate_connects_total", 1, "kind" => kind_label(connected.kind));
    info!(
        target: "riptide::gate",
        session_id = %connected.session.id(),
        %addr,
        kind = ?connected.kind,
        base_seq = connected.base_seq,
        "client connected"
    );

    loop {
        tokio::select! {
            message = receiver.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if socket_end.send(text.as_bytes()).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if socket_end.send(&data).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                // axum answers protocol-level pings itself.
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(target: "riptide::gate", %addr, error = %err, "socket error");
                    break;
                }
            },
            _ = &mut pump => break,
        }
    }

    socket_end.shutdown();
    pump.abort();
    debug!(target: "riptide::gate", session_id = %connected.session.id(), "socket closed");
}

async fn next_frame(receiver: &mut SplitStream<WebSocket>) -> Option<Vec<u8>> {
    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => return Some(text.into_bytes()),
            Ok(Message::Binary(data)) => return Some(data),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

async fn reject(
    sender: &mut SplitSink<WebSocket, Message>,
    state: &GateState,
    code: ErrorCode,
    message: &str,
) {
    counter!("riptide_gate_rejects_total", 1, "code" => code_label(code));
    let frame = state.codec.encode(&OutboundFrame::Error(ErrorFrame::new(code, message)));
    if let Ok(text) = String::from_utf8(frame.to_vec()) {
        let _ = sender.send(Message::Text(text)).await;
    }
    let _ = sender.close().await;
}

fn describe(err: &ConnectError) -> (ErrorCode, String) {
    match err {
        ConnectError::Admission(AdmissionError::MaxSessionsReached) => {
            (ErrorCode::ServerBusy, "session limit reached".into())
        }
        ConnectError::Admission(AdmissionError::TooManySessionsFromIp { .. }) => {
            (ErrorCode::TooManySessions, "too many sessions from this address".into())
        }
        ConnectError::Admission(AdmissionError::ShuttingDown) => {
            (ErrorCode::ServerBusy, "server is shutting down".into())
        }
        ConnectError::View(ViewError::UnknownRoute { route }) => {
            (ErrorCode::InvalidHandshake, format!("unknown route {route}"))
        }
        ConnectError::Store(_) | ConnectError::View(_) | ConnectError::Attach(_) => {
            (ErrorCode::Internal, "internal error".into())
        }
    }
}

fn kind_label(kind: ConnectKind) -> &'static str {
    match kind {
        ConnectKind::Created => "created",
        ConnectKind::Resumed { .. } => "resumed",
        ConnectKind::Resynced => "resynced",
        ConnectKind::Restored => "restored",
    }
}

fn code_label(code: ErrorCode) -> &'static str {
    match code {
        ErrorCode::InvalidHandshake => "invalid_handshake",
        ErrorCode::InvalidCsrf => "invalid_csrf",
        ErrorCode::ServerBusy => "server_busy",
        ErrorCode::TooManySessions => "too_many_sessions",
        ErrorCode::NotAuthorized => "not_authorized",
        ErrorCode::EventQueueFull => "event_queue_full",
        ErrorCode::Internal => "internal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn connect_errors_map_to_wire_codes() {
        let (code, _) = describe(&ConnectError::Admission(AdmissionError::MaxSessionsReached));
        assert_eq!(code, ErrorCode::ServerBusy);

        let (code, _) = describe(&ConnectError::Admission(
            AdmissionError::TooManySessionsFromIp { ip: "10.0.0.1".parse().unwrap() },
        ));
        assert_eq!(code, ErrorCode::TooManySessions);

        let (code, message) =
            describe(&ConnectError::View(ViewError::UnknownRoute { route: "/nope".into() }));
        assert_eq!(code, ErrorCode::InvalidHandshake);
        assert!(message.contains("/nope"));

        let (code, _) = describe(&ConnectError::Admission(AdmissionError::ShuttingDown));
        assert_eq!(code, ErrorCode::ServerBusy);
    }

    #[test_timeout::timeout]
    fn labels_cover_every_connect_kind() {
        assert_eq!(kind_label(ConnectKind::Created), "created");
        assert_eq!(kind_label(ConnectKind::Resumed { replayed: 3 }), "resumed");
        assert_eq!(kind_label(ConnectKind::Resynced), "resynced");
        assert_eq!(kind_label(ConnectKind::Restored), "restored");
    }
}
