//! WebSocket endpoint: upgrade, read loop, writer task, heartbeat.
//!
//! Each accepted socket gets three tasks: the read loop (this task)
//! which pins the framing on the first frame and routes messages in
//! arrival order, a writer draining the connection's queue so the
//! socket is only ever written from one place, and a heartbeat that
//! pings on the configured interval and closes connections whose last
//! activity is older than the timeout. Whichever exits first wins;
//! teardown then runs exactly once.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::{
    Connection, OutboundFrame, CLOSE_POLICY_VIOLATION, CLOSE_PROTOCOL_ERROR,
};
use crate::protocol::codec;
use crate::protocol::{Message, MessageBody, PingPayload};
use crate::server::AppState;
use crate::util::{new_connection_id, now_ms};

/// `GET /ws` — the single wire endpoint. Non-WebSocket requests are
/// rejected by the upgrade extractor with a 400-class response.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let context = state.context();
    ws.on_upgrade(move |socket| handle_socket(socket, context))
}

async fn handle_socket(socket: WebSocket, context: Arc<crate::server::ServerContext>) {
    // Bound concurrent handshakes when configured.
    let permit = match &context.accept_semaphore {
        Some(semaphore) => semaphore.clone().acquire_owned().await.ok(),
        None => None,
    };

    let cancel = context.shutdown.child_token();
    let (connection, outbound_rx) = Connection::new(
        new_connection_id(),
        context.config.outbound_queue_size,
        cancel.clone(),
    );

    if context
        .coordinator
        .registry()
        .register(connection.clone())
        .is_err()
    {
        warn!(connection = %connection.id(), "connection cap reached, rejecting socket");
        let (mut sink, _) = socket.split();
        let _ = sink
            .send(WsMessage::Close(Some(CloseFrame {
                code: CLOSE_POLICY_VIOLATION,
                reason: "connection limit reached".into(),
            })))
            .await;
        return;
    }
    drop(permit);

    info!(connection = %connection.id(), "connection accepted");

    let (sink, stream) = socket.split();

    let writer = tokio::spawn(writer_task(sink, outbound_rx, cancel.clone()));
    let heartbeat = tokio::spawn(heartbeat_task(connection.clone(), context.clone()));

    read_loop(stream, &connection, &context).await;

    context.coordinator.teardown_connection(&connection).await;
    heartbeat.abort();
    // The writer finishes on its own once the queue closes or the
    // cancel token fires; give it a moment to flush the close frame.
    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), writer).await;

    info!(connection = %connection.id(), "connection closed");
}

// ---------------------------------------------------------------------------
// Read loop
// ---------------------------------------------------------------------------

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    connection: &Arc<Connection>,
    context: &Arc<crate::server::ServerContext>,
) {
    loop {
        let received = tokio::select! {
            _ = connection.cancel_token().cancelled() => return,
            received = stream.next() => received,
        };

        let ws_message = match received {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                debug!(connection = %connection.id(), error = %e, "socket read error");
                return;
            }
            None => return,
        };

        match ws_message {
            WsMessage::Binary(bytes) => {
                if !process_frame(connection, context, &bytes).await {
                    return;
                }
            }
            WsMessage::Text(text) => {
                if !process_frame(connection, context, text.as_bytes()).await {
                    return;
                }
            }
            WsMessage::Close(_) => {
                debug!(connection = %connection.id(), "peer sent close frame");
                return;
            }
            // Transport-level ping/pong (axum answers pings itself).
            WsMessage::Ping(_) | WsMessage::Pong(_) => {
                connection.touch();
            }
        }
    }
}

/// Decode one frame and route it. Returns false when the connection
/// must close (framing corruption).
async fn process_frame(
    connection: &Arc<Connection>,
    context: &Arc<crate::server::ServerContext>,
    bytes: &[u8],
) -> bool {
    let protocol = match connection.protocol() {
        Some(pinned) => pinned,
        None => match codec::detect(bytes) {
            Ok(detected) => {
                debug!(connection = %connection.id(), protocol = ?detected, "framing pinned");
                connection.pin_protocol(detected)
            }
            Err(e) => {
                warn!(connection = %connection.id(), error = %e, "unrecognized first frame");
                connection.close(CLOSE_PROTOCOL_ERROR, "unrecognized framing");
                return false;
            }
        },
    };

    match codec::decode(bytes, protocol) {
        Ok(message) => {
            context.router.route(connection, message).await;
            true
        }
        Err(e) if e.is_fatal() => {
            warn!(connection = %connection.id(), error = %e, "framing corruption");
            connection.close(CLOSE_PROTOCOL_ERROR, &e.to_string());
            false
        }
        Err(e) => {
            // Recoverable: unknown type or malformed payload. Tell the
            // peer, keep the connection.
            debug!(connection = %connection.id(), error = %e, "dropping undecodable frame");
            let reply = Message::error("protocol_error", e.to_string());
            let _ = connection.send(&reply);
            true
        }
    }
}

// ---------------------------------------------------------------------------
// Writer task
// ---------------------------------------------------------------------------

async fn writer_task(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut outbound: mpsc::Receiver<OutboundFrame>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            frame = outbound.recv() => frame,
            _ = cancel.cancelled() => {
                // Drain whatever was queued before the cancel (the
                // close frame in particular), then stop.
                while let Ok(frame) = outbound.try_recv() {
                    if write_frame(&mut sink, frame).await.is_err() {
                        return;
                    }
                }
                let _ = sink.flush().await;
                return;
            }
        };

        match frame {
            Some(frame) => {
                let closing = matches!(frame, OutboundFrame::Close { .. });
                if write_frame(&mut sink, frame).await.is_err() || closing {
                    return;
                }
            }
            None => return,
        }
    }
}

async fn write_frame(
    sink: &mut SplitSink<WebSocket, WsMessage>,
    frame: OutboundFrame,
) -> Result<(), axum::Error> {
    let message = match frame {
        OutboundFrame::Binary(bytes) => WsMessage::Binary(bytes.into()),
        OutboundFrame::Text(text) => WsMessage::Text(text.into()),
        OutboundFrame::Close { code, reason } => WsMessage::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })),
    };
    sink.send(message).await
}

// ---------------------------------------------------------------------------
// Heartbeat task
// ---------------------------------------------------------------------------

async fn heartbeat_task(connection: Arc<Connection>, context: Arc<crate::server::ServerContext>) {
    let timeout_ms = context.config.heartbeat_timeout.as_millis() as i64;
    let mut ticker = tokio::time::interval(context.config.heartbeat_interval);
    // The first tick fires immediately; skip it so a fresh connection
    // is not pinged before it spoke.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = connection.cancel_token().cancelled() => return,
            _ = ticker.tick() => {
                let idle_ms = now_ms() - connection.last_activity();
                if idle_ms > timeout_ms {
                    info!(
                        connection = %connection.id(),
                        idle_ms,
                        "heartbeat timeout, closing connection"
                    );
                    connection.close(super::connection::CLOSE_GOING_AWAY, "heartbeat timeout");
                    return;
                }
                // Framing is only known after the first inbound frame;
                // until then the idle check above is the watchdog.
                if connection.protocol().is_some() {
                    let ping = Message::new(MessageBody::Ping(PingPayload {}));
                    if connection.send(&ping).is_err() {
                        return;
                    }
                }
            }
        }
    }
}
