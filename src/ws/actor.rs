//! Per-connection lifecycle: authenticate, relay, clean up.
//!
//! Each accepted socket gets one actor. The socket splits into a reader
//! half driven here and a writer task fed by an mpsc channel; the registry
//! and broadcaster only ever hold clones of the channel sender, so no other
//! component can block on or close this connection's transport.

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::sync::mpsc;
use tokio::time::{timeout, timeout_at, Instant};

use crate::state::AppState;
use crate::ws::broadcast::{broadcast_to_event, send_to_connection};
use crate::ws::protocol::{self, codes, ClientMessage, DecodeError, ServerMessage};
use crate::ws::registry::{ConnId, Member, RegistryError};
use crate::ws::ConnectionSender;

/// Close code sent to a connection displaced by a newer join for its user.
const CLOSE_REPLACED: u16 = 4000;
/// Close code for server-initiated closes (leave, violations, timeout).
const CLOSE_NORMAL: u16 = 1000;

/// Grace period for the writer to flush queued frames after the reader exits.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Identity a connection holds once its join has been accepted.
#[derive(Debug, Clone)]
struct Session {
    user_id: String,
    event_id: i64,
}

/// Run one connection from accept to close.
pub async fn run_connection(socket: WebSocket, state: AppState, peer: SocketAddr) {
    let conn_id = ConnId::next();
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();

    let mut writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    tracing::info!(%peer, %conn_id, "connection accepted");

    if let Some(session) = authenticate(&mut ws_receiver, &tx, &state, conn_id).await {
        tracing::info!(
            %peer,
            %conn_id,
            user_id = %session.user_id,
            event_id = session.event_id,
            "participant joined event"
        );
        relay_loop(&mut ws_receiver, &tx, &state, conn_id, &session).await;
    }

    // Converging cleanup: explicit leave, transport close, auth timeout and
    // protocol violations all end here. Registry.leave is idempotent, so a
    // connection that already left deregisters nothing and notifies no one.
    if let Some(member) = state.registry.leave(conn_id) {
        broadcast_to_event(
            &state.registry,
            member.event_id,
            &ServerMessage::UserLeft {
                user_id: member.user_id.clone(),
            },
            Some(conn_id),
        );
        tracing::info!(
            %conn_id,
            user_id = %member.user_id,
            event_id = member.event_id,
            "participant disconnected"
        );
    }

    // Let the writer drain queued replies and close frames; a peer that
    // stopped reading is cut off after the grace period.
    drop(tx);
    if timeout(WRITER_DRAIN_TIMEOUT, &mut writer_handle).await.is_err() {
        writer_handle.abort();
    }
    tracing::debug!(%peer, %conn_id, "connection closed");
}

/// Drive the unauthenticated phase: wait, bounded by the auth timeout, for
/// a first message that must be a valid `join_event`.
async fn authenticate(
    ws_receiver: &mut SplitStream<WebSocket>,
    tx: &ConnectionSender,
    state: &AppState,
    conn_id: ConnId,
) -> Option<Session> {
    let deadline = Instant::now() + state.auth_timeout;

    loop {
        let frame = match timeout_at(deadline, ws_receiver.next()).await {
            Err(_) => {
                tracing::warn!(%conn_id, "no join_event before the auth timeout");
                reply_error(tx, codes::AUTH_TIMEOUT, "No join_event received in time");
                close(tx);
                return None;
            }
            Ok(None) => return None,
            Ok(Some(Err(err))) => {
                tracing::warn!(%conn_id, error = %err, "transport error before join");
                return None;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        let text = match frame {
            Message::Text(text) => text,
            Message::Ping(data) => {
                let _ = tx.send(Message::Pong(data));
                continue;
            }
            Message::Pong(_) => continue,
            Message::Close(_) => return None,
            Message::Binary(_) => {
                reply_error(tx, codes::INVALID_MESSAGE_FORMAT, "Expected a text frame");
                close(tx);
                return None;
            }
        };

        return match protocol::decode(&text) {
            Ok(ClientMessage::JoinEvent { user_id, event_id }) => {
                join(tx, state, conn_id, user_id, event_id)
            }
            Ok(_) => {
                reply_error(
                    tx,
                    codes::INVALID_MESSAGE_TYPE,
                    "First message must be join_event",
                );
                close(tx);
                None
            }
            Err(err) => {
                let code = match &err {
                    DecodeError::Malformed(_) => codes::INVALID_JSON,
                    DecodeError::InvalidShape {
                        message_type: Some("join_event"),
                    } => codes::MISSING_FIELDS,
                    DecodeError::InvalidShape {
                        message_type: Some(_),
                    } => codes::INVALID_MESSAGE_TYPE,
                    DecodeError::InvalidShape { message_type: None } => {
                        codes::INVALID_MESSAGE_FORMAT
                    }
                    DecodeError::UnknownType(_) => codes::INVALID_MESSAGE_TYPE,
                };
                tracing::warn!(%conn_id, error = %err, "rejecting pre-join frame");
                reply_error(tx, code, "First message must be a valid join_event");
                close(tx);
                None
            }
        };
    }
}

/// Apply a validated join: register, handle user eviction, reply
/// `join_success`.
fn join(
    tx: &ConnectionSender,
    state: &AppState,
    conn_id: ConnId,
    user_id: String,
    event_id: i64,
) -> Option<Session> {
    let evicted = match state.registry.join(conn_id, &user_id, event_id, tx.clone()) {
        Ok(evicted) => evicted,
        Err(RegistryError::AlreadyJoined) => {
            // The handler believed this connection was unauthenticated, so
            // a registered entry for it means handler and registry disagree.
            tracing::error!(
                %conn_id,
                user_id = %user_id,
                "registry refused join for an unauthenticated connection"
            );
            reply_error(tx, codes::INTERNAL_ERROR, "Internal error");
            close(tx);
            return None;
        }
    };

    if let Some(prior) = evicted {
        evict(state, &prior, event_id);
    }

    send_to_connection(
        tx,
        &ServerMessage::JoinSuccess {
            user_id: user_id.clone(),
            event_id,
            message: format!("Successfully joined event {event_id}"),
        },
    );

    Some(Session { user_id, event_id })
}

/// Close a connection displaced by a newer join for the same user. A prior
/// connection in a different room is announced as having left that room; a
/// same-room replacement stays silent.
fn evict(state: &AppState, prior: &Member, new_event_id: i64) {
    tracing::info!(
        conn_id = %prior.conn_id,
        user_id = %prior.user_id,
        event_id = prior.event_id,
        "evicting prior connection after duplicate join"
    );
    let _ = prior.sender.send(Message::Close(Some(CloseFrame {
        code: CLOSE_REPLACED,
        reason: "Replaced by a newer connection".into(),
    })));

    if prior.event_id != new_event_id {
        broadcast_to_event(
            &state.registry,
            prior.event_id,
            &ServerMessage::UserLeft {
                user_id: prior.user_id.clone(),
            },
            Some(prior.conn_id),
        );
    }
}

/// Pump messages for a joined connection until it leaves or the transport
/// goes away.
async fn relay_loop(
    ws_receiver: &mut SplitStream<WebSocket>,
    tx: &ConnectionSender,
    state: &AppState,
    conn_id: ConnId,
    session: &Session,
) {
    loop {
        let frame = match ws_receiver.next().await {
            None => return,
            Some(Err(err)) => {
                tracing::warn!(
                    %conn_id,
                    user_id = %session.user_id,
                    error = %err,
                    "transport error"
                );
                return;
            }
            Some(Ok(frame)) => frame,
        };

        let text = match frame {
            Message::Text(text) => text,
            Message::Ping(data) => {
                let _ = tx.send(Message::Pong(data));
                continue;
            }
            Message::Pong(_) => continue,
            Message::Close(frame) => {
                tracing::debug!(
                    %conn_id,
                    user_id = %session.user_id,
                    reason = ?frame,
                    "client initiated close"
                );
                return;
            }
            Message::Binary(_) => {
                reply_error(tx, codes::INVALID_MESSAGE_FORMAT, "Expected a text frame");
                close(tx);
                return;
            }
        };

        match protocol::decode(&text) {
            Ok(ClientMessage::ShareLocation {
                latitude,
                longitude,
                timestamp,
                username,
            }) => {
                broadcast_to_event(
                    &state.registry,
                    session.event_id,
                    &ServerMessage::LocationUpdate {
                        user_id: session.user_id.clone(),
                        username,
                        latitude,
                        longitude,
                        timestamp,
                    },
                    Some(conn_id),
                );
            }
            Ok(ClientMessage::LeaveEvent) => {
                leave(state, conn_id);
                close(tx);
                return;
            }
            Ok(ClientMessage::JoinEvent { .. }) => {
                reply_error(
                    tx,
                    codes::INVALID_MESSAGE_TYPE,
                    "Already joined; open a new connection to rejoin",
                );
                close(tx);
                return;
            }
            // A malformed location update is answered but not fatal.
            Err(DecodeError::InvalidShape {
                message_type: Some("share_location"),
            }) => {
                reply_error(
                    tx,
                    codes::INVALID_MESSAGE_TYPE,
                    "Malformed share_location payload",
                );
            }
            Err(err) => {
                let code = match &err {
                    DecodeError::Malformed(_) => codes::INVALID_JSON,
                    DecodeError::InvalidShape {
                        message_type: Some(_),
                    } => codes::INVALID_MESSAGE_TYPE,
                    DecodeError::InvalidShape { message_type: None } => {
                        codes::INVALID_MESSAGE_FORMAT
                    }
                    DecodeError::UnknownType(_) => codes::INVALID_MESSAGE_TYPE,
                };
                tracing::warn!(
                    %conn_id,
                    user_id = %session.user_id,
                    error = %err,
                    "closing after bad frame"
                );
                reply_error(tx, code, "Invalid message");
                close(tx);
                return;
            }
        }
    }
}

/// Explicit leave: deregister and tell the room. The converging cleanup in
/// `run_connection` then finds nothing left to do.
fn leave(state: &AppState, conn_id: ConnId) {
    if let Some(member) = state.registry.leave(conn_id) {
        tracing::info!(
            %conn_id,
            user_id = %member.user_id,
            event_id = member.event_id,
            "participant left event"
        );
        broadcast_to_event(
            &state.registry,
            member.event_id,
            &ServerMessage::UserLeft {
                user_id: member.user_id.clone(),
            },
            Some(conn_id),
        );
    }
}

/// Writer task: receives frames from the mpsc channel and forwards them to
/// the WebSocket sink.
async fn writer_task(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(frame) = rx.recv().await {
        if ws_sender.send(frame).await.is_err() {
            // Send failed, the connection is broken.
            break;
        }
    }
}

fn reply_error(tx: &ConnectionSender, code: &str, message: &str) {
    send_to_connection(
        tx,
        &ServerMessage::Error {
            code: code.to_string(),
            message: message.to_string(),
        },
    );
}

fn close(tx: &ConnectionSender) {
    let _ = tx.send(Message::Close(Some(CloseFrame {
        code: CLOSE_NORMAL,
        reason: "".into(),
    })));
}
