//! Room fan-out for server messages.

use axum::extract::ws::Message;

use super::protocol::ServerMessage;
use super::registry::{ConnId, ConnectionRegistry};
use super::ConnectionSender;

/// Send a message to every connection joined to `event_id`, except
/// `exclude`. A member whose writer is already gone is skipped; its own
/// lifecycle cleanup removes the stale entry, never the broadcaster.
pub fn broadcast_to_event(
    registry: &ConnectionRegistry,
    event_id: i64,
    message: &ServerMessage,
    exclude: Option<ConnId>,
) {
    let frame = Message::Text(message.to_frame().into());

    for member in registry.members_of(event_id) {
        if exclude == Some(member.conn_id) {
            continue;
        }
        let _ = member.sender.send(frame.clone());
    }
}

/// Push one message to a single connection.
pub fn send_to_connection(sender: &ConnectionSender, message: &ServerMessage) {
    let _ = sender.send(Message::Text(message.to_frame().into()));
}
