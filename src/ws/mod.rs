pub mod actor;
pub mod broadcast;
pub mod handler;
pub mod protocol;
pub mod registry;

use tokio::sync::mpsc;

/// Sender half of a connection's outbound channel.
/// The registry and broadcaster clone this to push frames to a client; the
/// socket itself stays owned by the connection's actor.
pub type ConnectionSender = mpsc::UnboundedSender<axum::extract::ws::Message>;
