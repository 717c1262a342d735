use std::sync::Arc;
use std::time::Duration;

use crate::ws::registry::ConnectionRegistry;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// Live connection registry: who is joined to which event
    pub registry: Arc<ConnectionRegistry>,
    /// How long an accepted connection may stay silent before it must join
    pub auth_timeout: Duration,
}
