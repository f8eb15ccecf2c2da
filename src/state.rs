//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::auth::Authenticator;
use crate::config::Config;
use crate::connect::Orchestrator;

/// Shared application state for the jumpgate server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Admits, drives and tears down every proxied session.
    pub orchestrator: Arc<Orchestrator>,
    pub auth: Arc<Authenticator>,
}
