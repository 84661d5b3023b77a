//! Shared runtime state for esn-daemon.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum. The store, queue, and
//! clock are trait objects so the scenario tests in `tests/` run the router
//! against the in-memory testkit backends.

use std::sync::Arc;

use esn_db::StateStore;
use esn_queue::JobQueue;
use esn_schemas::Clock;

/// Static build metadata included in health / status responses.
#[derive(Clone, Debug)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

/// Cloneable (Arc) handle shared across all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn StateStore>,
    pub queue: Arc<dyn JobQueue>,
    pub clock: Arc<dyn Clock>,
    pub build: BuildInfo,
    /// Bearer token required by the /admin routes. None disables the
    /// administrative surface entirely (fail closed).
    pub admin_token: Option<String>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn StateStore>,
        queue: Arc<dyn JobQueue>,
        clock: Arc<dyn Clock>,
        admin_token: Option<String>,
    ) -> Self {
        Self {
            store,
            queue,
            clock,
            build: BuildInfo {
                service: "esn-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            admin_token,
        }
    }
}
