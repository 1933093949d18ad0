//! services/api/src/web/state.rs
//!
//! Defines the application's shared state.

use crate::config::Config;
use std::sync::Arc;
use waste_ivr_core::flow::CallFlow;
use waste_ivr_core::ports::{PersistenceService, SessionStore};

//=========================================================================================
// AppState (Shared Across All Requests)
//=========================================================================================

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub flow: Arc<CallFlow>,
    pub sessions: Arc<dyn SessionStore>,
    pub persistence: Arc<dyn PersistenceService>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Wires the call flow to the given stores.
    pub fn new(
        config: Arc<Config>,
        sessions: Arc<dyn SessionStore>,
        persistence: Arc<dyn PersistenceService>,
    ) -> Self {
        let flow = Arc::new(CallFlow::new(
            sessions.clone(),
            persistence.clone(),
            config.flow.clone(),
        ));
        Self {
            flow,
            sessions,
            persistence,
            config,
        }
    }
}
