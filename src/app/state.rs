//! Application state shared across routes

use std::sync::Arc;

use crate::config::Config;
use crate::state::ClientStateManager;

/// Shared application state, generic over the persistence gateway so the
/// routes can be exercised against the in-memory store.
pub struct AppState<G> {
    pub config: Arc<Config>,
    pub manager: Arc<ClientStateManager<G>>,
}

impl<G> AppState<G> {
    pub fn new(config: Config, manager: Arc<ClientStateManager<G>>) -> Self {
        Self {
            config: Arc::new(config),
            manager,
        }
    }
}

impl<G> Clone for AppState<G> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            manager: self.manager.clone(),
        }
    }
}
