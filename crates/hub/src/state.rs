//! Application state shared by every route

use std::sync::Arc;

use crate::config::Config;
use crate::websocket::RelayState;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub relay: RelayState,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            relay: RelayState::default(),
        }
    }
}
