use std::sync::Arc;

use config::Config;
use database::RadrStore;
use events::EventBus;
use routes::presence::PresenceMap;

pub mod client;
pub mod common;
pub mod config;
pub mod database;
pub mod error;
pub mod events;
pub mod middleware;
pub mod router;
pub mod routes;
pub mod utils;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RadrStore>,
    pub config: Config,
    pub presence: PresenceMap,
    pub events: EventBus,
}

impl AppState {
    pub fn new(store: Arc<dyn RadrStore>, config: Config, events: EventBus) -> Self {
        let presence = PresenceMap::new(config.presence_ttl());
        Self {
            store,
            config,
            presence,
            events,
        }
    }
}
