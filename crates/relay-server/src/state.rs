use crate::config::ServerSettings;
use crate::registry::TunnelRegistry;

pub struct AppState {
    pub settings: ServerSettings,
    pub registry: TunnelRegistry,
}

impl AppState {
    pub fn new(settings: ServerSettings) -> Self {
        Self {
            settings,
            registry: TunnelRegistry::new(),
        }
    }
}
