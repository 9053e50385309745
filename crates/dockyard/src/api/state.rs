//! Application state shared across handlers.

use std::sync::Arc;

use crate::lifecycle::LifecycleController;
use crate::stream::StreamSettings;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// Lifecycle controller.
    pub controller: Arc<LifecycleController>,
    /// Caller stream timing.
    pub stream: StreamSettings,
    /// Origins allowed to call the API cross-origin.
    pub allowed_origins: Arc<Vec<String>>,
}

impl AppState {
    pub fn new(controller: Arc<LifecycleController>, stream: StreamSettings) -> Self {
        Self {
            controller,
            stream,
            allowed_origins: Arc::new(Vec::new()),
        }
    }

    pub fn with_allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = Arc::new(origins);
        self
    }
}
