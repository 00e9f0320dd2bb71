use std::sync::Arc;

use crate::config::EngineSettings;
use crate::services::queue::JobQueue;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub queue: JobQueue,
    /// Environment-level settings; stored overrides are layered on per request.
    pub settings: Arc<EngineSettings>,
}

impl AppState {
    pub fn new(queue: JobQueue, settings: EngineSettings) -> Self {
        Self {
            queue,
            settings: Arc::new(settings),
        }
    }

    /// Settings with the persisted `config` overrides applied.
    pub async fn effective_settings(
        &self,
    ) -> Result<EngineSettings, crate::services::queue::QueueError> {
        self.queue.engine_settings((*self.settings).clone()).await
    }
}
