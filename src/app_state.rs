use std::sync::Arc;

use crate::config::WidgetConfig;
use crate::models::state::AppSnapshot;
use crate::services::{
    generation::GenerationClient,
    processor::{ProcessorError, ProcessorSettings, QueueProcessor},
    session_store::SessionStorage,
    store::Store,
};

/// One widget instance: its store and the processor driving its queue.
pub struct AppState<C> {
    pub config: WidgetConfig,
    pub store: Arc<Store>,
    pub processor: Arc<QueueProcessor<C>>,
}

impl<C: GenerationClient> AppState<C> {
    /// Hydrate the session and start processing. Interrupted work from an
    /// earlier load is picked up immediately.
    pub fn launch(
        storage: Arc<dyn SessionStorage>,
        config: WidgetConfig,
        client: C,
    ) -> Result<Self, ProcessorError> {
        let store = Store::new(storage, config.clone());
        let processor = QueueProcessor::new(
            Arc::clone(&store),
            Arc::new(client),
            ProcessorSettings::from(&config),
        )?;
        processor.init();

        Ok(Self {
            config,
            store,
            processor,
        })
    }

    /// Resolves once no job is PENDING or PROCESSING.
    pub async fn wait_until_settled(&self) -> Arc<AppSnapshot> {
        self.store.wait_for(AppSnapshot::is_settled).await
    }

    /// Stop processing and drop everything the session holds. Calls still in
    /// flight finish without touching storage again.
    pub fn end_session(&self) {
        self.processor.shutdown();
        if let Err(e) = self.store.end_session() {
            tracing::warn!(error = %e, "Failed to clear session storage");
        }
    }
}
