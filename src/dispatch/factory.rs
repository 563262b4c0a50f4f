use crate::dispatch::inprocess::InProcessDispatcher;
use crate::dispatch::worker_pool::WorkerPoolDispatcher;
use crate::dispatch::Dispatcher;
use crate::runtime::config::DispatcherConfig;
use crate::services::Services;
use std::sync::Arc;

/// Picks a concrete dispatcher from the configured worker count.
pub fn create_dispatcher<B>(
    config: DispatcherConfig,
    services: Services<B>,
) -> Arc<dyn Dispatcher<B>>
where
    B: Send + Sync + 'static,
{
    if config.worker_count() <= 1 {
        tracing::info!(
            batch_size = config.batch_size(),
            "creating in-process block dispatcher"
        );
        Arc::new(InProcessDispatcher::new(config, services))
    } else {
        tracing::info!(
            batch_size = config.batch_size(),
            workers = config.worker_count(),
            "creating worker-pool block dispatcher"
        );
        Arc::new(WorkerPoolDispatcher::new(config, services))
    }
}
