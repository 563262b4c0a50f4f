pub(crate) mod core;
pub mod factory;
pub mod inprocess;
pub mod worker_pool;

use crate::blocks::QueueEntry;
use crate::runtime::telemetry::QueueDepths;
use futures::future::BoxFuture;
use std::sync::Arc;

/// Callback invoked after committing a block whose handlers created a dynamic
/// data source. The node layer reacts by flushing the queue and re-enqueueing
/// the heights that must be re-evaluated against the new data-source set.
pub type DynamicDsCallback =
    Arc<dyn Fn(u64) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Push/pull contract between the height producer and a block dispatcher.
pub trait Dispatcher<B>: Send + Sync {
    /// Hydrates persisted progress and stores the dynamic-data-source callback.
    fn init(&self, on_dynamic_ds: DynamicDsCallback) -> BoxFuture<'_, anyhow::Result<()>>;

    /// Accepts a batch of entries. An empty batch still advances checkpoints
    /// through a sentinel entry at `buffer_height`.
    fn enqueue_blocks(
        &self,
        entries: Vec<QueueEntry<B>>,
        buffer_height: u64,
    ) -> BoxFuture<'_, anyhow::Result<()>>;

    /// Entries buffered ahead of the fetch stage.
    fn queue_size(&self) -> usize;

    /// Spare buffer capacity, for backpressure-aware producers.
    fn free_size(&self) -> usize;

    fn latest_buffered_height(&self) -> u64;

    /// Last committed height; `0` until the first block commits.
    fn latest_processed_height(&self) -> u64;

    fn set_latest_processed_height(&self, height: u64);

    fn processed_block_count(&self) -> u64;

    fn current_processing_height(&self) -> u64;

    /// Height of the first fatal fetch failure, if any occurred.
    fn fetch_failure_height(&self) -> Option<u64>;

    /// Lowers the buffered height and aborts all queued and in-flight work.
    fn flush_queue(&self, height: u64) -> BoxFuture<'_, ()>;

    /// Administrative rewind entry point. Rejected with a plain error when the
    /// target is ahead of the current processing height.
    fn rewind_to_height(&self, height: u64) -> BoxFuture<'_, anyhow::Result<()>>;

    /// Point-in-time queue occupancy, including per-worker status.
    fn queue_depths(&self) -> BoxFuture<'_, QueueDepths>;

    /// First fatal error captured by the pipeline, if any.
    fn fatal_error(&self) -> Option<anyhow::Error>;

    fn shutdown(&self) -> BoxFuture<'_, anyhow::Result<()>>;
}
