//! Shared dispatcher lifecycle: ordering invariants, rewind handling,
//! proof-of-index recording, checkpoint writes, and the two-phase
//! fetch-then-process unit both concrete dispatchers pipe every block through.

use crate::blocks::{HasHeader, Header, ProcessResult};
use crate::dispatch::DynamicDsCallback;
use crate::queues::ordered::TurnGuard;
use crate::queues::process::{ProcessSignal, ProcessStage};
use crate::runtime::context;
use crate::runtime::fatal::{DispatchError, DispatchStage, FatalErrorHandler};
use crate::runtime::telemetry::Telemetry;
use crate::services::{Checkpoint, FetchError, Services};
use anyhow::{anyhow, bail, Context, Result};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

/// Queue-abort strategy registered by the concrete dispatcher; invoked by
/// `rewind` after state is rolled back.
pub(crate) type FlushHook = Box<dyn Fn(u64) -> BoxFuture<'static, ()> + Send + Sync>;

/// Mutable dispatcher state. Heights use `0` as "none yet".
pub(crate) struct CoreState {
    latest_buffered: AtomicU64,
    latest_processed: AtomicU64,
    processed_count: AtomicU64,
    current_processing: AtomicU64,
    flush_epoch: AtomicU64,
    is_shutdown: AtomicBool,
    fetch_failure: OnceLock<u64>,
}

impl CoreState {
    fn new() -> Self {
        Self {
            latest_buffered: AtomicU64::new(0),
            latest_processed: AtomicU64::new(0),
            processed_count: AtomicU64::new(0),
            current_processing: AtomicU64::new(0),
            flush_epoch: AtomicU64::new(0),
            is_shutdown: AtomicBool::new(false),
            fetch_failure: OnceLock::new(),
        }
    }

    pub(crate) fn latest_buffered(&self) -> u64 {
        self.latest_buffered.load(Ordering::SeqCst)
    }

    pub(crate) fn set_latest_buffered(&self, height: u64) {
        self.latest_buffered.store(height, Ordering::SeqCst);
    }

    pub(crate) fn latest_processed(&self) -> u64 {
        self.latest_processed.load(Ordering::SeqCst)
    }

    pub(crate) fn set_latest_processed(&self, height: u64) {
        self.latest_processed.store(height, Ordering::SeqCst);
    }

    pub(crate) fn processed_count(&self) -> u64 {
        self.processed_count.load(Ordering::SeqCst)
    }

    pub(crate) fn set_processed_count(&self, count: u64) {
        self.processed_count.store(count, Ordering::SeqCst);
    }

    fn advance(&self, height: u64, processed_count: u64) {
        self.latest_processed.store(height, Ordering::SeqCst);
        self.processed_count.store(processed_count, Ordering::SeqCst);
    }

    pub(crate) fn current_processing(&self) -> u64 {
        self.current_processing.load(Ordering::SeqCst)
    }

    fn set_current_processing(&self, height: u64) {
        self.current_processing.store(height, Ordering::SeqCst);
    }

    /// Monotonic counter of queue flushes; work admitted under an older epoch
    /// is stale by definition.
    pub(crate) fn flush_epoch(&self) -> u64 {
        self.flush_epoch.load(Ordering::SeqCst)
    }

    fn bump_flush_epoch(&self) {
        self.flush_epoch.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::SeqCst)
    }

    pub(crate) fn set_shutdown(&self) {
        self.is_shutdown.store(true, Ordering::SeqCst);
    }

    fn record_fetch_failure(&self, height: u64) {
        let _ = self.fetch_failure.set(height);
    }

    pub(crate) fn fetch_failure(&self) -> Option<u64> {
        self.fetch_failure.get().copied()
    }
}

/// Arguments for one pass through the shared two-phase block unit.
pub(crate) struct PipeBlockArgs<T> {
    pub height: u64,
    /// Phase 1: resolves with the fetched unit and its release turn.
    pub fetch: BoxFuture<'static, Result<(T, TurnGuard), FetchError>>,
    /// True when the unit was superseded by a flush and must not be persisted.
    /// Checked before submission and again when the process job starts.
    pub discard: Arc<dyn Fn(&Header) -> bool + Send + Sync>,
    /// Phase 2 body: runs the handlers for the unit, between the lifecycle hooks.
    pub execute: Box<dyn FnOnce(T) -> BoxFuture<'static, Result<ProcessResult>> + Send>,
    /// Invoked on the first fatal fetch failure to stop further fetching.
    pub abort_fetching: Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>,
}

pub(crate) struct DispatcherCore<B> {
    state: CoreState,
    services: Services<B>,
    process_stage: ProcessStage,
    fatal: FatalErrorHandler,
    telemetry: Arc<Telemetry>,
    pending_rewind: Mutex<Option<Header>>,
    on_dynamic_ds: Mutex<Option<DynamicDsCallback>>,
    flush_hook: OnceLock<FlushHook>,
}

impl<B: Send + Sync + 'static> DispatcherCore<B> {
    pub(crate) fn new(
        services: Services<B>,
        process_stage: ProcessStage,
        fatal: FatalErrorHandler,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            state: CoreState::new(),
            services,
            process_stage,
            fatal,
            telemetry,
            pending_rewind: Mutex::new(None),
            on_dynamic_ds: Mutex::new(None),
            flush_hook: OnceLock::new(),
        }
    }

    pub(crate) fn state(&self) -> &CoreState {
        &self.state
    }

    pub(crate) fn services(&self) -> &Services<B> {
        &self.services
    }

    pub(crate) fn process_stage(&self) -> &ProcessStage {
        &self.process_stage
    }

    pub(crate) fn fatal(&self) -> &FatalErrorHandler {
        &self.fatal
    }

    pub(crate) fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    /// Hydrates persisted progress and stores the dynamic-data-source callback.
    pub(crate) async fn init(&self, on_dynamic_ds: DynamicDsCallback) -> Result<()> {
        let count = self
            .services
            .store
            .processed_block_count()
            .await
            .context("failed to hydrate processed block count")?;
        self.state.set_processed_count(count);
        *self.on_dynamic_ds.lock().unwrap() = Some(on_dynamic_ds);
        tracing::info!(processed_block_count = count, "dispatcher initialized");
        Ok(())
    }

    /// Registers the queue-abort strategy of the owning dispatcher. Must be
    /// called exactly once during construction.
    pub(crate) fn register_flush_hook(&self, hook: FlushHook) {
        if self.flush_hook.set(hook).is_err() {
            tracing::warn!("flush hook registered more than once; keeping the first");
        }
    }

    /// Marks the block as current, persists its header at the transaction
    /// boundary, and advances the active-project-version pointer.
    pub(crate) async fn pre_process_block(&self, header: &Header) -> Result<()> {
        context::assert_coordinator("pre_process_block");
        self.state.set_current_processing(header.height);
        self.services
            .store
            .persist_header(header)
            .await
            .context("failed to persist block header")?;
        self.services
            .project
            .advance_version(header.height)
            .await
            .context("failed to advance project version")?;
        tracing::debug!(height = header.height, "processing block");
        Ok(())
    }

    /// The correctness gate after handler execution: rewind targets first,
    /// then checkpoint, proof-of-index, and progress advancement.
    pub(crate) async fn post_process_block(
        &self,
        header: &Header,
        result: ProcessResult,
    ) -> Result<()> {
        context::assert_coordinator("post_process_block");
        let height = header.height;

        // A pending administrative or cross-chain target outranks whatever the
        // handler discovered, regardless of which height is lower.
        let pending = *self.pending_rewind.lock().unwrap();
        if let (Some(pending), Some(discovered)) = (&pending, &result.reindex_target) {
            if pending.height != discovered.height {
                tracing::warn!(
                    pending = pending.height,
                    discovered = discovered.height,
                    "conflicting rewind targets; honouring the pending one"
                );
            }
        }
        let target = pending.or(result.reindex_target);

        if let Some(target) = target {
            let datasources_remain = self
                .services
                .project
                .datasources_active_after(height)
                .await
                .context("failed to query data sources for commit")?;
            self.services
                .store
                .commit_block(height, datasources_remain)
                .await
                .with_context(|| format!("failed to commit block {height} before rewind"))?;
            self.services
                .poi
                .pause_sync()
                .await
                .context("failed to pause proof-of-index sync")?;
            self.pending_rewind.lock().unwrap().take();
            self.rewind(&target).await?;
            self.services
                .poi
                .resume_sync()
                .await
                .context("failed to resume proof-of-index sync")?;
            return Ok(());
        }

        let processed_count = self.state.processed_count() + 1;
        let checkpoint = Checkpoint {
            last_processed_height: height,
            last_processed_timestamp: unix_millis(),
            last_processed_block_timestamp: header.timestamp,
            processed_block_count: processed_count,
        };
        self.services
            .store
            .write_checkpoint(&checkpoint)
            .await
            .with_context(|| format!("failed to write checkpoint for block {height}"))?;

        if let Some(operation_hash) = self
            .services
            .store
            .operation_hash(height)
            .await
            .context("failed to read accumulated operation hash")?
        {
            self.services
                .poi
                .record_entry(header, operation_hash)
                .await
                .with_context(|| format!("failed to record proof-of-index for block {height}"))?;
            self.services
                .store
                .set_last_poi_height(height)
                .await
                .context("failed to record last proof-of-index height")?;
        }

        if result.dynamic_datasource_created {
            let callback = self.on_dynamic_ds.lock().unwrap().clone();
            match callback {
                Some(callback) => {
                    tracing::info!(height, "dynamic data source created; notifying");
                    callback(height)
                        .await
                        .context("dynamic data source callback failed")?;
                }
                None => {
                    tracing::warn!(height, "dynamic data source created before dispatcher init");
                }
            }
        }

        let latest = self.state.latest_processed();
        if latest != 0 && height <= latest {
            bail!("commit order violated: block {height} after {latest}");
        }
        self.state.advance(height, processed_count);
        self.telemetry.record_processed_block();

        let datasources_remain = self
            .services
            .project
            .datasources_active_after(height)
            .await
            .context("failed to query data sources for commit")?;
        self.services
            .store
            .commit_block(height, datasources_remain)
            .await
            .with_context(|| format!("failed to commit block {height}"))?;

        Ok(())
    }

    /// Rolls indexed state back to the target and flushes every queue to it,
    /// making the rewind safe regardless of how much work was buffered.
    pub(crate) async fn rewind(&self, target: &Header) -> Result<()> {
        self.telemetry.record_rewind();
        if target.height <= self.state.current_processing() {
            self.services
                .project
                .reindex(target)
                .await
                .map_err(|err| {
                    self.fatal.trigger(DispatchError::new(
                        DispatchStage::Rewind,
                        err.context(format!("failed to reindex to height {}", target.height)),
                    ))
                })?;
            self.state.set_latest_processed(target.height);
            tracing::info!(height = target.height, "reindexed to rewind target");
        }

        self.flush_all(target.height).await;
        Ok(())
    }

    /// Lowers the buffered height and aborts queued and in-flight work through
    /// the owning dispatcher's registered queue-abort strategy.
    pub(crate) async fn flush_all(&self, height: u64) {
        self.state.set_latest_buffered(height);
        self.state.bump_flush_epoch();
        self.telemetry.record_queue_flush();
        match self.flush_hook.get() {
            Some(hook) => hook(height).await,
            None => tracing::warn!(height, "flush requested before hook registration"),
        }
    }

    /// Administrative rewind: stores the target header as the pending marker
    /// consumed by the next `post_process_block`.
    pub(crate) async fn request_rewind(&self, height: u64) -> Result<()> {
        let current = self.state.current_processing();
        if height > current {
            bail!(
                "cannot rewind to height {height}: it is ahead of the current \
                 processing height {current}"
            );
        }
        let header = self
            .services
            .chain
            .header_for_height(height)
            .await
            .context("failed to fetch header for rewind target")?;
        *self.pending_rewind.lock().unwrap() = Some(header);
        tracing::info!(height, "administrative rewind requested");
        Ok(())
    }

    /// The shared two-phase unit: await the fetch, then hand the unit to the
    /// sequential process stage unless a flush superseded it in between.
    pub(crate) async fn pipe_block<T>(self: Arc<Self>, args: PipeBlockArgs<T>) -> Result<()>
    where
        T: HasHeader + Send + 'static,
    {
        let PipeBlockArgs {
            height,
            fetch,
            discard,
            execute,
            abort_fetching,
        } = args;

        let (unit, turn) = match fetch.await {
            Ok(pair) => pair,
            Err(FetchError::Flushed) => {
                tracing::trace!(height, "fetch task flushed; skipping");
                return Ok(());
            }
            Err(FetchError::BlockUnavailable { height }) => {
                tracing::debug!(height, "block unavailable; skipping");
                return Ok(());
            }
            Err(FetchError::Source(err)) => {
                return self.handle_fatal_fetch(height, err, abort_fetching).await;
            }
        };

        self.telemetry.record_fetched_block();
        let header = *unit.header();
        if discard(&header) {
            self.telemetry.record_discarded_block();
            tracing::debug!(height = header.height, "discarding superseded block");
            return Ok(());
        }

        let job = {
            let core = Arc::clone(&self);
            let discard = Arc::clone(&discard);
            let exec = execute(unit);
            async move {
                if discard(&header) {
                    core.telemetry.record_discarded_block();
                    tracing::debug!(
                        height = header.height,
                        "discarding block flushed while queued"
                    );
                    return Ok(());
                }
                core.pre_process_block(&header).await?;
                let result = exec.await?;
                core.post_process_block(&header, result).await
            }
        };

        let submitted = self
            .process_stage
            .submit(header.height, Box::pin(job))
            .await;
        // The turn is held until the job is queued so the process stage sees
        // submissions in fetch-admission order.
        drop(turn);

        match submitted.outcome().await {
            Ok(()) => Ok(()),
            Err(ProcessSignal::Flushed) => {
                tracing::trace!(height = header.height, "process task flushed; skipping");
                Ok(())
            }
            Err(ProcessSignal::Fatal) => Err(self
                .fatal
                .error()
                .unwrap_or_else(|| anyhow!("processing block {height} failed fatally"))),
        }
    }

    async fn handle_fatal_fetch(
        &self,
        height: u64,
        err: anyhow::Error,
        abort_fetching: Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>,
    ) -> Result<()> {
        self.state.set_shutdown();
        self.state.record_fetch_failure(height);
        if self.fatal.is_triggered() {
            return Ok(());
        }

        tracing::error!(
            height,
            error = %err,
            "fatal fetch failure; draining process stage before terminating"
        );
        abort_fetching().await;
        self.process_stage.drain().await;
        if let Err(flush_err) = self.services.store.flush_cache().await {
            tracing::error!(error = %flush_err, "failed to flush cached writes during shutdown");
        }

        let captioned = DispatchError::new(
            DispatchStage::Fetch,
            err.context(format!("failed to fetch block {height}")),
        );
        Err(self.fatal.trigger(captioned))
    }
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
