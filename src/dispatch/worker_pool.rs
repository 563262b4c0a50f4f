//! Worker-pool dispatcher: fans fetch and handler execution across N worker
//! tasks behind message-passing proxies, while one dispatcher-owned
//! fetch-order queue forces completions back into submission order for the
//! shared process stage.

use crate::blocks::{Header, ProcessResult, QueueEntry};
use crate::dispatch::core::{DispatcherCore, PipeBlockArgs};
use crate::dispatch::{Dispatcher, DynamicDsCallback};
use crate::queues::ordered::{OrderedTaskQueue, TurnGuard};
use crate::queues::process::ProcessStage;
use crate::runtime::config::DispatcherConfig;
use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::telemetry::{self, QueueDepths, Telemetry};
use crate::services::{FetchError, Services};
use crate::workers::handle::{spawn_worker, WorkerHandle};
use anyhow::{bail, Context, Result};
use futures::future::BoxFuture;
use rand::Rng;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct WorkerPoolDispatcher<B> {
    core: Arc<DispatcherCore<B>>,
    workers: Arc<Vec<WorkerHandle>>,
    fetch_order: OrderedTaskQueue,
    config: DispatcherConfig,
    run_token: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<B: Send + Sync + 'static> WorkerPoolDispatcher<B> {
    pub fn new(config: DispatcherConfig, services: Services<B>) -> Self {
        let root_token = CancellationToken::new();
        let run_token = root_token.child_token();
        let fatal = FatalErrorHandler::new(root_token, run_token.clone());
        let telemetry = Arc::new(Telemetry::default());

        let process_stage =
            ProcessStage::new(config.process_capacity(), config.process_timeout());
        let fetch_order = OrderedTaskQueue::new(
            config.pool_queue_capacity(),
            config.pool_queue_capacity(),
            config.fetch_timeout(),
        );

        let worker_count = config.worker_count().max(1);
        let workers: Arc<Vec<WorkerHandle>> = Arc::new(
            (0..worker_count)
                .map(|id| {
                    spawn_worker(
                        id,
                        Arc::clone(&services.chain),
                        Arc::clone(&services.executor),
                        run_token.clone(),
                    )
                })
                .collect(),
        );

        let core = Arc::new(DispatcherCore::new(
            services,
            process_stage.clone(),
            fatal,
            telemetry,
        ));
        core.register_flush_hook({
            let workers = Arc::clone(&workers);
            let fetch_order = fetch_order.clone();
            let process_stage = process_stage.clone();
            Box::new(move |height| {
                let workers = Arc::clone(&workers);
                let fetch_order = fetch_order.clone();
                let process_stage = process_stage.clone();
                Box::pin(async move {
                    tracing::debug!(height, "aborting worker fetches and both queues");
                    for worker in workers.iter() {
                        worker.abort_fetching().await;
                    }
                    fetch_order.flush();
                    process_stage.flush();
                })
            })
        });

        Self {
            core,
            workers,
            fetch_order,
            config,
            run_token,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Least-loaded selection with a uniform random tie-break, so repeated
    /// batches do not always land on the lowest index.
    async fn next_worker_index(&self) -> usize {
        let mut counts = Vec::with_capacity(self.workers.len());
        for worker in self.workers.iter() {
            counts.push(worker.pending_fetch_count().await);
        }
        select_least_loaded(&counts).unwrap_or(0)
    }

    /// Wraps the worker fetch in the fetch-order queue and pipes the height
    /// through the shared two-phase unit.
    async fn enqueue_block(&self, height: u64, worker_idx: usize) {
        let admission = self.fetch_order.admit().await;
        let snapshot = self.core.state().latest_buffered();
        let epoch = self.core.state().flush_epoch();
        let core = Arc::clone(&self.core);
        let workers = Arc::clone(&self.workers);

        let fetch: BoxFuture<'static, Result<(Header, TurnGuard), FetchError>> = Box::pin({
            let workers = Arc::clone(&workers);
            let fetch_order = self.fetch_order.clone();
            async move {
                let worker = &workers[worker_idx];
                fetch_order
                    .execute(admission, worker.fetch_block(height), |_| 1)
                    .await
            }
        });

        let discard: Arc<dyn Fn(&Header) -> bool + Send + Sync> = {
            let core = Arc::clone(&core);
            Arc::new(move |_header: &Header| {
                epoch != core.state().flush_epoch()
                    || snapshot > core.state().latest_buffered()
            })
        };

        let execute = {
            let workers = Arc::clone(&workers);
            Box::new(move |header: Header| {
                Box::pin(async move {
                    workers[worker_idx].process_block(header.height).await
                }) as BoxFuture<'static, Result<ProcessResult>>
            })
        };

        let abort_fetching = {
            let workers = Arc::clone(&workers);
            let fetch_order = self.fetch_order.clone();
            Box::new(move || {
                Box::pin(async move {
                    for worker in workers.iter() {
                        worker.abort_fetching().await;
                    }
                    fetch_order.flush();
                }) as BoxFuture<'static, ()>
            })
        };

        let args = PipeBlockArgs {
            height,
            fetch,
            discard,
            execute,
            abort_fetching,
        };
        tokio::spawn(async move {
            if let Err(err) = core.pipe_block(args).await {
                tracing::debug!(height, error = %err, "block pipe terminated");
            }
        });
    }

    async fn worker_loads(&self) -> Vec<telemetry::WorkerLoad> {
        let mut loads = Vec::with_capacity(self.workers.len());
        for worker in self.workers.iter() {
            match worker.status().await {
                Ok(load) => loads.push(load),
                Err(err) => {
                    tracing::debug!(worker = worker.id(), error = %err, "status poll failed")
                }
            }
        }
        loads
    }
}

impl<B: Send + Sync + 'static> Dispatcher<B> for WorkerPoolDispatcher<B> {
    fn init(&self, on_dynamic_ds: DynamicDsCallback) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.core.init(on_dynamic_ds).await?;

            let consumer = self
                .core
                .process_stage()
                .spawn_consumer(self.run_token.clone(), self.core.fatal().clone());

            let workers = Arc::clone(&self.workers);
            let fetch_order = self.fetch_order.clone();
            let process_stage = self.core.process_stage().clone();
            let reporter = telemetry::spawn_metrics_reporter(
                Arc::clone(self.core.telemetry()),
                move || {
                    let workers = Arc::clone(&workers);
                    let fetch_order = fetch_order.clone();
                    let process_stage = process_stage.clone();
                    async move {
                        let mut loads = Vec::with_capacity(workers.len());
                        for worker in workers.iter() {
                            if let Ok(load) = worker.status().await {
                                loads.push(load);
                            }
                        }
                        QueueDepths {
                            buffered_entries: fetch_order.outstanding(),
                            pending_fetch_weight: fetch_order.pending_weight(),
                            pending_process_jobs: process_stage.pending(),
                            workers: loads,
                        }
                    }
                },
                self.run_token.clone(),
                self.config.metrics_interval(),
            );

            self.handles.lock().unwrap().extend([consumer, reporter]);
            Ok(())
        })
    }

    fn enqueue_blocks(
        &self,
        entries: Vec<QueueEntry<B>>,
        buffer_height: u64,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.core.state().is_shutdown() {
                bail!("dispatcher is shut down; rejecting {} entries", entries.len());
            }

            // Fetching happens inside worker caches, so only bare heights can
            // be dispatched here.
            let mut heights = Vec::with_capacity(entries.len().max(1));
            for entry in entries {
                match entry {
                    QueueEntry::Height(height) => heights.push(height),
                    QueueEntry::Block(block) => bail!(
                        "worker-pool dispatcher accepts bare heights only, got fetched block {}",
                        block.height()
                    ),
                }
            }
            if heights.is_empty() {
                heights.push(buffer_height);
            }

            if buffer_height < self.core.state().latest_buffered() {
                tracing::info!(
                    buffer_height,
                    previous = self.core.state().latest_buffered(),
                    "buffer target moved backwards; flushing superseded work"
                );
                self.core.flush_all(buffer_height).await;
            }
            // Raise the buffered height before dispatching so in-flight discard
            // checks always compare against the freshest value.
            self.core.state().set_latest_buffered(buffer_height);

            // One worker takes the whole batch: keeps its fetch cache hot.
            let worker_idx = self.next_worker_index().await;
            tracing::debug!(
                worker = worker_idx,
                blocks = heights.len(),
                "assigning batch to worker"
            );
            for height in heights {
                self.enqueue_block(height, worker_idx).await;
            }
            Ok(())
        })
    }

    fn queue_size(&self) -> usize {
        self.fetch_order.outstanding()
    }

    fn free_size(&self) -> usize {
        self.fetch_order.free_slots()
    }

    fn latest_buffered_height(&self) -> u64 {
        self.core.state().latest_buffered()
    }

    fn latest_processed_height(&self) -> u64 {
        self.core.state().latest_processed()
    }

    fn set_latest_processed_height(&self, height: u64) {
        self.core.state().set_latest_processed(height);
    }

    fn processed_block_count(&self) -> u64 {
        self.core.state().processed_count()
    }

    fn current_processing_height(&self) -> u64 {
        self.core.state().current_processing()
    }

    fn fetch_failure_height(&self) -> Option<u64> {
        self.core.state().fetch_failure()
    }

    fn flush_queue(&self, height: u64) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.core.flush_all(height).await;
        })
    }

    fn rewind_to_height(&self, height: u64) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.core.request_rewind(height))
    }

    fn queue_depths(&self) -> BoxFuture<'_, QueueDepths> {
        Box::pin(async move {
            QueueDepths {
                buffered_entries: self.fetch_order.outstanding(),
                pending_fetch_weight: self.fetch_order.pending_weight(),
                pending_process_jobs: self.core.process_stage().pending(),
                workers: self.worker_loads().await,
            }
        })
    }

    fn fatal_error(&self) -> Option<anyhow::Error> {
        self.core.fatal().error()
    }

    fn shutdown(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            tracing::info!("shutting down worker-pool dispatcher");
            self.core.state().set_shutdown();
            self.run_token.cancel();

            self.fetch_order.flush();
            self.core.process_stage().flush();

            for worker in self.workers.iter() {
                if let Err(err) = worker.terminate().await {
                    tracing::warn!(worker = worker.id(), error = %err, "worker terminated abnormally");
                }
            }

            let handles = std::mem::take(&mut *self.handles.lock().unwrap());
            for handle in handles {
                if let Err(err) = handle.await {
                    tracing::warn!(error = %err, "dispatcher task terminated unexpectedly");
                }
            }

            self.core
                .services()
                .poi
                .stop_sync()
                .await
                .context("failed to stop proof-of-index sync")?;
            Ok(())
        })
    }
}

/// Index of the minimum pending count, selecting uniformly at random among
/// ties. Greedy and stateless; rebalancing happens every batch.
pub(crate) fn select_least_loaded(counts: &[usize]) -> Option<usize> {
    let min = *counts.iter().min()?;
    let ties: Vec<usize> = counts
        .iter()
        .enumerate()
        .filter(|(_, count)| **count == min)
        .map(|(index, _)| index)
        .collect();
    match ties.as_slice() {
        [only] => Some(*only),
        ties => Some(ties[rand::thread_rng().gen_range(0..ties.len())]),
    }
}
