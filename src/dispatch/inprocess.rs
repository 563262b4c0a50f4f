//! In-process dispatcher: entry buffer → weight-bounded fetch stage →
//! sequential process stage, all inside one process. Fetches run in parallel
//! ahead of strictly ordered processing.

use crate::blocks::{FetchedBlock, Header, ProcessResult, QueueEntry};
use crate::dispatch::core::{DispatcherCore, PipeBlockArgs};
use crate::dispatch::{Dispatcher, DynamicDsCallback};
use crate::queues::buffer::EntryBuffer;
use crate::queues::ordered::{Admission, OrderedTaskQueue, TurnGuard};
use crate::queues::process::ProcessStage;
use crate::runtime::config::DispatcherConfig;
use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::telemetry::{self, QueueDepths, Telemetry};
use crate::services::{FetchError, Services};
use anyhow::{bail, Context, Result};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct InProcessDispatcher<B> {
    core: Arc<DispatcherCore<B>>,
    pump: Arc<Pump<B>>,
    buffer: Arc<EntryBuffer<B>>,
    fetch_stage: OrderedTaskQueue,
    config: DispatcherConfig,
    run_token: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<B: Send + Sync + 'static> InProcessDispatcher<B> {
    pub fn new(config: DispatcherConfig, services: Services<B>) -> Self {
        let root_token = CancellationToken::new();
        let run_token = root_token.child_token();
        let fatal = FatalErrorHandler::new(root_token, run_token.clone());
        let telemetry = Arc::new(Telemetry::default());

        let process_stage =
            ProcessStage::new(config.process_capacity(), config.process_timeout());
        let buffer = Arc::new(EntryBuffer::new(config.buffer_capacity()));
        let fetch_stage = OrderedTaskQueue::new(
            config.fetch_burst(),
            config.fetch_budget(),
            config.fetch_timeout(),
        );

        let core = Arc::new(DispatcherCore::new(
            services,
            process_stage.clone(),
            fatal,
            telemetry,
        ));
        core.register_flush_hook({
            let buffer = Arc::clone(&buffer);
            let fetch_stage = fetch_stage.clone();
            let process_stage = process_stage.clone();
            Box::new(move |height| {
                let buffer = Arc::clone(&buffer);
                let fetch_stage = fetch_stage.clone();
                let process_stage = process_stage.clone();
                Box::pin(async move {
                    tracing::debug!(height, "flushing entry buffer and both stages");
                    buffer.clear();
                    fetch_stage.flush();
                    process_stage.flush();
                })
            })
        });

        let pump = Arc::new(Pump {
            core: Arc::clone(&core),
            buffer: Arc::clone(&buffer),
            fetch_stage: fetch_stage.clone(),
            run_token: run_token.clone(),
            active: AtomicBool::new(false),
        });

        Self {
            core,
            pump,
            buffer,
            fetch_stage,
            config,
            run_token,
            handles: Mutex::new(Vec::new()),
        }
    }
}

impl<B: Send + Sync + 'static> Dispatcher<B> for InProcessDispatcher<B> {
    fn init(&self, on_dynamic_ds: DynamicDsCallback) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.core.init(on_dynamic_ds).await?;

            let consumer = self
                .core
                .process_stage()
                .spawn_consumer(self.run_token.clone(), self.core.fatal().clone());

            let buffer = Arc::clone(&self.buffer);
            let fetch_stage = self.fetch_stage.clone();
            let process_stage = self.core.process_stage().clone();
            let reporter = telemetry::spawn_metrics_reporter(
                Arc::clone(self.core.telemetry()),
                move || {
                    let buffer = Arc::clone(&buffer);
                    let fetch_stage = fetch_stage.clone();
                    let process_stage = process_stage.clone();
                    async move {
                        QueueDepths {
                            buffered_entries: buffer.len(),
                            pending_fetch_weight: fetch_stage.pending_weight(),
                            pending_process_jobs: process_stage.pending(),
                            workers: Vec::new(),
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

            // An empty range still has to advance checkpoints: synthesize the
            // buffer height itself as the entry to fetch and commit.
            let entries = if entries.is_empty() {
                vec![QueueEntry::Height(buffer_height)]
            } else {
                entries
            };

            if buffer_height < self.core.state().latest_buffered() {
                tracing::info!(
                    buffer_height,
                    previous = self.core.state().latest_buffered(),
                    "buffer target moved backwards; flushing superseded work"
                );
                self.core.flush_all(buffer_height).await;
            }

            for entry in entries {
                self.buffer.push(entry).await;
            }
            self.core.state().set_latest_buffered(buffer_height);
            self.pump.trigger();
            Ok(())
        })
    }

    fn queue_size(&self) -> usize {
        self.buffer.len()
    }

    fn free_size(&self) -> usize {
        self.buffer.free_space()
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
                buffered_entries: self.buffer.len(),
                pending_fetch_weight: self.fetch_stage.pending_weight(),
                pending_process_jobs: self.core.process_stage().pending(),
                workers: Vec::new(),
            }
        })
    }

    fn fatal_error(&self) -> Option<anyhow::Error> {
        self.core.fatal().error()
    }

    fn shutdown(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            tracing::info!("shutting down in-process dispatcher");
            self.core.state().set_shutdown();
            self.run_token.cancel();

            self.buffer.clear();
            self.fetch_stage.flush();
            self.core.process_stage().flush();
            self.fetch_stage.wait_idle().await;

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

/// Pump loop feeding buffered entries into the fetch stage.
///
/// A single re-entrancy-guarded instance runs at a time; it exits when the
/// buffer empties and is re-triggered by the next enqueue.
struct Pump<B> {
    core: Arc<DispatcherCore<B>>,
    buffer: Arc<EntryBuffer<B>>,
    fetch_stage: OrderedTaskQueue,
    run_token: CancellationToken,
    active: AtomicBool,
}

impl<B: Send + Sync + 'static> Pump<B> {
    fn trigger(self: &Arc<Self>) {
        if self.active.swap(true, Ordering::AcqRel) {
            return;
        }
        let pump = Arc::clone(self);
        tokio::spawn(async move {
            pump.run().await;
            pump.active.store(false, Ordering::Release);
            // An enqueue may have raced the exit check; pick its work up.
            if !pump.buffer.is_empty()
                && !pump.core.state().is_shutdown()
                && !pump.run_token.is_cancelled()
            {
                pump.trigger();
            }
        });
    }

    async fn run(self: &Arc<Self>) {
        loop {
            if self.core.state().is_shutdown() || self.run_token.is_cancelled() {
                return;
            }
            if self.buffer.is_empty() {
                return;
            }

            // Hold off while the fetch stage is at its budget or the fetched
            // weight would overrun what the process stage can absorb.
            if !self.ready_for_next() {
                let fetch_changed = self.fetch_stage.state_changed();
                let process_changed = self.core.process_stage().state_changed();
                if !self.ready_for_next() {
                    tokio::select! {
                        _ = self.run_token.cancelled() => return,
                        _ = fetch_changed => {}
                        _ = process_changed => {}
                    }
                }
                continue;
            }

            let Some(entry) = self.buffer.pop() else {
                return;
            };
            let admission = self.fetch_stage.admit().await;
            self.spawn_pipe(entry, admission);
        }
    }

    fn ready_for_next(&self) -> bool {
        self.fetch_stage.has_spare_capacity()
            && self.fetch_stage.pending_weight()
                <= self.core.process_stage().free_capacity() as u64
    }

    fn spawn_pipe(&self, entry: QueueEntry<B>, admission: Admission) {
        let core = Arc::clone(&self.core);
        let chain = Arc::clone(&core.services().chain);
        let executor = Arc::clone(&core.services().executor);
        let height = entry.height();
        let snapshot = core.state().latest_buffered();
        let epoch = core.state().flush_epoch();

        let fetch: BoxFuture<'static, Result<(FetchedBlock<B>, TurnGuard), FetchError>> =
            Box::pin({
                let fetch_stage = self.fetch_stage.clone();
                let weigh_chain = Arc::clone(&chain);
                async move {
                    let task = async move {
                        match entry {
                            // Already fetched (bypass and test paths): hand it
                            // straight to the ordered release.
                            QueueEntry::Block(block) => Ok(block),
                            QueueEntry::Height(height) => {
                                let mut blocks = chain.fetch_blocks(&[height]).await?;
                                blocks
                                    .pop()
                                    .ok_or(FetchError::BlockUnavailable { height })
                            }
                        }
                    };
                    fetch_stage
                        .execute(admission, task, move |block| weigh_chain.block_weight(block))
                        .await
                }
            });

        let discard: Arc<dyn Fn(&Header) -> bool + Send + Sync> = {
            let core = Arc::clone(&core);
            let buffer = Arc::clone(&self.buffer);
            Arc::new(move |header: &Header| {
                // Stale when any flush intervened, when a flush lowered the
                // buffer past our snapshot, or when lower heights were
                // re-enqueued behind this block.
                epoch != core.state().flush_epoch()
                    || snapshot > core.state().latest_buffered()
                    || buffer
                        .peek_height()
                        .map_or(false, |next| next < header.height)
            })
        };

        let execute = Box::new(move |block: FetchedBlock<B>| {
            let executor = Arc::clone(&executor);
            Box::pin(async move { executor.execute(block).await })
                as BoxFuture<'static, Result<ProcessResult>>
        });

        let abort_fetching = {
            let fetch_stage = self.fetch_stage.clone();
            Box::new(move || {
                Box::pin(async move {
                    fetch_stage.flush();
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
}
