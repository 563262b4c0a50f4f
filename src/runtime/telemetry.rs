use core::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(5);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back
/// to `info`. Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Lightweight rolling counters used to derive runtime metrics.
#[derive(Default, Debug)]
pub struct Telemetry {
    fetched_blocks: AtomicU64,
    processed_blocks: AtomicU64,
    discarded_blocks: AtomicU64,
    queue_flushes: AtomicU64,
    rewinds: AtomicU64,
}

impl Telemetry {
    pub fn record_fetched_block(&self) {
        self.fetched_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processed_block(&self) {
        self.processed_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discarded_block(&self) {
        self.discarded_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queue_flush(&self) {
        self.queue_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rewind(&self) {
        self.rewinds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            fetched_blocks: self.fetched_blocks.load(Ordering::Relaxed),
            processed_blocks: self.processed_blocks.load(Ordering::Relaxed),
            discarded_blocks: self.discarded_blocks.load(Ordering::Relaxed),
            queue_flushes: self.queue_flushes.load(Ordering::Relaxed),
            rewinds: self.rewinds.load(Ordering::Relaxed),
        }
    }

    pub fn processed_blocks(&self) -> u64 {
        self.processed_blocks.load(Ordering::Relaxed)
    }

    pub fn discarded_blocks(&self) -> u64 {
        self.discarded_blocks.load(Ordering::Relaxed)
    }

    pub fn queue_flushes(&self) -> u64 {
        self.queue_flushes.load(Ordering::Relaxed)
    }

    pub fn rewinds(&self) -> u64 {
        self.rewinds.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Copy, Clone)]
pub struct TelemetrySnapshot {
    pub fetched_blocks: u64,
    pub processed_blocks: u64,
    pub discarded_blocks: u64,
    pub queue_flushes: u64,
    pub rewinds: u64,
}

/// Pending-work counts for one worker, as reported by its status endpoint.
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct WorkerLoad {
    pub worker_id: usize,
    pub pending_fetch: usize,
    pub pending_process: usize,
    pub cached_blocks: usize,
}

/// Point-in-time view of queue occupancy, polled by the metrics reporter and
/// exposed to operators through the dispatcher status accessor.
#[derive(Debug, Clone, Default)]
pub struct QueueDepths {
    pub buffered_entries: usize,
    pub pending_fetch_weight: u64,
    pub pending_process_jobs: usize,
    pub workers: Vec<WorkerLoad>,
}

/// Spawns a background task that periodically logs throughput, queue depths,
/// and per-worker pending counts.
pub fn spawn_metrics_reporter<F, Fut>(
    telemetry: Arc<Telemetry>,
    mut poll_depths: F,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = QueueDepths> + Send,
{
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_snapshot = telemetry.snapshot();
        let mut last_tick = Instant::now();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(target: "blockflow::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current_snapshot = telemetry.snapshot();
                    let processed_delta = current_snapshot
                        .processed_blocks
                        .saturating_sub(last_snapshot.processed_blocks);
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    let throughput = if elapsed <= f64::EPSILON {
                        0.0
                    } else {
                        processed_delta as f64 / elapsed
                    };
                    let depths = poll_depths().await;

                    tracing::info!(
                        target: "blockflow::metrics",
                        throughput = format!("{throughput:.2}"),
                        processed = current_snapshot.processed_blocks,
                        fetched = current_snapshot.fetched_blocks,
                        discarded = current_snapshot.discarded_blocks,
                        flushes = current_snapshot.queue_flushes,
                        rewinds = current_snapshot.rewinds,
                        buffered = depths.buffered_entries,
                        fetch_weight = depths.pending_fetch_weight,
                        process_jobs = depths.pending_process_jobs,
                        workers = ?depths.workers,
                        "runtime metrics snapshot"
                    );

                    last_snapshot = current_snapshot;
                    last_tick = Instant::now();
                }
            }
        }
    })
}
