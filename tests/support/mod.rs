//! Shared test harness: recording mock collaborators and polling helpers.
#![allow(dead_code)]

use anyhow::{bail, Result};
use blockflow::{
    create_dispatcher, BlockExecutor, BlockHash, ChainSource, Checkpoint, Dispatcher,
    DispatcherConfig, DynamicDsCallback, FetchError, FetchFuture, FetchedBlock, HasHeader, Header,
    Poi, ProcessResult, Project, ServiceFuture, Services, Store,
};
use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

static TRACING_SUBSCRIBER: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING_SUBSCRIBER);
}

pub fn header(height: u64) -> Header {
    let mut hash = [0u8; 32];
    hash[..8].copy_from_slice(&height.to_le_bytes());
    let mut parent = [0u8; 32];
    parent[..8].copy_from_slice(&height.wrapping_sub(1).to_le_bytes());
    Header {
        height,
        hash: BlockHash(hash),
        parent_hash: BlockHash(parent),
        timestamp: height * 1_000,
    }
}

pub fn block(height: u64) -> FetchedBlock<u64> {
    FetchedBlock::new(header(height), height)
}

/// Pause point usable inside the mock executor; one-shot open.
#[derive(Default)]
pub struct Gate {
    entered: Notify,
    entered_flag: AtomicBool,
    release: Notify,
    released: AtomicBool,
}

impl Gate {
    pub async fn wait_entered(&self, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        loop {
            if self.entered_flag.load(Ordering::SeqCst) {
                return Ok(());
            }
            if start.elapsed() > timeout {
                bail!("gate was not entered within {timeout:?}");
            }
            let notified = self.entered.notified();
            if self.entered_flag.load(Ordering::SeqCst) {
                return Ok(());
            }
            let _ = tokio::time::timeout(Duration::from_millis(20), notified).await;
        }
    }

    pub fn open(&self) {
        self.released.store(true, Ordering::SeqCst);
        self.release.notify_waiters();
    }

    async fn pass(&self) {
        self.entered_flag.store(true, Ordering::SeqCst);
        self.entered.notify_waiters();
        loop {
            if self.released.load(Ordering::SeqCst) {
                return;
            }
            let notified = self.release.notified();
            if self.released.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

/// Chain source over synthetic headers; failures and delays are scripted
/// per height.
#[derive(Default)]
pub struct MockChain {
    fail_at: Mutex<HashSet<u64>>,
    unavailable: Mutex<HashSet<u64>>,
    delays: Mutex<HashMap<u64, Duration>>,
    weights: Mutex<HashMap<u64, u64>>,
    fetch_counts: Mutex<HashMap<u64, usize>>,
}

impl MockChain {
    pub fn fail_at(&self, height: u64) {
        self.fail_at.lock().unwrap().insert(height);
    }

    pub fn unavailable_at(&self, height: u64) {
        self.unavailable.lock().unwrap().insert(height);
    }

    pub fn delay_at(&self, height: u64, delay: Duration) {
        self.delays.lock().unwrap().insert(height, delay);
    }

    pub fn weight_at(&self, height: u64, weight: u64) {
        self.weights.lock().unwrap().insert(height, weight);
    }

    pub fn fetch_count(&self, height: u64) -> usize {
        self.fetch_counts
            .lock()
            .unwrap()
            .get(&height)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        self.fetch_counts.lock().unwrap().values().sum()
    }
}

impl ChainSource for MockChain {
    type Block = u64;

    fn fetch_blocks(&self, heights: &[u64]) -> FetchFuture<'_, Vec<FetchedBlock<u64>>> {
        let heights = heights.to_vec();
        Box::pin(async move {
            let mut blocks = Vec::with_capacity(heights.len());
            for height in heights {
                *self
                    .fetch_counts
                    .lock()
                    .unwrap()
                    .entry(height)
                    .or_insert(0) += 1;
                if self.fail_at.lock().unwrap().contains(&height) {
                    return Err(FetchError::source(anyhow::anyhow!(
                        "injected fetch failure at height {height}"
                    )));
                }
                if self.unavailable.lock().unwrap().contains(&height) {
                    return Err(FetchError::BlockUnavailable { height });
                }
                let delay = self.delays.lock().unwrap().get(&height).copied();
                if let Some(delay) = delay {
                    sleep(delay).await;
                }
                blocks.push(block(height));
            }
            Ok(blocks)
        })
    }

    fn block_weight(&self, block: &FetchedBlock<u64>) -> u64 {
        self.weights
            .lock()
            .unwrap()
            .get(&block.header().height)
            .copied()
            .unwrap_or(1)
    }

    fn header_for_height(&self, height: u64) -> ServiceFuture<'_, Header> {
        Box::pin(async move { Ok(header(height)) })
    }
}

#[derive(Default)]
pub struct RecordingStore {
    pub initial_count: AtomicU64,
    pub with_operation_hashes: AtomicBool,
    pub persisted_headers: Mutex<Vec<u64>>,
    pub checkpoints: Mutex<Vec<Checkpoint>>,
    pub committed: Mutex<Vec<u64>>,
    pub poi_heights: Mutex<Vec<u64>>,
    pub cache_flushes: AtomicU64,
}

impl RecordingStore {
    pub fn committed_heights(&self) -> Vec<u64> {
        self.committed.lock().unwrap().clone()
    }

    pub fn assert_checkpoints_strictly_increasing(&self) {
        let checkpoints = self.checkpoints.lock().unwrap();
        for window in checkpoints.windows(2) {
            if let [previous, next] = window {
                assert!(
                    next.last_processed_height > previous.last_processed_height,
                    "checkpoint heights must strictly increase: {} then {}",
                    previous.last_processed_height,
                    next.last_processed_height
                );
                assert_eq!(
                    next.processed_block_count,
                    previous.processed_block_count + 1,
                    "processed count must advance exactly once per commit"
                );
            }
        }
    }
}

impl Store for RecordingStore {
    fn processed_block_count(&self) -> ServiceFuture<'_, u64> {
        Box::pin(async move { Ok(self.initial_count.load(Ordering::SeqCst)) })
    }

    fn persist_header(&self, header: &Header) -> ServiceFuture<'_, ()> {
        let height = header.height;
        Box::pin(async move {
            self.persisted_headers.lock().unwrap().push(height);
            Ok(())
        })
    }

    fn write_checkpoint(&self, checkpoint: &Checkpoint) -> ServiceFuture<'_, ()> {
        let checkpoint = *checkpoint;
        Box::pin(async move {
            self.checkpoints.lock().unwrap().push(checkpoint);
            Ok(())
        })
    }

    fn set_last_poi_height(&self, height: u64) -> ServiceFuture<'_, ()> {
        Box::pin(async move {
            self.poi_heights.lock().unwrap().push(height);
            Ok(())
        })
    }

    fn operation_hash(&self, height: u64) -> ServiceFuture<'_, Option<[u8; 32]>> {
        Box::pin(async move {
            if self.with_operation_hashes.load(Ordering::SeqCst) {
                Ok(Some([height as u8; 32]))
            } else {
                Ok(None)
            }
        })
    }

    fn commit_block(&self, height: u64, _datasources_remain: bool) -> ServiceFuture<'_, ()> {
        Box::pin(async move {
            self.committed.lock().unwrap().push(height);
            Ok(())
        })
    }

    fn flush_cache(&self) -> ServiceFuture<'_, ()> {
        Box::pin(async move {
            self.cache_flushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

#[derive(Default)]
pub struct RecordingPoi {
    pub entries: Mutex<Vec<u64>>,
    pub pauses: AtomicU64,
    pub resumes: AtomicU64,
    pub stops: AtomicU64,
}

impl Poi for RecordingPoi {
    fn record_entry(&self, header: &Header, _operation_hash: [u8; 32]) -> ServiceFuture<'_, ()> {
        let height = header.height;
        Box::pin(async move {
            self.entries.lock().unwrap().push(height);
            Ok(())
        })
    }

    fn pause_sync(&self) -> ServiceFuture<'_, ()> {
        Box::pin(async move {
            self.pauses.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn resume_sync(&self) -> ServiceFuture<'_, ()> {
        Box::pin(async move {
            self.resumes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn stop_sync(&self) -> ServiceFuture<'_, ()> {
        Box::pin(async move {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

#[derive(Default)]
pub struct RecordingProject {
    pub reindex_targets: Mutex<Vec<u64>>,
    pub advanced_versions: Mutex<Vec<u64>>,
}

impl Project for RecordingProject {
    fn reindex(&self, target: &Header) -> ServiceFuture<'_, ()> {
        let height = target.height;
        Box::pin(async move {
            self.reindex_targets.lock().unwrap().push(height);
            Ok(())
        })
    }

    fn datasources_active_after(&self, _height: u64) -> ServiceFuture<'_, bool> {
        Box::pin(async move { Ok(true) })
    }

    fn advance_version(&self, height: u64) -> ServiceFuture<'_, ()> {
        Box::pin(async move {
            self.advanced_versions.lock().unwrap().push(height);
            Ok(())
        })
    }
}

/// Handler executor that records every processed height together with the
/// data-source version it ran under, with scripted pauses and results.
#[derive(Default)]
pub struct RecordingExecutor {
    pub processed: Mutex<Vec<u64>>,
    pub processed_versions: Mutex<Vec<(u64, u64)>>,
    pub ds_version: AtomicU64,
    gates: Mutex<HashMap<u64, Arc<Gate>>>,
    dynamic_ds_at: Mutex<HashSet<u64>>,
    reindex_at: Mutex<HashMap<u64, Header>>,
    fail_at: Mutex<HashSet<u64>>,
}

impl RecordingExecutor {
    pub fn gate_at(&self, height: u64) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        self.gates.lock().unwrap().insert(height, Arc::clone(&gate));
        gate
    }

    pub fn dynamic_ds_at(&self, height: u64) {
        self.dynamic_ds_at.lock().unwrap().insert(height);
    }

    pub fn reindex_at(&self, height: u64, target: Header) {
        self.reindex_at.lock().unwrap().insert(height, target);
    }

    pub fn fail_at(&self, height: u64) {
        self.fail_at.lock().unwrap().insert(height);
    }

    pub fn processed_heights(&self) -> Vec<u64> {
        self.processed.lock().unwrap().clone()
    }
}

impl BlockExecutor for RecordingExecutor {
    type Block = u64;

    fn execute(&self, block: FetchedBlock<u64>) -> ServiceFuture<'_, ProcessResult> {
        let height = block.header().height;
        Box::pin(async move {
            let gate = self.gates.lock().unwrap().get(&height).cloned();
            if let Some(gate) = gate {
                gate.pass().await;
            }

            if self.fail_at.lock().unwrap().contains(&height) {
                anyhow::bail!("injected handler failure at height {height}");
            }

            let version = self.ds_version.load(Ordering::SeqCst);
            self.processed.lock().unwrap().push(height);
            self.processed_versions
                .lock()
                .unwrap()
                .push((height, version));

            Ok(ProcessResult {
                dynamic_datasource_created: self.dynamic_ds_at.lock().unwrap().remove(&height),
                reindex_target: self.reindex_at.lock().unwrap().remove(&height),
            })
        })
    }
}

pub struct Harness {
    pub chain: Arc<MockChain>,
    pub store: Arc<RecordingStore>,
    pub poi: Arc<RecordingPoi>,
    pub project: Arc<RecordingProject>,
    pub executor: Arc<RecordingExecutor>,
}

impl Harness {
    pub fn new() -> Self {
        init_tracing();
        Self {
            chain: Arc::new(MockChain::default()),
            store: Arc::new(RecordingStore::default()),
            poi: Arc::new(RecordingPoi::default()),
            project: Arc::new(RecordingProject::default()),
            executor: Arc::new(RecordingExecutor::default()),
        }
    }

    pub fn services(&self) -> Services<u64> {
        Services {
            chain: self.chain.clone(),
            store: self.store.clone(),
            poi: self.poi.clone(),
            project: self.project.clone(),
            executor: self.executor.clone(),
        }
    }

    pub fn config(batch_size: usize, worker_count: usize) -> DispatcherConfig {
        DispatcherConfig::builder()
            .batch_size(batch_size)
            .worker_count(worker_count)
            .metrics_interval(Duration::from_secs(60))
            .build()
            .expect("test config should validate")
    }

    /// Builds and initializes a dispatcher with a no-op dynamic-ds callback.
    pub async fn dispatcher(
        &self,
        batch_size: usize,
        worker_count: usize,
    ) -> Arc<dyn Dispatcher<u64>> {
        let dispatcher = create_dispatcher(
            Self::config(batch_size, worker_count),
            self.services(),
        );
        dispatcher
            .init(noop_dynamic_ds())
            .await
            .expect("dispatcher init should succeed");
        dispatcher
    }
}

pub fn noop_dynamic_ds() -> DynamicDsCallback {
    Arc::new(|_height| Box::pin(async { Ok(()) }))
}

/// Polls a predicate until it holds or the timeout elapses.
pub async fn wait_for<F>(what: &str, timeout: Duration, predicate: F) -> Result<()>
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    loop {
        if predicate() {
            return Ok(());
        }
        if start.elapsed() > timeout {
            bail!("timed out after {timeout:?} waiting for {what}");
        }
        sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_processed_height(
    dispatcher: &Arc<dyn Dispatcher<u64>>,
    target: u64,
    timeout: Duration,
) -> Result<()> {
    let result = wait_for("processed height", timeout, || {
        dispatcher.latest_processed_height() >= target
    })
    .await;
    if result.is_err() {
        bail!(
            "dispatcher did not reach height {target} within {timeout:?} \
             (last processed: {})",
            dispatcher.latest_processed_height()
        );
    }
    Ok(())
}
