//! Collaborator seams consumed by the dispatchers.
//!
//! Everything chain-, storage-, or runtime-specific sits behind these traits;
//! the dispatch core only schedules calls into them. All methods return boxed
//! futures so implementations stay object safe behind `Arc<dyn ...>`.

use crate::blocks::{FetchedBlock, Header};
use anyhow::Error as AnyError;
use core::future::Future;
use core::pin::Pin;
use std::fmt;
use std::sync::Arc;

pub type ServiceFuture<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;
pub type FetchFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, FetchError>> + Send + 'a>>;

/// Failure modes of a fetch task.
///
/// `Flushed` and `BlockUnavailable` are benign and swallowed where detected;
/// any `Source` error is the pipeline's first fatal condition.
#[derive(Debug)]
pub enum FetchError {
    /// The task was cancelled by a queue flush rather than failing on its own.
    Flushed,
    /// The height does not exist on the connected node (e.g. pruned).
    BlockUnavailable { height: u64 },
    /// Any other failure from the chain-data source.
    Source(AnyError),
}

impl FetchError {
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            FetchError::Flushed | FetchError::BlockUnavailable { .. }
        )
    }

    pub fn source(error: impl Into<AnyError>) -> Self {
        FetchError::Source(error.into())
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Flushed => write!(f, "fetch task flushed"),
            FetchError::BlockUnavailable { height } => {
                write!(f, "block at height {height} unavailable")
            }
            FetchError::Source(err) => write!(f, "fetch failed: {err}"),
        }
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FetchError::Source(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

/// Chain-data source: fetches blocks and weighs them for queue budgeting.
pub trait ChainSource: Send + Sync + 'static {
    type Block: Send + Sync + 'static;

    /// Fetch the given heights. Implementations may return fewer blocks than
    /// requested only by failing with `BlockUnavailable` for the missing ones.
    fn fetch_blocks(&self, heights: &[u64]) -> FetchFuture<'_, Vec<FetchedBlock<Self::Block>>>;

    /// Estimated weight of a fetched block for memory budgeting. Implementations
    /// should scale this with the serialized block size; `1` is a valid floor.
    fn block_weight(&self, block: &FetchedBlock<Self::Block>) -> u64;

    /// Header lookup used by administrative rewinds.
    fn header_for_height(&self, height: u64) -> ServiceFuture<'_, Header>;
}

/// Checkpoint metadata written after each committed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub last_processed_height: u64,
    /// Wall-clock time of the commit, milliseconds since the epoch.
    pub last_processed_timestamp: u64,
    /// Timestamp carried by the block itself.
    pub last_processed_block_timestamp: u64,
    pub processed_block_count: u64,
}

/// Persistence collaborator. The transaction for a height is owned by the
/// process stage for that height's duration; the dispatcher never holds more
/// than one open transaction.
pub trait Store: Send + Sync + 'static {
    /// Persisted block count used to hydrate dispatcher state at init.
    fn processed_block_count(&self) -> ServiceFuture<'_, u64>;

    /// Persist the header at the transaction boundary before handlers run.
    fn persist_header(&self, header: &Header) -> ServiceFuture<'_, ()>;

    fn write_checkpoint(&self, checkpoint: &Checkpoint) -> ServiceFuture<'_, ()>;

    fn set_last_poi_height(&self, height: u64) -> ServiceFuture<'_, ()>;

    /// Digest of the store operations accumulated while indexing the height,
    /// if any handler wrote anything.
    fn operation_hash(&self, height: u64) -> ServiceFuture<'_, Option<[u8; 32]>>;

    /// Commit pending writes for the height. `datasources_remain` tells the
    /// store whether any data source stays active beyond this height.
    fn commit_block(&self, height: u64, datasources_remain: bool) -> ServiceFuture<'_, ()>;

    /// Force-flush cached writes; used on the fatal-fetch drain path.
    fn flush_cache(&self) -> ServiceFuture<'_, ()>;
}

/// Proof-of-index collaborator.
pub trait Poi: Send + Sync + 'static {
    fn record_entry(&self, header: &Header, operation_hash: [u8; 32]) -> ServiceFuture<'_, ()>;

    fn pause_sync(&self) -> ServiceFuture<'_, ()>;

    fn resume_sync(&self) -> ServiceFuture<'_, ()>;

    fn stop_sync(&self) -> ServiceFuture<'_, ()>;
}

/// Project/upgrade collaborator: reindexing and the active data-source set.
pub trait Project: Send + Sync + 'static {
    fn reindex(&self, target: &Header) -> ServiceFuture<'_, ()>;

    /// Whether any data source is still active after the given height.
    fn datasources_active_after(&self, height: u64) -> ServiceFuture<'_, bool>;

    /// Advance the active-project-version pointer to the given height.
    fn advance_version(&self, height: u64) -> ServiceFuture<'_, ()>;
}

/// Runs the user handlers for a fetched block. Sandboxing and handler wiring
/// live below this seam; fork and multi-chain collaborators communicate with
/// the dispatcher only through the `reindex_target` the result carries. The
/// block is consumed: after execution only its side effects remain.
pub trait BlockExecutor: Send + Sync + 'static {
    type Block: Send + Sync + 'static;

    fn execute(
        &self,
        block: FetchedBlock<Self::Block>,
    ) -> ServiceFuture<'_, crate::blocks::ProcessResult>;
}

/// Bundle of collaborator handles shared across a dispatcher and its workers.
pub struct Services<B> {
    pub chain: Arc<dyn ChainSource<Block = B>>,
    pub store: Arc<dyn Store>,
    pub poi: Arc<dyn Poi>,
    pub project: Arc<dyn Project>,
    pub executor: Arc<dyn BlockExecutor<Block = B>>,
}

impl<B> Clone for Services<B> {
    fn clone(&self) -> Self {
        Self {
            chain: Arc::clone(&self.chain),
            store: Arc::clone(&self.store),
            poi: Arc::clone(&self.poi),
            project: Arc::clone(&self.project),
            executor: Arc::clone(&self.executor),
        }
    }
}
