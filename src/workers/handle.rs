//! Client-side worker proxy: per-method request/response over the serialized
//! channel. The dispatcher only ever talks to workers through this type.

use crate::blocks::{Header, ProcessResult};
use crate::runtime::telemetry::WorkerLoad;
use crate::services::{BlockExecutor, ChainSource, FetchError};
use crate::workers::messages::{decode, encode, Envelope, WorkerRequest, WorkerResponse};
use crate::workers::service::WorkerService;
use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const REQUEST_CHANNEL_CAPACITY: usize = 64;

pub(crate) struct WorkerHandle {
    id: usize,
    tx: mpsc::Sender<Envelope>,
    join: Mutex<Option<JoinHandle<()>>>,
}

/// Spawns a worker service task and returns the handle that proxies to it.
pub(crate) fn spawn_worker<B: Send + Sync + 'static>(
    id: usize,
    chain: Arc<dyn ChainSource<Block = B>>,
    executor: Arc<dyn BlockExecutor<Block = B>>,
    run_token: CancellationToken,
) -> WorkerHandle {
    let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
    let service = WorkerService::new(id, chain, executor, rx, run_token);
    let join = tokio::spawn(service.run());
    WorkerHandle {
        id,
        tx,
        join: Mutex::new(Some(join)),
    }
}

impl WorkerHandle {
    pub(crate) fn id(&self) -> usize {
        self.id
    }

    async fn request(&self, request: &WorkerRequest) -> Result<WorkerResponse> {
        let payload = encode(request)?;
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Envelope { payload, reply })
            .await
            .map_err(|_| anyhow!("worker {} is gone", self.id))?;
        let bytes = rx
            .await
            .map_err(|_| anyhow!("worker {} dropped the request", self.id))?;
        decode(&bytes)
    }

    /// Fetch a height into the worker's cache; only the header crosses back.
    pub(crate) async fn fetch_block(&self, height: u64) -> Result<Header, FetchError> {
        match self
            .request(&WorkerRequest::FetchBlock { height })
            .await
        {
            Ok(WorkerResponse::Fetched(result)) => result.map_err(FetchError::from),
            Ok(other) => Err(FetchError::source(anyhow!(
                "worker {} sent an unexpected fetch response: {other:?}",
                self.id
            ))),
            Err(err) => Err(FetchError::Source(err)),
        }
    }

    /// Run the handlers for a previously fetched height.
    pub(crate) async fn process_block(&self, height: u64) -> Result<ProcessResult> {
        match self
            .request(&WorkerRequest::ProcessBlock { height })
            .await?
        {
            WorkerResponse::Processed(result) => result.map_err(|message| anyhow!(message)),
            other => Err(anyhow!(
                "worker {} sent an unexpected process response: {other:?}",
                self.id
            )),
        }
    }

    pub(crate) async fn status(&self) -> Result<WorkerLoad> {
        match self.request(&WorkerRequest::Status).await? {
            WorkerResponse::Status(load) => Ok(load),
            other => Err(anyhow!(
                "worker {} sent an unexpected status response: {other:?}",
                self.id
            )),
        }
    }

    /// Pending-fetch count for least-loaded selection. A worker that cannot
    /// report is treated as maximally loaded so it is never chosen.
    pub(crate) async fn pending_fetch_count(&self) -> usize {
        match self.status().await {
            Ok(load) => load.pending_fetch,
            Err(err) => {
                tracing::warn!(worker = self.id, error = %err, "worker status poll failed");
                usize::MAX
            }
        }
    }

    pub(crate) async fn abort_fetching(&self) {
        match self.request(&WorkerRequest::AbortFetching).await {
            Ok(WorkerResponse::AbortAcknowledged) => {}
            Ok(other) => {
                tracing::warn!(worker = self.id, response = ?other, "unexpected abort response");
            }
            Err(err) => {
                tracing::warn!(worker = self.id, error = %err, "failed to abort worker fetches");
            }
        }
    }

    /// Asks the worker to exit and waits for its task to finish.
    pub(crate) async fn terminate(&self) -> Result<()> {
        if let Err(err) = self.request(&WorkerRequest::Terminate).await {
            tracing::debug!(worker = self.id, error = %err, "worker already gone at terminate");
        }
        let join = self.join.lock().unwrap().take();
        if let Some(join) = join {
            join.await
                .map_err(|err| anyhow!("worker {} task panicked: {err}", self.id))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::{BlockHash, FetchedBlock, ProcessResult};
    use crate::services::{FetchFuture, ServiceFuture};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, Duration};

    struct StubChain {
        delay: Duration,
        fetched: AtomicUsize,
    }

    impl ChainSource for StubChain {
        type Block = u64;

        fn fetch_blocks(&self, heights: &[u64]) -> FetchFuture<'_, Vec<FetchedBlock<u64>>> {
            let heights = heights.to_vec();
            Box::pin(async move {
                sleep(self.delay).await;
                self.fetched.fetch_add(heights.len(), Ordering::SeqCst);
                Ok(heights
                    .into_iter()
                    .map(|height| {
                        FetchedBlock::new(
                            Header {
                                height,
                                hash: BlockHash([height as u8; 32]),
                                parent_hash: BlockHash([height.wrapping_sub(1) as u8; 32]),
                                timestamp: height * 1_000,
                            },
                            height,
                        )
                    })
                    .collect())
            })
        }

        fn block_weight(&self, _block: &FetchedBlock<u64>) -> u64 {
            1
        }

        fn header_for_height(&self, height: u64) -> ServiceFuture<'_, Header> {
            Box::pin(async move {
                Ok(Header {
                    height,
                    hash: BlockHash([height as u8; 32]),
                    parent_hash: BlockHash([height.wrapping_sub(1) as u8; 32]),
                    timestamp: height * 1_000,
                })
            })
        }
    }

    struct StubExecutor;

    impl BlockExecutor for StubExecutor {
        type Block = u64;

        fn execute(&self, _block: FetchedBlock<u64>) -> ServiceFuture<'_, ProcessResult> {
            Box::pin(async { Ok(ProcessResult::default()) })
        }
    }

    fn spawn_stub_worker(delay: Duration) -> (WorkerHandle, CancellationToken) {
        let token = CancellationToken::new();
        let handle = spawn_worker(
            0,
            Arc::new(StubChain {
                delay,
                fetched: AtomicUsize::new(0),
            }),
            Arc::new(StubExecutor),
            token.clone(),
        );
        (handle, token)
    }

    #[tokio::test]
    async fn fetch_then_process_round_trip() {
        let (worker, _token) = spawn_stub_worker(Duration::ZERO);

        let header = worker.fetch_block(5).await.expect("fetch should succeed");
        assert_eq!(header.height, 5);

        let status = worker.status().await.expect("status should respond");
        assert_eq!(status.cached_blocks, 1);

        worker
            .process_block(5)
            .await
            .expect("process should succeed");
        let status = worker.status().await.expect("status should respond");
        assert_eq!(status.cached_blocks, 0, "processing consumes the cache");

        worker.terminate().await.expect("terminate should succeed");
    }

    #[tokio::test]
    async fn processing_an_unfetched_height_fails() {
        let (worker, _token) = spawn_stub_worker(Duration::ZERO);
        let err = worker
            .process_block(9)
            .await
            .expect_err("missing cache entry must fail");
        assert!(format!("{err}").contains("fetch cache"));
        worker.terminate().await.expect("terminate should succeed");
    }

    #[tokio::test]
    async fn abort_discards_outstanding_fetches_and_cache() {
        let (worker, _token) = spawn_stub_worker(Duration::from_millis(200));

        let fetch = {
            let height = 3;
            let worker = &worker;
            tokio::time::timeout(Duration::from_secs(2), async move {
                worker.fetch_block(height).await
            })
        };

        let (fetch_result, _) = tokio::join!(fetch, async {
            sleep(Duration::from_millis(20)).await;
            worker.abort_fetching().await;
        });

        let result = fetch_result.expect("fetch should resolve promptly after abort");
        assert!(matches!(result, Err(FetchError::Flushed)));

        let status = worker.status().await.expect("status should respond");
        assert_eq!(status.cached_blocks, 0);
        worker.terminate().await.expect("terminate should succeed");
    }

    #[tokio::test]
    async fn status_reports_pending_fetches() {
        let (worker, _token) = spawn_stub_worker(Duration::from_millis(100));

        let pending = {
            let worker = &worker;
            tokio::join!(
                async move {
                    let _ = worker.fetch_block(1).await;
                },
                async {
                    sleep(Duration::from_millis(20)).await;
                    worker.pending_fetch_count().await
                }
            )
            .1
        };
        assert_eq!(pending, 1, "in-flight fetch should be reported as pending");
        worker.terminate().await.expect("terminate should succeed");
    }
}
