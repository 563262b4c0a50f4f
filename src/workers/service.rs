//! Worker service task: fetches blocks into a local cache and runs handler
//! execution on request. Shares no state with the dispatcher; everything goes
//! through the serialized request channel.

use crate::blocks::FetchedBlock;
use crate::services::{BlockExecutor, ChainSource, FetchError};
use crate::workers::messages::{
    decode, encode, Envelope, WireFetchError, WorkerRequest, WorkerResponse,
};
use crate::runtime::telemetry::WorkerLoad;
use anyhow::anyhow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub(crate) struct WorkerService<B> {
    id: usize,
    chain: Arc<dyn ChainSource<Block = B>>,
    executor: Arc<dyn BlockExecutor<Block = B>>,
    requests: mpsc::Receiver<Envelope>,
    run_token: CancellationToken,
    state: Arc<WorkerState<B>>,
}

struct WorkerState<B> {
    cache: Mutex<HashMap<u64, FetchedBlock<B>>>,
    pending_fetch: AtomicUsize,
    pending_process: AtomicUsize,
    /// Swapped out and cancelled when outstanding fetches must be abandoned.
    abort_token: Mutex<CancellationToken>,
}

impl<B: Send + Sync + 'static> WorkerService<B> {
    pub(crate) fn new(
        id: usize,
        chain: Arc<dyn ChainSource<Block = B>>,
        executor: Arc<dyn BlockExecutor<Block = B>>,
        requests: mpsc::Receiver<Envelope>,
        run_token: CancellationToken,
    ) -> Self {
        Self {
            id,
            chain,
            executor,
            requests,
            run_token,
            state: Arc::new(WorkerState {
                cache: Mutex::new(HashMap::new()),
                pending_fetch: AtomicUsize::new(0),
                pending_process: AtomicUsize::new(0),
                abort_token: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    pub(crate) async fn run(mut self) {
        tracing::info!(worker = self.id, "worker task started");

        loop {
            let envelope = tokio::select! {
                _ = self.run_token.cancelled() => break,
                envelope = self.requests.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            let request: WorkerRequest = match decode(&envelope.payload) {
                Ok(request) => request,
                Err(err) => {
                    tracing::error!(worker = self.id, error = %err, "dropping undecodable request");
                    continue;
                }
            };

            match request {
                WorkerRequest::FetchBlock { height } => self.handle_fetch(height, envelope),
                WorkerRequest::ProcessBlock { height } => self.handle_process(height, envelope),
                WorkerRequest::Status => {
                    let load = WorkerLoad {
                        worker_id: self.id,
                        pending_fetch: self.state.pending_fetch.load(Ordering::SeqCst),
                        pending_process: self.state.pending_process.load(Ordering::SeqCst),
                        cached_blocks: self.state.cache.lock().unwrap().len(),
                    };
                    respond(self.id, envelope, &WorkerResponse::Status(load));
                }
                WorkerRequest::AbortFetching => {
                    let old_token = {
                        let mut token = self.state.abort_token.lock().unwrap();
                        std::mem::replace(&mut *token, CancellationToken::new())
                    };
                    old_token.cancel();
                    // Cached blocks may belong to a superseded branch; drop
                    // them so stale payloads can never be processed.
                    self.state.cache.lock().unwrap().clear();
                    tracing::debug!(worker = self.id, "aborted outstanding fetches");
                    respond(self.id, envelope, &WorkerResponse::AbortAcknowledged);
                }
                WorkerRequest::Terminate => {
                    respond(self.id, envelope, &WorkerResponse::Terminating);
                    break;
                }
            }
        }

        tracing::info!(worker = self.id, "worker task exited");
    }

    /// Fetches run concurrently inside the worker; only the request intake is
    /// serialized so status polls stay responsive.
    fn handle_fetch(&self, height: u64, envelope: Envelope) {
        let worker_id = self.id;
        let chain = Arc::clone(&self.chain);
        let state = Arc::clone(&self.state);
        let abort_token = self.state.abort_token.lock().unwrap().clone();
        let run_token = self.run_token.clone();

        state.pending_fetch.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = abort_token.cancelled() => Err(FetchError::Flushed),
                _ = run_token.cancelled() => Err(FetchError::Flushed),
                fetched = chain.fetch_blocks(&[height]) => fetched.and_then(|mut blocks| {
                    blocks.pop().ok_or(FetchError::BlockUnavailable { height })
                }),
            };
            state.pending_fetch.fetch_sub(1, Ordering::SeqCst);

            let response = match result {
                Ok(block) => {
                    let header = *crate::blocks::HasHeader::header(&block);
                    state.cache.lock().unwrap().insert(height, block);
                    WorkerResponse::Fetched(Ok(header))
                }
                Err(err) => WorkerResponse::Fetched(Err(WireFetchError::from(err))),
            };
            respond(worker_id, envelope, &response);
        });
    }

    fn handle_process(&self, height: u64, envelope: Envelope) {
        let worker_id = self.id;
        let executor = Arc::clone(&self.executor);
        let state = Arc::clone(&self.state);

        state.pending_process.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let block = state.cache.lock().unwrap().remove(&height);
            let result = match block {
                Some(block) => executor
                    .execute(block)
                    .await
                    .map_err(|err| format!("{err:#}")),
                None => Err(format!(
                    "block {height} is not in worker {worker_id}'s fetch cache"
                )),
            };
            state.pending_process.fetch_sub(1, Ordering::SeqCst);
            respond(worker_id, envelope, &WorkerResponse::Processed(result));
        });
    }
}

fn respond(worker_id: usize, envelope: Envelope, response: &WorkerResponse) {
    let bytes = match encode(response) {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::error!(worker = worker_id, error = %err, "failed to encode response");
            encode(&WorkerResponse::Processed(Err(anyhow!(
                "worker {worker_id} failed to encode its response"
            )
            .to_string())))
            .unwrap_or_default()
        }
    };
    if envelope.reply.send(bytes).is_err() {
        tracing::debug!(worker = worker_id, "request abandoned before reply");
    }
}
