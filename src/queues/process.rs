//! Sequential process stage shared by both dispatchers.
//!
//! Jobs run one at a time, in submission order, inside the coordinator task.
//! Submission suspends while the stage is full (backpressure to the fetch
//! side); a flush rejects queued jobs with a benign signal; a job failure or
//! timeout is routed through the fatal handler and stops the consumer.

use crate::runtime::context;
use crate::runtime::fatal::{DispatchError, DispatchStage, FatalErrorHandler};
use anyhow::anyhow;
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::futures::Notified;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Non-success outcome of a submitted job, as seen by the submitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessSignal {
    /// The job was discarded by a flush or stage shutdown before completing.
    Flushed,
    /// The job failed; the error was already routed through the fatal handler.
    Fatal,
}

struct ProcessJob {
    height: u64,
    task: BoxFuture<'static, anyhow::Result<()>>,
    reply: oneshot::Sender<Result<(), ProcessSignal>>,
}

struct StageState {
    jobs: VecDeque<ProcessJob>,
    running: bool,
    consumer_alive: bool,
}

struct StageInner {
    state: Mutex<StageState>,
    notify: Notify,
    capacity: usize,
    timeout: Duration,
}

pub(crate) struct ProcessStage {
    inner: Arc<StageInner>,
}

impl Clone for ProcessStage {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Completion handle returned by [`ProcessStage::submit`] once the job has
/// been queued; awaiting it yields the job outcome.
pub(crate) struct SubmittedJob {
    rx: oneshot::Receiver<Result<(), ProcessSignal>>,
}

impl SubmittedJob {
    pub(crate) async fn outcome(self) -> Result<(), ProcessSignal> {
        self.rx.await.unwrap_or(Err(ProcessSignal::Flushed))
    }
}

impl ProcessStage {
    pub(crate) fn new(capacity: usize, timeout: Duration) -> Self {
        assert!(capacity > 0, "process capacity must be greater than zero");
        Self {
            inner: Arc::new(StageInner {
                state: Mutex::new(StageState {
                    jobs: VecDeque::new(),
                    running: false,
                    consumer_alive: true,
                }),
                notify: Notify::new(),
                capacity,
                timeout,
            }),
        }
    }

    /// Queues a job, suspending while the stage is at capacity. Returns once
    /// the job is queued so the caller can release upstream turns before
    /// awaiting the outcome.
    pub(crate) async fn submit(
        &self,
        height: u64,
        task: BoxFuture<'static, anyhow::Result<()>>,
    ) -> SubmittedJob {
        let (tx, rx) = oneshot::channel();
        let mut job = Some(ProcessJob {
            height,
            task,
            reply: tx,
        });

        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.inner.state.lock().unwrap();
                if !state.consumer_alive {
                    // Reply channel drops with the job; the submitter observes
                    // a flushed outcome.
                    break;
                }
                if state.jobs.len() < self.inner.capacity {
                    state
                        .jobs
                        .push_back(job.take().expect("job submitted once"));
                    break;
                }
            }
            notified.await;
        }

        self.inner.notify.notify_waiters();
        SubmittedJob { rx }
    }

    /// Spawns the single consumer task. Jobs run inside the coordinator
    /// context so lifecycle hooks can assert their execution context.
    pub(crate) fn spawn_consumer(
        &self,
        run_token: CancellationToken,
        fatal: FatalErrorHandler,
    ) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(context::enter_coordinator(async move {
            loop {
                let job = tokio::select! {
                    _ = run_token.cancelled() => break,
                    job = Self::next_job(&inner) => job,
                };

                let height = job.height;
                let outcome = tokio::time::timeout(inner.timeout, job.task).await;
                {
                    let mut state = inner.state.lock().unwrap();
                    state.running = false;
                }
                inner.notify.notify_waiters();

                match outcome {
                    Ok(Ok(())) => {
                        let _ = job.reply.send(Ok(()));
                    }
                    Ok(Err(err)) => {
                        fatal.trigger(DispatchError::new(
                            DispatchStage::Process,
                            err.context(format!("failed to process block {height}")),
                        ));
                        let _ = job.reply.send(Err(ProcessSignal::Fatal));
                        break;
                    }
                    Err(_) => {
                        fatal.trigger(DispatchError::new(
                            DispatchStage::Process,
                            anyhow!(
                                "processing block {height} timed out after {:?}",
                                inner.timeout
                            ),
                        ));
                        let _ = job.reply.send(Err(ProcessSignal::Fatal));
                        break;
                    }
                }
            }

            let drained: Vec<ProcessJob> = {
                let mut state = inner.state.lock().unwrap();
                state.consumer_alive = false;
                state.running = false;
                state.jobs.drain(..).collect()
            };
            for job in drained {
                let _ = job.reply.send(Err(ProcessSignal::Flushed));
            }
            inner.notify.notify_waiters();
        }))
    }

    async fn next_job(inner: &Arc<StageInner>) -> ProcessJob {
        loop {
            let notified = inner.notify.notified();
            {
                let mut state = inner.state.lock().unwrap();
                if let Some(job) = state.jobs.pop_front() {
                    state.running = true;
                    drop(state);
                    inner.notify.notify_waiters();
                    return job;
                }
            }
            notified.await;
        }
    }

    /// Rejects every queued job with a benign flushed signal. The job already
    /// running (if any) completes; its own discard re-check decides whether it
    /// still commits.
    pub(crate) fn flush(&self) {
        let drained: Vec<ProcessJob> = {
            let mut state = self.inner.state.lock().unwrap();
            state.jobs.drain(..).collect()
        };
        for job in drained {
            let _ = job.reply.send(Err(ProcessSignal::Flushed));
        }
        self.inner.notify.notify_waiters();
    }

    /// Waits until no job is queued or running.
    pub(crate) async fn drain(&self) {
        loop {
            let notified = self.inner.notify.notified();
            {
                let state = self.inner.state.lock().unwrap();
                if state.jobs.is_empty() && !state.running {
                    return;
                }
            }
            notified.await;
        }
    }

    pub(crate) fn pending(&self) -> usize {
        let state = self.inner.state.lock().unwrap();
        state.jobs.len() + usize::from(state.running)
    }

    pub(crate) fn free_capacity(&self) -> usize {
        self.inner
            .capacity
            .saturating_sub(self.inner.state.lock().unwrap().jobs.len())
    }

    pub(crate) fn state_changed(&self) -> Notified<'_> {
        self.inner.notify.notified()
    }
}
