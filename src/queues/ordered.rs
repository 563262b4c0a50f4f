//! Completion-ordered task queue used by both fetch stages.
//!
//! Tasks execute concurrently, but their results are handed over strictly in
//! admission order: a task holds its "turn" (a [`TurnGuard`]) from the moment
//! its result is released until the caller has forwarded the result downstream.
//! This is what lets racing fetch completions feed a sequential process stage
//! without ever reordering heights.
//!
//! Weight accounting: each successful result contributes a caller-supplied
//! weight from completion until its turn guard drops, so large blocks hold
//! more of the stage budget than small ones.

use crate::services::FetchError;
use anyhow::anyhow;
use core::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub(crate) struct OrderedTaskQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    state: Mutex<QueueState>,
    notify: Notify,
    budget: usize,
    capacity: usize,
    task_timeout: Duration,
}

struct QueueState {
    next_ticket: u64,
    next_release: u64,
    outstanding: usize,
    pending_weight: u64,
    generation: u64,
    /// Set when a fatal task error reached its turn; later tickets are held
    /// back until a flush resets the queue.
    halted: bool,
    flush_token: CancellationToken,
}

/// Admission slot handed out in strict order before a task starts running.
pub(crate) struct Admission {
    ticket: u64,
    generation: u64,
    token: CancellationToken,
}

/// Holds the release turn for a delivered result. Dropping the guard lets the
/// next admitted task hand its result over.
pub(crate) struct TurnGuard {
    inner: Arc<QueueInner>,
    generation: u64,
    weight: u64,
}

impl std::fmt::Debug for TurnGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnGuard")
            .field("generation", &self.generation)
            .field("weight", &self.weight)
            .finish()
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.generation == self.generation {
                state.next_release += 1;
                state.pending_weight = state.pending_weight.saturating_sub(self.weight);
            }
            state.outstanding = state.outstanding.saturating_sub(1);
        }
        self.inner.notify.notify_waiters();
    }
}

impl Clone for OrderedTaskQueue {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl OrderedTaskQueue {
    pub(crate) fn new(capacity: usize, budget: usize, task_timeout: Duration) -> Self {
        assert!(capacity > 0, "capacity must be greater than zero");
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    next_ticket: 0,
                    next_release: 0,
                    outstanding: 0,
                    pending_weight: 0,
                    generation: 0,
                    halted: false,
                    flush_token: CancellationToken::new(),
                }),
                notify: Notify::new(),
                budget: budget.max(1),
                capacity,
                task_timeout,
            }),
        }
    }

    /// Takes the next admission slot, suspending while the queue is at its
    /// burst capacity. Admissions must be taken in the order results are
    /// expected downstream.
    pub(crate) async fn admit(&self) -> Admission {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.inner.state.lock().unwrap();
                if state.outstanding < self.inner.capacity {
                    let ticket = state.next_ticket;
                    state.next_ticket += 1;
                    state.outstanding += 1;
                    return Admission {
                        ticket,
                        generation: state.generation,
                        token: state.flush_token.clone(),
                    };
                }
            }
            notified.await;
        }
    }

    /// Runs a task under the given admission and waits for its release turn.
    ///
    /// Benign failures pass the turn straight to the next ticket; a fatal
    /// failure halts the queue at this ticket so no later result can slip
    /// past it before the caller reacts (typically with a flush).
    pub(crate) async fn execute<T, F, W>(
        &self,
        admission: Admission,
        task: F,
        weigh: W,
    ) -> Result<(T, TurnGuard), FetchError>
    where
        F: Future<Output = Result<T, FetchError>>,
        W: FnOnce(&T) -> u64,
    {
        let Admission {
            ticket,
            generation,
            token,
        } = admission;

        let result = tokio::select! {
            _ = token.cancelled() => Err(FetchError::Flushed),
            outcome = tokio::time::timeout(self.inner.task_timeout, task) => match outcome {
                Ok(result) => result,
                Err(_) => Err(FetchError::source(anyhow!(
                    "task timed out after {:?}",
                    self.inner.task_timeout
                ))),
            },
        };

        let weight = match &result {
            Ok(value) => weigh(value).max(1),
            Err(_) => 0,
        };
        if weight > 0 {
            let mut state = self.inner.state.lock().unwrap();
            if state.generation == generation {
                state.pending_weight = state.pending_weight.saturating_add(weight);
            }
        }
        self.inner.notify.notify_waiters();

        let mut result = Some(result);
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.inner.state.lock().unwrap();
                if state.generation != generation {
                    state.outstanding = state.outstanding.saturating_sub(1);
                    drop(state);
                    self.inner.notify.notify_waiters();
                    return Err(FetchError::Flushed);
                }
                if !state.halted && state.next_release == ticket {
                    return match result.take().expect("result delivered once") {
                        Ok(value) => {
                            let guard = TurnGuard {
                                inner: Arc::clone(&self.inner),
                                generation,
                                weight,
                            };
                            drop(state);
                            Ok((value, guard))
                        }
                        Err(err) => {
                            if err.is_benign() {
                                state.next_release += 1;
                            } else {
                                state.halted = true;
                            }
                            state.outstanding = state.outstanding.saturating_sub(1);
                            drop(state);
                            self.inner.notify.notify_waiters();
                            Err(err)
                        }
                    };
                }
            }
            notified.await;
        }
    }

    /// Cancels in-flight tasks and rejects unreleased results with a benign
    /// flushed condition. Weight and release bookkeeping restart fresh.
    pub(crate) fn flush(&self) {
        let old_token = {
            let mut state = self.inner.state.lock().unwrap();
            state.generation += 1;
            state.halted = false;
            state.pending_weight = 0;
            state.next_release = state.next_ticket;
            std::mem::replace(&mut state.flush_token, CancellationToken::new())
        };
        old_token.cancel();
        self.inner.notify.notify_waiters();
    }

    /// Waits until no admitted task or held turn remains.
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.inner.state.lock().unwrap().outstanding == 0 {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.inner.state.lock().unwrap().outstanding
    }

    pub(crate) fn free_slots(&self) -> usize {
        self.inner
            .capacity
            .saturating_sub(self.inner.state.lock().unwrap().outstanding)
    }

    pub(crate) fn pending_weight(&self) -> u64 {
        self.inner.state.lock().unwrap().pending_weight
    }

    /// True while the stage is under its normal scheduling budget; admissions
    /// beyond it are still possible up to the burst capacity.
    pub(crate) fn has_spare_capacity(&self) -> bool {
        self.inner.state.lock().unwrap().outstanding < self.inner.budget
    }

    pub(crate) fn state_changed(&self) -> Notified<'_> {
        self.inner.notify.notified()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, timeout};

    fn queue(capacity: usize, budget: usize) -> OrderedTaskQueue {
        OrderedTaskQueue::new(capacity, budget, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn releases_results_in_admission_order() {
        let q = queue(8, 8);
        let a = q.admit().await;
        let b = q.admit().await;

        let q_slow = q.clone();
        let slow = tokio::spawn(async move {
            q_slow
                .execute(
                    a,
                    async {
                        sleep(Duration::from_millis(50)).await;
                        Ok(1u64)
                    },
                    |_| 1,
                )
                .await
        });
        let q_fast = q.clone();
        let fast = tokio::spawn(async move { q_fast.execute(b, async { Ok(2u64) }, |_| 1).await });

        sleep(Duration::from_millis(10)).await;
        assert!(
            !fast.is_finished(),
            "second ticket must wait for the first to release"
        );

        let (value, guard) = slow.await.unwrap().expect("first task should succeed");
        assert_eq!(value, 1);
        assert!(!fast.is_finished(), "turn is held until the guard drops");
        drop(guard);

        let (value, _guard) = timeout(Duration::from_millis(250), fast)
            .await
            .expect("second result should release after the first turn ends")
            .unwrap()
            .expect("second task should succeed");
        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn admission_suspends_at_capacity() {
        let q = queue(1, 1);
        let admission = q.admit().await;

        let q2 = q.clone();
        let second = tokio::spawn(async move { q2.admit().await });
        sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished(), "capacity should gate admissions");

        let (_, guard) = q
            .execute(admission, async { Ok(()) }, |_| 1)
            .await
            .expect("task should succeed");
        drop(guard);

        timeout(Duration::from_millis(250), second)
            .await
            .expect("slot should free after release")
            .unwrap();
    }

    #[tokio::test]
    async fn weight_is_held_until_the_turn_ends() {
        let q = queue(4, 4);
        let admission = q.admit().await;
        let (_, guard) = q
            .execute(admission, async { Ok(()) }, |_| 7)
            .await
            .expect("task should succeed");
        assert_eq!(q.pending_weight(), 7);
        drop(guard);
        assert_eq!(q.pending_weight(), 0);
        assert_eq!(q.outstanding(), 0);
    }

    #[tokio::test]
    async fn benign_failure_passes_the_turn_along() {
        let q = queue(4, 4);
        let a = q.admit().await;
        let b = q.admit().await;

        let err = q
            .execute(
                a,
                async { Err::<(), _>(FetchError::BlockUnavailable { height: 5 }) },
                |_| 1,
            )
            .await
            .expect_err("first task fails");
        assert!(err.is_benign());

        let (value, _guard) = timeout(
            Duration::from_millis(250),
            q.execute(b, async { Ok(6u64) }, |_| 1),
        )
        .await
        .expect("benign failure must not halt the queue")
        .expect("second task should succeed");
        assert_eq!(value, 6);
    }

    #[tokio::test]
    async fn fatal_failure_halts_later_tickets_until_flush() {
        let q = queue(4, 4);
        let a = q.admit().await;
        let b = q.admit().await;

        let err = q
            .execute(
                a,
                async { Err::<(), _>(FetchError::source(anyhow!("node gone"))) },
                |_| 1,
            )
            .await
            .expect_err("first task fails");
        assert!(!err.is_benign());

        let q2 = q.clone();
        let held = tokio::spawn(async move { q2.execute(b, async { Ok(()) }, |_| 1).await });
        sleep(Duration::from_millis(20)).await;
        assert!(
            !held.is_finished(),
            "later tickets must not release past a fatal failure"
        );

        q.flush();
        let result = timeout(Duration::from_millis(250), held)
            .await
            .expect("flush should unblock held tickets")
            .unwrap();
        assert!(matches!(result, Err(FetchError::Flushed)));

        q.wait_idle().await;
        assert_eq!(q.outstanding(), 0);
    }

    #[tokio::test]
    async fn flush_cancels_in_flight_tasks() {
        let q = queue(4, 4);
        let admission = q.admit().await;

        let q2 = q.clone();
        let hung = tokio::spawn(async move {
            q2.execute(
                admission,
                async {
                    sleep(Duration::from_secs(30)).await;
                    Ok(())
                },
                |_| 1,
            )
            .await
        });

        sleep(Duration::from_millis(20)).await;
        q.flush();

        let result = timeout(Duration::from_millis(250), hung)
            .await
            .expect("flush should cancel the in-flight task")
            .unwrap();
        assert!(matches!(result, Err(FetchError::Flushed)));
    }

    #[tokio::test]
    async fn timeout_surfaces_as_fatal_failure() {
        let q = OrderedTaskQueue::new(2, 2, Duration::from_millis(20));
        let admission = q.admit().await;
        let err = q
            .execute(
                admission,
                async {
                    sleep(Duration::from_secs(30)).await;
                    Ok(())
                },
                |_: &()| 1,
            )
            .await
            .expect_err("task should time out");
        assert!(!err.is_benign(), "queue timeouts are ordinary fatal failures");
    }
}
