//! Execution-context guard for the coordinator task.
//!
//! Checkpoint and proof-of-index state have a single writer: the process-stage
//! consumer. The lifecycle hooks assert at entry that they run inside that
//! task, replacing annotation-based enforcement with a runtime check.

use core::future::Future;

tokio::task_local! {
    static COORDINATOR: ();
}

/// Runs a future with the coordinator marker set for its whole task.
pub(crate) async fn enter_coordinator<F>(future: F) -> F::Output
where
    F: Future,
{
    COORDINATOR.scope((), future).await
}

/// Asserts that the caller is executing inside the coordinator task.
#[track_caller]
pub(crate) fn assert_coordinator(hook: &str) {
    debug_assert!(
        COORDINATOR.try_with(|_| ()).is_ok(),
        "{hook} must only be called from the coordinator task"
    );
    // Release builds still record misuse without aborting the pipeline.
    if COORDINATOR.try_with(|_| ()).is_err() {
        tracing::error!(hook, "lifecycle hook invoked outside the coordinator task");
    }
}
