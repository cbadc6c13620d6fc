//! Fan-out of one operation across concurrent runners.
//!
//! [`run`] spawns one task per runner slot before awaiting any of them, then waits for every
//! task to finish. A failing runner does not cancel its siblings; all failures are collected into
//! a single [`AggregateRunnerFailure`]. No ordering between runners is guaranteed.

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::{AggregateRunnerFailure, Error, Result};
use crate::pool::RunnerSlot;

/// Runs `operation` for every slot in `0..runners` concurrently.
///
/// Every per-slot future observes `cancel`: once it fires, runners still in flight stop and
/// report [`Error::Cancelled`]. Results are returned in slot order.
pub async fn run<T, F, Fut>(
    runners: usize,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<Vec<T>>
where
    F: FnMut(RunnerSlot) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let handles: Vec<_> = RunnerSlot::range(runners)
        .map(|slot| {
            let task = operation(slot);
            let cancel = cancel.clone();
            let span = tracing::debug_span!("runner", %slot);
            tokio::spawn(async move { cancellable(&cancel, task).await }.instrument(span))
        })
        .collect();

    let joined = futures::future::join_all(handles).await;

    let mut results = Vec::with_capacity(runners);
    let mut failures = Vec::new();
    for (slot, outcome) in RunnerSlot::range(runners).zip(joined) {
        match outcome {
            Ok(Ok(value)) => results.push(value),
            Ok(Err(error)) => failures.push((slot, error)),
            Err(join_error) => {
                failures.push((slot, Error::RunnerPanicked(join_error.to_string())));
            }
        }
    }

    if failures.is_empty() {
        Ok(results)
    } else {
        tracing::debug!(failed = failures.len(), runners, "coordinated run failed");
        Err(AggregateRunnerFailure { failures }.into())
    }
}

/// Runs `operation` for the single slot `0` on the current task.
///
/// This is the shape of single-client benchmarks, which measure one client without any
/// scheduling overhead.
pub async fn run_inline<T, Fut>(cancel: &CancellationToken, operation: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    cancellable(cancel, operation).await
}

async fn cancellable<T, Fut>(cancel: &CancellationToken, operation: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = operation => result,
    }
}
