//! Bounded batch execution.
//!
//! Backends limit how many items a single push, pull or delete call may carry. The helpers here
//! split a logical batch into calls of at most `max_per_call` items and drive them one after
//! another. Batches of one runner never overlap; parallelism comes from running several runners.

use std::future::Future;

use crate::backend::BackendResult;
use crate::error::{Error, Result};

/// Progress of a batched push-style operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchProgress {
    /// Number of calls issued.
    pub calls: usize,
    /// Number of items applied by those calls.
    pub applied: usize,
}

/// Applies `items` in consecutive batches of at most `max_per_call` items.
///
/// The last batch may be smaller. On failure, the returned [`Error::Batch`] reports how many
/// items were applied before the failing call.
///
/// # Panics
///
/// Panics if `max_per_call` is zero.
pub async fn execute_batched<T, F, Fut>(
    items: Vec<T>,
    max_per_call: usize,
    mut operation: F,
) -> Result<BatchProgress>
where
    F: FnMut(Vec<T>) -> Fut,
    Fut: Future<Output = BackendResult<()>>,
{
    assert!(max_per_call > 0, "batch limit must be positive");

    let requested = items.len();
    let mut progress = BatchProgress::default();
    let mut remaining = items.into_iter();

    while progress.applied < requested {
        let batch: Vec<T> = remaining.by_ref().take(max_per_call).collect();
        let batch_len = batch.len();

        operation(batch).await.map_err(|source| Error::Batch {
            applied: progress.applied,
            requested,
            source,
        })?;

        progress.calls += 1;
        progress.applied += batch_len;
    }

    Ok(progress)
}

/// Outcome of a batched pull-style operation.
#[derive(Debug)]
pub struct PullOutcome<H> {
    /// Everything received, in order.
    pub items: Vec<H>,
    /// Number of calls issued.
    pub calls: usize,
    /// Number of items that were asked for.
    pub requested: usize,
}

impl<H> PullOutcome<H> {
    /// Returns `true` if the source ran out before `requested` items were received.
    pub fn exhausted(&self) -> bool {
        self.items.len() < self.requested
    }
}

/// Receives up to `total` items in calls of at most `max_per_call` items.
///
/// `pull` is called with the number of items to request and must return at most that many. A
/// call that returns fewer items than requested signals that the source is exhausted and ends
/// the operation early; that is not an error.
///
/// If a call fails, the items received so far are handed back along with the error so that
/// callers can still release them.
///
/// # Panics
///
/// Panics if `max_per_call` is zero.
pub async fn pull_batched<H, F, Fut>(
    total: usize,
    max_per_call: usize,
    mut pull: F,
) -> Result<PullOutcome<H>, (Vec<H>, Error)>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = BackendResult<Vec<H>>>,
{
    assert!(max_per_call > 0, "batch limit must be positive");

    let mut items = Vec::with_capacity(total);
    let mut calls = 0;

    while items.len() < total {
        let request = max_per_call.min(total - items.len());
        let batch = match pull(request).await {
            Ok(batch) => batch,
            Err(source) => {
                let error = Error::Batch {
                    applied: items.len(),
                    requested: total,
                    source,
                };
                return Err((items, error));
            }
        };
        calls += 1;

        let received = batch.len();
        items.extend(batch);
        if received < request {
            tracing::trace!(received, request, "source exhausted, stopping early");
            break;
        }
    }

    Ok(PullOutcome {
        items,
        calls,
        requested: total,
    })
}
