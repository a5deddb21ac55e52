//! Bounded parallel execution of a batch of agent invocations.

use std::future::Future;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::BatonError;

/// What each task in a batch knows about itself.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub index: usize,
    pub total: usize,
    /// Cancelled when the caller cancels or any sibling fails.
    pub cancel: CancellationToken,
}

/// Run `f` over `items` with at most `limit` tasks in flight.
///
/// Results come back in input order. The first error cancels the group,
/// tasks that have not started are skipped, running ones are drained, and
/// that first error is returned.
pub async fn run_bounded<T, R, E, F, Fut>(
    parent: &CancellationToken,
    limit: usize,
    items: Vec<T>,
    f: F,
) -> Result<Vec<R>, E>
where
    F: Fn(TaskContext, T) -> Fut,
    Fut: Future<Output = Result<R, E>>,
    E: From<BatonError>,
{
    let total = items.len();
    let limit = limit.max(1);
    let group = parent.child_token();
    let semaphore = Arc::new(Semaphore::new(limit));
    debug!(total, limit, "starting bounded batch");

    let mut running = FuturesUnordered::new();
    for (index, item) in items.into_iter().enumerate() {
        let semaphore = Arc::clone(&semaphore);
        let ctx = TaskContext {
            index,
            total,
            cancel: group.clone(),
        };
        let f = &f;
        running.push(async move {
            let permit = tokio::select! {
                permit = semaphore.acquire_owned() => permit.ok(),
                _ = ctx.cancel.cancelled() => None,
            };
            let Some(_permit) = permit else {
                return (index, None);
            };
            if ctx.cancel.is_cancelled() {
                return (index, None);
            }
            (index, Some(f(ctx, item).await))
        });
    }

    // `None` marks a task that never started.
    let mut slots: Vec<Option<R>> = (0..total).map(|_| None).collect();
    let mut first_error: Option<E> = None;
    while let Some((index, outcome)) = running.next().await {
        match outcome {
            Some(Ok(value)) => slots[index] = Some(value),
            Some(Err(err)) => {
                if first_error.is_none() {
                    debug!(index, "task failed, cancelling batch");
                    group.cancel();
                    first_error = Some(err);
                }
            }
            None => {}
        }
    }

    if let Some(err) = first_error {
        return Err(err);
    }
    if parent.is_cancelled() {
        return Err(BatonError::Cancelled.into());
    }
    slots
        .into_iter()
        .map(|slot| slot.ok_or_else(|| BatonError::Cancelled.into()))
        .collect()
}
