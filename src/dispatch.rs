use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::error::{DispatchError, ItemFailure};

/// Fan N independent async work items out under a concurrency cap.
///
/// A permit pool of `limit` gates the start of each item's work, so at most
/// `limit` items are in flight at any moment. Every item produces exactly one
/// outcome: panics, worker errors, and per-item timeouts all convert into an
/// `ItemFailure` value instead of propagating. The returned list is
/// positionally aligned to the input regardless of completion order.
///
/// `limit == 0` is a structural error and fails before any work starts.
pub async fn dispatch_bounded<I, T, F, Fut>(
    items: Vec<I>,
    limit: usize,
    timeout: Duration,
    worker: F,
) -> Result<Vec<Result<T, ItemFailure>>, DispatchError>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(usize, I) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = Result<T, ItemFailure>> + Send + 'static,
{
    if limit == 0 {
        return Err(DispatchError::InvalidLimit);
    }
    if items.is_empty() {
        return Ok(Vec::new());
    }

    let semaphore = Arc::new(Semaphore::new(limit));
    let mut handles = Vec::with_capacity(items.len());

    for (index, item) in items.into_iter().enumerate() {
        let semaphore = semaphore.clone();
        let worker = worker.clone();

        handles.push(tokio::spawn(async move {
            let _permit = semaphore
                .acquire()
                .await
                .map_err(|_| ItemFailure::unknown("permit pool closed"))?;

            match tokio::time::timeout(timeout, worker(index, item)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ItemFailure::timeout(format!(
                    "no response within {}s",
                    timeout.as_secs()
                ))),
            }
        }));
    }

    let mut outcomes = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.await {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => outcomes.push(Err(ItemFailure::unknown(format!("task panicked: {e}")))),
        }
    }
    Ok(outcomes)
}
