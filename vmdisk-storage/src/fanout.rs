//! Concurrent fan-out of one operation over a set of volumes.
//!
//! All futures run cooperatively on the calling task and every one of them is
//! driven to completion; a failure never cancels its siblings.

use futures::future::join_all;
use std::future::Future;
use vmdisk_core::{Result, StorageError};

/// Runs `op` for every item concurrently and fails if any of them failed.
///
/// A single failure is returned as is; several are wrapped in
/// [`StorageError::Aggregate`] so none of them is hidden.
pub async fn fan_out<T, R, F, Fut>(items: impl IntoIterator<Item = T>, op: F) -> Result<Vec<R>>
where
    F: FnMut(T) -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let results = join_all(items.into_iter().map(op)).await;

    let mut values = Vec::with_capacity(results.len());
    let mut errors = Vec::new();
    for result in results {
        match result {
            Ok(value) => values.push(value),
            Err(e) => errors.push(e),
        }
    }

    match errors.len() {
        0 => Ok(values),
        1 => Err(errors.remove(0)),
        _ => Err(StorageError::Aggregate(errors)),
    }
}

/// Runs `op` for every item concurrently and returns the failures instead of
/// raising them.
pub async fn fan_out_best_effort<T, F, Fut>(
    items: impl IntoIterator<Item = T>,
    op: F,
) -> Vec<StorageError>
where
    F: FnMut(T) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    join_all(items.into_iter().map(op))
        .await
        .into_iter()
        .filter_map(|result| result.err())
        .collect()
}
