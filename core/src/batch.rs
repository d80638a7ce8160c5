//! Bounded-concurrency batches.
//!
//! Items are driven through `buffer_unordered`, so at most `limit`
//! operations are in flight. Each outcome keeps the index of its input,
//! which lets callers report per-item results in input order.

use std::future::Future;

use futures::stream::{self, StreamExt};
use log::debug;

use crate::error::ApiError;

#[derive(Debug)]
pub struct BatchReport<T> {
    pub succeeded: Vec<(usize, T)>,
    pub failed: Vec<(usize, ApiError)>,
}

impl<T> BatchReport<T> {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Run `op` over `items` with at most `limit` calls in flight.
pub async fn run_bounded<I, T, F, Fut>(items: Vec<I>, limit: usize, mut op: F) -> BatchReport<T>
where
    F: FnMut(I) -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let limit = limit.max(1);
    let outcomes: Vec<(usize, Result<T, ApiError>)> = stream::iter(items.into_iter().enumerate())
        .map(|(index, item)| {
            let work = op(item);
            async move { (index, work.await) }
        })
        .buffer_unordered(limit)
        .collect()
        .await;

    let mut report = BatchReport {
        succeeded: Vec::new(),
        failed: Vec::new(),
    };
    for (index, outcome) in outcomes {
        match outcome {
            Ok(value) => report.succeeded.push((index, value)),
            Err(e) => {
                debug!("batch item {index} failed: {e}");
                report.failed.push((index, e));
            }
        }
    }
    report.succeeded.sort_by_key(|(index, _)| *index);
    report.failed.sort_by_key(|(index, _)| *index);
    report
}
