//! Partial-success accounting for multi-item extraction runs.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

const ERROR_SAMPLE_LIMIT: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchError {
    #[error("{failed} of {total} items failed: {}", .sample.join("; "))]
    Partial {
        failed: usize,
        total: usize,
        sample: Vec<String>,
    },
    #[error("all items failed: {first}")]
    Total { first: String },
    #[error("cancelled after {completed} items ({remaining} not attempted)")]
    Cancelled { completed: usize, remaining: usize },
}

/// Records plus an optional aggregate error. Records are returned even when
/// some items failed.
#[derive(Debug, Clone)]
pub struct BatchOutcome<T> {
    pub records: Vec<T>,
    /// Best-effort records recovered from items that failed.
    pub partials: Vec<T>,
    pub error: Option<BatchError>,
    pub attempted: usize,
    pub failed: usize,
    pub total: usize,
}

impl<T> BatchOutcome<T> {
    pub fn is_clean(&self) -> bool {
        self.error.is_none()
    }

    /// Share of items that completed, 0.0–1.0. An empty batch counts as complete.
    pub fn completeness(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        let completed = self.attempted.saturating_sub(self.failed).min(self.total);
        completed as f64 / self.total as f64
    }

    pub fn into_result(self) -> Result<Vec<T>, BatchError> {
        match self.error {
            None => Ok(self.records),
            Some(err) => Err(err),
        }
    }
}

/// Accumulates per-item results in input order.
#[derive(Debug)]
pub struct BatchCollector<T> {
    total: usize,
    completed: usize,
    records: Vec<T>,
    partials: Vec<T>,
    failures: Vec<String>,
}

impl<T> BatchCollector<T> {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            completed: 0,
            records: Vec::with_capacity(total),
            partials: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn success(&mut self, record: T) {
        self.completed += 1;
        self.records.push(record);
    }

    /// One item that produced several records (a GMP table page, say).
    pub fn success_many(&mut self, records: impl IntoIterator<Item = T>) {
        self.completed += 1;
        self.records.extend(records);
    }

    pub fn failure(&mut self, error: impl ToString) {
        self.failures.push(error.to_string());
    }

    pub fn failure_with_partial(&mut self, error: impl ToString, partial: T) {
        self.failure(error);
        self.partials.push(partial);
    }

    pub fn attempted(&self) -> usize {
        self.completed + self.failures.len()
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    pub fn finish(self) -> BatchOutcome<T> {
        let attempted = self.attempted();
        let failed = self.failures.len();
        let (records, error) = if failed == 0 {
            (self.records, None)
        } else if self.completed == 0 {
            let first = self.failures.into_iter().next().unwrap_or_default();
            (Vec::new(), Some(BatchError::Total { first }))
        } else {
            let sample = self.failures.into_iter().take(ERROR_SAMPLE_LIMIT).collect();
            (
                self.records,
                Some(BatchError::Partial {
                    failed,
                    total: self.total,
                    sample,
                }),
            )
        };
        BatchOutcome {
            records,
            partials: self.partials,
            error,
            attempted,
            failed,
            total: self.total,
        }
    }

    /// Stops early; whatever was collected so far is kept.
    pub fn cancelled(self) -> BatchOutcome<T> {
        let attempted = self.attempted();
        let failed = self.failures.len();
        BatchOutcome {
            records: self.records,
            partials: self.partials,
            error: Some(BatchError::Cancelled {
                completed: attempted,
                remaining: self.total.saturating_sub(attempted),
            }),
            attempted,
            failed,
            total: self.total,
        }
    }
}

/// Cooperative stop flag with an optional deadline. Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            flag: Arc::default(),
            deadline: Some(deadline),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// What a single batch item produced.
#[derive(Debug)]
pub enum ItemOutcome<T> {
    Records(Vec<T>),
    Failed { error: String, partial: Option<T> },
}

impl<T> ItemOutcome<T> {
    pub fn one(record: T) -> Self {
        Self::Records(vec![record])
    }

    pub fn failed(error: impl ToString) -> Self {
        Self::Failed {
            error: error.to_string(),
            partial: None,
        }
    }
}

/// Runs `handle` over `items` one at a time, checking `cancel` before each.
/// A failing item never stops the loop.
pub async fn run_sequential<'a, I, T, F, Fut>(items: &'a [I], cancel: &CancelSignal, mut handle: F) -> BatchOutcome<T>
where
    F: FnMut(&'a I) -> Fut,
    Fut: Future<Output = ItemOutcome<T>>,
{
    let mut batch = BatchCollector::new(items.len());
    for item in items {
        if cancel.is_cancelled() {
            return batch.cancelled();
        }
        match handle(item).await {
            ItemOutcome::Records(records) => batch.success_many(records),
            ItemOutcome::Failed {
                error,
                partial: Some(partial),
            } => batch.failure_with_partial(error, partial),
            ItemOutcome::Failed { error, partial: None } => batch.failure(error),
        }
    }
    batch.finish()
}
