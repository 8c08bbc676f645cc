//! Batch bookkeeping shared by the due-instance driver and the migration runner.
//!
//! Each item ends in an [`ItemOutcome`]; a failing item is counted and
//! reported, never allowed to abort the rest of the batch.

use std::time::{Duration, Instant};

/// Result of processing one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Done,
    /// Nothing to do (not due, lost a race, already handled).
    Skipped,
    /// Transient failure, retried on the next run.
    Recoverable(String),
    /// Failure that needs an operator.
    Fatal(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemError {
    pub id: String,
    pub message: String,
    pub fatal: bool,
}

/// Counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub errors: Vec<ItemError>,
}

impl BatchSummary {
    pub fn record(&mut self, id: &str, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Done => self.processed += 1,
            ItemOutcome::Skipped => self.skipped += 1,
            ItemOutcome::Recoverable(message) => {
                tracing::warn!("⚠️ {id}: {message} (will retry)");
                self.failed += 1;
                self.errors.push(ItemError {
                    id: id.to_string(),
                    message,
                    fatal: false,
                });
            }
            ItemOutcome::Fatal(message) => {
                tracing::error!("❌ {id}: {message}");
                self.failed += 1;
                self.errors.push(ItemError {
                    id: id.to_string(),
                    message,
                    fatal: true,
                });
            }
        }
    }

    pub fn merge(&mut self, other: BatchSummary) {
        self.processed += other.processed;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.errors.extend(other.errors);
    }

    pub fn total(&self) -> usize {
        self.processed + self.skipped + self.failed
    }
}

/// Wall-clock allowance for one run. Work stops between batches once spent.
#[derive(Debug, Clone, Copy)]
pub struct BatchBudget {
    started: Instant,
    limit: Duration,
}

impl BatchBudget {
    pub fn new(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    pub fn exhausted(&self) -> bool {
        self.started.elapsed() >= self.limit
    }
}
