use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::json;

use crate::error::{BackendError, RowErrorKind};
use crate::record::CanonicalRecord;
use crate::report::{ProgressSnapshot, RowError, RunReporter};
use crate::storage::{ModeTransition, StorageMode};

/// Hard cap on records per backend write.
pub const MAX_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone)]
pub struct Batch {
    pub index: usize,
    pub records: Vec<CanonicalRecord>,
}

impl Batch {
    fn row_span(&self) -> (usize, usize) {
        let first = self.records.first().map(|r| r.source_row).unwrap_or(0);
        let last = self.records.last().map(|r| r.source_row).unwrap_or(0);
        (first, last)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchAck {
    pub written: usize,
    pub mode: StorageMode,
}

/// Ids a backend already holds. `incomplete` says why some could not be read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnownIds {
    pub ids: HashSet<String>,
    pub incomplete: Option<String>,
}

/// Where batches go. A write either stores every record of the batch or none.
pub trait BatchBackend: Send {
    fn write_batch(&mut self, batch: &Batch) -> Result<BatchAck, BackendError>;

    /// Ids already stored, for duplicate suppression.
    fn existing_ids(&self) -> KnownIds {
        KnownIds::default()
    }

    fn mode(&self) -> StorageMode {
        StorageMode::Normal
    }

    /// Ladder steps taken since the last call, whether or not the write that
    /// caused them succeeded.
    fn take_transitions(&mut self) -> Vec<ModeTransition> {
        Vec::new()
    }
}

impl<B: BatchBackend + ?Sized> BatchBackend for &mut B {
    fn write_batch(&mut self, batch: &Batch) -> Result<BatchAck, BackendError> {
        (**self).write_batch(batch)
    }

    fn existing_ids(&self) -> KnownIds {
        (**self).existing_ids()
    }

    fn mode(&self) -> StorageMode {
        (**self).mode()
    }

    fn take_transitions(&mut self) -> Vec<ModeTransition> {
        (**self).take_transitions()
    }
}

/// One batch's outcome plus the storage state it left behind.
struct Attempt {
    result: Result<BatchAck, BackendError>,
    transitions: Vec<ModeTransition>,
    mode: StorageMode,
}

/// Splits `records` in order into batches of at most `batch_size` (clamped to
/// `1..=MAX_BATCH_SIZE`).
pub fn partition(records: Vec<CanonicalRecord>, batch_size: usize) -> Vec<Batch> {
    let size = batch_size.clamp(1, MAX_BATCH_SIZE);
    let mut out = Vec::with_capacity(records.len().div_ceil(size));
    let mut it = records.into_iter().peekable();
    while it.peek().is_some() {
        out.push(Batch {
            index: out.len(),
            records: it.by_ref().take(size).collect(),
        });
    }
    out
}

/// Timing policy between and around batch writes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Sleep after each batch.
    pub pause: Duration,
    /// Extra attempts for a batch that failed transiently.
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            pause: Duration::from_millis(100),
            max_retries: 2,
            retry_delay: Duration::from_millis(250),
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    pub fn immediate() -> Self {
        Self {
            pause: Duration::ZERO,
            max_retries: 0,
            retry_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt as i32);
        self.retry_delay.mul_f64(factor)
    }
}

/// Cooperative stop signal. Only stops new batches from being submitted.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub batches_committed: usize,
    pub batches_failed: usize,
    pub records_committed: usize,
    pub records_failed: usize,
    /// Records in batches never handed to the backend.
    pub unsubmitted: usize,
    pub cancelled: bool,
}

pub struct BatchCommitter {
    policy: BackoffPolicy,
    workers: usize,
    cancel: Option<CancelFlag>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl BatchCommitter {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            workers: 1,
            cancel: None,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| c.is_cancelled())
    }

    /// Commits every batch. A failed batch never stops the ones after it.
    /// Counters reach `reporter` and `progress` after each batch.
    pub fn commit<B: BatchBackend>(
        &self,
        batches: &[Batch],
        backend: &Mutex<B>,
        reporter: &Mutex<RunReporter>,
        progress: &(dyn Fn(&ProgressSnapshot) + Sync),
    ) -> CommitSummary {
        let next = AtomicUsize::new(0);
        let summary = Mutex::new(CommitSummary::default());

        let worker = || loop {
            if self.cancelled() {
                break;
            }
            let i = next.fetch_add(1, Ordering::SeqCst);
            let Some(batch) = batches.get(i) else {
                break;
            };

            let attempt = self.write_with_retry(batch, backend);
            {
                let mut rep = lock(reporter);
                let mut sum = lock(&summary);
                for t in attempt.transitions {
                    rep.storage_transition(t);
                }
                rep.set_storage_mode(attempt.mode);
                match attempt.result {
                    Ok(ack) => {
                        tracing::info!(
                            batch = batch.index,
                            records = batch.records.len(),
                            mode = ack.mode.as_str(),
                            "batch committed"
                        );
                        rep.set_storage_mode(ack.mode);
                        rep.batch_succeeded(batch.records.len());
                        sum.batches_committed += 1;
                        sum.records_committed += batch.records.len();
                    }
                    Err(e) => {
                        tracing::warn!(batch = batch.index, error = %e, "batch failed");
                        let (first, last) = batch.row_span();
                        rep.batch_failed(
                            RowError::new(
                                first,
                                0,
                                RowErrorKind::BatchCommitFailure,
                                format!("batch {} failed: {}", batch.index, e),
                            )
                            .with_details(json!({
                                "batch": batch.index,
                                "records": batch.records.len(),
                                "firstRow": first,
                                "lastRow": last,
                            })),
                            batch.records.len(),
                        );
                        sum.batches_failed += 1;
                        sum.records_failed += batch.records.len();
                    }
                }
                progress(&rep.snapshot());
            }

            if i + 1 < batches.len() && !self.policy.pause.is_zero() {
                std::thread::sleep(self.policy.pause);
            }
        };

        std::thread::scope(|s| {
            for _ in 0..self.workers.min(batches.len().max(1)) {
                s.spawn(&worker);
            }
        });

        let mut out = summary.into_inner().unwrap_or_else(|p| p.into_inner());
        let claimed = next.load(Ordering::SeqCst).min(batches.len());
        if claimed < batches.len() {
            let rest = &batches[claimed..];
            let unsubmitted = rest.iter().map(|b| b.records.len()).sum::<usize>();
            tracing::warn!(batches = rest.len(), records = unsubmitted, "run cancelled");
            let first = rest.first().and_then(|b| b.records.first()).map(|r| r.source_row).unwrap_or(0);
            let mut rep = lock(reporter);
            rep.cancelled(
                RowError::new(first, 0, RowErrorKind::BatchCommitFailure, "cancelled").with_details(
                    json!({ "batches": rest.len(), "records": unsubmitted }),
                ),
                unsubmitted,
            );
            progress(&rep.snapshot());
            out.unsubmitted = unsubmitted;
            out.cancelled = true;
        }
        out
    }

    fn write_with_retry<B: BatchBackend>(&self, batch: &Batch, backend: &Mutex<B>) -> Attempt {
        let mut attempt = 0u32;
        let mut transitions = Vec::new();
        loop {
            let (result, mode) = {
                let mut b = lock(backend);
                let result = b.write_batch(batch);
                transitions.extend(b.take_transitions());
                (result, b.mode())
            };
            match result {
                Err(e) if e.is_retryable() && attempt < self.policy.max_retries => {
                    let delay = self.policy.delay_for(attempt);
                    tracing::debug!(batch = batch.index, attempt, ?delay, error = %e, "retrying batch");
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                result => {
                    return Attempt {
                        result,
                        transitions,
                        mode,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(n: usize) -> Vec<CanonicalRecord> {
        (0..n)
            .map(|i| CanonicalRecord {
                id: format!("grade-{i}"),
                source_row: i + 1,
                ..CanonicalRecord::default()
            })
            .collect()
    }

    #[test]
    fn partition_preserves_order_and_cap() {
        let batches = partition(records(1201), 10_000);
        assert_eq!(
            batches.iter().map(|b| b.records.len()).collect::<Vec<_>>(),
            vec![500, 500, 201]
        );
        assert_eq!(batches[1].records[0].id, "grade-500");
        assert_eq!(batches.iter().map(|b| b.records.len()).sum::<usize>(), 1201);
    }

    #[test]
    fn backoff_grows_geometrically() {
        let p = BackoffPolicy {
            retry_delay: Duration::from_millis(100),
            multiplier: 2.0,
            ..BackoffPolicy::default()
        };
        assert_eq!(p.delay_for(0), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(400));
    }
}
