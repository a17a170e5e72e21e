use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use gradeimportd::batch::{
    partition, BackoffPolicy, Batch, BatchAck, BatchBackend, BatchCommitter, CancelFlag,
};
use gradeimportd::error::{BackendError, RowErrorKind, WarningKind};
use gradeimportd::record::CanonicalRecord;
use gradeimportd::report::{ProgressSnapshot, RunReporter};
use gradeimportd::storage::{ModeTransition, StorageMode};

fn records(n: usize) -> Vec<CanonicalRecord> {
    (0..n)
        .map(|i| CanonicalRecord {
            id: format!("grade-{i:04}"),
            source_row: i + 1,
            ..CanonicalRecord::default()
        })
        .collect()
}

/// Stores everything except batches listed in `fail`, which fail fatally, and
/// batches listed in `flaky`, which fail transiently once.
#[derive(Default)]
struct ScriptedBackend {
    stored: HashSet<String>,
    fail: HashSet<usize>,
    flaky: HashSet<usize>,
    attempts: Vec<usize>,
}

impl BatchBackend for ScriptedBackend {
    fn write_batch(&mut self, batch: &Batch) -> Result<BatchAck, BackendError> {
        self.attempts.push(batch.index);
        if self.fail.contains(&batch.index) {
            return Err(BackendError::Fatal(format!("batch {} refused", batch.index)));
        }
        if self.flaky.remove(&batch.index) {
            return Err(BackendError::Transient("connection reset".into()));
        }
        self.stored.extend(batch.records.iter().map(|r| r.id.clone()));
        Ok(BatchAck {
            written: batch.records.len(),
            mode: StorageMode::Normal,
        })
    }
}

fn queued_reporter(n: usize) -> Mutex<RunReporter> {
    let mut rep = RunReporter::new("job");
    rep.records_queued(n);
    Mutex::new(rep)
}

#[test]
fn failed_batch_does_not_stop_later_batches() {
    let batches = partition(records(1200), 500);
    let backend = Mutex::new(ScriptedBackend {
        fail: HashSet::from([1]),
        ..ScriptedBackend::default()
    });
    let reporter = queued_reporter(1200);

    let summary = BatchCommitter::new(BackoffPolicy::immediate()).commit(
        &batches,
        &backend,
        &reporter,
        &|_: &ProgressSnapshot| {},
    );

    assert_eq!(summary.batches_committed, 2);
    assert_eq!(summary.batches_failed, 1);
    assert_eq!(summary.records_committed, 700);
    assert_eq!(summary.records_failed, 500);

    let report = reporter.into_inner().expect("reporter").finish();
    assert_eq!(report.succeeded + report.failed, 1200);
    assert_eq!(report.batches.attempted, 3);
    let failure = report
        .errors
        .iter()
        .find(|e| e.kind == RowErrorKind::BatchCommitFailure)
        .expect("batch failure recorded");
    assert_eq!(failure.row, 501);
    let details = failure.details.as_ref().expect("details");
    assert_eq!(details["firstRow"], 501);
    assert_eq!(details["lastRow"], 1000);

    let backend = backend.into_inner().expect("backend");
    assert_eq!(backend.stored.len(), 700);
    assert!(!backend.stored.contains("grade-0500"));
}

#[test]
fn transient_failure_is_retried() {
    let batches = partition(records(10), 5);
    let backend = Mutex::new(ScriptedBackend {
        flaky: HashSet::from([0]),
        ..ScriptedBackend::default()
    });
    let reporter = queued_reporter(10);
    let policy = BackoffPolicy {
        max_retries: 1,
        ..BackoffPolicy::immediate()
    };

    let summary = BatchCommitter::new(policy).commit(
        &batches,
        &backend,
        &reporter,
        &|_: &ProgressSnapshot| {},
    );

    assert_eq!(summary.records_committed, 10);
    assert_eq!(summary.batches_failed, 0);
    let backend = backend.into_inner().expect("backend");
    assert_eq!(backend.attempts, vec![0, 0, 1]);
}

#[test]
fn transient_failure_without_retries_fails_the_batch() {
    let batches = partition(records(10), 5);
    let backend = Mutex::new(ScriptedBackend {
        flaky: HashSet::from([0]),
        ..ScriptedBackend::default()
    });
    let reporter = queued_reporter(10);

    let summary = BatchCommitter::new(BackoffPolicy::immediate()).commit(
        &batches,
        &backend,
        &reporter,
        &|_: &ProgressSnapshot| {},
    );

    assert_eq!(summary.records_failed, 5);
    assert_eq!(summary.records_committed, 5);
}

#[test]
fn parallel_workers_account_for_every_record() {
    let batches = partition(records(2_345), 100);
    let backend = Mutex::new(ScriptedBackend {
        fail: HashSet::from([3, 7, 20]),
        ..ScriptedBackend::default()
    });
    let reporter = queued_reporter(2_345);
    let calls = AtomicUsize::new(0);
    let last_percent = AtomicUsize::new(0);
    let progress = |snap: &ProgressSnapshot| {
        calls.fetch_add(1, Ordering::SeqCst);
        last_percent.fetch_max(snap.percent as usize, Ordering::SeqCst);
    };

    let summary = BatchCommitter::new(BackoffPolicy::immediate())
        .with_workers(4)
        .commit(&batches, &backend, &reporter, &progress);

    assert_eq!(summary.batches_committed + summary.batches_failed, batches.len());
    assert_eq!(summary.records_committed + summary.records_failed, 2_345);
    assert_eq!(summary.records_failed, 300);
    assert_eq!(calls.load(Ordering::SeqCst), batches.len());
    assert_eq!(last_percent.load(Ordering::SeqCst), 100);

    let report = reporter.into_inner().expect("reporter").finish();
    assert_eq!(report.succeeded, 2_045);
    assert_eq!(report.failed, 300);
    let mut attempts = backend.into_inner().expect("backend").attempts;
    attempts.sort_unstable();
    assert_eq!(attempts, (0..batches.len()).collect::<Vec<_>>());
}

#[test]
fn cancel_stops_new_batches_and_counts_the_rest_as_failed() {
    let batches = partition(records(50), 10);
    let backend = Mutex::new(ScriptedBackend::default());
    let reporter = queued_reporter(50);
    let cancel = CancelFlag::new();
    let progress = |snap: &ProgressSnapshot| {
        if snap.batches.attempted == 2 {
            cancel.cancel();
        }
    };

    let summary = BatchCommitter::new(BackoffPolicy::immediate())
        .with_cancel(cancel.clone())
        .commit(&batches, &backend, &reporter, &progress);

    assert!(summary.cancelled);
    assert_eq!(summary.records_committed, 20);
    assert_eq!(summary.unsubmitted, 30);

    let report = reporter.into_inner().expect("reporter").finish();
    assert!(report.cancelled);
    assert_eq!(report.succeeded, 20);
    assert_eq!(report.failed, 30);
    assert_eq!(backend.into_inner().expect("backend").stored.len(), 20);
}

/// Steps down the ladder on every write and then refuses the batch anyway.
#[derive(Default)]
struct DegradingBackend {
    mode: StorageMode,
    pending: Vec<ModeTransition>,
}

impl BatchBackend for DegradingBackend {
    fn write_batch(&mut self, _batch: &Batch) -> Result<BatchAck, BackendError> {
        for to in [StorageMode::Compressed, StorageMode::Remote, StorageMode::Essential] {
            if to > self.mode {
                self.pending.push(ModeTransition {
                    from: self.mode,
                    to,
                    bytes: 0,
                    reason: "full".into(),
                });
                self.mode = to;
            }
        }
        Err(BackendError::Exhausted("nothing fits".into()))
    }

    fn mode(&self) -> StorageMode {
        self.mode
    }

    fn take_transitions(&mut self) -> Vec<ModeTransition> {
        std::mem::take(&mut self.pending)
    }
}

#[test]
fn escalations_are_reported_even_when_the_batch_fails() {
    let batches = partition(records(6), 3);
    let backend = Mutex::new(DegradingBackend::default());
    let reporter = queued_reporter(6);

    let summary = BatchCommitter::new(BackoffPolicy::immediate()).commit(
        &batches,
        &backend,
        &reporter,
        &|_: &ProgressSnapshot| {},
    );
    assert_eq!(summary.batches_failed, 2);

    let report = reporter.into_inner().expect("reporter").finish();
    assert_eq!(report.failed, 6);
    assert_eq!(
        report.transitions.iter().map(|t| t.to).collect::<Vec<_>>(),
        vec![StorageMode::Compressed, StorageMode::Remote, StorageMode::Essential]
    );
    assert_eq!(
        report
            .warnings
            .iter()
            .filter(|w| w.kind == WarningKind::ModeEscalated)
            .count(),
        3
    );
    assert_eq!(report.final_storage_mode, StorageMode::Essential);
    assert!(report.detail_lost);
}
