use std::time::Instant;

use serde::Serialize;
use serde_json::Value;

use crate::decode::SourceEncoding;
use crate::error::{RowErrorKind, WarningKind};
use crate::storage::{ModeTransition, StorageMode};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowError {
    pub row: usize,
    pub line: usize,
    pub kind: RowErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl RowError {
    pub fn new(row: usize, line: usize, kind: RowErrorKind, message: impl Into<String>) -> Self {
        Self {
            row,
            line,
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Warning {
    pub kind: WarningKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row: Option<usize>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchCounts {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Point-in-time view for progress displays.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub job_id: String,
    pub rows_read: usize,
    pub rows_transformed: usize,
    pub rows_rejected: usize,
    pub records_total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub duplicates_skipped: usize,
    pub batches: BatchCounts,
    pub storage_mode: StorageMode,
    pub percent: u8,
    pub elapsed_ms: u64,
}

/// Final, immutable outcome of a run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub job_id: String,
    pub succeeded: usize,
    pub failed: usize,
    pub duplicates_skipped: usize,
    pub errors: Vec<RowError>,
    pub warnings: Vec<Warning>,
    pub transitions: Vec<ModeTransition>,
    pub batches: BatchCounts,
    pub rows_read: usize,
    pub rows_transformed: usize,
    pub elapsed_ms: u64,
    pub final_storage_mode: StorageMode,
    /// Non-essential fields were dropped to fit storage.
    pub detail_lost: bool,
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<SourceEncoding>,
}

pub struct RunReporter {
    job_id: String,
    started: Instant,
    rows_read: usize,
    rows_transformed: usize,
    records_total: usize,
    succeeded: usize,
    failed_records: usize,
    duplicates_skipped: usize,
    errors: Vec<RowError>,
    warnings: Vec<Warning>,
    transitions: Vec<ModeTransition>,
    batches: BatchCounts,
    storage_mode: StorageMode,
    cancelled: bool,
    encoding: Option<SourceEncoding>,
}

impl RunReporter {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            started: Instant::now(),
            rows_read: 0,
            rows_transformed: 0,
            records_total: 0,
            succeeded: 0,
            failed_records: 0,
            duplicates_skipped: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
            transitions: Vec::new(),
            batches: BatchCounts::default(),
            storage_mode: StorageMode::Normal,
            cancelled: false,
            encoding: None,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn set_encoding(&mut self, encoding: SourceEncoding) {
        self.encoding = Some(encoding);
    }

    pub fn rows_read(&mut self, n: usize) {
        self.rows_read = n;
    }

    pub fn row_transformed(&mut self) {
        self.rows_transformed += 1;
    }

    pub fn reject(&mut self, error: RowError) {
        tracing::debug!(row = error.row, kind = ?error.kind, message = %error.message, "row rejected");
        self.errors.push(error);
    }

    pub fn warn(&mut self, kind: WarningKind, row: Option<usize>, message: impl Into<String>) {
        self.warnings.push(Warning {
            kind,
            row,
            message: message.into(),
        });
    }

    pub fn duplicate_skipped(&mut self) {
        self.duplicates_skipped += 1;
    }

    pub fn records_queued(&mut self, n: usize) {
        self.records_total = n;
    }

    pub fn batch_succeeded(&mut self, records: usize) {
        self.batches.attempted += 1;
        self.batches.succeeded += 1;
        self.succeeded += records;
    }

    pub fn batch_failed(&mut self, error: RowError, records: usize) {
        self.batches.attempted += 1;
        self.batches.failed += 1;
        self.failed_records += records;
        self.errors.push(error);
    }

    /// Records that were never submitted because the run was cancelled.
    pub fn cancelled(&mut self, error: RowError, unsubmitted: usize) {
        self.cancelled = true;
        self.failed_records += unsubmitted;
        self.errors.push(error);
    }

    pub fn storage_transition(&mut self, t: ModeTransition) {
        self.warn(
            WarningKind::ModeEscalated,
            None,
            format!("storage {:?} -> {:?}: {}", t.from, t.to, t.reason),
        );
        self.storage_mode = self.storage_mode.max(t.to);
        self.transitions.push(t);
    }

    /// Batches may complete out of order; the reported mode never moves back.
    pub fn set_storage_mode(&mut self, mode: StorageMode) {
        self.storage_mode = self.storage_mode.max(mode);
    }

    pub fn rejected_rows(&self) -> usize {
        self.errors
            .iter()
            .filter(|e| e.kind != RowErrorKind::BatchCommitFailure)
            .count()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let done = self.succeeded + self.failed_records;
        let percent = if self.records_total == 0 {
            0
        } else {
            ((done * 100) / self.records_total).min(100) as u8
        };
        ProgressSnapshot {
            job_id: self.job_id.clone(),
            rows_read: self.rows_read,
            rows_transformed: self.rows_transformed,
            rows_rejected: self.rejected_rows(),
            records_total: self.records_total,
            succeeded: self.succeeded,
            failed: self.failed_records + self.rejected_rows(),
            duplicates_skipped: self.duplicates_skipped,
            batches: self.batches,
            storage_mode: self.storage_mode,
            percent,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        }
    }

    pub fn finish(mut self) -> RunReport {
        let failed = self.failed_records + self.rejected_rows();
        // Row errors in row order, batch-level entries after them.
        self.errors
            .sort_by_key(|e| (e.kind == RowErrorKind::BatchCommitFailure, e.row));
        RunReport {
            job_id: self.job_id,
            succeeded: self.succeeded,
            failed,
            duplicates_skipped: self.duplicates_skipped,
            errors: self.errors,
            warnings: self.warnings,
            detail_lost: self.storage_mode == StorageMode::Essential,
            transitions: self.transitions,
            batches: self.batches,
            rows_read: self.rows_read,
            rows_transformed: self.rows_transformed,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            final_storage_mode: self.storage_mode,
            cancelled: self.cancelled,
            encoding: self.encoding,
        }
    }
}
