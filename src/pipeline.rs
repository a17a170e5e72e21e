use std::collections::HashSet;
use std::sync::Mutex;

use serde::Serialize;

use crate::batch::{partition, BatchBackend, BatchCommitter, CancelFlag};
use crate::config::IngestConfig;
use crate::csv::{parse_rows, ParsedFile, RawRow};
use crate::dates::{resolve_date, DateContext};
use crate::decode::{decode_bytes, SourceEncoding};
use crate::directory::{EntityDirectory, MatchTier};
use crate::error::{IngestError, RowErrorKind, WarningKind};
use crate::record::{transform, CanonicalRecord};
use crate::report::{ProgressSnapshot, RowError, RunReport, RunReporter, Warning};
use crate::resolve::{resolve_identity, NormalizedQuery};

/// One row that made it all the way to a record.
struct Transformed {
    record: CanonicalRecord,
    tier: MatchTier,
    candidates: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewRow {
    pub row: usize,
    pub line: usize,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_tier: Option<MatchTier>,
    pub candidates: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub student_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub teacher_id: Option<String>,
    pub duplicate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RowErrorKind>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierCounts {
    pub exact: usize,
    pub course_only: usize,
    pub subject_only: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewReport {
    pub encoding: SourceEncoding,
    pub header: Vec<String>,
    pub rows_read: usize,
    pub rows_ok: usize,
    pub duplicates: usize,
    pub tiers: TierCounts,
    pub rows: Vec<PreviewRow>,
    pub errors: Vec<RowError>,
    pub warnings: Vec<Warning>,
}

/// Decode, parse, resolve, transform, then commit, against one directory.
pub struct Pipeline<'a> {
    directory: &'a dyn EntityDirectory,
    config: IngestConfig,
    dates: DateContext,
    cancel: Option<CancelFlag>,
}

impl<'a> Pipeline<'a> {
    pub fn new(directory: &'a dyn EntityDirectory, config: IngestConfig) -> Self {
        let dates = config.date_context();
        Self {
            directory,
            config,
            dates,
            cancel: None,
        }
    }

    pub fn with_date_context(mut self, dates: DateContext) -> Self {
        self.dates = dates.with_fallback(self.config.date_fallback);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    fn process_row(&self, row: &RawRow, reporter: &mut RunReporter) -> Result<Transformed, RowError> {
        let query = NormalizedQuery::from_row(row);
        let identity = resolve_identity(row, &query, self.directory)?;

        let Some(date) = resolve_date(&row.date, &self.dates) else {
            return Err(RowError::new(
                row.row,
                row.line,
                RowErrorKind::FieldInvalid,
                format!("unrecognised date: {:?}", row.date),
            ));
        };
        if date.lossy {
            reporter.warn(
                WarningKind::DateAmbiguous,
                Some(row.row),
                format!("unrecognised date {:?}; used run time {}", row.date, date.instant.to_rfc3339()),
            );
        }

        let record = transform(row, &identity, &date, self.config.semester_cutoff())?;
        tracing::debug!(
            row = row.row,
            tier = identity.match_tier.number(),
            record = %record.id,
            "row transformed"
        );
        Ok(Transformed {
            record,
            tier: identity.match_tier,
            candidates: identity.candidates,
        })
    }

    /// Decode and parse, recording file-level warnings and parse errors.
    fn read(&self, bytes: &[u8], reporter: &mut RunReporter) -> Result<(ParsedFile, SourceEncoding), IngestError> {
        let decoded = decode_bytes(bytes);
        reporter.set_encoding(decoded.encoding);
        if decoded.ambiguous {
            reporter.warn(
                WarningKind::DecodingAmbiguous,
                None,
                format!(
                    "picked {:?} with {} suspicious characters (utf-8 {}, windows-1252 {})",
                    decoded.encoding,
                    decoded.utf8_score.min(decoded.windows1252_score),
                    decoded.utf8_score,
                    decoded.windows1252_score
                ),
            );
        }
        let parsed = parse_rows(&decoded.text)?;
        reporter.rows_read(parsed.rows_total);
        for e in &parsed.rejected {
            reporter.reject(e.clone());
        }
        Ok((parsed, decoded.encoding))
    }

    /// Full run: every valid, not yet stored row ends up in `backend`.
    pub fn run<B: BatchBackend>(
        &self,
        job_id: &str,
        bytes: &[u8],
        backend: &mut B,
        progress: &(dyn Fn(&ProgressSnapshot) + Sync),
    ) -> Result<RunReport, IngestError> {
        let mut reporter = RunReporter::new(job_id);
        tracing::info!(job = job_id, bytes = bytes.len(), "ingest started");

        let (parsed, _) = self.read(bytes, &mut reporter)?;
        let mut records = Vec::with_capacity(parsed.rows.len());
        for row in &parsed.rows {
            match self.process_row(row, &mut reporter) {
                Ok(t) => {
                    reporter.row_transformed();
                    records.push(t.record);
                }
                Err(e) => reporter.reject(e),
            }
        }
        if records.is_empty() {
            return Err(IngestError::NoRecordsProduced {
                rows_read: parsed.rows_total,
                rejected: reporter.rejected_rows(),
            });
        }

        reporter.set_storage_mode(backend.mode());
        let known = backend.existing_ids();
        if let Some(reason) = known.incomplete {
            reporter.warn(WarningKind::DuplicateCheckIncomplete, None, reason);
        }
        let fresh = records
            .into_iter()
            .filter(|r| {
                let dup = known.ids.contains(&r.id);
                if dup {
                    reporter.duplicate_skipped();
                }
                !dup
            })
            .collect::<Vec<_>>();
        reporter.records_queued(fresh.len());

        let batches = partition(fresh, self.config.batch_size);
        let mut committer = BatchCommitter::new(self.config.backoff()).with_workers(self.config.workers);
        if let Some(c) = &self.cancel {
            committer = committer.with_cancel(c.clone());
        }
        let reporter = Mutex::new(reporter);
        let backend = Mutex::new(backend);
        let summary = committer.commit(&batches, &backend, &reporter, progress);

        let mut reporter = reporter.into_inner().unwrap_or_else(|p| p.into_inner());
        let backend = backend.into_inner().unwrap_or_else(|p| p.into_inner());
        reporter.set_storage_mode(backend.mode());
        let report = reporter.finish();
        tracing::info!(
            job = job_id,
            succeeded = report.succeeded,
            failed = report.failed,
            duplicates = report.duplicates_skipped,
            batches_failed = summary.batches_failed,
            mode = report.final_storage_mode.as_str(),
            "ingest finished"
        );
        Ok(report)
    }

    /// Resolution without writes. `existing` marks rows that a run would skip.
    pub fn preview(&self, bytes: &[u8], existing: &HashSet<String>) -> Result<PreviewReport, IngestError> {
        let mut reporter = RunReporter::new("preview");
        let (parsed, encoding) = self.read(bytes, &mut reporter)?;

        let mut rows = Vec::with_capacity(parsed.rows.len());
        let mut tiers = TierCounts::default();
        let mut errors = parsed.rejected.clone();
        let mut duplicates = 0usize;
        for row in &parsed.rows {
            match self.process_row(row, &mut reporter) {
                Ok(t) => {
                    match t.tier {
                        MatchTier::Exact => tiers.exact += 1,
                        MatchTier::CourseOnly => tiers.course_only += 1,
                        MatchTier::SubjectOnly => tiers.subject_only += 1,
                    }
                    let duplicate = existing.contains(&t.record.id);
                    if duplicate {
                        duplicates += 1;
                    }
                    rows.push(PreviewRow {
                        row: row.row,
                        line: row.line,
                        status: "ok",
                        match_tier: Some(t.tier),
                        candidates: t.candidates,
                        record_id: Some(t.record.id),
                        student_id: Some(t.record.student_id),
                        teacher_id: Some(t.record.teacher_id),
                        duplicate,
                        error: None,
                    });
                }
                Err(e) => {
                    rows.push(PreviewRow {
                        row: row.row,
                        line: row.line,
                        status: "error",
                        match_tier: None,
                        candidates: 0,
                        record_id: None,
                        student_id: None,
                        teacher_id: None,
                        duplicate: false,
                        error: Some(e.kind),
                    });
                    errors.push(e);
                }
            }
        }
        errors.sort_by_key(|e| e.row);

        let report = reporter.finish();
        Ok(PreviewReport {
            encoding,
            header: parsed.columns.header.clone(),
            rows_read: parsed.rows_total,
            rows_ok: rows.iter().filter(|r| r.status == "ok").count(),
            duplicates,
            tiers,
            rows,
            errors,
            warnings: report.warnings,
        })
    }
}
