use serde::Serialize;
use thiserror::Error;

/// Failures that end a run without a report body.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("header is missing required columns: {}", missing.join(", "))]
    HeaderInvalid { missing: Vec<String> },

    #[error("no rows could be transformed ({rejected} rejected of {rows_read})")]
    NoRecordsProduced { rows_read: usize, rejected: usize },
}

impl IngestError {
    pub fn code(&self) -> &'static str {
        match self {
            IngestError::HeaderInvalid { .. } => "header_invalid",
            IngestError::NoRecordsProduced { .. } => "no_records",
        }
    }
}

/// Row-level error taxonomy. None of these abort a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RowErrorKind {
    RowParseError,
    IdentityUnresolved,
    FieldInvalid,
    BatchCommitFailure,
}

/// Non-fatal conditions that are reported but never reject a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WarningKind {
    DecodingAmbiguous,
    DateAmbiguous,
    ModeEscalated,
    /// Some stored ids could not be read, so duplicates may be written again.
    DuplicateCheckIncomplete,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("capacity exceeded: needed {needed} bytes, {available} available")]
    CapacityExceeded { needed: usize, available: usize },

    #[error("remote store unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("stored payload under {key} is corrupt: {message}")]
    Corrupt { key: String, message: String },

    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Outcome classes for a single batch write, as seen by the committer.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Every rung of the storage ladder refused the batch.
    #[error("storage exhausted: {0}")]
    Exhausted(String),

    /// Worth retrying under the backoff policy.
    #[error("transient backend failure: {0}")]
    Transient(String),

    #[error("backend failure: {0}")]
    Fatal(String),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }
}

impl From<StoreError> for BackendError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::CapacityExceeded { .. } => BackendError::Exhausted(e.to_string()),
            StoreError::Backend(m) => BackendError::Transient(m),
            other => BackendError::Fatal(other.to_string()),
        }
    }
}
