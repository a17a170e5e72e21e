use serde_json::{json, Value};

use crate::error::{IngestError, StoreError};

pub fn ok(id: &str, result: Value) -> Value {
    json!({ "id": id, "ok": true, "result": result })
}

pub fn err(id: &str, code: &str, message: impl Into<String>, details: Option<Value>) -> Value {
    let mut error = json!({ "code": code, "message": message.into() });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({ "id": id, "ok": false, "error": error })
}

/// Machine-readable context for a run that never produced a report.
pub fn ingest_error_details(e: &IngestError) -> Value {
    match e {
        IngestError::HeaderInvalid { missing } => json!({ "missing": missing }),
        IngestError::NoRecordsProduced { rows_read, rejected } => {
            json!({ "rowsRead": rows_read, "rejected": rejected })
        }
    }
}

pub fn ingest_err(id: &str, e: &IngestError, job_id: Option<&str>) -> Value {
    let mut details = ingest_error_details(e);
    if let Some(job) = job_id {
        details["jobId"] = json!(job);
    }
    err(id, e.code(), e.to_string(), Some(details))
}

pub fn storage_err(id: &str, e: &StoreError) -> Value {
    err(id, "storage_failed", e.to_string(), None)
}
