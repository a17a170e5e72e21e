use std::time::Duration;

use chrono::{FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::batch::{BackoffPolicy, MAX_BATCH_SIZE};
use crate::dates::{DateContext, DateFallback};
use crate::record::SemesterCutoff;
use crate::storage::{StorageOptions, COMPRESS_THRESHOLD_BYTES, DEFAULT_LOCAL_BUDGET_BYTES, DEFAULT_STORAGE_KEY};

/// Settings key holding the workspace's saved ingest configuration.
pub const SETTINGS_KEY: &str = "setup.ingest";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IngestConfig {
    pub batch_size: usize,
    pub workers: usize,
    pub pause_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub compress_threshold_bytes: usize,
    pub local_budget_bytes: usize,
    pub storage_key: String,
    pub semester_cutoff_month: u32,
    pub semester_cutoff_day: u32,
    pub date_fallback: DateFallback,
    /// Offset used for calendar dates; host offset when absent.
    pub utc_offset_minutes: Option<i32>,
    pub remote_enabled: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: MAX_BATCH_SIZE,
            workers: 1,
            pause_ms: 100,
            max_retries: 2,
            retry_delay_ms: 250,
            backoff_multiplier: 2.0,
            compress_threshold_bytes: COMPRESS_THRESHOLD_BYTES,
            local_budget_bytes: DEFAULT_LOCAL_BUDGET_BYTES,
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            semester_cutoff_month: 7,
            semester_cutoff_day: 1,
            date_fallback: DateFallback::Now,
            utc_offset_minutes: None,
            remote_enabled: true,
        }
    }
}

impl IngestConfig {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            pause: Duration::from_millis(self.pause_ms),
            max_retries: self.max_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            multiplier: self.backoff_multiplier,
        }
    }

    pub fn semester_cutoff(&self) -> SemesterCutoff {
        SemesterCutoff {
            month: self.semester_cutoff_month,
            day: self.semester_cutoff_day,
        }
    }

    pub fn storage_options(&self) -> StorageOptions {
        StorageOptions {
            key: self.storage_key.clone(),
            compress_threshold_bytes: self.compress_threshold_bytes,
        }
    }

    pub fn date_context(&self) -> DateContext {
        let ctx = match self
            .utc_offset_minutes
            .and_then(|m| FixedOffset::east_opt(m * 60))
        {
            Some(offset) => DateContext::new(offset, Utc::now().with_timezone(&offset)),
            None => DateContext::system(),
        };
        ctx.with_fallback(self.date_fallback)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Defaults, then the saved section, then per-request overrides.
    /// Malformed saved values are skipped; bad overrides are an error.
    pub fn layered(saved: Option<&Value>, overrides: Option<&Map<String, Value>>) -> Result<Self, String> {
        let mut current = Self::default().to_value();
        if let Some(saved_obj) = saved.and_then(|v| v.as_object()) {
            for (k, v) in saved_obj {
                let mut one = Map::new();
                one.insert(k.clone(), v.clone());
                let _ = merge_patch(&mut current, &one);
            }
        }
        if let Some(patch) = overrides {
            merge_patch(&mut current, patch)?;
        }
        serde_json::from_value(current).map_err(|e| e.to_string())
    }
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v.as_i64().ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_f64_range(v: &Value, key: &str, min: f64, max: f64) -> Result<f64, String> {
    let n = v.as_f64().ok_or_else(|| format!("{} must be a number", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_storage_key(v: &Value, key: &str) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?.trim();
    if s.is_empty() || s.len() > 64 {
        return Err(format!("{} length must be 1..=64", key));
    }
    if !s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(format!("{} may only contain letters, digits, '-', '_' and '.'", key));
    }
    Ok(s.to_string())
}

/// Validates and applies `patch` onto a config object.
pub fn merge_patch(current: &mut Value, patch: &Map<String, Value>) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal ingest config must be a JSON object".to_string())?;
    for (k, v) in patch {
        let value = match k.as_str() {
            "batchSize" => Value::from(parse_i64_range(v, k, 1, MAX_BATCH_SIZE as i64)?),
            "workers" => Value::from(parse_i64_range(v, k, 1, 8)?),
            "pauseMs" | "retryDelayMs" => Value::from(parse_i64_range(v, k, 0, 60_000)?),
            "maxRetries" => Value::from(parse_i64_range(v, k, 0, 10)?),
            "backoffMultiplier" => Value::from(parse_f64_range(v, k, 1.0, 10.0)?),
            "compressThresholdBytes" => Value::from(parse_i64_range(v, k, 256, 256 * 1024 * 1024)?),
            "localBudgetBytes" => Value::from(parse_i64_range(v, k, 1024, 1024 * 1024 * 1024)?),
            "storageKey" => Value::String(parse_storage_key(v, k)?),
            "semesterCutoffMonth" => Value::from(parse_i64_range(v, k, 1, 12)?),
            "semesterCutoffDay" => Value::from(parse_i64_range(v, k, 1, 31)?),
            "dateFallback" => {
                let s = v
                    .as_str()
                    .ok_or_else(|| format!("{} must be string", k))?
                    .to_ascii_lowercase();
                if s != "now" && s != "reject" {
                    return Err("dateFallback must be one of: now, reject".into());
                }
                Value::String(s)
            }
            "utcOffsetMinutes" => {
                if v.is_null() {
                    Value::Null
                } else {
                    Value::from(parse_i64_range(v, k, -12 * 60, 14 * 60)?)
                }
            }
            "remoteEnabled" => Value::Bool(parse_bool(v, k)?),
            _ => return Err(format!("unknown ingest field: {}", k)),
        };
        obj.insert(k.clone(), value);
    }
    Ok(())
}
