use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::record::CanonicalRecord;

/// Long field name -> short field name used by the COMPRESSED representation.
const SHORT_NAMES: [(&str, &str); 22] = [
    ("id", "i"),
    ("studentId", "s"),
    ("studentIdentifier", "r"),
    ("studentName", "n"),
    ("teacherId", "t"),
    ("teacherName", "tn"),
    ("courseId", "c"),
    ("sectionId", "x"),
    ("course", "cn"),
    ("section", "xn"),
    ("subjectCode", "a"),
    ("subjectName", "an"),
    ("activityType", "k"),
    ("activityId", "ai"),
    ("grade", "g"),
    ("maxGrade", "m"),
    ("gradedAt", "ts"),
    ("date", "d"),
    ("semester", "p"),
    ("year", "y"),
    ("topic", "tp"),
    ("sourceRow", "sr"),
];

fn rename(obj: Map<String, Value>, to_short: bool) -> Map<String, Value> {
    obj.into_iter()
        .filter(|(_, v)| !matches!(v, Value::String(s) if s.is_empty()))
        .map(|(k, v)| {
            let renamed = SHORT_NAMES
                .iter()
                .find(|(long, short)| if to_short { *long == k } else { *short == k })
                .map(|(long, short)| if to_short { *short } else { *long })
                .map(str::to_string)
                .unwrap_or(k);
            (renamed, v)
        })
        .collect()
}

/// Same records, short keys, empty strings dropped. Lossless.
pub fn compress(records: &[CanonicalRecord]) -> Result<String, StoreError> {
    let mut out = Vec::with_capacity(records.len());
    for r in records {
        match serde_json::to_value(r) {
            Ok(Value::Object(obj)) => out.push(Value::Object(rename(obj, true))),
            Ok(_) => {}
            Err(e) => return Err(StoreError::Backend(e.to_string())),
        }
    }
    serde_json::to_string(&out).map_err(|e| StoreError::Backend(e.to_string()))
}

pub fn expand(key: &str, payload: &str) -> Result<Vec<CanonicalRecord>, StoreError> {
    let corrupt = |e: serde_json::Error| StoreError::Corrupt {
        key: key.to_string(),
        message: e.to_string(),
    };
    let items: Vec<Map<String, Value>> = serde_json::from_str(payload).map_err(corrupt)?;
    items
        .into_iter()
        .map(|obj| serde_json::from_value(Value::Object(rename(obj, false))).map_err(corrupt))
        .collect()
}

/// Id plus foreign keys; what survives when nothing else fits. Grades,
/// dates and names are not kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EssentialRecord {
    pub id: String,
    pub student_id: String,
    pub teacher_id: String,
    pub course_id: String,
    pub section_id: String,
    pub subject_code: String,
    pub activity_id: String,
}

impl From<&CanonicalRecord> for EssentialRecord {
    fn from(r: &CanonicalRecord) -> Self {
        Self {
            id: r.id.clone(),
            student_id: r.student_id.clone(),
            teacher_id: r.teacher_id.clone(),
            course_id: r.course_id.clone(),
            section_id: r.section_id.clone(),
            subject_code: r.subject_code.clone(),
            activity_id: r.activity_id.clone(),
        }
    }
}
