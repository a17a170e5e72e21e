use chrono::Datelike;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::csv::RawRow;
use crate::dates::ResolvedDate;
use crate::error::RowErrorKind;
use crate::normalize::{normalize, slug_join};
use crate::report::RowError;
use crate::resolve::ResolvedIdentity;

pub const MAX_GRADE: f64 = 100.0;
const ID_HEX_LEN: usize = 24;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityType {
    Assignment,
    #[default]
    Evaluation,
}

impl ActivityType {
    pub fn from_cell(raw: &str) -> Self {
        match normalize(raw).as_str() {
            "tarea" | "assignment" | "homework" => ActivityType::Assignment,
            _ => ActivityType::Evaluation,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActivityType::Assignment => "assignment",
            ActivityType::Evaluation => "evaluation",
        }
    }
}

/// The unit that gets persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CanonicalRecord {
    pub id: String,
    pub student_id: String,
    pub student_identifier: String,
    pub student_name: String,
    pub teacher_id: String,
    pub teacher_name: String,
    pub course_id: String,
    pub section_id: String,
    pub course: String,
    pub section: String,
    pub subject_code: String,
    pub subject_name: String,
    pub activity_type: ActivityType,
    pub activity_id: String,
    pub grade: f64,
    pub max_grade: f64,
    /// RFC 3339 instant.
    pub graded_at: String,
    /// Calendar day, `YYYY-MM-DD`.
    pub date: String,
    pub semester: u8,
    pub year: i32,
    pub topic: String,
    pub source_row: usize,
}

/// First day of the second semester, as (month, day).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemesterCutoff {
    pub month: u32,
    pub day: u32,
}

impl Default for SemesterCutoff {
    fn default() -> Self {
        Self { month: 7, day: 1 }
    }
}

impl SemesterCutoff {
    pub fn semester_of(&self, month: u32, day: u32) -> u8 {
        if (month, day) < (self.month, self.day) {
            1
        } else {
            2
        }
    }
}

/// `grade-` plus a SHA-256 prefix over the identity tuple. No clock input, so
/// re-ingesting an unchanged file reproduces the same ids.
pub fn record_id(student_id: &str, subject_code: &str, raw_date: &str, row_index: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}|{}|{}|{}", student_id, subject_code, raw_date, row_index));
    let hex = format!("{:x}", hasher.finalize());
    format!("grade-{}", &hex[..ID_HEX_LEN])
}

/// Accepts `,` as decimal separator. Finite values in `[0, MAX_GRADE]` only.
pub fn parse_grade(raw: &str) -> Option<f64> {
    let v = raw.trim().replace(',', ".").parse::<f64>().ok()?;
    (v.is_finite() && (0.0..=MAX_GRADE).contains(&v)).then_some(v)
}

fn explicit_semester(raw: &str) -> Option<u8> {
    let digits = raw.chars().filter(|c| c.is_ascii_digit()).collect::<String>();
    match digits.as_str() {
        "1" => Some(1),
        "2" => Some(2),
        _ => None,
    }
}

pub fn transform(
    row: &RawRow,
    identity: &ResolvedIdentity<'_>,
    date: &ResolvedDate,
    cutoff: SemesterCutoff,
) -> Result<CanonicalRecord, RowError> {
    let Some(grade) = parse_grade(&row.grade) else {
        return Err(RowError::new(
            row.row,
            row.line,
            RowErrorKind::FieldInvalid,
            format!("grade is not a number in 0..={}: {:?}", MAX_GRADE, row.grade),
        )
        .with_details(json!({ "field": "grade", "value": row.grade })));
    };

    let day = date.day;
    let semester = explicit_semester(&row.semester)
        .unwrap_or_else(|| cutoff.semester_of(day.month(), day.day()));
    let date_str = day.format("%Y-%m-%d").to_string();

    let activity_type = ActivityType::from_cell(&row.activity_type);
    let type_label = if row.activity_type.trim().is_empty() {
        activity_type.as_str()
    } else {
        row.activity_type.as_str()
    };
    let activity_id = format!(
        "activity-{}",
        slug_join(&[
            identity.subject_code.as_str(),
            identity.course_id.as_str(),
            identity.section_id.as_str(),
            type_label,
            date_str.as_str(),
        ])
    );

    Ok(CanonicalRecord {
        id: record_id(&identity.student.id, &identity.subject_code, &row.date, row.index()),
        student_id: identity.student.id.clone(),
        student_identifier: row.identifier.clone(),
        student_name: row.student_name.clone(),
        teacher_id: identity.teacher.id.clone(),
        teacher_name: identity.teacher.name.clone(),
        course_id: identity.course_id.clone(),
        section_id: identity.section_id.clone(),
        course: row.course.clone(),
        section: row.section.clone(),
        subject_code: identity.subject_code.clone(),
        subject_name: row.subject.clone(),
        activity_type,
        activity_id,
        grade,
        max_grade: MAX_GRADE,
        graded_at: date.instant.to_rfc3339(),
        date: date_str,
        semester,
        year: day.year(),
        topic: row.topic.clone(),
        source_row: row.row,
    })
}
