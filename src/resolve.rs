use serde::Serialize;
use serde_json::json;

use crate::csv::RawRow;
use crate::directory::{EntityDirectory, MatchTier, Student, Teacher};
use crate::error::RowErrorKind;
use crate::normalize::{canonicalize_course, normalize};
use crate::report::RowError;

/// Comparison keys derived once per row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedQuery {
    pub subject: String,
    pub course: String,
    pub section: String,
    /// `"<number> <level>"` when the course text carries one.
    pub course_key: String,
}

impl NormalizedQuery {
    pub fn from_row(row: &RawRow) -> Self {
        Self {
            subject: normalize(&row.subject),
            course: normalize(&row.course),
            section: normalize(&row.section),
            course_key: canonicalize_course(&row.course),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedIdentity<'a> {
    pub student: &'a Student,
    pub teacher: &'a Teacher,
    pub course_id: String,
    pub section_id: String,
    pub subject_code: String,
    pub match_tier: MatchTier,
    /// Teachers that qualified at `match_tier`; the first one won.
    pub candidates: usize,
}

pub fn resolve_identity<'a>(
    row: &RawRow,
    query: &NormalizedQuery,
    dir: &'a dyn EntityDirectory,
) -> Result<ResolvedIdentity<'a>, RowError> {
    let student = resolve_student(row, dir)?;

    let subject_code = dir
        .subject_code(&row.subject)
        .unwrap_or_else(|| row.subject.clone());

    let tiers =
        dir.find_teachers_by_subject_and_assignment(&subject_code, &row.subject, &row.course, &row.section);
    let Some((match_tier, teacher, candidates)) = tiers.best() else {
        return Err(RowError::new(
            row.row,
            row.line,
            RowErrorKind::IdentityUnresolved,
            format!(
                "no teacher for {} in {} {}",
                row.subject, row.course, row.section
            ),
        )
        .with_details(json!({
            "entity": "teacher",
            "subject": row.subject,
            "subjectCode": subject_code,
            "course": row.course,
            "section": row.section,
            "tierReached": null,
        })));
    };
    if candidates > 1 {
        tracing::debug!(
            row = row.row,
            tier = match_tier.number(),
            candidates,
            teacher = %teacher.id,
            "several teachers qualified; taking first in directory order"
        );
    }

    let (course_id, section_id) = course_linkage(row, query, student)?;

    Ok(ResolvedIdentity {
        student,
        teacher,
        course_id,
        section_id,
        subject_code,
        match_tier,
        candidates,
    })
}

fn resolve_student<'a>(row: &RawRow, dir: &'a dyn EntityDirectory) -> Result<&'a Student, RowError> {
    let found = dir.find_students_by_identifier(&row.identifier);
    match found.as_slice() {
        [one] => Ok(*one),
        [] => Err(RowError::new(
            row.row,
            row.line,
            RowErrorKind::IdentityUnresolved,
            format!("student not found: {}", row.identifier),
        )
        .with_details(json!({ "entity": "student", "identifier": row.identifier }))),
        many => Err(RowError::new(
            row.row,
            row.line,
            RowErrorKind::IdentityUnresolved,
            format!("identifier {} matches {} students", row.identifier, many.len()),
        )
        .with_details(json!({
            "entity": "student",
            "identifier": row.identifier,
            "matches": many.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
        }))),
    }
}

/// Course and section ids from the student's own enrolment. An empty section
/// cell matches on course alone when the student has exactly one such enrolment.
fn course_linkage(
    row: &RawRow,
    query: &NormalizedQuery,
    student: &Student,
) -> Result<(String, String), RowError> {
    let assignment = if query.section.is_empty() {
        let mut by_course = student
            .course_assignments
            .iter()
            .filter(|ca| ca.matches_course(&query.course_key));
        match (by_course.next(), by_course.next()) {
            (Some(one), None) => Some(one),
            _ => None,
        }
    } else {
        student
            .course_assignments
            .iter()
            .find(|ca| ca.matches(&query.course_key, &query.section))
    };

    match assignment.and_then(|ca| Some((ca.course_id.clone()?, ca.section_id.clone()?))) {
        Some(ids) => Ok(ids),
        None => Err(RowError::new(
            row.row,
            row.line,
            RowErrorKind::FieldInvalid,
            format!(
                "no course/section linkage for student {} in {} {}",
                student.id, row.course, row.section
            ),
        )
        .with_details(json!({
            "field": "course",
            "course": row.course,
            "section": row.section,
        }))),
    }
}
