use std::collections::HashMap;

use crate::error::{IngestError, RowErrorKind};
use crate::normalize::normalize;
use crate::report::RowError;

pub const DELIMITER: char = ',';

/// Typed fields read from one grade row. Aliases are resolved once per file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    StudentName,
    Identifier,
    Course,
    Section,
    Subject,
    ActivityType,
    Date,
    Grade,
    Topic,
    Semester,
}

impl Field {
    pub const ALL: [Field; 10] = [
        Field::StudentName,
        Field::Identifier,
        Field::Course,
        Field::Section,
        Field::Subject,
        Field::ActivityType,
        Field::Date,
        Field::Grade,
        Field::Topic,
        Field::Semester,
    ];

    pub fn aliases(self) -> &'static [&'static str] {
        match self {
            Field::StudentName => &["nombre", "student", "studentname", "student_name", "estudiante"],
            Field::Identifier => &[
                "rut",
                "studentid",
                "student_id",
                "studentrut",
                "student_rut",
                "identifier",
                "id",
            ],
            Field::Course => &["curso", "course", "courseid", "course_id"],
            Field::Section => &["seccion", "section", "sectionid", "section_id"],
            Field::Subject => &["asignatura", "subject", "subjectid", "subject_id", "materia"],
            Field::ActivityType => &["tipo", "type", "activitytype", "activity_type"],
            Field::Date => &["fecha", "date", "gradedat", "activitydate", "activity_date"],
            Field::Grade => &["nota", "grade", "score", "calificacion", "nota_final"],
            Field::Topic => &["tema", "topic", "theme", "comentario", "comment"],
            Field::Semester => &["semestre", "semester", "periodo", "period"],
        }
    }

    pub fn required(self) -> bool {
        matches!(
            self,
            Field::StudentName
                | Field::Identifier
                | Field::Course
                | Field::Subject
                | Field::Date
                | Field::Grade
        )
    }

    pub fn label(self) -> &'static str {
        self.aliases()[0]
    }
}

/// Header name → column index for every recognised field.
#[derive(Debug, Clone, Default)]
pub struct ColumnMap {
    cols: HashMap<Field, usize>,
    pub header: Vec<String>,
}

impl ColumnMap {
    pub fn from_header(line: &str) -> Result<Self, IngestError> {
        let header = parse_csv_record(line)
            .map(|cells| cells.iter().map(|h| header_key(h)).collect::<Vec<_>>())
            .unwrap_or_default();

        let mut idx = HashMap::<&str, usize>::new();
        for (i, name) in header.iter().enumerate() {
            // First occurrence wins for duplicated header names.
            idx.entry(name.as_str()).or_insert(i);
        }

        let mut cols = HashMap::new();
        let mut missing = Vec::new();
        for field in Field::ALL {
            match field.aliases().iter().find_map(|a| idx.get(a).copied()) {
                Some(i) => {
                    cols.insert(field, i);
                }
                None if field.required() => missing.push(field.label().to_string()),
                None => {}
            }
        }
        if !missing.is_empty() {
            return Err(IngestError::HeaderInvalid { missing });
        }

        Ok(Self { cols, header })
    }

    pub fn index_of(&self, field: Field) -> Option<usize> {
        self.cols.get(&field).copied()
    }

    fn cell(&self, cells: &[String], field: Field) -> String {
        self.index_of(field)
            .and_then(|i| cells.get(i))
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RawRow {
    /// 1-based ordinal among data rows.
    pub row: usize,
    /// 1-based physical line in the file.
    pub line: usize,
    pub student_name: String,
    pub identifier: String,
    pub course: String,
    pub section: String,
    pub subject: String,
    pub activity_type: String,
    pub date: String,
    pub grade: String,
    pub topic: String,
    pub semester: String,
}

impl RawRow {
    /// Zero-based index used for record identity.
    pub fn index(&self) -> usize {
        self.row.saturating_sub(1)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParsedFile {
    pub columns: ColumnMap,
    pub rows: Vec<RawRow>,
    pub rejected: Vec<RowError>,
    pub rows_total: usize,
}

/// Splits decoded text into typed rows. Only a bad header fails the whole file.
pub fn parse_rows(text: &str) -> Result<ParsedFile, IngestError> {
    let lines = text
        .split('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l))
        .collect::<Vec<_>>();

    let Some(header_line) = lines.first() else {
        return Err(IngestError::HeaderInvalid {
            missing: required_labels(),
        });
    };
    let columns = ColumnMap::from_header(header_line)?;

    // Trailing blank lines are end-of-file padding, not rows.
    let last_data = lines
        .iter()
        .rposition(|l| !l.trim().is_empty())
        .unwrap_or(0);

    let mut rows = Vec::new();
    let mut rejected = Vec::new();
    let mut row_no = 0usize;
    for (i, raw_line) in lines.iter().enumerate().take(last_data + 1).skip(1) {
        row_no += 1;
        let line_no = i + 1;
        if raw_line.trim().is_empty() {
            rejected.push(RowError::new(
                row_no,
                line_no,
                RowErrorKind::RowParseError,
                "blank line",
            ));
            continue;
        }
        let cells = match parse_csv_record(raw_line) {
            Ok(c) => c,
            Err(message) => {
                rejected.push(RowError::new(
                    row_no,
                    line_no,
                    RowErrorKind::RowParseError,
                    message,
                ));
                continue;
            }
        };
        rows.push(RawRow {
            row: row_no,
            line: line_no,
            student_name: columns.cell(&cells, Field::StudentName),
            identifier: columns.cell(&cells, Field::Identifier),
            course: columns.cell(&cells, Field::Course),
            section: columns.cell(&cells, Field::Section),
            subject: columns.cell(&cells, Field::Subject),
            activity_type: columns.cell(&cells, Field::ActivityType),
            date: columns.cell(&cells, Field::Date),
            grade: columns.cell(&cells, Field::Grade),
            topic: columns.cell(&cells, Field::Topic),
            semester: columns.cell(&cells, Field::Semester),
        });
    }

    tracing::debug!(
        rows = rows.len(),
        rejected = rejected.len(),
        "parsed csv rows"
    );

    Ok(ParsedFile {
        columns,
        rows,
        rejected,
        rows_total: row_no,
    })
}

/// `"Student ID"`, `"student-id"` and `"student_id"` all name the same column.
fn header_key(cell: &str) -> String {
    normalize(cell.trim_start_matches('\u{feff}')).replace([' ', '-'], "_")
}

fn required_labels() -> Vec<String> {
    Field::ALL
        .iter()
        .filter(|f| f.required())
        .map(|f| f.label().to_string())
        .collect()
}

/// Quote-aware split of one record on [`DELIMITER`]. `""` inside quotes is a literal quote.
pub fn parse_csv_record(line: &str) -> Result<Vec<String>, String> {
    let mut out: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0usize;
    while i < chars.len() {
        let ch = chars[i];
        if ch == '"' {
            if in_quotes && i + 1 < chars.len() && chars[i + 1] == '"' {
                buf.push('"');
                i += 2;
                continue;
            }
            in_quotes = !in_quotes;
            i += 1;
            continue;
        }
        if ch == DELIMITER && !in_quotes {
            out.push(buf.trim().to_string());
            buf = String::new();
            i += 1;
            continue;
        }
        buf.push(ch);
        i += 1;
    }
    if in_quotes {
        return Err("unterminated quoted field".to_string());
    }
    out.push(buf.trim().to_string());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoted_cells_keep_delimiters() {
        let cells = parse_csv_record(r#"Ana,"Pérez, María","dijo ""hola""""#).expect("parse");
        assert_eq!(cells, vec!["Ana", "Pérez, María", r#"dijo "hola""#]);
    }

    #[test]
    fn header_spellings_share_a_column() {
        let cols = ColumnMap::from_header("Student Name,Student-ID,CURSO,Asignatura,Fecha,Nota").expect("header");
        assert_eq!(cols.index_of(Field::StudentName), Some(0));
        assert_eq!(cols.index_of(Field::Identifier), Some(1));
        assert_eq!(cols.index_of(Field::Section), None);
    }

    #[test]
    fn missing_required_columns_are_named() {
        let Err(IngestError::HeaderInvalid { missing }) = ColumnMap::from_header("nombre,curso,asignatura,nota") else {
            panic!("header should be rejected");
        };
        assert_eq!(missing, vec!["rut", "fecha"]);
    }

    #[test]
    fn unterminated_quote_is_an_error() {
        assert!(parse_csv_record(r#"Ana,"sin cierre"#).is_err());
    }
}
