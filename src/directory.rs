use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize, Serializer};

use crate::normalize::{canonicalize_course, identifier_key, normalize};

/// A course+section pairing as it appears on a user. Ids may be absent in
/// exported snapshots; they are filled from the catalogue at load time.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseAssignment {
    #[serde(default)]
    pub course: String,
    #[serde(default)]
    pub section: String,
    #[serde(default)]
    pub course_id: Option<String>,
    #[serde(default)]
    pub section_id: Option<String>,
    #[serde(skip)]
    pub course_key: String,
    #[serde(skip)]
    pub section_key: String,
}

impl CourseAssignment {
    pub fn matches_course(&self, course_key: &str) -> bool {
        self.course_key == course_key
    }

    pub fn matches(&self, course_key: &str, section_key: &str) -> bool {
        self.course_key == course_key && self.section_key == section_key
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Course {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Section {
    pub id: String,
    pub course_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub code: String,
    pub name: String,
}

/// Raw user entry; partitioned by `role` into students and teachers.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserEntry {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    role: String,
    #[serde(default, alias = "rut")]
    identifier: String,
    #[serde(default)]
    subjects: Vec<String>,
    #[serde(default)]
    course_assignments: Vec<CourseAssignment>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: String,
    pub name: String,
    pub identifier: String,
    pub course_assignments: Vec<CourseAssignment>,
    #[serde(skip)]
    identifier_key: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Teacher {
    pub id: String,
    pub name: String,
    pub subjects: Vec<String>,
    pub course_assignments: Vec<CourseAssignment>,
}

impl Teacher {
    /// Subject lists in exports hold codes, normalized names or display names.
    pub fn teaches(&self, subject_code: &str, subject_name: &str) -> bool {
        let normalized = normalize(subject_name);
        self.subjects
            .iter()
            .any(|s| s == subject_code || *s == normalized || s == subject_name)
    }
}

/// Which fallback level produced a teacher match. Lower is stricter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchTier {
    Exact = 1,
    CourseOnly = 2,
    SubjectOnly = 3,
}

impl MatchTier {
    pub fn number(self) -> u8 {
        self as u8
    }
}

impl Serialize for MatchTier {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u8(self.number())
    }
}

/// Candidates at each tier, each list in directory order.
#[derive(Debug, Default)]
pub struct TierMatches<'a> {
    pub exact: Vec<&'a Teacher>,
    pub course_only: Vec<&'a Teacher>,
    pub subject_only: Vec<&'a Teacher>,
}

impl<'a> TierMatches<'a> {
    /// First teacher at the first non-empty tier, plus how many qualified there.
    pub fn best(&self) -> Option<(MatchTier, &'a Teacher, usize)> {
        [
            (MatchTier::Exact, &self.exact),
            (MatchTier::CourseOnly, &self.course_only),
            (MatchTier::SubjectOnly, &self.subject_only),
        ]
        .into_iter()
        .find_map(|(tier, list)| list.first().map(|t| (tier, *t, list.len())))
    }
}

/// Read-only source of students, teachers and the subject catalogue.
pub trait EntityDirectory: Send + Sync {
    /// Every student-role entity whose identifier key equals `identifier`'s.
    fn find_students_by_identifier(&self, identifier: &str) -> Vec<&Student>;

    fn teachers(&self) -> &[Teacher];

    /// Catalogue code for a subject given by code or (any spelling of) name.
    fn subject_code(&self, subject: &str) -> Option<String>;

    fn find_teachers_by_subject_and_assignment(
        &self,
        subject_code: &str,
        subject_name: &str,
        course: &str,
        section: &str,
    ) -> TierMatches<'_> {
        let course_key = canonicalize_course(course);
        let section_key = normalize(section);
        let mut out = TierMatches::default();
        for t in self.teachers() {
            if !t.teaches(subject_code, subject_name) {
                continue;
            }
            if t.course_assignments
                .iter()
                .any(|ca| ca.matches(&course_key, &section_key))
            {
                out.exact.push(t);
            }
            if t.course_assignments
                .iter()
                .any(|ca| ca.matches_course(&course_key))
            {
                out.course_only.push(t);
            }
            out.subject_only.push(t);
        }
        out
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotFile {
    #[serde(default)]
    subjects: Vec<Subject>,
    #[serde(default)]
    courses: Vec<Course>,
    #[serde(default)]
    sections: Vec<Section>,
    #[serde(default)]
    users: Vec<UserEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct DirectorySnapshot {
    pub subjects: Vec<Subject>,
    pub courses: Vec<Course>,
    pub sections: Vec<Section>,
    students: Vec<Student>,
    teachers: Vec<Teacher>,
    by_identifier: HashMap<String, Vec<usize>>,
    subject_by_key: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectorySummary {
    pub students: usize,
    pub teachers: usize,
    pub courses: usize,
    pub sections: usize,
    pub subjects: usize,
}

impl DirectorySnapshot {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read directory {}", path.to_string_lossy()))?;
        Self::from_json_str(&text)
            .with_context(|| format!("invalid directory {}", path.to_string_lossy()))
    }

    pub fn from_json_str(text: &str) -> anyhow::Result<Self> {
        let file: SnapshotFile = serde_json::from_str(text)?;
        Ok(Self::build(file))
    }

    fn build(file: SnapshotFile) -> Self {
        let course_ids = file
            .courses
            .iter()
            .map(|c| (canonicalize_course(&c.name), c.id.clone()))
            .collect::<HashMap<_, _>>();
        let section_ids = file
            .sections
            .iter()
            .map(|s| ((s.course_id.clone(), normalize(&s.name)), s.id.clone()))
            .collect::<HashMap<_, _>>();

        let complete = |mut ca: CourseAssignment| {
            ca.course_key = canonicalize_course(&ca.course);
            ca.section_key = normalize(&ca.section);
            if ca.course_id.is_none() {
                ca.course_id = course_ids.get(&ca.course_key).cloned();
            }
            if ca.section_id.is_none() {
                if let Some(cid) = &ca.course_id {
                    ca.section_id = section_ids
                        .get(&(cid.clone(), ca.section_key.clone()))
                        .cloned();
                }
            }
            ca
        };

        let mut students = Vec::new();
        let mut teachers = Vec::new();
        for u in file.users {
            let assignments = u
                .course_assignments
                .into_iter()
                .map(&complete)
                .collect::<Vec<_>>();
            match u.role.as_str() {
                "student" => students.push(Student {
                    identifier_key: identifier_key(&u.identifier),
                    id: u.id,
                    name: u.name,
                    identifier: u.identifier,
                    course_assignments: assignments,
                }),
                "teacher" => teachers.push(Teacher {
                    id: u.id,
                    name: u.name,
                    subjects: u.subjects,
                    course_assignments: assignments,
                }),
                _ => {}
            }
        }

        let mut by_identifier: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, s) in students.iter().enumerate() {
            if !s.identifier_key.is_empty() {
                by_identifier.entry(s.identifier_key.clone()).or_default().push(i);
            }
        }

        let mut subject_by_key = HashMap::new();
        for s in &file.subjects {
            subject_by_key
                .entry(normalize(&s.name))
                .or_insert_with(|| s.code.clone());
            subject_by_key
                .entry(normalize(&s.code))
                .or_insert_with(|| s.code.clone());
        }

        tracing::info!(
            students = students.len(),
            teachers = teachers.len(),
            subjects = file.subjects.len(),
            "directory loaded"
        );

        Self {
            subjects: file.subjects,
            courses: file.courses,
            sections: file.sections,
            students,
            teachers,
            by_identifier,
            subject_by_key,
        }
    }

    pub fn students(&self) -> &[Student] {
        &self.students
    }

    pub fn summary(&self) -> DirectorySummary {
        DirectorySummary {
            students: self.students.len(),
            teachers: self.teachers.len(),
            courses: self.courses.len(),
            sections: self.sections.len(),
            subjects: self.subjects.len(),
        }
    }
}

impl EntityDirectory for DirectorySnapshot {
    fn find_students_by_identifier(&self, identifier: &str) -> Vec<&Student> {
        self.by_identifier
            .get(&identifier_key(identifier))
            .map(|idx| idx.iter().map(|&i| &self.students[i]).collect())
            .unwrap_or_default()
    }

    fn teachers(&self) -> &[Teacher] {
        &self.teachers
    }

    fn subject_code(&self, subject: &str) -> Option<String> {
        self.subject_by_key.get(&normalize(subject)).cloned()
    }
}
