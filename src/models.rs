use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Credit value used when a curriculum source does not track credits.
pub const DEFAULT_UNIT_CREDITS: u32 = 10;

/// Title of the synthetic unit substituted when no source yields any unit.
pub const FALLBACK_UNIT_TITLE: &str = "Course Completion";

/// Flat field map fed to the template renderer.
pub type FieldMap = BTreeMap<String, String>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown {what} '{value}'")]
pub struct ParseEnumError {
    pub what: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_string(),
        }
    }
}

/// Closed classification of courses used to pick a template set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CourseCategory {
    Cpd,
    Qualification,
}

impl CourseCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            CourseCategory::Cpd => "cpd",
            CourseCategory::Qualification => "qualification",
        }
    }
}

impl fmt::Display for CourseCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for CourseCategory {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpd" => Ok(CourseCategory::Cpd),
            "qualification" => Ok(CourseCategory::Qualification),
            other => Err(ParseEnumError::new("course category", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    Certificate,
    Transcript,
}

impl TemplateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateKind::Certificate => "certificate",
            TemplateKind::Transcript => "transcript",
        }
    }
}

impl fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for TemplateKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "certificate" => Ok(TemplateKind::Certificate),
            "transcript" => Ok(TemplateKind::Transcript),
            other => Err(ParseEnumError::new("template kind", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Pending,
    Ready,
    Failed,
}

impl GenerationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationStatus::Pending => "pending",
            GenerationStatus::Ready => "ready",
            GenerationStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for GenerationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for GenerationStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(GenerationStatus::Pending),
            "ready" => Ok(GenerationStatus::Ready),
            "failed" => Ok(GenerationStatus::Failed),
            other => Err(ParseEnumError::new("generation status", other)),
        }
    }
}

/// Action tag recorded in the generation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogAction {
    Generated,
    PdfCreated,
    RegistrationAdded,
    Failed,
}

impl LogAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogAction::Generated => "generated",
            LogAction::PdfCreated => "pdf_created",
            LogAction::RegistrationAdded => "registration_added",
            LogAction::Failed => "failed",
        }
    }
}

impl fmt::Display for LogAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for LogAction {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generated" => Ok(LogAction::Generated),
            "pdf_created" => Ok(LogAction::PdfCreated),
            "registration_added" => Ok(LogAction::RegistrationAdded),
            "failed" => Ok(LogAction::Failed),
            other => Err(ParseEnumError::new("log action", other)),
        }
    }
}

/// A student's request to receive a certificate for a completed course.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionClaim {
    pub id: Uuid,
    pub student_id: Uuid,
    pub course_id: Uuid,
    pub course_category: CourseCategory,
    /// Name the student asked to have printed; may be empty.
    pub student_name: Option<String>,
    /// Certificate name captured at claim time.
    pub certificate_name: Option<String>,
    /// Name of the selected course variant, if the claim picked one.
    pub selected_course_name: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub claimed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourseRecord {
    pub id: Uuid,
    pub title: String,
    pub level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentRecord {
    pub id: Uuid,
    pub full_name: String,
}

/// Everything about a claim needed to build the field maps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimContext {
    pub claim: CompletionClaim,
    pub course: CourseRecord,
    pub student: StudentRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseUnit {
    pub ordinal: u32,
    pub title: String,
    pub credits: u32,
}

impl CourseUnit {
    pub fn new(ordinal: u32, title: impl Into<String>, credits: Option<u32>) -> Self {
        Self {
            ordinal,
            title: title.into(),
            credits: credits.unwrap_or(DEFAULT_UNIT_CREDITS),
        }
    }

    /// Synthetic unit used so transcripts are never empty.
    pub fn fallback() -> Self {
        Self::new(1, FALLBACK_UNIT_TITLE, None)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateTemplate {
    pub id: Uuid,
    pub name: String,
    pub kind: TemplateKind,
    pub course_category: CourseCategory,
    /// Path relative to the template directory.
    pub path: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationStamp {
    pub at: DateTime<Utc>,
    pub by: String,
}

/// Durable output of the pipeline, at most one per claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedCertificate {
    pub id: Uuid,
    pub claim_id: Uuid,
    pub student_id: Uuid,
    pub course_id: Uuid,
    pub course_category: CourseCategory,
    pub certificate_source_path: Option<String>,
    pub transcript_source_path: Option<String>,
    pub certificate_distribution_url: Option<String>,
    pub transcript_distribution_url: Option<String>,
    pub registration_number: Option<String>,
    pub registration_added_at: Option<DateTime<Utc>>,
    pub registration_added_by: Option<String>,
    pub status: GenerationStatus,
    pub error_message: Option<String>,
    pub generated_field_snapshot: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Values written by a successful run; keyed by `claim_id` on upsert.
#[derive(Debug, Clone, Serialize)]
pub struct CertificateUpsert {
    pub claim_id: Uuid,
    pub student_id: Uuid,
    pub course_id: Uuid,
    pub course_category: CourseCategory,
    pub certificate_source_path: String,
    pub transcript_source_path: String,
    pub certificate_distribution_url: Option<String>,
    pub transcript_distribution_url: Option<String>,
    pub registration_number: String,
    /// Condition the stored number must meet for the write to apply.
    pub number_precondition: NumberPrecondition,
    /// Only overwrites the stored stamp when present.
    pub registration_added: Option<RegistrationStamp>,
    pub generated_field_snapshot: serde_json::Value,
}

/// Guard on the stored registration number, checked inside the upsert.
///
/// A run that rendered with the stored (or a freshly allocated) number must
/// not overwrite a number set by someone else while it was running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NumberPrecondition {
    /// Replace whatever is stored.
    Overwrite,
    /// Apply only while the stored number still equals this value
    /// (`None`: no row, or a row without a number).
    Unchanged(Option<String>),
}

impl NumberPrecondition {
    pub fn allows(&self, stored: Option<&str>) -> bool {
        match self {
            NumberPrecondition::Overwrite => true,
            NumberPrecondition::Unchanged(expected) => expected.as_deref() == stored,
        }
    }
}

/// Row created with status `pending` once both documents are rendered.
#[derive(Debug, Clone, Serialize)]
pub struct PendingRecord {
    pub claim_id: Uuid,
    pub student_id: Uuid,
    pub course_id: Uuid,
    pub course_category: CourseCategory,
}

/// Values written when a run fails; stored paths are left untouched.
#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub claim_id: Uuid,
    pub student_id: Uuid,
    pub course_id: Uuid,
    pub course_category: CourseCategory,
    pub error_message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogDraft {
    pub action: LogAction,
    pub detail: serde_json::Value,
}

impl LogDraft {
    pub fn new(action: LogAction, detail: serde_json::Value) -> Self {
        Self { action, detail }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationLogEntry {
    pub id: Uuid,
    pub generated_certificate_id: Uuid,
    pub action: LogAction,
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_course_category_parse_is_case_insensitive() {
        assert_eq!("CPD".parse::<CourseCategory>().unwrap(), CourseCategory::Cpd);
        assert_eq!(
            " qualification ".parse::<CourseCategory>().unwrap(),
            CourseCategory::Qualification
        );
        assert!("diploma".parse::<CourseCategory>().is_err());
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            GenerationStatus::Pending,
            GenerationStatus::Ready,
            GenerationStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<GenerationStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_log_action_serializes_as_tag() {
        let json = serde_json::to_string(&LogAction::RegistrationAdded).unwrap();
        assert_eq!(json, "\"registration_added\"");
        assert_eq!(LogAction::PdfCreated.to_string(), "pdf_created");
    }

    #[test]
    fn test_display_honours_padding() {
        assert_eq!(format!("{:<12}|", LogAction::Generated), "generated   |");
        assert_eq!(format!("{:>8}", CourseCategory::Cpd), "     cpd");
    }

    #[test]
    fn test_number_precondition() {
        assert!(NumberPrecondition::Overwrite.allows(Some("REG-00042")));
        let unchanged = NumberPrecondition::Unchanged(Some("REG-00001".to_string()));
        assert!(unchanged.allows(Some("REG-00001")));
        assert!(!unchanged.allows(Some("REG-00042")));
        assert!(!unchanged.allows(None));
        assert!(NumberPrecondition::Unchanged(None).allows(None));
    }

    #[test]
    fn test_course_unit_defaults_credits() {
        let unit = CourseUnit::new(3, "Risk", None);
        assert_eq!(unit.credits, DEFAULT_UNIT_CREDITS);

        let fallback = CourseUnit::fallback();
        assert_eq!(fallback.ordinal, 1);
        assert_eq!(fallback.title, FALLBACK_UNIT_TITLE);
    }
}
