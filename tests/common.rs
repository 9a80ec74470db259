#![allow(dead_code)]

use async_trait::async_trait;
use certificate_pipeline::convert::{ConversionError, Converter};
use certificate_pipeline::curriculum::{CurriculumAggregator, UnitSource};
use certificate_pipeline::models::{
    CertificateTemplate, CertificateUpsert, ClaimContext, CompletionClaim, CourseCategory,
    CourseRecord, CourseUnit, FailureRecord, GeneratedCertificate, GenerationLogEntry,
    GenerationStatus, LogAction, LogDraft, PendingRecord, StudentRecord, TemplateKind,
};
use certificate_pipeline::render::fields::MAX_TRANSCRIPT_UNITS;
use certificate_pipeline::render::Escaping;
use certificate_pipeline::sequence::{
    AllocationError, RegistrationFormat, SequenceAllocator, SequenceSource,
};
use certificate_pipeline::storage::ArtifactStorage;
use certificate_pipeline::store::{CertificateStore, ClaimRepository, PersistenceError};
use certificate_pipeline::templates::{TemplateRepository, TemplateStore};
use certificate_pipeline::{CertificatePipeline, PipelineComponents};
use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const CERTIFICATE_TEMPLATE: &str = r#"#let registration = "${REGISTRATION_NO}"
#let student = "${STUDENT_NAME}"
#let course = "${COURSE_NAME}"
#let issued = "${DATE_OF_ISSUANCE}"
#let completed = "${COMPLETION_DATE}"
"#;

pub fn transcript_template() -> String {
    let mut template = String::from(
        "#let registration = \"${REGISTRATION_NO}\"\n#let student = \"${STUDENT_NAME}\"\n#let course = \"${COURSE_NAME}\"\n#let level = \"${COURSE_LEVEL}\"\n#let completed = \"${COMPLETION_DATE}\"\n",
    );
    for slot in 1..=MAX_TRANSCRIPT_UNITS {
        template.push_str(&format!(
            "#row(\"${{UNIT_{0}_NAME}}\", \"${{UNIT_{0}_CREDITS}}\")\n",
            slot
        ));
    }
    template
}

pub fn claim_context(student_name: &str, course_title: &str, category: CourseCategory) -> ClaimContext {
    let student_id = Uuid::new_v4();
    let course_id = Uuid::new_v4();
    ClaimContext {
        claim: CompletionClaim {
            id: Uuid::new_v4(),
            student_id,
            course_id,
            course_category: category,
            student_name: Some(student_name.to_string()),
            certificate_name: None,
            selected_course_name: None,
            completed_at: Some(Utc.with_ymd_and_hms(2025, 5, 2, 15, 30, 0).unwrap()),
            claimed_at: Utc.with_ymd_and_hms(2025, 5, 4, 9, 0, 0).unwrap(),
        },
        course: CourseRecord {
            id: course_id,
            title: course_title.to_string(),
            level: Some("Level 2".to_string()),
        },
        student: StudentRecord {
            id: student_id,
            full_name: format!("{} (account)", student_name),
        },
    }
}

pub fn numbered_units(count: u32) -> Vec<CourseUnit> {
    (1..=count)
        .map(|i| CourseUnit::new(i, format!("Unit {} title", i), None))
        .collect()
}

/// In-memory claims keyed by claim id.
#[derive(Default)]
pub struct MemoryClaims {
    claims: Mutex<HashMap<Uuid, ClaimContext>>,
}

impl MemoryClaims {
    pub async fn add(&self, ctx: ClaimContext) -> Uuid {
        let id = ctx.claim.id;
        self.claims.lock().await.insert(id, ctx);
        id
    }
}

#[async_trait]
impl ClaimRepository for MemoryClaims {
    async fn load_claim(&self, claim_id: Uuid) -> Result<Option<ClaimContext>, PersistenceError> {
        Ok(self.claims.lock().await.get(&claim_id).cloned())
    }
}

#[derive(Default)]
struct StoreState {
    rows: HashMap<Uuid, GeneratedCertificate>,
    logs: Vec<GenerationLogEntry>,
}

/// In-memory certificate store with the same upsert semantics as the
/// Postgres implementation: one row per claim, updated in place.
#[derive(Default)]
pub struct MemoryCertificateStore {
    state: Mutex<StoreState>,
    pub fail_upserts: AtomicBool,
    pub fail_lookups: AtomicBool,
}

impl MemoryCertificateStore {
    pub async fn row_count(&self) -> usize {
        self.state.lock().await.rows.len()
    }

    pub async fn row(&self, claim_id: Uuid) -> Option<GeneratedCertificate> {
        self.state.lock().await.rows.get(&claim_id).cloned()
    }

    pub async fn actions(&self, generated_certificate_id: Uuid) -> Vec<LogAction> {
        self.state
            .lock()
            .await
            .logs
            .iter()
            .filter(|l| l.generated_certificate_id == generated_certificate_id)
            .map(|l| l.action)
            .collect()
    }

    fn push_log(state: &mut StoreState, generated_certificate_id: Uuid, draft: &LogDraft) {
        state.logs.push(GenerationLogEntry {
            id: Uuid::new_v4(),
            generated_certificate_id,
            action: draft.action,
            detail: draft.detail.clone(),
            created_at: Utc::now(),
        });
    }
}

fn new_row(
    claim_id: Uuid,
    student_id: Uuid,
    course_id: Uuid,
    course_category: CourseCategory,
    status: GenerationStatus,
) -> GeneratedCertificate {
    let now = Utc::now();
    GeneratedCertificate {
        id: Uuid::new_v4(),
        claim_id,
        student_id,
        course_id,
        course_category,
        certificate_source_path: None,
        transcript_source_path: None,
        certificate_distribution_url: None,
        transcript_distribution_url: None,
        registration_number: None,
        registration_added_at: None,
        registration_added_by: None,
        status,
        error_message: None,
        generated_field_snapshot: serde_json::json!({}),
        created_at: now,
        updated_at: now,
    }
}

#[async_trait]
impl CertificateStore for MemoryCertificateStore {
    async fn find_by_claim(
        &self,
        claim_id: Uuid,
    ) -> Result<Option<GeneratedCertificate>, PersistenceError> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("mock lookup failure".to_string()));
        }
        Ok(self.state.lock().await.rows.get(&claim_id).cloned())
    }

    async fn mark_pending(&self, record: &PendingRecord) -> Result<(), PersistenceError> {
        self.state
            .lock()
            .await
            .rows
            .entry(record.claim_id)
            .or_insert_with(|| {
                new_row(
                    record.claim_id,
                    record.student_id,
                    record.course_id,
                    record.course_category,
                    GenerationStatus::Pending,
                )
            });
        Ok(())
    }

    async fn upsert(
        &self,
        record: &CertificateUpsert,
        log: &[LogDraft],
    ) -> Result<GeneratedCertificate, PersistenceError> {
        if self.fail_upserts.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("mock upsert failure".to_string()));
        }

        let mut state = self.state.lock().await;
        if let Some(existing) = state.rows.get(&record.claim_id) {
            let stored = existing.registration_number.clone();
            if !record.number_precondition.allows(stored.as_deref()) {
                return Err(PersistenceError::NumberChanged {
                    claim_id: record.claim_id,
                    stored,
                });
            }
        }

        let row = state.rows.entry(record.claim_id).or_insert_with(|| {
            new_row(
                record.claim_id,
                record.student_id,
                record.course_id,
                record.course_category,
                GenerationStatus::Pending,
            )
        });

        row.student_id = record.student_id;
        row.course_id = record.course_id;
        row.course_category = record.course_category;
        row.certificate_source_path = Some(record.certificate_source_path.clone());
        row.transcript_source_path = Some(record.transcript_source_path.clone());
        row.certificate_distribution_url = record.certificate_distribution_url.clone();
        row.transcript_distribution_url = record.transcript_distribution_url.clone();
        row.registration_number = Some(record.registration_number.clone());
        if let Some(stamp) = &record.registration_added {
            row.registration_added_at = Some(stamp.at);
            row.registration_added_by = Some(stamp.by.clone());
        }
        row.status = GenerationStatus::Ready;
        row.error_message = None;
        row.generated_field_snapshot = record.generated_field_snapshot.clone();
        row.updated_at = Utc::now();

        let stored = row.clone();
        for draft in log {
            Self::push_log(&mut state, stored.id, draft);
        }
        Ok(stored)
    }

    async fn record_failure(
        &self,
        record: &FailureRecord,
    ) -> Result<GeneratedCertificate, PersistenceError> {
        let mut state = self.state.lock().await;
        let row = state.rows.entry(record.claim_id).or_insert_with(|| {
            new_row(
                record.claim_id,
                record.student_id,
                record.course_id,
                record.course_category,
                GenerationStatus::Failed,
            )
        });
        row.status = GenerationStatus::Failed;
        row.error_message = Some(record.error_message.clone());
        row.updated_at = Utc::now();

        let stored = row.clone();
        let draft = LogDraft::new(
            LogAction::Failed,
            serde_json::json!({ "error": record.error_message }),
        );
        Self::push_log(&mut state, stored.id, &draft);
        Ok(stored)
    }

    async fn history(
        &self,
        generated_certificate_id: Uuid,
    ) -> Result<Vec<GenerationLogEntry>, PersistenceError> {
        Ok(self
            .state
            .lock()
            .await
            .logs
            .iter()
            .filter(|l| l.generated_certificate_id == generated_certificate_id)
            .cloned()
            .collect())
    }
}

/// Atomic counter standing in for the database sequence.
#[derive(Default)]
pub struct CounterSequence {
    pub value: AtomicI64,
    pub unavailable: AtomicBool,
}

#[async_trait]
impl SequenceSource for CounterSequence {
    async fn next_value(&self) -> Result<i64, AllocationError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AllocationError::Unavailable("connection refused".to_string()));
        }
        let value = self.value.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::task::yield_now().await;
        Ok(value)
    }
}

/// Serves `<category>/<kind>.typ` for every key except those removed.
pub struct DirectoryTemplates {
    pub missing: Vec<(TemplateKind, CourseCategory)>,
}

#[async_trait]
impl TemplateRepository for DirectoryTemplates {
    async fn find_active(
        &self,
        kind: TemplateKind,
        category: CourseCategory,
    ) -> Result<Option<CertificateTemplate>, String> {
        if self.missing.contains(&(kind, category)) {
            return Ok(None);
        }
        Ok(Some(CertificateTemplate {
            id: Uuid::new_v4(),
            name: format!("{} {}", category, kind),
            kind,
            course_category: category,
            path: format!("{}/{}.typ", category, kind),
            is_active: true,
        }))
    }
}

/// In-memory artifact storage.
#[derive(Default)]
pub struct MemoryStorage {
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub async fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().await.get(path).cloned()
    }

    pub async fn file_count(&self) -> usize {
        self.files.lock().await.len()
    }
}

#[async_trait]
impl ArtifactStorage for MemoryStorage {
    async fn upload_file(&self, path: &str, file_data: &[u8]) -> Result<(), String> {
        self.files
            .lock()
            .await
            .insert(path.to_string(), file_data.to_vec());
        Ok(())
    }

    fn get_public_url(&self, path: &str) -> String {
        format!("http://test.example.com/{}", path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConverterBehaviour {
    Succeed,
    AlwaysTimeout,
    FailTranscripts,
}

/// Converter that fakes a PDF by prefixing the source.
pub struct StubConverter {
    pub behaviour: ConverterBehaviour,
}

#[async_trait]
impl Converter for StubConverter {
    fn source_extension(&self) -> &str {
        "typ"
    }

    fn output_extension(&self) -> &str {
        "pdf"
    }

    fn escaping(&self) -> Escaping {
        Escaping::TypstString
    }

    async fn convert(&self, source: &[u8]) -> Result<Vec<u8>, ConversionError> {
        let is_transcript = String::from_utf8_lossy(source).contains("#row(");
        match self.behaviour {
            ConverterBehaviour::AlwaysTimeout => Err(ConversionError::Timeout {
                program: "stub".to_string(),
                timeout: Duration::from_secs(30),
            }),
            ConverterBehaviour::FailTranscripts if is_transcript => Err(ConversionError::Exit {
                program: "stub".to_string(),
                code: 1,
                stderr: "layout overflow".to_string(),
            }),
            _ => {
                let mut pdf = b"%PDF-1.7\n".to_vec();
                pdf.extend_from_slice(source);
                Ok(pdf)
            }
        }
    }
}

/// Converter that stalls on documents containing `marker`, then succeeds.
pub struct StallingConverter {
    pub marker: String,
    pub delay: Duration,
}

#[async_trait]
impl Converter for StallingConverter {
    fn source_extension(&self) -> &str {
        "typ"
    }

    fn output_extension(&self) -> &str {
        "pdf"
    }

    fn escaping(&self) -> Escaping {
        Escaping::TypstString
    }

    async fn convert(&self, source: &[u8]) -> Result<Vec<u8>, ConversionError> {
        if String::from_utf8_lossy(source).contains(&self.marker) {
            tokio::time::sleep(self.delay).await;
        }
        let mut pdf = b"%PDF-1.7\n".to_vec();
        pdf.extend_from_slice(source);
        Ok(pdf)
    }
}

/// Unit source returning fixed units for every course.
pub struct FixedUnits(pub Vec<CourseUnit>);

#[async_trait]
impl UnitSource for FixedUnits {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn fetch_units(&self, _course_id: Uuid) -> Result<Vec<CourseUnit>, String> {
        Ok(self.0.clone())
    }
}

pub struct Harness {
    pub pipeline: Arc<CertificatePipeline>,
    pub claims: Arc<MemoryClaims>,
    pub store: Arc<MemoryCertificateStore>,
    pub sequence: Arc<CounterSequence>,
    pub storage: Arc<MemoryStorage>,
    pub template_dir: TempDir,
}

pub struct HarnessOptions {
    pub units: Vec<CourseUnit>,
    pub converter: Arc<dyn Converter>,
    pub missing_templates: Vec<(TemplateKind, CourseCategory)>,
    pub certificate_template: String,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            units: numbered_units(3),
            converter: Arc::new(StubConverter {
                behaviour: ConverterBehaviour::Succeed,
            }),
            missing_templates: Vec::new(),
            certificate_template: CERTIFICATE_TEMPLATE.to_string(),
        }
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_options(HarnessOptions::default())
    }

    pub fn with_options(options: HarnessOptions) -> Self {
        let template_dir = tempfile::tempdir().unwrap();
        for category in [CourseCategory::Cpd, CourseCategory::Qualification] {
            let dir = template_dir.path().join(category.as_str());
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("certificate.typ"), &options.certificate_template).unwrap();
            std::fs::write(dir.join("transcript.typ"), transcript_template()).unwrap();
        }

        let claims = Arc::new(MemoryClaims::default());
        let store = Arc::new(MemoryCertificateStore::default());
        let sequence = Arc::new(CounterSequence::default());
        let storage = Arc::new(MemoryStorage::default());

        let units: Arc<dyn UnitSource> = Arc::new(FixedUnits(options.units));
        let curriculum = CurriculumAggregator::new()
            .register(CourseCategory::Cpd, units.clone())
            .register(CourseCategory::Qualification, units);

        let templates = TemplateStore::new(
            Arc::new(DirectoryTemplates {
                missing: options.missing_templates,
            }),
            template_dir.path(),
            Duration::from_secs(60),
        );

        let pipeline = CertificatePipeline::new(PipelineComponents {
            claims: claims.clone(),
            store: store.clone(),
            allocator: SequenceAllocator::new(sequence.clone(), RegistrationFormat::default()),
            curriculum,
            templates,
            converter: options.converter,
            storage: storage.clone(),
        });

        Self {
            pipeline: Arc::new(pipeline),
            claims,
            store,
            sequence,
            storage,
            template_dir,
        }
    }

    /// Number of values drawn from the sequence so far.
    pub fn sequence_value(&self) -> i64 {
        self.sequence.value.load(Ordering::SeqCst)
    }

    pub async fn add_claim(&self, student_name: &str, course_title: &str) -> Uuid {
        self.claims
            .add(claim_context(student_name, course_title, CourseCategory::Cpd))
            .await
    }
}
