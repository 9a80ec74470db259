//! Certificate/transcript generation pipeline.
//!
//! A run moves through the stages of [`PipelineStage`] strictly in order.
//! Template lookup, rendering, number allocation, artifact storage and
//! persistence failures are fatal: the run stops and the claim's row is
//! marked `failed`. Conversion failures only leave the affected
//! distribution URL empty.

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::convert::Converter;
use crate::curriculum::CurriculumAggregator;
use crate::db::Database;
use crate::models::{
    CertificateUpsert, ClaimContext, FailureRecord, FieldMap, GeneratedCertificate,
    GenerationLogEntry, LogAction, LogDraft, NumberPrecondition, PendingRecord,
    RegistrationStamp, TemplateKind,
};
use crate::render::common::sanitize_filename;
use crate::render::{fields, RenderError, TemplateRenderer};
use crate::sequence::{AllocationError, RegistrationNumber, SequenceAllocator};
use crate::storage::{ArtifactStorage, LocalArtifactStorage, DISTRIBUTION_AREA, RENDERED_AREA};
use crate::store::{CertificateStore, ClaimRepository, PersistenceError};
use crate::templates::{TemplateError, TemplateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Start,
    UnitsResolved,
    TemplatesLoaded,
    NumberAllocated,
    Rendered,
    Converted,
    Persisted,
    Done,
    Failed,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::Start => "start",
            PipelineStage::UnitsResolved => "units_resolved",
            PipelineStage::TemplatesLoaded => "templates_loaded",
            PipelineStage::NumberAllocated => "number_allocated",
            PipelineStage::Rendered => "rendered",
            PipelineStage::Converted => "converted",
            PipelineStage::Persisted => "persisted",
            PipelineStage::Done => "done",
            PipelineStage::Failed => "failed",
        };
        f.pad(name)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("claim {0} not found")]
    ClaimNotFound(Uuid),
    #[error("no generated certificate exists for claim {0}")]
    CertificateNotFound(Uuid),
    #[error(transparent)]
    TemplateLookup(#[from] TemplateError),
    #[error("failed to render {kind}: {source}")]
    TemplateRender {
        kind: TemplateKind,
        #[source]
        source: RenderError,
    },
    #[error("registration number allocation failed: {0}")]
    Allocation(#[from] AllocationError),
    #[error("failed to store {path}: {reason}")]
    Storage { path: String, reason: String },
    #[error("persistence failed: {0}")]
    Persistence(#[from] PersistenceError),
}

/// Result of a run that reached the store.
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub certificate: GeneratedCertificate,
    pub unit_count: usize,
    /// Documents whose conversion failed, with the reason.
    pub conversion_failures: Vec<(TemplateKind, String)>,
}

/// Dependencies of a pipeline.
pub struct PipelineComponents {
    pub claims: Arc<dyn ClaimRepository>,
    pub store: Arc<dyn CertificateStore>,
    pub allocator: SequenceAllocator,
    pub curriculum: CurriculumAggregator,
    pub templates: TemplateStore,
    pub converter: Arc<dyn Converter>,
    pub storage: Arc<dyn ArtifactStorage>,
}

pub struct CertificatePipeline {
    claims: Arc<dyn ClaimRepository>,
    store: Arc<dyn CertificateStore>,
    allocator: SequenceAllocator,
    curriculum: CurriculumAggregator,
    templates: TemplateStore,
    renderer: TemplateRenderer,
    converter: Arc<dyn Converter>,
    storage: Arc<dyn ArtifactStorage>,
}

/// Runs repeated because the stored number changed underneath them.
const MAX_NUMBER_ATTEMPTS: usize = 3;

enum NumberSource {
    Allocate,
    Reuse(String),
    Explicit(RegistrationNumber),
}

impl NumberSource {
    fn from_stored(stored: Option<String>) -> Self {
        match stored {
            Some(number) => NumberSource::Reuse(number),
            None => NumberSource::Allocate,
        }
    }

    /// What the stored number must still be when the run persists.
    fn precondition(&self) -> NumberPrecondition {
        match self {
            NumberSource::Allocate => NumberPrecondition::Unchanged(None),
            NumberSource::Reuse(existing) => NumberPrecondition::Unchanged(Some(existing.clone())),
            NumberSource::Explicit(_) => NumberPrecondition::Overwrite,
        }
    }
}

struct StageTracker {
    claim_id: Uuid,
    stage: PipelineStage,
}

impl StageTracker {
    fn new(claim_id: Uuid) -> Self {
        Self {
            claim_id,
            stage: PipelineStage::Start,
        }
    }

    fn advance(&mut self, next: PipelineStage) {
        log::debug!("Claim {}: {} -> {}", self.claim_id, self.stage, next);
        self.stage = next;
    }
}

struct RenderedDocument {
    kind: TemplateKind,
    source_path: String,
    bytes: Vec<u8>,
}

impl CertificatePipeline {
    pub fn new(components: PipelineComponents) -> Self {
        let renderer = TemplateRenderer::new(components.converter.escaping());
        Self {
            claims: components.claims,
            store: components.store,
            allocator: components.allocator,
            curriculum: components.curriculum,
            templates: components.templates,
            renderer,
            converter: components.converter,
            storage: components.storage,
        }
    }

    /// Wire a pipeline to Postgres, the local artifact directory and the
    /// configured converter.
    pub fn from_database(db: Database, config: &PipelineConfig) -> Self {
        let db = Arc::new(db);
        Self::new(PipelineComponents {
            claims: db.clone(),
            store: db.clone(),
            allocator: SequenceAllocator::new(db.clone(), config.registration_format.clone()),
            curriculum: db.curriculum_aggregator(),
            templates: TemplateStore::new(
                db.clone(),
                config.template_dir.clone(),
                config.template_cache_ttl,
            ),
            converter: Arc::new(config.build_converter()),
            storage: Arc::new(LocalArtifactStorage::new(
                config.artifact_dir.clone(),
                config.artifact_base_url.clone(),
            )),
        })
    }

    /// First generation for a claim, or a retry of it.
    ///
    /// Without `explicit_number`, a number already stored for the claim is
    /// reused and a new one is allocated only when none exists.
    pub async fn generate(
        &self,
        claim_id: Uuid,
        explicit_number: Option<&str>,
    ) -> Result<GenerationOutcome, PipelineError> {
        log::info!("Generating certificate for claim {}", claim_id);
        let ctx = self
            .claims
            .load_claim(claim_id)
            .await?
            .ok_or(PipelineError::ClaimNotFound(claim_id))?;

        let number = match explicit_number {
            Some(explicit) => match self.allocator.accept(explicit) {
                Ok(number) => NumberSource::Explicit(number),
                Err(e) => return Err(self.fail(&ctx, PipelineStage::Start, e.into()).await),
            },
            None => match self.store.find_by_claim(claim_id).await {
                Ok(existing) => {
                    NumberSource::from_stored(existing.and_then(|c| c.registration_number))
                }
                Err(e) => return Err(self.fail(&ctx, PipelineStage::Start, e.into()).await),
            },
        };

        self.run(&ctx, number, None).await
    }

    /// Operator correction: set `number` on an existing certificate and
    /// regenerate both documents with it.
    pub async fn add_registration_number(
        &self,
        claim_id: Uuid,
        number: &str,
        actor: &str,
    ) -> Result<GenerationOutcome, PipelineError> {
        log::info!(
            "Adding registration number {} to claim {} (by {})",
            number,
            claim_id,
            actor
        );
        self.store
            .find_by_claim(claim_id)
            .await?
            .ok_or(PipelineError::CertificateNotFound(claim_id))?;
        let ctx = self
            .claims
            .load_claim(claim_id)
            .await?
            .ok_or(PipelineError::ClaimNotFound(claim_id))?;

        let number = match self.allocator.accept(number) {
            Ok(number) => number,
            Err(e) => return Err(self.fail(&ctx, PipelineStage::Start, e.into()).await),
        };
        let stamp = RegistrationStamp {
            at: Utc::now(),
            by: actor.to_string(),
        };

        self.run(&ctx, NumberSource::Explicit(number), Some(stamp))
            .await
    }

    /// Generation log of the certificate for a claim.
    pub async fn history(&self, claim_id: Uuid) -> Result<Vec<GenerationLogEntry>, PipelineError> {
        let certificate = self
            .store
            .find_by_claim(claim_id)
            .await?
            .ok_or(PipelineError::CertificateNotFound(claim_id))?;
        Ok(self.store.history(certificate.id).await?)
    }

    async fn run(
        &self,
        ctx: &ClaimContext,
        number: NumberSource,
        stamp: Option<RegistrationStamp>,
    ) -> Result<GenerationOutcome, PipelineError> {
        let mut number = number;
        let mut attempt = 1;
        loop {
            let mut tracker = StageTracker::new(ctx.claim.id);
            match self.execute(ctx, number, stamp.clone(), &mut tracker).await {
                Ok(outcome) => {
                    tracker.advance(PipelineStage::Done);
                    log::info!(
                        "Certificate for claim {} ready with registration number {}",
                        ctx.claim.id,
                        outcome
                            .certificate
                            .registration_number
                            .as_deref()
                            .unwrap_or("-")
                    );
                    return Ok(outcome);
                }
                Err(PipelineError::Persistence(PersistenceError::NumberChanged {
                    stored, ..
                })) if attempt < MAX_NUMBER_ATTEMPTS => {
                    log::warn!(
                        "Registration number of claim {} changed to {} during generation, rendering again",
                        ctx.claim.id,
                        stored.as_deref().unwrap_or("-")
                    );
                    number = NumberSource::from_stored(stored);
                    attempt += 1;
                }
                Err(e) => return Err(self.fail(ctx, tracker.stage, e).await),
            }
        }
    }

    async fn execute(
        &self,
        ctx: &ClaimContext,
        number: NumberSource,
        stamp: Option<RegistrationStamp>,
        tracker: &mut StageTracker,
    ) -> Result<GenerationOutcome, PipelineError> {
        let claim = &ctx.claim;

        let units = self
            .curriculum
            .resolve_units(claim.course_id, claim.course_category)
            .await;
        tracker.advance(PipelineStage::UnitsResolved);

        let certificate_template = self
            .templates
            .load(TemplateKind::Certificate, claim.course_category)
            .await?;
        let transcript_template = self
            .templates
            .load(TemplateKind::Transcript, claim.course_category)
            .await?;
        tracker.advance(PipelineStage::TemplatesLoaded);

        let number_precondition = number.precondition();
        let registration_number = match number {
            NumberSource::Allocate => self.allocator.allocate().await?.into_inner(),
            NumberSource::Reuse(existing) => existing,
            NumberSource::Explicit(explicit) => explicit.into_inner(),
        };
        tracker.advance(PipelineStage::NumberAllocated);

        let issued_on = Utc::now().date_naive();
        let certificate_fields = fields::certificate_fields(ctx, &registration_number, issued_on);
        let transcript_fields = fields::transcript_fields(ctx, &registration_number, &units);

        let timestamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let token = sanitize_filename(&registration_number, &timestamp);
        let certificate = self
            .render_and_store(
                claim.id,
                TemplateKind::Certificate,
                &certificate_template.bytes,
                &certificate_fields,
                &token,
            )
            .await?;
        let transcript = self
            .render_and_store(
                claim.id,
                TemplateKind::Transcript,
                &transcript_template.bytes,
                &transcript_fields,
                &token,
            )
            .await?;
        self.store
            .mark_pending(&PendingRecord {
                claim_id: claim.id,
                student_id: claim.student_id,
                course_id: claim.course_id,
                course_category: claim.course_category,
            })
            .await?;
        tracker.advance(PipelineStage::Rendered);

        let mut conversion_failures = Vec::new();
        let certificate_url = self
            .convert_and_store(claim.id, &certificate, &token, &mut conversion_failures)
            .await;
        let transcript_url = self
            .convert_and_store(claim.id, &transcript, &token, &mut conversion_failures)
            .await;
        tracker.advance(PipelineStage::Converted);

        let snapshot = json!({
            "certificate": certificate_fields,
            "transcript": transcript_fields,
            "templates": {
                "certificate": certificate_template.template.name,
                "transcript": transcript_template.template.name,
            },
            "unit_count": units.len(),
        });

        let mut log_entries = vec![LogDraft::new(
            LogAction::Generated,
            json!({
                "registration_number": registration_number,
                "certificate_source_path": certificate.source_path,
                "transcript_source_path": transcript.source_path,
                "unit_count": units.len(),
            }),
        )];
        if certificate_url.is_some() || transcript_url.is_some() {
            log_entries.push(LogDraft::new(
                LogAction::PdfCreated,
                json!({
                    "certificate_distribution_url": certificate_url,
                    "transcript_distribution_url": transcript_url,
                }),
            ));
        }
        if let Some(stamp) = &stamp {
            log_entries.push(LogDraft::new(
                LogAction::RegistrationAdded,
                json!({
                    "registration_number": registration_number,
                    "added_by": stamp.by,
                    "added_at": stamp.at,
                }),
            ));
        }

        let record = CertificateUpsert {
            claim_id: claim.id,
            student_id: claim.student_id,
            course_id: claim.course_id,
            course_category: claim.course_category,
            certificate_source_path: certificate.source_path,
            transcript_source_path: transcript.source_path,
            certificate_distribution_url: certificate_url,
            transcript_distribution_url: transcript_url,
            registration_number,
            number_precondition,
            registration_added: stamp,
            generated_field_snapshot: snapshot,
        };
        let stored = self.store.upsert(&record, &log_entries).await?;
        tracker.advance(PipelineStage::Persisted);

        Ok(GenerationOutcome {
            certificate: stored,
            unit_count: units.len(),
            conversion_failures,
        })
    }

    async fn render_and_store(
        &self,
        claim_id: Uuid,
        kind: TemplateKind,
        template: &[u8],
        field_map: &FieldMap,
        token: &str,
    ) -> Result<RenderedDocument, PipelineError> {
        let bytes = self
            .renderer
            .render(template, field_map)
            .map_err(|source| PipelineError::TemplateRender { kind, source })?;

        let source_path = artifact_path(
            RENDERED_AREA,
            kind,
            claim_id,
            token,
            self.converter.source_extension(),
        );
        self.storage
            .upload_file(&source_path, &bytes)
            .await
            .map_err(|reason| PipelineError::Storage {
                path: source_path.clone(),
                reason,
            })?;

        Ok(RenderedDocument {
            kind,
            source_path,
            bytes,
        })
    }

    /// Best effort: failures are logged and reported, never returned.
    async fn convert_and_store(
        &self,
        claim_id: Uuid,
        document: &RenderedDocument,
        token: &str,
        failures: &mut Vec<(TemplateKind, String)>,
    ) -> Option<String> {
        let converted = match self.converter.convert(&document.bytes).await {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!(
                    "Conversion of {} for claim {} failed, keeping rendered document only: {}",
                    document.kind,
                    claim_id,
                    e
                );
                failures.push((document.kind, e.to_string()));
                return None;
            }
        };

        let path = artifact_path(
            DISTRIBUTION_AREA,
            document.kind,
            claim_id,
            token,
            self.converter.output_extension(),
        );
        if let Err(reason) = self.storage.upload_file(&path, &converted).await {
            log::warn!(
                "Storing converted {} for claim {} failed: {}",
                document.kind,
                claim_id,
                reason
            );
            failures.push((document.kind, reason));
            return None;
        }

        Some(self.storage.get_public_url(&path))
    }

    /// Record a fatal error on the claim's row and hand the error back.
    async fn fail(
        &self,
        ctx: &ClaimContext,
        stage: PipelineStage,
        error: PipelineError,
    ) -> PipelineError {
        log::error!(
            "Certificate generation for claim {} failed at {}: {}",
            ctx.claim.id,
            stage,
            error
        );

        let record = FailureRecord {
            claim_id: ctx.claim.id,
            student_id: ctx.claim.student_id,
            course_id: ctx.claim.course_id,
            course_category: ctx.claim.course_category,
            error_message: error.to_string(),
        };
        if let Err(e) = self.store.record_failure(&record).await {
            log::error!("Could not record failure for claim {}: {}", ctx.claim.id, e);
        }

        log::debug!(
            "Claim {}: {} -> {}",
            ctx.claim.id,
            stage,
            PipelineStage::Failed
        );
        error
    }
}

fn artifact_path(
    area: &str,
    kind: TemplateKind,
    claim_id: Uuid,
    token: &str,
    extension: &str,
) -> String {
    format!("{}/{}-{}-{}.{}", area, kind, claim_id, token, extension)
}
