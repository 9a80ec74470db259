//! Repository seams for claims and generated certificates.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    CertificateUpsert, ClaimContext, FailureRecord, GeneratedCertificate, GenerationLogEntry,
    LogDraft, PendingRecord,
};

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stored row is invalid: {0}")]
    InvalidRow(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("registration number of claim {claim_id} changed to {stored:?} during the run")]
    NumberChanged {
        claim_id: Uuid,
        stored: Option<String>,
    },
}

/// Read access to claims and the course/student records they point at.
#[async_trait]
pub trait ClaimRepository: Send + Sync {
    async fn load_claim(&self, claim_id: Uuid) -> Result<Option<ClaimContext>, PersistenceError>;
}

/// Idempotent persistence of pipeline output plus the append-only log.
#[async_trait]
pub trait CertificateStore: Send + Sync {
    async fn find_by_claim(
        &self,
        claim_id: Uuid,
    ) -> Result<Option<GeneratedCertificate>, PersistenceError>;

    /// Insert a `pending` row for the claim unless one already exists.
    async fn mark_pending(&self, record: &PendingRecord) -> Result<(), PersistenceError>;

    /// Insert or update the row for `record.claim_id` and append `log`
    /// entries, atomically. Status becomes `ready` and any error is cleared.
    /// Fails with `NumberChanged`, writing nothing, when the stored number
    /// does not satisfy `record.number_precondition`.
    async fn upsert(
        &self,
        record: &CertificateUpsert,
        log: &[LogDraft],
    ) -> Result<GeneratedCertificate, PersistenceError>;

    /// Insert or update the row for `record.claim_id` with status `failed`,
    /// keeping any stored paths and number, and append a `failed` entry.
    async fn record_failure(
        &self,
        record: &FailureRecord,
    ) -> Result<GeneratedCertificate, PersistenceError>;

    /// Log entries for a certificate, oldest first.
    async fn history(
        &self,
        generated_certificate_id: Uuid,
    ) -> Result<Vec<GenerationLogEntry>, PersistenceError>;
}
