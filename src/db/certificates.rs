//! Generated certificate persistence and the generation log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use super::Database;
use crate::models::{
    CertificateUpsert, FailureRecord, GeneratedCertificate, GenerationLogEntry, GenerationStatus,
    LogAction, LogDraft, NumberPrecondition, PendingRecord,
};
use crate::store::{CertificateStore, PersistenceError};

const CERTIFICATE_COLUMNS: &str = "id, claim_id, student_id, course_id, course_category, \
     certificate_source_path, transcript_source_path, certificate_distribution_url, \
     transcript_distribution_url, registration_number, registration_added_at, \
     registration_added_by, status, error_message, generated_field_snapshot, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct CertificateRow {
    id: Uuid,
    claim_id: Uuid,
    student_id: Uuid,
    course_id: Uuid,
    course_category: String,
    certificate_source_path: Option<String>,
    transcript_source_path: Option<String>,
    certificate_distribution_url: Option<String>,
    transcript_distribution_url: Option<String>,
    registration_number: Option<String>,
    registration_added_at: Option<DateTime<Utc>>,
    registration_added_by: Option<String>,
    status: String,
    error_message: Option<String>,
    generated_field_snapshot: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<CertificateRow> for GeneratedCertificate {
    type Error = PersistenceError;

    fn try_from(row: CertificateRow) -> Result<Self, Self::Error> {
        let invalid = |e: crate::models::ParseEnumError| {
            PersistenceError::InvalidRow(format!("generated certificate {}: {}", row.id, e))
        };
        let course_category = row.course_category.parse().map_err(invalid)?;
        let status: GenerationStatus = row.status.parse().map_err(invalid)?;

        Ok(GeneratedCertificate {
            id: row.id,
            claim_id: row.claim_id,
            student_id: row.student_id,
            course_id: row.course_id,
            course_category,
            certificate_source_path: row.certificate_source_path,
            transcript_source_path: row.transcript_source_path,
            certificate_distribution_url: row.certificate_distribution_url,
            transcript_distribution_url: row.transcript_distribution_url,
            registration_number: row.registration_number,
            registration_added_at: row.registration_added_at,
            registration_added_by: row.registration_added_by,
            status,
            error_message: row.error_message,
            generated_field_snapshot: row.generated_field_snapshot,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LogRow {
    id: Uuid,
    generated_certificate_id: Uuid,
    action: String,
    detail: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<LogRow> for GenerationLogEntry {
    type Error = PersistenceError;

    fn try_from(row: LogRow) -> Result<Self, Self::Error> {
        let action: LogAction = row
            .action
            .parse()
            .map_err(|e| PersistenceError::InvalidRow(format!("log entry {}: {}", row.id, e)))?;
        Ok(GenerationLogEntry {
            id: row.id,
            generated_certificate_id: row.generated_certificate_id,
            action,
            detail: row.detail,
            created_at: row.created_at,
        })
    }
}

async fn append_log(
    tx: &mut Transaction<'_, Postgres>,
    generated_certificate_id: Uuid,
    entry: &LogDraft,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO generation_log (id, generated_certificate_id, action, detail, created_at)
        VALUES ($1, $2, $3, $4, NOW())
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(generated_certificate_id)
    .bind(entry.action.as_str())
    .bind(&entry.detail)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl CertificateStore for Database {
    async fn find_by_claim(
        &self,
        claim_id: Uuid,
    ) -> Result<Option<GeneratedCertificate>, PersistenceError> {
        let sql = format!(
            "SELECT {} FROM generated_certificates WHERE claim_id = $1",
            CERTIFICATE_COLUMNS
        );
        let row = sqlx::query_as::<_, CertificateRow>(&sql)
            .bind(claim_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(GeneratedCertificate::try_from).transpose()
    }

    async fn mark_pending(&self, record: &PendingRecord) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            INSERT INTO generated_certificates (
                id, claim_id, student_id, course_id, course_category,
                status, generated_field_snapshot, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, 'pending', '{}'::JSONB, NOW(), NOW())
            ON CONFLICT (claim_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(record.claim_id)
        .bind(record.student_id)
        .bind(record.course_id)
        .bind(record.course_category.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert(
        &self,
        record: &CertificateUpsert,
        log: &[LogDraft],
    ) -> Result<GeneratedCertificate, PersistenceError> {
        let (added_at, added_by) = match &record.registration_added {
            Some(stamp) => (Some(stamp.at), Some(stamp.by.as_str())),
            None => (None, None),
        };
        let (overwrite, expected_number) = match &record.number_precondition {
            NumberPrecondition::Overwrite => (true, None),
            NumberPrecondition::Unchanged(expected) => (false, expected.as_deref()),
        };

        let sql = format!(
            r#"
            INSERT INTO generated_certificates (
                id, claim_id, student_id, course_id, course_category,
                certificate_source_path, transcript_source_path,
                certificate_distribution_url, transcript_distribution_url,
                registration_number, registration_added_at, registration_added_by,
                status, error_message, generated_field_snapshot, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, 'ready', NULL, $13, NOW(), NOW())
            ON CONFLICT (claim_id) DO UPDATE SET
                student_id = EXCLUDED.student_id,
                course_id = EXCLUDED.course_id,
                course_category = EXCLUDED.course_category,
                certificate_source_path = EXCLUDED.certificate_source_path,
                transcript_source_path = EXCLUDED.transcript_source_path,
                certificate_distribution_url = EXCLUDED.certificate_distribution_url,
                transcript_distribution_url = EXCLUDED.transcript_distribution_url,
                registration_number = EXCLUDED.registration_number,
                registration_added_at = COALESCE(EXCLUDED.registration_added_at, generated_certificates.registration_added_at),
                registration_added_by = COALESCE(EXCLUDED.registration_added_by, generated_certificates.registration_added_by),
                status = 'ready',
                error_message = NULL,
                generated_field_snapshot = EXCLUDED.generated_field_snapshot,
                updated_at = NOW()
            WHERE $14 OR generated_certificates.registration_number IS NOT DISTINCT FROM $15
            RETURNING {}
            "#,
            CERTIFICATE_COLUMNS
        );

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, CertificateRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(record.claim_id)
            .bind(record.student_id)
            .bind(record.course_id)
            .bind(record.course_category.as_str())
            .bind(&record.certificate_source_path)
            .bind(&record.transcript_source_path)
            .bind(record.certificate_distribution_url.as_deref())
            .bind(record.transcript_distribution_url.as_deref())
            .bind(&record.registration_number)
            .bind(added_at)
            .bind(added_by)
            .bind(&record.generated_field_snapshot)
            .bind(overwrite)
            .bind(expected_number)
            .fetch_optional(&mut *tx)
            .await?;

        // No row back means the conflicting row failed the number guard.
        let Some(row) = row else {
            let stored: Option<String> = sqlx::query_scalar(
                "SELECT registration_number FROM generated_certificates WHERE claim_id = $1",
            )
            .bind(record.claim_id)
            .fetch_one(&mut *tx)
            .await?;
            tx.rollback().await?;
            return Err(PersistenceError::NumberChanged {
                claim_id: record.claim_id,
                stored,
            });
        };

        for entry in log {
            append_log(&mut tx, row.id, entry).await?;
        }
        tx.commit().await?;

        GeneratedCertificate::try_from(row)
    }

    async fn record_failure(
        &self,
        record: &FailureRecord,
    ) -> Result<GeneratedCertificate, PersistenceError> {
        let sql = format!(
            r#"
            INSERT INTO generated_certificates (
                id, claim_id, student_id, course_id, course_category,
                status, error_message, generated_field_snapshot, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, 'failed', $6, '{{}}'::JSONB, NOW(), NOW())
            ON CONFLICT (claim_id) DO UPDATE SET
                status = 'failed',
                error_message = EXCLUDED.error_message,
                updated_at = NOW()
            RETURNING {}
            "#,
            CERTIFICATE_COLUMNS
        );

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, CertificateRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(record.claim_id)
            .bind(record.student_id)
            .bind(record.course_id)
            .bind(record.course_category.as_str())
            .bind(&record.error_message)
            .fetch_one(&mut *tx)
            .await?;

        let entry = LogDraft::new(
            LogAction::Failed,
            serde_json::json!({ "error": record.error_message }),
        );
        append_log(&mut tx, row.id, &entry).await?;
        tx.commit().await?;

        GeneratedCertificate::try_from(row)
    }

    async fn history(
        &self,
        generated_certificate_id: Uuid,
    ) -> Result<Vec<GenerationLogEntry>, PersistenceError> {
        let rows = sqlx::query_as::<_, LogRow>(
            r#"
            SELECT id, generated_certificate_id, action, detail, created_at
            FROM generation_log
            WHERE generated_certificate_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(generated_certificate_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(GenerationLogEntry::try_from).collect()
    }
}
