//! Claim lookups.
//!
//! Claims, courses and students belong to the surrounding application; this
//! module only reads them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::Database;
use crate::models::{ClaimContext, CompletionClaim, CourseRecord, StudentRecord};
use crate::store::{ClaimRepository, PersistenceError};

#[derive(sqlx::FromRow)]
struct ClaimRow {
    id: Uuid,
    student_id: Uuid,
    course_id: Uuid,
    course_category: String,
    student_name: Option<String>,
    certificate_name: Option<String>,
    selected_course_name: Option<String>,
    completed_at: Option<DateTime<Utc>>,
    claimed_at: DateTime<Utc>,
    course_title: String,
    course_level: Option<String>,
    student_full_name: String,
}

impl TryFrom<ClaimRow> for ClaimContext {
    type Error = PersistenceError;

    fn try_from(row: ClaimRow) -> Result<Self, Self::Error> {
        let course_category = row
            .course_category
            .parse()
            .map_err(|e| PersistenceError::InvalidRow(format!("claim {}: {}", row.id, e)))?;

        Ok(ClaimContext {
            claim: CompletionClaim {
                id: row.id,
                student_id: row.student_id,
                course_id: row.course_id,
                course_category,
                student_name: row.student_name,
                certificate_name: row.certificate_name,
                selected_course_name: row.selected_course_name,
                completed_at: row.completed_at,
                claimed_at: row.claimed_at,
            },
            course: CourseRecord {
                id: row.course_id,
                title: row.course_title,
                level: row.course_level,
            },
            student: StudentRecord {
                id: row.student_id,
                full_name: row.student_full_name,
            },
        })
    }
}

#[async_trait]
impl ClaimRepository for Database {
    async fn load_claim(&self, claim_id: Uuid) -> Result<Option<ClaimContext>, PersistenceError> {
        let row = sqlx::query_as::<_, ClaimRow>(
            r#"
            SELECT c.id, c.student_id, c.course_id, c.course_category,
                   c.student_name, c.certificate_name, c.selected_course_name,
                   c.completed_at, c.claimed_at,
                   co.title AS course_title, co.level AS course_level,
                   s.full_name AS student_full_name
            FROM certificate_claims c
            JOIN courses co ON co.id = c.course_id
            JOIN students s ON s.id = c.student_id
            WHERE c.id = $1
            "#,
        )
        .bind(claim_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ClaimContext::try_from).transpose()
    }
}
