//! Curriculum tables as unit sources.

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::curriculum::UnitSource;
use crate::models::CourseUnit;

/// A unit source defined by a query returning `ordinal`, `title` and
/// `credits` (nullable) for the course bound to `$1`.
pub struct SqlUnitSource {
    name: String,
    query: String,
    pool: PgPool,
}

impl SqlUnitSource {
    pub fn new(name: impl Into<String>, query: impl Into<String>, pool: PgPool) -> Self {
        Self {
            name: name.into(),
            query: query.into(),
            pool,
        }
    }

    /// Generic units table shared by older courses of every category.
    pub fn legacy_units(pool: PgPool) -> Self {
        Self::new(
            "course_units",
            "SELECT unit_number AS ordinal, title, credits FROM course_units WHERE course_id = $1 ORDER BY unit_number",
            pool,
        )
    }

    /// CPD topics; this table has no credit column.
    pub fn cpd_topics(pool: PgPool) -> Self {
        Self::new(
            "cpd_course_topics",
            "SELECT topic_order AS ordinal, topic_title AS title, NULL::INT4 AS credits FROM cpd_course_topics WHERE course_id = $1 ORDER BY topic_order",
            pool,
        )
    }

    pub fn qualification_units(pool: PgPool) -> Self {
        Self::new(
            "qualification_units",
            "SELECT unit_no AS ordinal, unit_title AS title, credit_value AS credits FROM qualification_units WHERE course_id = $1 ORDER BY unit_no",
            pool,
        )
    }
}

#[derive(sqlx::FromRow)]
struct UnitRow {
    ordinal: i32,
    title: String,
    credits: Option<i32>,
}

#[async_trait]
impl UnitSource for SqlUnitSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_units(&self, course_id: Uuid) -> Result<Vec<CourseUnit>, String> {
        let rows = sqlx::query_as::<_, UnitRow>(&self.query)
            .bind(course_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| e.to_string())?;

        let mut units = Vec::with_capacity(rows.len());
        for row in rows {
            let Ok(ordinal) = u32::try_from(row.ordinal) else {
                log::warn!(
                    "Skipping unit '{}' with negative ordinal {} in {}",
                    row.title,
                    row.ordinal,
                    self.name
                );
                continue;
            };
            let credits = row.credits.and_then(|c| u32::try_from(c).ok());
            units.push(CourseUnit::new(ordinal, row.title, credits));
        }
        Ok(units)
    }
}
