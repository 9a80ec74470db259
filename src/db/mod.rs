//! Postgres-backed implementations of the pipeline's repositories.
//!
//! This module is split into submodules for better separation of concerns:
//! - `claims` - claim, course and student lookups
//! - `templates` - active template lookup
//! - `certificates` - generated certificate upserts and generation log
//! - `sequence` - registration number sequence
//! - `curriculum` - unit sources over the curriculum tables

mod certificates;
mod claims;
mod curriculum;
mod sequence;
mod templates;

pub use curriculum::SqlUnitSource;

use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

use crate::curriculum::CurriculumAggregator;
use crate::models::CourseCategory;

#[derive(Clone)]
pub struct Database {
    pub pool: PgPool,
}

impl Database {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(900))
            .max_lifetime(Duration::from_secs(1800))
            .connect(database_url)
            .await?;

        log::info!("Connected to database (max {} connections)", max_connections);
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        log::info!("Database migrations applied");
        Ok(())
    }

    /// Unit sources in priority order for each course category. The legacy
    /// generic table is the last resort for both.
    pub fn curriculum_aggregator(&self) -> CurriculumAggregator {
        let legacy = Arc::new(SqlUnitSource::legacy_units(self.pool.clone()));
        CurriculumAggregator::new()
            .register(
                CourseCategory::Cpd,
                Arc::new(SqlUnitSource::cpd_topics(self.pool.clone())),
            )
            .register(CourseCategory::Cpd, legacy.clone())
            .register(
                CourseCategory::Qualification,
                Arc::new(SqlUnitSource::qualification_units(self.pool.clone())),
            )
            .register(CourseCategory::Qualification, legacy)
    }
}
