//! Curriculum aggregation across inconsistently populated unit sources.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::{CourseCategory, CourseUnit};

/// One place a course's units may be stored.
#[async_trait]
pub trait UnitSource: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Fetch units for a course. An empty vector means "nothing here".
    async fn fetch_units(&self, course_id: Uuid) -> Result<Vec<CourseUnit>, String>;
}

/// Resolves the ordered unit list for a course by trying each source
/// registered for its category in priority order.
#[derive(Default, Clone)]
pub struct CurriculumAggregator {
    sources: HashMap<CourseCategory, Vec<Arc<dyn UnitSource>>>,
}

impl CurriculumAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `source` after any existing sources for `category`.
    pub fn register(mut self, category: CourseCategory, source: Arc<dyn UnitSource>) -> Self {
        self.sources.entry(category).or_default().push(source);
        self
    }

    pub async fn resolve_units(&self, course_id: Uuid, category: CourseCategory) -> Vec<CourseUnit> {
        let sources = self.sources.get(&category).map(Vec::as_slice).unwrap_or(&[]);

        for source in sources {
            match source.fetch_units(course_id).await {
                Ok(units) if !units.is_empty() => {
                    log::debug!(
                        "Resolved {} units for course {} from {}",
                        units.len(),
                        course_id,
                        source.name()
                    );
                    return normalize(units, source.name());
                }
                Ok(_) => {
                    log::debug!("Unit source {} empty for course {}", source.name(), course_id);
                }
                Err(e) => {
                    log::warn!(
                        "Unit source {} failed for course {}: {}",
                        source.name(),
                        course_id,
                        e
                    );
                }
            }
        }

        log::info!(
            "No units found for course {} ({}), using fallback unit",
            course_id,
            category
        );
        vec![CourseUnit::fallback()]
    }
}

/// Order by ordinal and drop duplicate ordinals, keeping the first seen.
fn normalize(mut units: Vec<CourseUnit>, source: &str) -> Vec<CourseUnit> {
    units.sort_by_key(|u| u.ordinal);
    let before = units.len();
    units.dedup_by_key(|u| u.ordinal);
    if units.len() != before {
        log::warn!(
            "Dropped {} duplicate unit ordinals from {}",
            before - units.len(),
            source
        );
    }
    units
}
