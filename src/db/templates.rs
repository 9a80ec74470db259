//! Active template lookup.

use async_trait::async_trait;
use uuid::Uuid;

use super::Database;
use crate::models::{CertificateTemplate, CourseCategory, TemplateKind};
use crate::templates::TemplateRepository;

#[derive(sqlx::FromRow)]
struct TemplateRow {
    id: Uuid,
    name: String,
    kind: String,
    course_category: String,
    path: String,
    is_active: bool,
}

impl TryFrom<TemplateRow> for CertificateTemplate {
    type Error = String;

    fn try_from(row: TemplateRow) -> Result<Self, Self::Error> {
        Ok(CertificateTemplate {
            id: row.id,
            name: row.name,
            kind: row.kind.parse().map_err(|e| format!("{}", e))?,
            course_category: row.course_category.parse().map_err(|e| format!("{}", e))?,
            path: row.path,
            is_active: row.is_active,
        })
    }
}

#[async_trait]
impl TemplateRepository for Database {
    async fn find_active(
        &self,
        kind: TemplateKind,
        category: CourseCategory,
    ) -> Result<Option<CertificateTemplate>, String> {
        let row = sqlx::query_as::<_, TemplateRow>(
            r#"
            SELECT id, name, kind, course_category, path, is_active
            FROM certificate_templates
            WHERE kind = $1 AND course_category = $2 AND is_active
            "#,
        )
        .bind(kind.as_str())
        .bind(category.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        row.map(CertificateTemplate::try_from).transpose()
    }
}
