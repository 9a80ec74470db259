//! Lookup of the active template per (kind, course category).

use async_trait::async_trait;
use moka::future::Cache;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::models::{CertificateTemplate, CourseCategory, TemplateKind};

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("no active {kind} template for course category '{category}'")]
    NotActive {
        kind: TemplateKind,
        category: CourseCategory,
    },
    #[error("template lookup for {kind}/{category} failed: {reason}")]
    Lookup {
        kind: TemplateKind,
        category: CourseCategory,
        reason: String,
    },
    #[error("failed to read template {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait TemplateRepository: Send + Sync {
    /// The single active template for the key, if any.
    async fn find_active(
        &self,
        kind: TemplateKind,
        category: CourseCategory,
    ) -> Result<Option<CertificateTemplate>, String>;
}

/// An active template together with its file contents.
#[derive(Debug, Clone)]
pub struct LoadedTemplate {
    pub template: CertificateTemplate,
    pub path: PathBuf,
    pub bytes: Vec<u8>,
}

/// Resolves active templates and reads them from the template directory,
/// caching the result for a short time.
pub struct TemplateStore {
    repository: Arc<dyn TemplateRepository>,
    template_dir: PathBuf,
    cache: Cache<(TemplateKind, CourseCategory), Arc<LoadedTemplate>>,
}

impl TemplateStore {
    pub fn new(
        repository: Arc<dyn TemplateRepository>,
        template_dir: impl Into<PathBuf>,
        ttl: Duration,
    ) -> Self {
        let cache = Cache::builder().time_to_live(ttl).max_capacity(16).build();
        Self {
            repository,
            template_dir: template_dir.into(),
            cache,
        }
    }

    pub async fn load(
        &self,
        kind: TemplateKind,
        category: CourseCategory,
    ) -> Result<Arc<LoadedTemplate>, TemplateError> {
        let key = (kind, category);
        if let Some(cached) = self.cache.get(&key).await {
            log::debug!("Template cache hit for {}/{}", kind, category);
            return Ok(cached);
        }

        let template = self
            .repository
            .find_active(kind, category)
            .await
            .map_err(|reason| TemplateError::Lookup {
                kind,
                category,
                reason,
            })?
            .ok_or(TemplateError::NotActive { kind, category })?;

        let path = self.template_dir.join(&template.path);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|source| TemplateError::Io {
                path: path.display().to_string(),
                source,
            })?;

        log::info!(
            "Loaded {} template '{}' for {} from {}",
            kind,
            template.name,
            category,
            path.display()
        );

        let loaded = Arc::new(LoadedTemplate {
            template,
            path,
            bytes,
        });
        self.cache.insert(key, loaded.clone()).await;
        Ok(loaded)
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }
}
