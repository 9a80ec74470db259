//! Durable storage for generated documents.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};

/// Folder for rendered, editable documents.
pub const RENDERED_AREA: &str = "rendered";
/// Folder for converted distribution documents.
pub const DISTRIBUTION_AREA: &str = "distribution";

#[async_trait]
pub trait ArtifactStorage: Send + Sync {
    /// Store `file_data` under the relative `path`, replacing any existing file.
    async fn upload_file(&self, path: &str, file_data: &[u8]) -> Result<(), String>;

    /// Public URL under which a stored file is served.
    fn get_public_url(&self, path: &str) -> String;
}

/// Filesystem-backed storage rooted at a directory.
pub struct LocalArtifactStorage {
    root: PathBuf,
    base_url: String,
}

impl LocalArtifactStorage {
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into(),
        }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, String> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if path.is_empty() || escapes {
            return Err(format!("Invalid artifact path: {}", path));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ArtifactStorage for LocalArtifactStorage {
    async fn upload_file(&self, path: &str, file_data: &[u8]) -> Result<(), String> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("Failed to create folder {}: {}", parent.display(), e))?;
        }

        // Write beside the target and rename so readers never see a partial file.
        let staging = target.with_extension("part");
        tokio::fs::write(&staging, file_data)
            .await
            .map_err(|e| format!("Failed to write {}: {}", staging.display(), e))?;
        tokio::fs::rename(&staging, &target)
            .await
            .map_err(|e| format!("Failed to move {} into place: {}", target.display(), e))?;

        log::debug!("Stored artifact {} ({} bytes)", path, file_data.len());
        Ok(())
    }

    fn get_public_url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}
