//! Boot image registry.
//!
//! The manager materializes a boot image for every created instance at
//! `<root>/instances/<id>/image`. Where the bytes come from is behind
//! [`ImageRegistry`]; the local implementation resolves image ids inside
//! a base directory and copies.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Source of boot images.
#[async_trait]
pub trait ImageRegistry: Send + Sync {
    /// Materialize the image identified by `image_id` at `target`.
    async fn download(&self, image_id: &str, target: &Path) -> Result<()>;
}

/// Registry backed by a local directory of images, keyed by file name.
#[derive(Debug, Clone)]
pub struct LocalImageRegistry {
    base_dir: PathBuf,
}

impl LocalImageRegistry {
    /// Create a registry over `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }
}

#[async_trait]
impl ImageRegistry for LocalImageRegistry {
    async fn download(&self, image_id: &str, target: &Path) -> Result<()> {
        // Image ids are plain names; refuse anything that would escape
        // the base directory.
        if image_id.is_empty() || image_id.contains(['/', '\\']) || image_id.contains("..") {
            return Err(Error::image(
                "resolve",
                format!("invalid image id: {}", image_id),
            ));
        }

        let source = self.base_dir.join(image_id);
        if !source.is_file() {
            return Err(Error::image(
                "resolve",
                format!("image not found: {}", source.display()),
            ));
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&source, target).await.map_err(|e| {
            Error::image(
                "download",
                format!("copy {} -> {}: {}", source.display(), target.display(), e),
            )
        })?;

        tracing::debug!(image = %image_id, target = %target.display(), "image downloaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_download_copies_image() {
        let base = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        std::fs::write(base.path().join("alpine.img"), b"bootable").unwrap();

        let registry = LocalImageRegistry::new(base.path());
        let target = out.path().join("instances/vm1/image");
        registry.download("alpine.img", &target).await.unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"bootable");
    }

    #[tokio::test]
    async fn test_download_missing_image_fails() {
        let base = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();

        let registry = LocalImageRegistry::new(base.path());
        let err = registry
            .download("missing.img", &out.path().join("image"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Image { .. }));
    }

    #[tokio::test]
    async fn test_download_rejects_traversal() {
        let base = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();

        let registry = LocalImageRegistry::new(base.path());
        let err = registry
            .download("../etc/passwd", &out.path().join("image"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Image { .. }));
    }
}
