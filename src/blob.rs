//! Blob storage for pipeline artifacts.
//!
//! Stages exchange file bytes through opaque keys. The only backend is a
//! directory tree rooted at `[blob] root`; keys are relative slash-separated
//! paths such as `staging/scan-1714557600000.pdf`.

use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Store `bytes` under `key`, replacing any previous content.
    /// Returns the key.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<String>;
}

pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        if key.is_empty()
            || rel
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("invalid blob key: '{}'", key);
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read blob {}", path.display()))
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<String> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write then rename so readers never see a partial artifact.
        let mut tmp = path.clone().into_os_string();
        tmp.push(".partial");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("Failed to write blob {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(key.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn put_then_get_nested_key() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(dir.path());
        let key = store.put("staging/a-1.pdf", b"%PDF").await.unwrap();
        assert_eq!(key, "staging/a-1.pdf");
        assert_eq!(store.get(&key).await.unwrap(), b"%PDF");
        assert!(!dir.path().join("staging/a-1.pdf.partial").exists());
    }

    #[tokio::test]
    async fn escaping_keys_are_rejected() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(dir.path());
        assert!(store.put("../outside", b"x").await.is_err());
        assert!(store.put("/abs/path", b"x").await.is_err());
        assert!(store.get("").await.is_err());
    }
}
