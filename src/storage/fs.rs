use async_trait::async_trait;
use std::path::PathBuf;

use super::{validate_reference, ObjectStore};
use crate::error::{GenieError, Result};

/// Documents stored under a local directory
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn fetch_bytes(&self, reference: &str) -> Result<Vec<u8>> {
        let relative = validate_reference(reference)?;
        let path = self.root.join(relative);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| GenieError::Storage(format!("Failed to read {}: {}", relative, e)))?;
        log::debug!("Fetched {} bytes from {}", bytes.len(), path.display());
        Ok(bytes)
    }
}
