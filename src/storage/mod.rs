//! Object store access for uploaded documents referenced by path.

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::{GenieError, Result};

pub mod fs;
pub mod http;

pub use fs::FsObjectStore;
pub use http::HttpObjectStore;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Raw bytes of the object at `reference`
    async fn fetch_bytes(&self, reference: &str) -> Result<Vec<u8>>;
}

/// Reject empty references and anything that could escape the store root
pub(crate) fn validate_reference(reference: &str) -> Result<&str> {
    let trimmed = reference.trim().trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(GenieError::Storage("Empty storage reference".to_string()));
    }
    if trimmed.split(['/', '\\']).any(|part| part == "..") {
        return Err(GenieError::Storage(format!("Invalid storage reference: {}", reference)));
    }
    Ok(trimmed)
}

/// Build the configured backend
pub fn from_config(config: &StorageConfig) -> Result<Arc<dyn ObjectStore>> {
    match config.backend {
        StorageBackend::Fs => {
            let root = config
                .root
                .clone()
                .ok_or_else(|| GenieError::Config("storage.root is required for the fs backend".to_string()))?;
            Ok(Arc::new(FsObjectStore::new(root)))
        }
        StorageBackend::Http => {
            let base_url = config
                .base_url
                .clone()
                .ok_or_else(|| GenieError::Config("storage.base_url is required for the http backend".to_string()))?;
            let api_key = match &config.api_key_env {
                Some(name) => Some(crate::config::api_key(name)?),
                None => None,
            };
            Ok(Arc::new(HttpObjectStore::new(base_url, api_key, config.timeout_secs)?))
        }
    }
}
