use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use super::{validate_reference, ObjectStore};
use crate::error::{GenieError, Result};

/// Documents served by a remote bucket gateway: `GET {base_url}/{reference}`
pub struct HttpObjectStore {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpObjectStore {
    pub fn new(base_url: String, api_key: Option<String>, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| GenieError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn fetch_bytes(&self, reference: &str) -> Result<Vec<u8>> {
        let relative = validate_reference(reference)?;
        let url = format!("{}/{}", self.base_url, relative);

        let mut request = self.client.get(&url);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| GenieError::Storage(format!("Network error fetching {}: {}", relative, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GenieError::Storage(format!(
                "Object store returned {} for {}",
                status, relative
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| GenieError::Storage(format!("Failed to read body of {}: {}", relative, e)))?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::spawn_stub;
    use axum::{extract::Path, http::HeaderMap, http::StatusCode, routing::get, Router};

    async fn serve_object(Path(key): Path<String>, headers: HeaderMap) -> (StatusCode, Vec<u8>) {
        let authorized = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            == Some("Bearer bucket-key");
        if !authorized {
            return (StatusCode::UNAUTHORIZED, Vec::new());
        }
        match key.as_str() {
            "acct-1/inv.png" => (StatusCode::OK, vec![0x89, b'P', b'N', b'G']),
            _ => (StatusCode::NOT_FOUND, Vec::new()),
        }
    }

    fn bucket() -> Router {
        Router::new().route("/objects/*key", get(serve_object))
    }

    #[tokio::test]
    async fn test_fetch_with_bearer_key() {
        let base = spawn_stub(bucket()).await;
        let store = HttpObjectStore::new(format!("{}/objects/", base), Some("bucket-key".to_string()), 5).unwrap();

        let bytes = store.fetch_bytes("acct-1/inv.png").await.unwrap();
        assert_eq!(bytes, vec![0x89, b'P', b'N', b'G']);
    }

    #[tokio::test]
    async fn test_non_success_status_is_storage_error() {
        let base = spawn_stub(bucket()).await;
        let store = HttpObjectStore::new(format!("{}/objects", base), Some("bucket-key".to_string()), 5).unwrap();
        let err = store.fetch_bytes("acct-1/missing.png").await.unwrap_err();
        assert!(matches!(err, GenieError::Storage(ref m) if m.contains("404")));

        let anonymous = HttpObjectStore::new(format!("{}/objects", base), None, 5).unwrap();
        assert!(anonymous.fetch_bytes("acct-1/inv.png").await.is_err());
    }
}
