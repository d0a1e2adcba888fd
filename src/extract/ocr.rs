use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use super::schema::SCHEMA_NAME;
use super::DocumentInput;
use crate::config::OcrConfig;
use crate::error::{GenieError, Result};

/// Structured-extraction OCR capability
///
/// Errors are always one of `OcrTransport`, `OcrStatus` or `OcrUnparsable`
/// so callers can tell a failed call from an unusable answer.
#[async_trait]
pub trait OcrClient: Send + Sync {
    /// Annotate `document` according to `schema`, returning a JSON object
    async fn annotate(&self, document: &DocumentInput, schema: &Value) -> Result<Value>;
}

#[derive(Serialize)]
struct OcrRequest<'a> {
    model: &'a str,
    document: OcrDocument,
    document_annotation_format: AnnotationFormat<'a>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OcrDocument {
    DocumentUrl { document_url: String },
    ImageUrl { image_url: String },
}

#[derive(Serialize)]
struct AnnotationFormat<'a> {
    #[serde(rename = "type")]
    format_type: &'static str,
    json_schema: NamedSchema<'a>,
}

#[derive(Serialize)]
struct NamedSchema<'a> {
    name: &'static str,
    schema: &'a Value,
    strict: bool,
}

#[derive(Deserialize)]
struct OcrResponse {
    #[serde(default)]
    document_annotation: Option<Value>,
}

/// Client for a Mistral-style `/v1/ocr` endpoint with document annotation
pub struct MistralOcrClient {
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl MistralOcrClient {
    pub fn new(base_url: &str, model: &str, api_key: String, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| GenieError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
        })
    }

    pub fn from_config(config: &OcrConfig) -> Result<Self> {
        let api_key = crate::config::api_key(&config.api_key_env)?;
        Self::new(&config.base_url, &config.model, api_key, config.timeout_secs)
    }
}

/// Annotation as a JSON object; the endpoint returns it either as a JSON
/// string or inline.
fn parse_annotation(body: &str) -> Result<Value> {
    let response: OcrResponse = serde_json::from_str(body)
        .map_err(|e| GenieError::OcrUnparsable(format!("Response is not JSON: {}", e)))?;

    let annotation = match response.document_annotation {
        Some(Value::String(text)) => serde_json::from_str::<Value>(&text)
            .map_err(|e| GenieError::OcrUnparsable(format!("Annotation is not JSON: {}", e)))?,
        Some(value) => value,
        None => return Err(GenieError::OcrUnparsable("No document annotation in response".to_string())),
    };

    if !annotation.is_object() {
        return Err(GenieError::OcrUnparsable("Annotation is not a JSON object".to_string()));
    }
    Ok(annotation)
}

#[async_trait]
impl OcrClient for MistralOcrClient {
    async fn annotate(&self, document: &DocumentInput, schema: &Value) -> Result<Value> {
        let payload = if document.is_pdf() {
            OcrDocument::DocumentUrl { document_url: document.data_url() }
        } else {
            OcrDocument::ImageUrl { image_url: document.data_url() }
        };
        let request = OcrRequest {
            model: &self.model,
            document: payload,
            document_annotation_format: AnnotationFormat {
                format_type: "json_schema",
                json_schema: NamedSchema {
                    name: SCHEMA_NAME,
                    schema,
                    strict: true,
                },
            },
        };

        let start = std::time::Instant::now();
        let response = self
            .client
            .post(format!("{}/v1/ocr", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| GenieError::OcrTransport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GenieError::OcrTransport(format!("Failed to read response: {}", e)))?;

        if !status.is_success() {
            return Err(GenieError::OcrStatus {
                status: status.as_u16(),
                body,
            });
        }

        log::debug!("OCR call for {} took {:?}", document.file_name, start.elapsed());
        parse_annotation(&body)
    }
}
