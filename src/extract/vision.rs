use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use super::DocumentInput;
use crate::config::VisionConfig;
use crate::error::{GenieError, Result};

/// Multimodal fallback extraction
#[async_trait]
pub trait VisionClient: Send + Sync {
    /// Extract a JSON object from `document` following `instruction`
    async fn extract(&self, document: &DocumentInput, instruction: &str) -> Result<Value>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<Message>,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct Message {
    role: &'static str,
    content: Vec<ContentPart>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
    File { file: FileData },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Serialize)]
struct FileData {
    filename: String,
    file_data: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible chat completions client
pub struct OpenAiVisionClient {
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
    temperature: f32,
}

impl OpenAiVisionClient {
    pub fn new(base_url: &str, model: &str, api_key: String, temperature: f32, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| GenieError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
            temperature,
        })
    }

    pub fn from_config(config: &VisionConfig) -> Result<Self> {
        let api_key = crate::config::api_key(&config.api_key_env)?;
        Self::new(
            &config.base_url,
            &config.model,
            api_key,
            config.temperature,
            config.timeout_secs,
        )
    }

    fn document_part(document: &DocumentInput) -> ContentPart {
        if document.is_pdf() {
            ContentPart::File {
                file: FileData {
                    filename: document.file_name.clone(),
                    file_data: document.data_url(),
                },
            }
        } else {
            ContentPart::ImageUrl {
                image_url: ImageUrl { url: document.data_url() },
            }
        }
    }
}

#[async_trait]
impl VisionClient for OpenAiVisionClient {
    async fn extract(&self, document: &DocumentInput, instruction: &str) -> Result<Value> {
        let request = ChatRequest {
            model: &self.model,
            temperature: self.temperature,
            messages: vec![Message {
                role: "user",
                content: vec![
                    ContentPart::Text { text: instruction.to_string() },
                    Self::document_part(document),
                ],
            }],
            response_format: ResponseFormat { format_type: "json_object" },
        };

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| GenieError::Vision(format!("Network error: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            return Err(GenieError::Vision(format!("API error {}: {}", status, body)));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| GenieError::Vision(format!("Failed to parse response: {}", e)))?;

        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| GenieError::Vision("Empty response".to_string()))?;

        let value: Value = serde_json::from_str(content.trim())
            .map_err(|e| GenieError::Vision(format!("Invalid JSON: {}", e)))?;
        if !value.is_object() {
            return Err(GenieError::Vision("Expected a JSON object".to_string()));
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::spawn_stub;
    use axum::{extract::State, routing::post, Json, Router};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    type Captured = Arc<Mutex<Option<Value>>>;

    fn stub(content: &'static str, captured: Captured) -> Router {
        Router::new()
            .route(
                "/v1/chat/completions",
                post(move |State(seen): State<Captured>, Json(request): Json<Value>| async move {
                    *seen.lock().unwrap() = Some(request);
                    Json(json!({
                        "choices": [{"message": {"role": "assistant", "content": content}}]
                    }))
                }),
            )
            .with_state(captured)
    }

    fn image() -> DocumentInput {
        DocumentInput {
            bytes: vec![0xff, 0xd8],
            mime_type: "image/jpeg".to_string(),
            file_name: "receipt.jpg".to_string(),
        }
    }

    #[tokio::test]
    async fn test_extract_sends_low_temperature_json_request() {
        let captured: Captured = Arc::default();
        let base = spawn_stub(stub(r#"{"vendor_name": "Acme Co"}"#, captured.clone())).await;
        let client = OpenAiVisionClient::new(&base, "gpt-4o-mini", "key".to_string(), 0.1, 5).unwrap();

        let value = client.extract(&image(), "extract").await.unwrap();
        assert_eq!(value["vendor_name"], "Acme Co");

        let request = captured.lock().unwrap().clone().unwrap();
        assert_eq!(request["response_format"]["type"], "json_object");
        assert!((request["temperature"].as_f64().unwrap() - 0.1).abs() < 1e-6);
        let parts = request["messages"][0]["content"].as_array().unwrap();
        assert_eq!(parts[0]["type"], "text");
        assert_eq!(parts[1]["type"], "image_url");
        assert!(parts[1]["image_url"]["url"].as_str().unwrap().starts_with("data:image/jpeg;base64,"));
    }

    #[tokio::test]
    async fn test_pdf_is_sent_as_file_part() {
        let captured: Captured = Arc::default();
        let base = spawn_stub(stub(r#"{"invoice_number": "INV-1"}"#, captured.clone())).await;
        let client = OpenAiVisionClient::new(&base, "gpt-4o-mini", "key".to_string(), 0.1, 5).unwrap();
        let pdf = DocumentInput {
            bytes: b"%PDF".to_vec(),
            mime_type: "application/pdf".to_string(),
            file_name: "inv.pdf".to_string(),
        };

        client.extract(&pdf, "extract").await.unwrap();
        let request = captured.lock().unwrap().clone().unwrap();
        let part = &request["messages"][0]["content"][1];
        assert_eq!(part["type"], "file");
        assert_eq!(part["file"]["filename"], "inv.pdf");
    }

    #[tokio::test]
    async fn test_malformed_json_is_hard_failure() {
        let base = spawn_stub(stub("Sure! Here is the data: {vendor", Arc::default())).await;
        let client = OpenAiVisionClient::new(&base, "gpt-4o-mini", "key".to_string(), 0.1, 5).unwrap();
        let err = client.extract(&image(), "extract").await.unwrap_err();
        assert!(matches!(err, GenieError::Vision(ref m) if m.contains("Invalid JSON")));
    }
}
