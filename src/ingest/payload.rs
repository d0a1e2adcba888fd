//! Ingestion request body and byte-source handling.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;

use crate::error::{GenieError, Result};

/// Body of a processing request
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRequest {
    #[serde(default)]
    pub invoice_id: Option<String>,
    /// Object store reference, mutually exclusive with `base64_data`
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub base64_data: Option<String>,
    #[serde(default)]
    pub file_type: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
}

/// Where the document bytes come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ByteSource {
    Inline(String),
    Stored(String),
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl ProcessRequest {
    pub fn invoice_id(&self) -> Result<&str> {
        non_blank(&self.invoice_id).ok_or_else(|| GenieError::InvalidInput("Missing invoice id".to_string()))
    }

    /// Exactly one of inline bytes or a storage reference
    pub fn byte_source(&self) -> Result<ByteSource> {
        match (non_blank(&self.base64_data), non_blank(&self.file_path)) {
            (Some(data), None) => Ok(ByteSource::Inline(data.to_string())),
            (None, Some(path)) => Ok(ByteSource::Stored(path.to_string())),
            (None, None) => Err(GenieError::MissingFileData),
            (Some(_), Some(_)) => Err(GenieError::InvalidInput(
                "Provide either base64Data or filePath, not both".to_string(),
            )),
        }
    }
}

/// Lowercased MIME type without parameters (`"Image/PNG; q=1"` -> `"image/png"`)
pub fn normalize_mime(raw: &str) -> String {
    raw.split(';').next().unwrap_or_default().trim().to_lowercase()
}

pub fn is_supported_mime(mime: &str) -> bool {
    mime == "application/pdf" || mime.strip_prefix("image/").is_some_and(|subtype| !subtype.is_empty())
}

/// Decode inline base64, tolerating a `data:` URL prefix and line breaks
pub fn decode_inline(data: &str) -> Result<Vec<u8>> {
    let encoded = match data.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => data,
    };
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| GenieError::InvalidInput(format!("Invalid base64 data: {}", e)))?;
    if bytes.is_empty() {
        return Err(GenieError::MissingFileData);
    }
    Ok(bytes)
}
