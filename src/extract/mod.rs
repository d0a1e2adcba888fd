//! Extraction of invoice fields from a document.
//!
//! Two external paths produce an extraction payload: the structured OCR
//! annotation endpoint and the vision chat fallback. [`fields`] turns either
//! payload into scores, validation verdicts and structured columns.

use base64::{engine::general_purpose::STANDARD, Engine as _};

pub mod fields;
pub mod ocr;
pub mod schema;
pub mod vision;

pub use ocr::{MistralOcrClient, OcrClient};
pub use vision::{OpenAiVisionClient, VisionClient};

/// Document bytes handed to an extraction client
#[derive(Debug, Clone)]
pub struct DocumentInput {
    pub bytes: Vec<u8>,
    /// Lowercased MIME type without parameters
    pub mime_type: String,
    pub file_name: String,
}

impl DocumentInput {
    pub fn is_pdf(&self) -> bool {
        self.mime_type == "application/pdf"
    }

    /// `data:` URL carrying the base64-encoded bytes
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, STANDARD.encode(&self.bytes))
    }
}
