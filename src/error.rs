use thiserror::Error;

/// Main error type for Invoice Genie
#[derive(Error, Debug)]
pub enum GenieError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// File system I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Caller could not be authenticated
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Neither inline bytes nor a storage reference were supplied
    #[error("Missing file data")]
    MissingFileData,

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Declared MIME type is neither a PDF nor an image
    #[error("Unsupported file type: {0}")]
    UnsupportedFileType(String),

    /// Extraction succeeded but the document carries no invoice markers
    #[error("Invalid document type")]
    NotAnInvoice,

    /// Account is at or over its page quota
    #[error("Usage limit exceeded ({remaining} of {limit} pages remaining)")]
    QuotaExceeded { remaining: i64, limit: i64 },

    /// Invoice not found (or not owned by the caller)
    #[error("Invoice not found: {0}")]
    InvoiceNotFound(String),

    /// Extracted data record not found
    #[error("Extracted data not found for invoice: {0}")]
    ExtractedDataNotFound(String),

    /// Status change not allowed by the processing state machine
    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Object store fetch failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// OCR endpoint unreachable or the request failed in flight
    #[error("OCR transport error: {0}")]
    OcrTransport(String),

    /// OCR endpoint answered with a non-success status
    #[error("OCR API error {status}: {body}")]
    OcrStatus { status: u16, body: String },

    /// OCR answered 200 but the annotation could not be parsed
    #[error("OCR response unparsable: {0}")]
    OcrUnparsable(String),

    /// Vision fallback failed (transport, status or malformed JSON)
    #[error("Vision extraction error: {0}")]
    Vision(String),

    /// Anything else
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GenieError {
    /// Kind of a primary OCR failure, `None` for every other error.
    /// OCR failures trigger the vision fallback.
    pub fn ocr_failure_kind(&self) -> Option<&'static str> {
        match self {
            GenieError::OcrTransport(_) => Some("transport"),
            GenieError::OcrStatus { .. } => Some("status"),
            GenieError::OcrUnparsable(_) => Some("unparsable"),
            _ => None,
        }
    }
}

/// Convenient Result type using GenieError
pub type Result<T> = std::result::Result<T, GenieError>;
