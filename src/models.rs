use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::GenieError;

/// Processing lifecycle of an uploaded document.
///
/// `pending → processing → completed | failed`, plus the manual
/// `failed → pending` retry. A request rejected before processing starts
/// moves `pending → failed` directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
        }
    }

    pub fn can_transition_to(&self, next: ProcessingStatus) -> bool {
        use ProcessingStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Failed)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Failed, Pending)
        )
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingStatus {
    type Err = GenieError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ProcessingStatus::Pending),
            "processing" => Ok(ProcessingStatus::Processing),
            "completed" => Ok(ProcessingStatus::Completed),
            "failed" => Ok(ProcessingStatus::Failed),
            other => Err(GenieError::InvalidInput(format!("Unknown processing status: {}", other))),
        }
    }
}

/// Which extraction path produced a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    StructuredOcr,
    VisionOnly,
}

impl ExtractionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionMethod::StructuredOcr => "structured_ocr",
            ExtractionMethod::VisionOnly => "vision_only",
        }
    }
}

impl FromStr for ExtractionMethod {
    type Err = GenieError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "structured_ocr" => Ok(ExtractionMethod::StructuredOcr),
            "vision_only" => Ok(ExtractionMethod::VisionOnly),
            other => Err(GenieError::InvalidInput(format!("Unknown extraction method: {}", other))),
        }
    }
}

/// Customer account owning invoices and a page quota
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub email: String,
    /// Per-account override of the configured default quota
    pub page_quota: Option<i64>,
    pub created_at: String,
}

/// One uploaded document and its processing lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub account_id: String,
    pub project_id: Option<String>,
    pub file_name: String,
    pub file_type: String,
    pub file_size: i64,
    pub storage_ref: Option<String>,
    pub page_count: i64,
    pub status: ProcessingStatus,
    pub failure_reason: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Metadata recorded at upload time
#[derive(Debug, Clone, Deserialize)]
pub struct NewInvoice {
    #[serde(default)]
    pub project_id: Option<String>,
    pub file_name: String,
    pub file_type: String,
    #[serde(default)]
    pub file_size: i64,
    #[serde(default)]
    pub storage_ref: Option<String>,
}

/// Structured invoice fields. These columns are the source of truth for a
/// stored extraction; a reviewer overwrites them as a whole.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvoiceFields {
    pub invoice_number: Option<String>,
    pub vendor_name: Option<String>,
    pub vendor_address: Option<String>,
    pub customer_name: Option<String>,
    pub customer_address: Option<String>,
    #[serde(alias = "invoice_date")]
    pub issue_date: Option<String>,
    pub due_date: Option<String>,
    pub subtotal: Option<f64>,
    pub tax_amount: Option<f64>,
    pub discount_amount: Option<f64>,
    pub total_amount: Option<f64>,
    pub currency: Option<String>,
    pub payment_terms: Option<String>,
    pub payment_method: Option<String>,
    pub notes: Option<String>,
}

/// Result of a successful extraction, at most one per invoice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedInvoiceData {
    pub id: String,
    pub invoice_id: String,
    #[serde(flatten)]
    pub fields: InvoiceFields,
    /// Verbatim extraction payload, written once for audit and re-derivation.
    pub raw_payload: Value,
    pub confidence_score: f64,
    pub verified: bool,
    pub extraction_method: ExtractionMethod,
    pub created_at: String,
    pub updated_at: String,
}

impl ExtractedInvoiceData {
    /// Read-only JSON view derived from the structured columns.
    pub fn projection(&self, line_items: &[LineItem]) -> Value {
        let f = &self.fields;
        let items: Vec<Value> = line_items
            .iter()
            .map(|item| {
                json!({
                    "description": item.description,
                    "quantity": item.quantity,
                    "unit_price": item.unit_price,
                    "amount": item.amount,
                })
            })
            .collect();
        json!({
            "id": self.id,
            "invoice_id": self.invoice_id,
            "invoice_number": f.invoice_number,
            "vendor_name": f.vendor_name,
            "vendor_address": f.vendor_address,
            "customer_name": f.customer_name,
            "customer_address": f.customer_address,
            "invoice_date": f.issue_date,
            "due_date": f.due_date,
            "subtotal": f.subtotal,
            "tax_amount": f.tax_amount,
            "discount_amount": f.discount_amount,
            "total_amount": f.total_amount,
            "currency": f.currency,
            "payment_terms": f.payment_terms,
            "payment_method": f.payment_method,
            "notes": f.notes,
            "line_items": items,
            "confidence_score": self.confidence_score,
            "verified": self.verified,
            "extraction_method": self.extraction_method,
        })
    }
}

/// Line item as persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub id: String,
    pub extracted_data_id: String,
    pub position: i64,
    pub description: String,
    pub quantity: f64,
    pub unit_price: f64,
    pub amount: f64,
}

/// Line item before insertion (from an extraction payload or a reviewer)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLineItem {
    pub description: String,
    pub quantity: f64,
    pub unit_price: f64,
    pub amount: f64,
}

/// Pages used against the quota for one account and billing period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageCounter {
    pub account_id: String,
    pub period: String,
    pub pages_processed: i64,
    pub page_quota: i64,
}

impl UsageCounter {
    pub fn remaining(&self) -> i64 {
        (self.page_quota - self.pages_processed).max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            ProcessingStatus::Pending,
            ProcessingStatus::Processing,
            ProcessingStatus::Completed,
            ProcessingStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<ProcessingStatus>().unwrap(), status);
        }
        assert!("done".parse::<ProcessingStatus>().is_err());
    }

    #[test]
    fn test_status_transitions() {
        use ProcessingStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Pending));
        assert!(Pending.can_transition_to(Failed));

        assert!(!Processing.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn test_usage_remaining_never_negative() {
        let counter = UsageCounter {
            account_id: "acct".to_string(),
            period: "2026-10".to_string(),
            pages_processed: 12,
            page_quota: 10,
        };
        assert_eq!(counter.remaining(), 0);
    }

    #[test]
    fn test_projection_uses_structured_columns() {
        let data = ExtractedInvoiceData {
            id: "d1".to_string(),
            invoice_id: "i1".to_string(),
            fields: InvoiceFields {
                vendor_name: Some("Edited Vendor".to_string()),
                total_amount: Some(42.0),
                ..Default::default()
            },
            raw_payload: json!({"vendor_name": "Original Vendor"}),
            confidence_score: 0.5,
            verified: true,
            extraction_method: ExtractionMethod::VisionOnly,
            created_at: String::new(),
            updated_at: String::new(),
        };
        let items = vec![LineItem {
            id: "l1".to_string(),
            extracted_data_id: "d1".to_string(),
            position: 0,
            description: "Widget".to_string(),
            quantity: 2.0,
            unit_price: 21.0,
            amount: 42.0,
        }];

        let view = data.projection(&items);
        assert_eq!(view["vendor_name"], "Edited Vendor");
        assert_eq!(view["total_amount"], 42.0);
        assert_eq!(view["extraction_method"], "vision_only");
        assert_eq!(view["line_items"].as_array().unwrap().len(), 1);
    }
}
