//! Ingestion orchestrator: drives one invoice from admission to a terminal status.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::config::{AdmissionPolicy, IngestConfig};
use crate::db::Db;
use crate::error::{GenieError, Result};
use crate::extract::{fields, schema, DocumentInput, OcrClient, VisionClient};
use crate::models::ExtractionMethod;
use crate::storage::{validate_reference, ObjectStore};
use crate::store::{extracted, invoices};
use crate::usage::UsageLedger;

pub mod audit;
pub mod payload;

pub use audit::AuditEvent;
pub use payload::{ByteSource, ProcessRequest};

/// Documents are not decomposed; every document counts as one page.
pub const PAGES_PER_DOCUMENT: i64 = 1;

/// Orchestrator tuning, taken from the `[ingest]` config section
#[derive(Debug, Clone, Copy)]
pub struct IngestSettings {
    pub admission: AdmissionPolicy,
    pub low_confidence_threshold: f64,
}

impl From<&IngestConfig> for IngestSettings {
    fn from(config: &IngestConfig) -> Self {
        Self {
            admission: config.admission,
            low_confidence_threshold: config.low_confidence_threshold,
        }
    }
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self::from(&IngestConfig::default())
    }
}

/// Successful processing result
#[derive(Debug, Clone, Serialize)]
pub struct ProcessOutcome {
    pub invoice_data_id: String,
    /// Read-only projection of the stored record
    pub extracted: Value,
    pub confidence_score: f64,
    pub pages_processed: i64,
    pub method: ExtractionMethod,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Coordinates the ledger, object store, extraction clients and persistence.
///
/// Holds no per-request state; one instance serves concurrent requests.
pub struct Orchestrator {
    db: Db,
    ledger: Arc<dyn UsageLedger>,
    objects: Arc<dyn ObjectStore>,
    ocr: Arc<dyn OcrClient>,
    vision: Arc<dyn VisionClient>,
    settings: IngestSettings,
}

impl Orchestrator {
    pub fn new(
        db: Db,
        ledger: Arc<dyn UsageLedger>,
        objects: Arc<dyn ObjectStore>,
        ocr: Arc<dyn OcrClient>,
        vision: Arc<dyn VisionClient>,
        settings: IngestSettings,
    ) -> Self {
        Self {
            db,
            ledger,
            objects,
            ocr,
            vision,
            settings,
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn ledger(&self) -> &Arc<dyn UsageLedger> {
        &self.ledger
    }

    /// Process one invoice for `account_id`.
    ///
    /// Quota rejections leave the invoice untouched. Once the invoice has
    /// moved to `processing`, every failure moves it to `failed`.
    pub async fn process(&self, account_id: &str, request: ProcessRequest) -> Result<ProcessOutcome> {
        let invoice_id = request.invoice_id()?.to_string();

        let source = match request.byte_source() {
            Ok(source) => source,
            Err(e) => {
                self.reject_pending(account_id, &invoice_id, &e).await;
                return Err(e);
            }
        };

        let reserved = self.admit(account_id).await?;

        if let Err(e) = invoices::begin_processing(&self.db, account_id, &invoice_id).await {
            log::warn!("Cannot start processing invoice {}: {}", invoice_id, e);
            if reserved {
                self.release(account_id).await;
            }
            return Err(e);
        }
        audit::record(&self.db, &invoice_id, account_id, AuditEvent::Started, None).await;

        match self.run(account_id, &invoice_id, &request, source, reserved).await {
            Ok(outcome) => {
                let detail = format!("method={} confidence={:.2}", outcome.method.as_str(), outcome.confidence_score);
                audit::record(&self.db, &invoice_id, account_id, AuditEvent::Completed, Some(&detail)).await;
                log::info!(
                    "Invoice {} completed via {} (confidence {:.2})",
                    invoice_id,
                    outcome.method.as_str(),
                    outcome.confidence_score
                );
                Ok(outcome)
            }
            Err(e) => {
                log::error!("Processing invoice {} failed: {}", invoice_id, e);
                self.mark_failed(account_id, &invoice_id, &e).await;
                if reserved {
                    self.release(account_id).await;
                }
                Err(e)
            }
        }
    }

    /// Returns whether pages were reserved up front
    async fn admit(&self, account_id: &str) -> Result<bool> {
        let (admission, reserved) = match self.settings.admission {
            AdmissionPolicy::CheckThenIncrement => (self.ledger.check(account_id, PAGES_PER_DOCUMENT).await?, false),
            AdmissionPolicy::Reserve => (self.ledger.try_reserve(account_id, PAGES_PER_DOCUMENT).await?, true),
        };

        if !admission.allowed {
            log::info!(
                "Rejecting request for account {}: quota reached ({} of {} remaining)",
                account_id,
                admission.remaining,
                admission.limit
            );
            return Err(GenieError::QuotaExceeded {
                remaining: admission.remaining,
                limit: admission.limit,
            });
        }
        log::debug!("Admitted account {} ({} pages remaining)", account_id, admission.remaining);
        Ok(reserved)
    }

    async fn release(&self, account_id: &str) {
        if let Err(e) = self.ledger.release(account_id, PAGES_PER_DOCUMENT).await {
            log::warn!("Failed to release reserved pages for account {}: {}", account_id, e);
        }
    }

    /// Fail an invoice over a malformed request that never took ownership of
    /// it. Only `pending` invoices move; one in flight elsewhere is left alone.
    async fn reject_pending(&self, account_id: &str, invoice_id: &str, cause: &GenieError) {
        let reason = cause.to_string();
        match invoices::fail_pending_invoice(&self.db, account_id, invoice_id, &reason).await {
            Ok(()) => {
                audit::record(&self.db, invoice_id, account_id, AuditEvent::Failed, Some(&reason)).await;
            }
            Err(e) => log::warn!("Rejected request for invoice {} left its status unchanged: {}", invoice_id, e),
        }
    }

    /// Reference for a stored document, which must be the invoice's own
    /// upload or, for invoices without one, live under the account's prefix
    async fn owned_reference(&self, account_id: &str, invoice_id: &str, requested: &str) -> Result<String> {
        let requested = validate_reference(requested)?;
        let invoice = invoices::get_invoice(&self.db, account_id, invoice_id)
            .await?
            .ok_or_else(|| GenieError::InvoiceNotFound(invoice_id.to_string()))?;

        let owned = match invoice.storage_ref.as_deref() {
            Some(stored) => validate_reference(stored).map(|s| s == requested).unwrap_or(false),
            None => requested.starts_with(&format!("{}/", account_id)),
        };
        if !owned {
            log::warn!("Account {} requested foreign file {} for invoice {}", account_id, requested, invoice_id);
            return Err(GenieError::InvalidInput("File path does not belong to this invoice".to_string()));
        }
        Ok(requested.to_string())
    }

    /// Best-effort `failed` status write; its own failure is only logged
    async fn mark_failed(&self, account_id: &str, invoice_id: &str, cause: &GenieError) {
        let reason = cause.to_string();
        if let Err(e) = invoices::fail_invoice(&self.db, account_id, invoice_id, &reason).await {
            log::warn!("Could not mark invoice {} as failed: {}", invoice_id, e);
            return;
        }
        audit::record(&self.db, invoice_id, account_id, AuditEvent::Failed, Some(&reason)).await;
    }

    async fn run(
        &self,
        account_id: &str,
        invoice_id: &str,
        request: &ProcessRequest,
        source: ByteSource,
        reserved: bool,
    ) -> Result<ProcessOutcome> {
        let declared = request.file_type.as_deref().unwrap_or_default();
        let mime_type = payload::normalize_mime(declared);
        if !payload::is_supported_mime(&mime_type) {
            return Err(GenieError::UnsupportedFileType(declared.to_string()));
        }

        let bytes = match source {
            ByteSource::Inline(data) => {
                let bytes = payload::decode_inline(&data)?;
                log::info!("Decoded inline document for invoice {} (~{} KB)", invoice_id, bytes.len() / 1024);
                bytes
            }
            ByteSource::Stored(reference) => {
                let reference = self.owned_reference(account_id, invoice_id, &reference).await?;
                self.objects.fetch_bytes(&reference).await?
            }
        };

        let document = DocumentInput {
            bytes,
            mime_type,
            file_name: request
                .file_name
                .clone()
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| invoice_id.to_string()),
        };

        let (payload, method) = self.extract(account_id, invoice_id, &document).await?;

        if !fields::looks_like_invoice(&payload) {
            return Err(GenieError::NotAnInvoice);
        }

        let confidence = fields::confidence_score(&payload);
        if confidence < self.settings.low_confidence_threshold {
            log::warn!("Low confidence extraction for invoice {}: {:.2}", invoice_id, confidence);
        }

        let record = extracted::insert_extracted(
            &self.db,
            invoice_id,
            fields::fields_from_payload(&payload),
            &payload,
            confidence,
            method,
        )
        .await?;

        let mut warnings = Vec::new();
        let items = fields::line_items_from_payload(&payload);
        if let Err(e) = extracted::insert_line_items(&self.db, &record.id, items).await {
            log::warn!("Failed to store line items for invoice {}: {}", invoice_id, e);
            warnings.push(format!("Line items were not saved: {}", e));
        }

        invoices::complete_invoice(&self.db, account_id, invoice_id, PAGES_PER_DOCUMENT).await?;

        if !reserved {
            if let Err(e) = self.ledger.increment(account_id, PAGES_PER_DOCUMENT).await {
                log::error!("Failed to record usage for account {}: {}", account_id, e);
            }
        }

        let stored_items = extracted::list_line_items(&self.db, &record.id).await.unwrap_or_else(|e| {
            log::warn!("Failed to read back line items for invoice {}: {}", invoice_id, e);
            Vec::new()
        });

        Ok(ProcessOutcome {
            invoice_data_id: record.id.clone(),
            extracted: record.projection(&stored_items),
            confidence_score: confidence,
            pages_processed: PAGES_PER_DOCUMENT,
            method,
            warnings,
        })
    }

    /// Structured OCR first; any OCR failure falls back to vision exactly once
    async fn extract(
        &self,
        account_id: &str,
        invoice_id: &str,
        document: &DocumentInput,
    ) -> Result<(Value, ExtractionMethod)> {
        let schema = schema::invoice_schema();
        match self.ocr.annotate(document, &schema).await {
            Ok(annotation) => Ok((annotation, ExtractionMethod::StructuredOcr)),
            Err(e) => {
                let Some(kind) = e.ocr_failure_kind() else {
                    return Err(e);
                };
                log::warn!("OCR failed for invoice {} ({}): {}; falling back to vision", invoice_id, kind, e);
                let detail = format!("{}: {}", kind, e);
                audit::record(&self.db, invoice_id, account_id, AuditEvent::OcrFallback, Some(&detail)).await;

                let value = self.vision.extract(document, &schema::vision_prompt()).await?;
                Ok((value, ExtractionMethod::VisionOnly))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::migrated_db;
    use crate::models::{NewInvoice, ProcessingStatus};
    use crate::storage::FsObjectStore;
    use crate::usage::SqliteUsageLedger;
    use async_trait::async_trait;
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const ACCOUNT: &str = "acct-1";
    const PDF_BYTES: &[u8] = b"%PDF-1.7 test";

    enum OcrBehavior {
        Annotate(Value),
        Status(u16),
        Unparsable,
    }

    struct FakeOcr {
        behavior: OcrBehavior,
        calls: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl OcrClient for FakeOcr {
        async fn annotate(&self, document: &DocumentInput, _schema: &Value) -> Result<Value> {
            self.calls.lock().unwrap().push(document.bytes.clone());
            match &self.behavior {
                OcrBehavior::Annotate(value) => Ok(value.clone()),
                OcrBehavior::Status(status) => Err(GenieError::OcrStatus {
                    status: *status,
                    body: "upstream error".to_string(),
                }),
                OcrBehavior::Unparsable => Err(GenieError::OcrUnparsable("expected object".to_string())),
            }
        }
    }

    struct FakeVision {
        reply: Option<Value>,
        calls: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl VisionClient for FakeVision {
        async fn extract(&self, document: &DocumentInput, _instruction: &str) -> Result<Value> {
            self.calls.lock().unwrap().push(document.bytes.clone());
            self.reply
                .clone()
                .ok_or_else(|| GenieError::Vision("Invalid JSON: expected value".to_string()))
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        db: Db,
        ledger: Arc<SqliteUsageLedger>,
        ocr: Arc<FakeOcr>,
        vision: Arc<FakeVision>,
        objects_dir: TempDir,
        _db_dir: TempDir,
    }

    impl Harness {
        fn ocr_calls(&self) -> usize {
            self.ocr.calls.lock().unwrap().len()
        }

        fn vision_calls(&self) -> Vec<Vec<u8>> {
            self.vision.calls.lock().unwrap().clone()
        }

        async fn status(&self, invoice_id: &str) -> ProcessingStatus {
            invoices::get_invoice(&self.db, ACCOUNT, invoice_id)
                .await
                .unwrap()
                .unwrap()
                .status
        }

        async fn pages_used(&self) -> i64 {
            self.ledger.counter(ACCOUNT).await.unwrap().pages_processed
        }

        async fn has_extracted(&self, invoice_id: &str) -> bool {
            extracted::get_extracted_for_invoice(&self.db, ACCOUNT, invoice_id)
                .await
                .unwrap()
                .is_some()
        }
    }

    async fn harness(ocr: OcrBehavior, vision: Option<Value>, quota: i64, admission: AdmissionPolicy) -> Harness {
        let (db, db_dir) = migrated_db().await;
        let objects_dir = TempDir::new().unwrap();
        let ledger = Arc::new(SqliteUsageLedger::new(db.clone(), quota));
        let ocr = Arc::new(FakeOcr {
            behavior: ocr,
            calls: Mutex::new(Vec::new()),
        });
        let vision = Arc::new(FakeVision {
            reply: vision,
            calls: Mutex::new(Vec::new()),
        });
        let orchestrator = Orchestrator::new(
            db.clone(),
            ledger.clone(),
            Arc::new(FsObjectStore::new(objects_dir.path())),
            ocr.clone(),
            vision.clone(),
            IngestSettings {
                admission,
                low_confidence_threshold: 0.5,
            },
        );
        Harness {
            orchestrator,
            db,
            ledger,
            ocr,
            vision,
            objects_dir,
            _db_dir: db_dir,
        }
    }

    fn acme() -> Value {
        json!({
            "invoice_number": "INV-1",
            "vendor_name": "Acme Co",
            "total_amount": 100.00,
            "currency": "USD",
            "invoice_date": "2026-10-01",
            "line_items": [
                {"description": "Widget", "quantity": 2, "unit_price": 30.0, "amount": 60.0},
                {"description": "", "quantity": null, "unit_price": null, "amount": 40.0}
            ]
        })
    }

    async fn pending_invoice(db: &Db, file_type: &str) -> String {
        invoices::create_invoice(
            db,
            ACCOUNT,
            NewInvoice {
                project_id: Some("proj-1".to_string()),
                file_name: "upload".to_string(),
                file_type: file_type.to_string(),
                file_size: PDF_BYTES.len() as i64,
                storage_ref: None,
            },
        )
        .await
        .unwrap()
        .id
    }

    fn inline_request(invoice_id: &str, file_type: &str) -> ProcessRequest {
        ProcessRequest {
            invoice_id: Some(invoice_id.to_string()),
            file_path: None,
            base64_data: Some(STANDARD.encode(PDF_BYTES)),
            file_type: Some(file_type.to_string()),
            file_name: Some("acme.pdf".to_string()),
        }
    }

    #[tokio::test]
    async fn test_structured_ocr_success() {
        let h = harness(OcrBehavior::Annotate(acme()), None, 10, AdmissionPolicy::CheckThenIncrement).await;
        let id = pending_invoice(&h.db, "application/pdf").await;

        let outcome = h.orchestrator.process(ACCOUNT, inline_request(&id, "application/pdf")).await.unwrap();

        assert_eq!(outcome.confidence_score, 1.0);
        assert_eq!(outcome.pages_processed, 1);
        assert_eq!(outcome.method, ExtractionMethod::StructuredOcr);
        assert_eq!(outcome.extracted["vendor_name"], "Acme Co");
        assert_eq!(outcome.extracted["line_items"].as_array().unwrap().len(), 2);
        assert!(outcome.warnings.is_empty());

        assert_eq!(h.status(&id).await, ProcessingStatus::Completed);
        assert_eq!(h.ocr_calls(), 1);
        assert!(h.vision_calls().is_empty());
        assert_eq!(h.pages_used().await, 1);

        let invoice = invoices::get_invoice(&h.db, ACCOUNT, &id).await.unwrap().unwrap();
        assert_eq!(invoice.page_count, 1);

        let record = extracted::get_extracted_for_invoice(&h.db, ACCOUNT, &id).await.unwrap().unwrap();
        assert_eq!(record.raw_payload, acme());
        assert!(!record.verified);
        let items = extracted::list_line_items(&h.db, &record.id).await.unwrap();
        assert_eq!(items[1].description, "Item");
        assert_eq!(items[1].quantity, 1.0);
        assert_eq!(items[1].unit_price, 0.0);
        assert_eq!(items[1].amount, 40.0);

        let events: Vec<String> = audit::list_events(&h.db, ACCOUNT, &id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event)
            .collect();
        assert_eq!(events, vec!["started", "completed"]);
    }

    #[tokio::test]
    async fn test_unparsable_ocr_falls_back_to_vision_once() {
        let h = harness(OcrBehavior::Unparsable, Some(acme()), 10, AdmissionPolicy::CheckThenIncrement).await;
        let id = pending_invoice(&h.db, "image/png").await;

        let outcome = h.orchestrator.process(ACCOUNT, inline_request(&id, "image/png")).await.unwrap();

        assert_eq!(outcome.method, ExtractionMethod::VisionOnly);
        assert_eq!(outcome.confidence_score, 1.0);
        assert_eq!(h.vision_calls(), vec![PDF_BYTES.to_vec()]);
        assert_eq!(h.status(&id).await, ProcessingStatus::Completed);

        let events: Vec<String> = audit::list_events(&h.db, ACCOUNT, &id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event)
            .collect();
        assert_eq!(events, vec!["started", "ocr_fallback", "completed"]);
    }

    #[tokio::test]
    async fn test_ocr_error_status_falls_back_and_vision_failure_is_terminal() {
        for status in [400u16, 503] {
            let h = harness(OcrBehavior::Status(status), None, 10, AdmissionPolicy::CheckThenIncrement).await;
            let id = pending_invoice(&h.db, "application/pdf").await;

            let err = h.orchestrator.process(ACCOUNT, inline_request(&id, "application/pdf")).await.unwrap_err();

            assert!(matches!(err, GenieError::Vision(_)));
            assert_eq!(h.vision_calls().len(), 1);
            assert_eq!(h.status(&id).await, ProcessingStatus::Failed);
            assert!(!h.has_extracted(&id).await);
            assert_eq!(h.pages_used().await, 0);

            let invoice = invoices::get_invoice(&h.db, ACCOUNT, &id).await.unwrap().unwrap();
            assert!(invoice.failure_reason.unwrap().contains("Vision"));
        }
    }

    #[tokio::test]
    async fn test_quota_reached_leaves_invoice_untouched() {
        let h = harness(OcrBehavior::Annotate(acme()), None, 1, AdmissionPolicy::CheckThenIncrement).await;
        h.ledger.increment(ACCOUNT, 1).await.unwrap();
        let id = pending_invoice(&h.db, "application/pdf").await;

        let err = h.orchestrator.process(ACCOUNT, inline_request(&id, "application/pdf")).await.unwrap_err();

        assert!(matches!(err, GenieError::QuotaExceeded { remaining: 0, limit: 1 }));
        assert_eq!(h.status(&id).await, ProcessingStatus::Pending);
        assert_eq!(h.ocr_calls(), 0);
        assert!(audit::list_events(&h.db, ACCOUNT, &id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_type_rejected_before_extraction() {
        let h = harness(OcrBehavior::Annotate(acme()), Some(acme()), 10, AdmissionPolicy::CheckThenIncrement).await;
        let id = pending_invoice(&h.db, "text/plain").await;

        let err = h.orchestrator.process(ACCOUNT, inline_request(&id, "text/plain")).await.unwrap_err();

        assert!(matches!(err, GenieError::UnsupportedFileType(ref t) if t == "text/plain"));
        assert!(err.to_string().contains("text/plain"));
        assert_eq!(h.ocr_calls(), 0);
        assert!(h.vision_calls().is_empty());
        assert_eq!(h.status(&id).await, ProcessingStatus::Failed);
    }

    #[tokio::test]
    async fn test_non_invoice_is_rejected_without_persisting() {
        let junk = json!({
            "vendor_name": "Not provided",
            "total_amount": 0,
            "invoice_number": null,
            "currency": "USD",
            "notes": "a photo of a cat"
        });
        let h = harness(OcrBehavior::Annotate(junk), None, 10, AdmissionPolicy::CheckThenIncrement).await;
        let id = pending_invoice(&h.db, "image/jpeg").await;

        let err = h.orchestrator.process(ACCOUNT, inline_request(&id, "image/jpeg")).await.unwrap_err();

        assert!(matches!(err, GenieError::NotAnInvoice));
        assert_eq!(err.to_string(), "Invalid document type");
        assert!(!h.has_extracted(&id).await);
        assert_eq!(h.status(&id).await, ProcessingStatus::Failed);
        assert_eq!(h.pages_used().await, 0);
    }

    #[tokio::test]
    async fn test_missing_file_data_fails_before_any_call() {
        let h = harness(OcrBehavior::Annotate(acme()), None, 10, AdmissionPolicy::CheckThenIncrement).await;
        let id = pending_invoice(&h.db, "application/pdf").await;
        let mut request = inline_request(&id, "application/pdf");
        request.base64_data = None;

        let err = h.orchestrator.process(ACCOUNT, request).await.unwrap_err();

        assert!(matches!(err, GenieError::MissingFileData));
        assert_eq!(h.ocr_calls(), 0);
        assert_eq!(h.status(&id).await, ProcessingStatus::Failed);

        let mut no_id = inline_request("", "application/pdf");
        no_id.invoice_id = None;
        assert!(matches!(
            h.orchestrator.process(ACCOUNT, no_id).await,
            Err(GenieError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_low_confidence_is_accepted() {
        let sparse = json!({"vendor_name": "Corner Shop", "total_amount": "Unknown"});
        let h = harness(OcrBehavior::Annotate(sparse), None, 10, AdmissionPolicy::CheckThenIncrement).await;
        let id = pending_invoice(&h.db, "image/png").await;

        let outcome = h.orchestrator.process(ACCOUNT, inline_request(&id, "image/png")).await.unwrap();

        assert_eq!(outcome.confidence_score, 0.25);
        assert_eq!(h.status(&id).await, ProcessingStatus::Completed);
        assert!(outcome.extracted["line_items"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stored_reference_is_fetched() {
        let h = harness(OcrBehavior::Annotate(acme()), None, 10, AdmissionPolicy::CheckThenIncrement).await;
        std::fs::create_dir_all(h.objects_dir.path().join("acct-1")).unwrap();
        std::fs::write(h.objects_dir.path().join("acct-1/acme.pdf"), PDF_BYTES).unwrap();
        let id = pending_invoice(&h.db, "application/pdf").await;

        let mut request = inline_request(&id, "application/pdf");
        request.base64_data = None;
        request.file_path = Some("acct-1/acme.pdf".to_string());
        h.orchestrator.process(ACCOUNT, request).await.unwrap();
        assert_eq!(h.ocr.calls.lock().unwrap()[0], PDF_BYTES.to_vec());

        let other = pending_invoice(&h.db, "application/pdf").await;
        let mut missing = inline_request(&other, "application/pdf");
        missing.base64_data = None;
        missing.file_path = Some("acct-1/missing.pdf".to_string());
        let err = h.orchestrator.process(ACCOUNT, missing).await.unwrap_err();
        assert!(matches!(err, GenieError::Storage(_)));
        assert_eq!(h.status(&other).await, ProcessingStatus::Failed);
        assert_eq!(h.ocr_calls(), 1);
    }

    #[tokio::test]
    async fn test_stored_reference_must_belong_to_the_invoice() {
        let h = harness(OcrBehavior::Annotate(acme()), None, 10, AdmissionPolicy::CheckThenIncrement).await;
        for dir in ["acct-1", "acct-2"] {
            std::fs::create_dir_all(h.objects_dir.path().join(dir)).unwrap();
        }
        std::fs::write(h.objects_dir.path().join("acct-2/private.pdf"), b"private to acct-2").unwrap();
        std::fs::write(h.objects_dir.path().join("acct-1/uploaded.pdf"), PDF_BYTES).unwrap();
        std::fs::write(h.objects_dir.path().join("acct-1/other.pdf"), PDF_BYTES).unwrap();

        let stored_request = |invoice_id: &str, path: &str| {
            let mut request = inline_request(invoice_id, "application/pdf");
            request.base64_data = None;
            request.file_path = Some(path.to_string());
            request
        };

        let foreign = pending_invoice(&h.db, "application/pdf").await;
        let err = h
            .orchestrator
            .process(ACCOUNT, stored_request(&foreign, "acct-2/private.pdf"))
            .await
            .unwrap_err();
        assert!(matches!(err, GenieError::InvalidInput(_)));
        assert_eq!(h.status(&foreign).await, ProcessingStatus::Failed);

        let uploaded = invoices::create_invoice(
            &h.db,
            ACCOUNT,
            NewInvoice {
                project_id: None,
                file_name: "uploaded.pdf".to_string(),
                file_type: "application/pdf".to_string(),
                file_size: PDF_BYTES.len() as i64,
                storage_ref: Some("acct-1/uploaded.pdf".to_string()),
            },
        )
        .await
        .unwrap()
        .id;
        let err = h
            .orchestrator
            .process(ACCOUNT, stored_request(&uploaded, "acct-1/other.pdf"))
            .await
            .unwrap_err();
        assert!(matches!(err, GenieError::InvalidInput(_)));

        assert_eq!(h.ocr_calls(), 0);
        assert!(h.vision_calls().is_empty());
        assert_eq!(h.pages_used().await, 0);

        invoices::reset_for_retry(&h.db, ACCOUNT, &uploaded).await.unwrap();
        h.orchestrator
            .process(ACCOUNT, stored_request(&uploaded, "/acct-1/uploaded.pdf"))
            .await
            .unwrap();
        assert_eq!(h.ocr.calls.lock().unwrap()[0], PDF_BYTES.to_vec());
    }

    #[tokio::test]
    async fn test_malformed_request_does_not_fail_invoice_in_flight() {
        let h = harness(OcrBehavior::Annotate(acme()), None, 10, AdmissionPolicy::CheckThenIncrement).await;
        let id = pending_invoice(&h.db, "application/pdf").await;
        invoices::begin_processing(&h.db, ACCOUNT, &id).await.unwrap();

        let mut duplicate = inline_request(&id, "application/pdf");
        duplicate.base64_data = None;
        let err = h.orchestrator.process(ACCOUNT, duplicate).await.unwrap_err();
        assert!(matches!(err, GenieError::MissingFileData));
        assert_eq!(h.status(&id).await, ProcessingStatus::Processing);
        assert!(audit::list_events(&h.db, ACCOUNT, &id).await.unwrap().is_empty());

        // the attempt that owns the invoice still completes
        invoices::complete_invoice(&h.db, ACCOUNT, &id, PAGES_PER_DOCUMENT).await.unwrap();
        assert_eq!(h.status(&id).await, ProcessingStatus::Completed);
    }

    #[tokio::test]
    async fn test_only_pending_invoices_are_processed() {
        let h = harness(OcrBehavior::Annotate(acme()), None, 10, AdmissionPolicy::CheckThenIncrement).await;
        let id = pending_invoice(&h.db, "application/pdf").await;
        h.orchestrator.process(ACCOUNT, inline_request(&id, "application/pdf")).await.unwrap();

        let err = h.orchestrator.process(ACCOUNT, inline_request(&id, "application/pdf")).await.unwrap_err();
        assert!(matches!(err, GenieError::InvalidTransition { .. }));
        assert_eq!(h.status(&id).await, ProcessingStatus::Completed);
        assert_eq!(h.ocr_calls(), 1);
        assert_eq!(h.pages_used().await, 1);

        let err = h.orchestrator.process("acct-2", inline_request(&id, "application/pdf")).await.unwrap_err();
        assert!(matches!(err, GenieError::InvoiceNotFound(_)));
    }

    #[tokio::test]
    async fn test_retry_after_failure_reprocesses() {
        let h = harness(OcrBehavior::Unparsable, Some(acme()), 10, AdmissionPolicy::CheckThenIncrement).await;
        let id = pending_invoice(&h.db, "text/plain").await;
        assert!(h.orchestrator.process(ACCOUNT, inline_request(&id, "text/plain")).await.is_err());

        invoices::reset_for_retry(&h.db, ACCOUNT, &id).await.unwrap();
        let outcome = h.orchestrator.process(ACCOUNT, inline_request(&id, "application/pdf")).await.unwrap();
        assert_eq!(outcome.method, ExtractionMethod::VisionOnly);
        assert_eq!(h.status(&id).await, ProcessingStatus::Completed);
    }

    #[tokio::test]
    async fn test_reserve_policy_counts_once_and_releases_on_failure() {
        let h = harness(OcrBehavior::Status(500), None, 1, AdmissionPolicy::Reserve).await;
        let failing = pending_invoice(&h.db, "application/pdf").await;
        assert!(h.orchestrator.process(ACCOUNT, inline_request(&failing, "application/pdf")).await.is_err());
        assert_eq!(h.pages_used().await, 0);

        let h = harness(OcrBehavior::Annotate(acme()), None, 1, AdmissionPolicy::Reserve).await;
        let first = pending_invoice(&h.db, "application/pdf").await;
        let second = pending_invoice(&h.db, "application/pdf").await;
        h.orchestrator.process(ACCOUNT, inline_request(&first, "application/pdf")).await.unwrap();
        assert_eq!(h.pages_used().await, 1);

        let err = h.orchestrator.process(ACCOUNT, inline_request(&second, "application/pdf")).await.unwrap_err();
        assert!(matches!(err, GenieError::QuotaExceeded { .. }));
        assert_eq!(h.status(&second).await, ProcessingStatus::Pending);
    }
}
