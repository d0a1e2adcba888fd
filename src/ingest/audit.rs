//! Processing attempt audit trail.

use chrono::Utc;
use rusqlite::params;
use serde::Serialize;
use uuid::Uuid;

use crate::db::Db;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEvent {
    Started,
    OcrFallback,
    Completed,
    Failed,
}

impl AuditEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEvent::Started => "started",
            AuditEvent::OcrFallback => "ocr_fallback",
            AuditEvent::Completed => "completed",
            AuditEvent::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessingEvent {
    pub event_id: String,
    pub invoice_id: String,
    pub timestamp: String,
    pub event: String,
    pub detail: Option<String>,
}

/// Append an event. Returns the generated event id.
pub async fn log_event(
    db: &Db,
    invoice_id: &str,
    account_id: &str,
    event: AuditEvent,
    detail: Option<&str>,
) -> Result<String> {
    let event_id = Uuid::new_v4().to_string();
    let timestamp = Utc::now().to_rfc3339();

    let id = event_id.clone();
    let invoice = invoice_id.to_string();
    let account = account_id.to_string();
    let detail = detail.map(String::from);

    db.with_connection(move |conn| {
        conn.execute(
            r#"
            INSERT INTO processing_events (
                event_id, invoice_id, account_id, timestamp, event, detail
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![id, invoice, account, timestamp, event.as_str(), detail],
        )?;
        Ok(())
    })
    .await?;

    Ok(event_id)
}

/// Like [`log_event`], but a failed write is only logged
pub async fn record(db: &Db, invoice_id: &str, account_id: &str, event: AuditEvent, detail: Option<&str>) {
    if let Err(e) = log_event(db, invoice_id, account_id, event, detail).await {
        log::warn!("Failed to record {} event for invoice {}: {}", event.as_str(), invoice_id, e);
    }
}

/// Events of an invoice owned by `account_id`, oldest first
pub async fn list_events(db: &Db, account_id: &str, invoice_id: &str) -> Result<Vec<ProcessingEvent>> {
    let account = account_id.to_string();
    let invoice = invoice_id.to_string();
    db.with_connection(move |conn| {
        let mut stmt = conn.prepare(
            "SELECT event_id, invoice_id, timestamp, event, detail FROM processing_events
             WHERE invoice_id = ?1 AND account_id = ?2
             ORDER BY timestamp, rowid",
        )?;
        let rows = stmt.query_map(params![invoice, account], |row| {
            Ok(ProcessingEvent {
                event_id: row.get(0)?,
                invoice_id: row.get(1)?,
                timestamp: row.get(2)?,
                event: row.get(3)?,
                detail: row.get(4)?,
            })
        })?;
        let events = rows.collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
        Ok(events)
    })
    .await
}
