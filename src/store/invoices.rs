use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::db::Db;
use crate::error::{GenieError, Result};
use crate::models::{Invoice, NewInvoice, ProcessingStatus};

const INVOICE_COLUMNS: &str = "id, account_id, project_id, file_name, file_type, file_size, \
     storage_ref, page_count, status, failure_reason, created_at, updated_at";

fn row_to_invoice(row: &Row<'_>) -> rusqlite::Result<Invoice> {
    let status: String = row.get(8)?;
    let status = status.parse::<ProcessingStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Invoice {
        id: row.get(0)?,
        account_id: row.get(1)?,
        project_id: row.get(2)?,
        file_name: row.get(3)?,
        file_type: row.get(4)?,
        file_size: row.get(5)?,
        storage_ref: row.get(6)?,
        page_count: row.get(7)?,
        status,
        failure_reason: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

/// Record an uploaded document in `pending`
pub async fn create_invoice(db: &Db, account_id: &str, new: NewInvoice) -> Result<Invoice> {
    if new.file_name.trim().is_empty() {
        return Err(GenieError::InvalidInput("file_name is required".to_string()));
    }
    if new.file_size < 0 {
        return Err(GenieError::InvalidInput("file_size must not be negative".to_string()));
    }

    let now = Utc::now().to_rfc3339();
    let invoice = Invoice {
        id: Uuid::new_v4().to_string(),
        account_id: account_id.to_string(),
        project_id: new.project_id,
        file_name: new.file_name,
        file_type: new.file_type,
        file_size: new.file_size,
        storage_ref: new.storage_ref,
        page_count: 0,
        status: ProcessingStatus::Pending,
        failure_reason: None,
        created_at: now.clone(),
        updated_at: now,
    };

    let row = invoice.clone();
    db.with_connection(move |conn| {
        conn.execute(
            r#"
            INSERT INTO invoices (
                id, account_id, project_id, file_name, file_type, file_size,
                storage_ref, page_count, status, failure_reason, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                row.id,
                row.account_id,
                row.project_id,
                row.file_name,
                row.file_type,
                row.file_size,
                row.storage_ref,
                row.page_count,
                row.status.as_str(),
                row.failure_reason,
                row.created_at,
                row.updated_at,
            ],
        )?;
        Ok(())
    })
    .await?;

    Ok(invoice)
}

/// Fetch an invoice owned by `account_id`
pub async fn get_invoice(db: &Db, account_id: &str, invoice_id: &str) -> Result<Option<Invoice>> {
    let account_id = account_id.to_string();
    let invoice_id = invoice_id.to_string();
    db.with_connection(move |conn| {
        let sql = format!(
            "SELECT {} FROM invoices WHERE id = ?1 AND account_id = ?2",
            INVOICE_COLUMNS
        );
        let invoice = conn
            .query_row(&sql, params![invoice_id, account_id], row_to_invoice)
            .optional()?;
        Ok(invoice)
    })
    .await
}

/// List an account's invoices, newest first
pub async fn list_invoices(
    db: &Db,
    account_id: &str,
    project_id: Option<String>,
    status: Option<ProcessingStatus>,
) -> Result<Vec<Invoice>> {
    let account_id = account_id.to_string();
    db.with_connection(move |conn| {
        let sql = format!(
            "SELECT {} FROM invoices
             WHERE account_id = ?1
               AND (?2 IS NULL OR project_id = ?2)
               AND (?3 IS NULL OR status = ?3)
             ORDER BY created_at DESC",
            INVOICE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![account_id, project_id, status.map(|s| s.as_str())],
            row_to_invoice,
        )?;
        let invoices = rows.collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
        Ok(invoices)
    })
    .await
}

/// Move an invoice to `to` if its current status is one of `from`.
///
/// The status check and the write are a single conditional UPDATE. When no
/// row matches, the invoice is re-read to tell "not found / not owned" apart
/// from "wrong current status".
async fn transition(
    db: &Db,
    account_id: &str,
    invoice_id: &str,
    from: &'static [ProcessingStatus],
    to: ProcessingStatus,
    failure_reason: Option<String>,
    page_count: Option<i64>,
) -> Result<()> {
    debug_assert!(from.iter().all(|f| f.can_transition_to(to)));

    let account = account_id.to_string();
    let id = invoice_id.to_string();
    let now = Utc::now().to_rfc3339();
    let updated = db
        .with_connection(move |conn| {
            let placeholders = from
                .iter()
                .map(|s| format!("'{}'", s.as_str()))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "UPDATE invoices
                 SET status = ?1, failure_reason = ?2, page_count = COALESCE(?3, page_count), updated_at = ?4
                 WHERE id = ?5 AND account_id = ?6 AND status IN ({})",
                placeholders
            );
            let changed = conn.execute(
                &sql,
                params![to.as_str(), failure_reason, page_count, now, id, account],
            )?;
            Ok(changed)
        })
        .await?;

    if updated == 1 {
        return Ok(());
    }

    match get_invoice(db, account_id, invoice_id).await? {
        None => Err(GenieError::InvoiceNotFound(invoice_id.to_string())),
        Some(current) => Err(GenieError::InvalidTransition {
            from: current.status.to_string(),
            to: to.to_string(),
        }),
    }
}

/// `pending → processing`
pub async fn begin_processing(db: &Db, account_id: &str, invoice_id: &str) -> Result<()> {
    transition(
        db,
        account_id,
        invoice_id,
        &[ProcessingStatus::Pending],
        ProcessingStatus::Processing,
        None,
        None,
    )
    .await
}

/// `processing → completed`, recording the number of pages processed
pub async fn complete_invoice(db: &Db, account_id: &str, invoice_id: &str, page_count: i64) -> Result<()> {
    transition(
        db,
        account_id,
        invoice_id,
        &[ProcessingStatus::Processing],
        ProcessingStatus::Completed,
        None,
        Some(page_count),
    )
    .await
}

/// `processing → failed` with a user-facing reason
pub async fn fail_invoice(db: &Db, account_id: &str, invoice_id: &str, reason: &str) -> Result<()> {
    transition(
        db,
        account_id,
        invoice_id,
        &[ProcessingStatus::Processing],
        ProcessingStatus::Failed,
        Some(reason.to_string()),
        None,
    )
    .await
}

/// `pending → failed` only, for requests rejected before processing started
pub async fn fail_pending_invoice(db: &Db, account_id: &str, invoice_id: &str, reason: &str) -> Result<()> {
    transition(
        db,
        account_id,
        invoice_id,
        &[ProcessingStatus::Pending],
        ProcessingStatus::Failed,
        Some(reason.to_string()),
        None,
    )
    .await
}

/// Manual retry: `failed → pending`, clearing the failure reason
pub async fn reset_for_retry(db: &Db, account_id: &str, invoice_id: &str) -> Result<Invoice> {
    transition(
        db,
        account_id,
        invoice_id,
        &[ProcessingStatus::Failed],
        ProcessingStatus::Pending,
        None,
        None,
    )
    .await?;
    get_invoice(db, account_id, invoice_id)
        .await?
        .ok_or_else(|| GenieError::InvoiceNotFound(invoice_id.to_string()))
}
