use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row, Transaction};
use serde_json::Value;
use uuid::Uuid;

use crate::db::Db;
use crate::error::{GenieError, Result};
use crate::models::{ExtractedInvoiceData, ExtractionMethod, InvoiceFields, LineItem, NewLineItem};

const EXTRACTED_COLUMNS: &str = "id, invoice_id, invoice_number, vendor_name, vendor_address, \
     customer_name, customer_address, issue_date, due_date, subtotal, tax_amount, discount_amount, \
     total_amount, currency, payment_terms, payment_method, notes, raw_payload, confidence_score, \
     verified, extraction_method, created_at, updated_at";

fn conversion_error(index: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(err))
}

fn row_to_extracted(row: &Row<'_>) -> rusqlite::Result<ExtractedInvoiceData> {
    let raw: String = row.get(17)?;
    let raw_payload: Value = serde_json::from_str(&raw).map_err(|e| conversion_error(17, e))?;
    let method: String = row.get(20)?;
    let extraction_method = method
        .parse::<ExtractionMethod>()
        .map_err(|e| conversion_error(20, e))?;

    Ok(ExtractedInvoiceData {
        id: row.get(0)?,
        invoice_id: row.get(1)?,
        fields: InvoiceFields {
            invoice_number: row.get(2)?,
            vendor_name: row.get(3)?,
            vendor_address: row.get(4)?,
            customer_name: row.get(5)?,
            customer_address: row.get(6)?,
            issue_date: row.get(7)?,
            due_date: row.get(8)?,
            subtotal: row.get(9)?,
            tax_amount: row.get(10)?,
            discount_amount: row.get(11)?,
            total_amount: row.get(12)?,
            currency: row.get(13)?,
            payment_terms: row.get(14)?,
            payment_method: row.get(15)?,
            notes: row.get(16)?,
        },
        raw_payload,
        confidence_score: row.get(18)?,
        verified: row.get(19)?,
        extraction_method,
        created_at: row.get(21)?,
        updated_at: row.get(22)?,
    })
}

fn row_to_line_item(row: &Row<'_>) -> rusqlite::Result<LineItem> {
    Ok(LineItem {
        id: row.get(0)?,
        extracted_data_id: row.get(1)?,
        position: row.get(2)?,
        description: row.get(3)?,
        quantity: row.get(4)?,
        unit_price: row.get(5)?,
        amount: row.get(6)?,
    })
}

/// Insert the extraction result for an invoice.
///
/// At most one record exists per invoice; a leftover from an earlier attempt
/// that failed after persisting is replaced (its line items cascade).
pub async fn insert_extracted(
    db: &Db,
    invoice_id: &str,
    fields: InvoiceFields,
    raw_payload: &Value,
    confidence_score: f64,
    method: ExtractionMethod,
) -> Result<ExtractedInvoiceData> {
    let now = Utc::now().to_rfc3339();
    let record = ExtractedInvoiceData {
        id: Uuid::new_v4().to_string(),
        invoice_id: invoice_id.to_string(),
        fields,
        raw_payload: raw_payload.clone(),
        confidence_score,
        verified: false,
        extraction_method: method,
        created_at: now.clone(),
        updated_at: now,
    };

    let raw_text = serde_json::to_string(raw_payload)?;
    let row = record.clone();
    db.with_connection(move |conn| {
        let tx = conn.transaction()?;
        let replaced = tx.execute(
            "DELETE FROM extracted_invoice_data WHERE invoice_id = ?1",
            params![row.invoice_id],
        )?;
        if replaced > 0 {
            log::warn!("Replacing stale extracted data for invoice {}", row.invoice_id);
        }
        let f = &row.fields;
        tx.execute(
            r#"
            INSERT INTO extracted_invoice_data (
                id, invoice_id, invoice_number, vendor_name, vendor_address,
                customer_name, customer_address, issue_date, due_date, subtotal,
                tax_amount, discount_amount, total_amount, currency, payment_terms,
                payment_method, notes, raw_payload, confidence_score, verified,
                extraction_method, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                      ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)
            "#,
            params![
                row.id,
                row.invoice_id,
                f.invoice_number,
                f.vendor_name,
                f.vendor_address,
                f.customer_name,
                f.customer_address,
                f.issue_date,
                f.due_date,
                f.subtotal,
                f.tax_amount,
                f.discount_amount,
                f.total_amount,
                f.currency,
                f.payment_terms,
                f.payment_method,
                f.notes,
                raw_text,
                row.confidence_score,
                row.verified,
                row.extraction_method.as_str(),
                row.created_at,
                row.updated_at,
            ],
        )?;
        tx.commit()?;
        Ok(())
    })
    .await?;

    Ok(record)
}

fn insert_items(tx: &Transaction<'_>, extracted_data_id: &str, items: &[NewLineItem]) -> Result<usize> {
    let mut stmt = tx.prepare(
        r#"
        INSERT INTO line_items (
            id, extracted_data_id, position, description, quantity, unit_price, amount
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )?;
    for (position, item) in items.iter().enumerate() {
        stmt.execute(params![
            Uuid::new_v4().to_string(),
            extracted_data_id,
            position as i64,
            item.description,
            item.quantity,
            item.unit_price,
            item.amount,
        ])?;
    }
    Ok(items.len())
}

/// Bulk-insert line items for a freshly created record
pub async fn insert_line_items(db: &Db, extracted_data_id: &str, items: Vec<NewLineItem>) -> Result<usize> {
    if items.is_empty() {
        return Ok(0);
    }
    let extracted_data_id = extracted_data_id.to_string();
    db.with_connection(move |conn| {
        let tx = conn.transaction()?;
        let count = insert_items(&tx, &extracted_data_id, &items)?;
        tx.commit()?;
        Ok(count)
    })
    .await
}

/// Extracted data for an invoice owned by `account_id`
pub async fn get_extracted_for_invoice(
    db: &Db,
    account_id: &str,
    invoice_id: &str,
) -> Result<Option<ExtractedInvoiceData>> {
    let account_id = account_id.to_string();
    let invoice_id = invoice_id.to_string();
    db.with_connection(move |conn| {
        let sql = format!(
            "SELECT {} FROM extracted_invoice_data
             WHERE invoice_id = ?1
               AND invoice_id IN (SELECT id FROM invoices WHERE account_id = ?2)",
            EXTRACTED_COLUMNS
        );
        let record = conn
            .query_row(&sql, params![invoice_id, account_id], row_to_extracted)
            .optional()?;
        Ok(record)
    })
    .await
}

/// Line items of a record, in position order
pub async fn list_line_items(db: &Db, extracted_data_id: &str) -> Result<Vec<LineItem>> {
    let extracted_data_id = extracted_data_id.to_string();
    db.with_connection(move |conn| {
        let mut stmt = conn.prepare(
            "SELECT id, extracted_data_id, position, description, quantity, unit_price, amount
             FROM line_items WHERE extracted_data_id = ?1 ORDER BY position",
        )?;
        let rows = stmt.query_map(params![extracted_data_id], row_to_line_item)?;
        let items = rows.collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
        Ok(items)
    })
    .await
}

/// Human review: overwrite the structured fields, mark the record verified and
/// replace every line item, all in one transaction.
///
/// The raw payload is left untouched.
pub async fn apply_review(
    db: &Db,
    account_id: &str,
    invoice_id: &str,
    fields: InvoiceFields,
    items: Vec<NewLineItem>,
) -> Result<(ExtractedInvoiceData, Vec<LineItem>)> {
    let account = account_id.to_string();
    let invoice = invoice_id.to_string();
    let now = Utc::now().to_rfc3339();

    let extracted_id = db
        .with_connection(move |conn| {
            let tx = conn.transaction()?;
            let extracted_id: Option<String> = tx
                .query_row(
                    "SELECT id FROM extracted_invoice_data
                     WHERE invoice_id = ?1
                       AND invoice_id IN (SELECT id FROM invoices WHERE account_id = ?2)",
                    params![invoice, account],
                    |row| row.get(0),
                )
                .optional()?;
            let extracted_id = extracted_id.ok_or_else(|| GenieError::ExtractedDataNotFound(invoice.clone()))?;

            tx.execute(
                r#"
                UPDATE extracted_invoice_data SET
                    invoice_number = ?1, vendor_name = ?2, vendor_address = ?3,
                    customer_name = ?4, customer_address = ?5, issue_date = ?6, due_date = ?7,
                    subtotal = ?8, tax_amount = ?9, discount_amount = ?10, total_amount = ?11,
                    currency = ?12, payment_terms = ?13, payment_method = ?14, notes = ?15,
                    verified = 1, updated_at = ?16
                WHERE id = ?17
                "#,
                params![
                    fields.invoice_number,
                    fields.vendor_name,
                    fields.vendor_address,
                    fields.customer_name,
                    fields.customer_address,
                    fields.issue_date,
                    fields.due_date,
                    fields.subtotal,
                    fields.tax_amount,
                    fields.discount_amount,
                    fields.total_amount,
                    fields.currency,
                    fields.payment_terms,
                    fields.payment_method,
                    fields.notes,
                    now,
                    extracted_id,
                ],
            )?;

            tx.execute(
                "DELETE FROM line_items WHERE extracted_data_id = ?1",
                params![extracted_id],
            )?;
            insert_items(&tx, &extracted_id, &items)?;
            tx.commit()?;
            Ok(extracted_id)
        })
        .await?;

    let record = get_extracted_for_invoice(db, account_id, invoice_id)
        .await?
        .ok_or_else(|| GenieError::ExtractedDataNotFound(invoice_id.to_string()))?;
    let items = list_line_items(db, &extracted_id).await?;
    Ok((record, items))
}
