//! Coercion of an extraction payload into structured fields.
//!
//! Both extraction paths return loosely typed JSON: amounts as numbers or
//! strings, dates in whatever format was printed, and sentinels such as
//! "Not provided" where a model found nothing. Everything here is pure.

use chrono::NaiveDate;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

use crate::models::{InvoiceFields, NewLineItem};

/// Fields whose presence makes up the confidence score
pub const REQUIRED_FIELDS: [&str; 4] = ["invoice_number", "total_amount", "currency", "vendor_name"];

const PLACEHOLDERS: &[&str] = &["not provided", "unknown", "n/a", "na", "null", "none", "-"];

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%d.%m.%Y",
    "%d/%m/%Y",
    "%Y/%m/%d",
    "%Y.%m.%d",
    "%B %d, %Y",
    "%b %d, %Y",
    "%d %B %Y",
    "%d %b %Y",
];

pub fn is_placeholder(text: &str) -> bool {
    let normalized = text.trim().to_lowercase();
    PLACEHOLDERS.contains(&normalized.as_str())
}

/// Whether a payload value counts as provided
pub fn is_present(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty() && !is_placeholder(s),
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Some(Value::Bool(b)) => *b,
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}

/// Share of [`REQUIRED_FIELDS`] present in the payload, in `[0, 1]`
pub fn confidence_score(payload: &Value) -> f64 {
    let present = REQUIRED_FIELDS
        .iter()
        .filter(|field| is_present(payload.get(**field)))
        .count();
    present as f64 / REQUIRED_FIELDS.len() as f64
}

/// A document is accepted as an invoice when it names a vendor, carries a
/// positive total, or has an invoice number.
pub fn looks_like_invoice(payload: &Value) -> bool {
    let has_vendor = is_present(payload.get("vendor_name"));
    let has_number = is_present(payload.get("invoice_number"));
    let has_total = payload
        .get("total_amount")
        .and_then(parse_amount)
        .map(|total| total > 0.0)
        .unwrap_or(false);
    has_vendor || has_total || has_number
}

fn amount_noise() -> &'static Regex {
    static NOISE: OnceLock<Regex> = OnceLock::new();
    NOISE.get_or_init(|| Regex::new(r"[^0-9.,\-]").expect("amount pattern is valid"))
}

/// Parse a monetary amount given as a number or as printed text
/// (`"$1,234.50"`, `"1.234,50 €"`).
pub fn parse_amount(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            if is_placeholder(s) {
                return None;
            }
            let cleaned = amount_noise().replace_all(s.trim(), "");
            normalize_separators(&cleaned).parse::<f64>().ok()
        }
        _ => None,
    }
}

fn normalize_separators(raw: &str) -> String {
    let last_dot = raw.rfind('.');
    let last_comma = raw.rfind(',');
    match (last_dot, last_comma) {
        // "1.234,50": comma is the decimal separator
        (Some(dot), Some(comma)) if comma > dot => raw.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => raw.replace(',', ""),
        (None, Some(comma)) => {
            let decimals = raw.len() - comma - 1;
            if raw.matches(',').count() == 1 && (1..=2).contains(&decimals) {
                raw.replace(',', ".")
            } else {
                raw.replace(',', "")
            }
        }
        _ => raw.to_string(),
    }
}

/// Normalise to `YYYY-MM-DD` when the text matches a known format, else keep it verbatim
pub fn normalize_date(value: Option<&Value>) -> Option<String> {
    let raw = text_value(value)?;
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(&raw, fmt) {
            return Some(date.format("%Y-%m-%d").to_string());
        }
    }
    Some(raw)
}

/// Trimmed text of a present scalar value
fn text_value(value: Option<&Value>) -> Option<String> {
    if !is_present(value) {
        return None;
    }
    match value? {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn text(payload: &Value, key: &str) -> Option<String> {
    text_value(payload.get(key))
}

fn amount(payload: &Value, key: &str) -> Option<f64> {
    payload.get(key).and_then(parse_amount)
}

/// Structured columns derived from a payload
pub fn fields_from_payload(payload: &Value) -> InvoiceFields {
    let issue = payload.get("invoice_date").or_else(|| payload.get("issue_date"));
    InvoiceFields {
        invoice_number: text(payload, "invoice_number"),
        vendor_name: text(payload, "vendor_name"),
        vendor_address: text(payload, "vendor_address"),
        customer_name: text(payload, "customer_name"),
        customer_address: text(payload, "customer_address"),
        issue_date: normalize_date(issue),
        due_date: normalize_date(payload.get("due_date")),
        subtotal: amount(payload, "subtotal"),
        tax_amount: amount(payload, "tax_amount"),
        discount_amount: amount(payload, "discount_amount"),
        total_amount: amount(payload, "total_amount"),
        currency: text(payload, "currency").map(|c| c.to_uppercase()),
        payment_terms: text(payload, "payment_terms"),
        payment_method: text(payload, "payment_method"),
        notes: text(payload, "notes"),
    }
}

/// Line items from the payload's `line_items` array with defaults applied:
/// description "Item", quantity 1, unit price and amount 0.
/// Entries that are not JSON objects carry no fields and are skipped.
pub fn line_items_from_payload(payload: &Value) -> Vec<NewLineItem> {
    let Some(items) = payload.get("line_items").and_then(Value::as_array) else {
        return Vec::new();
    };

    items
        .iter()
        .filter(|item| item.is_object())
        .map(|item| {
            let description = text(item, "description").unwrap_or_else(|| "Item".to_string());
            let quantity = amount(item, "quantity").filter(|q| *q != 0.0).unwrap_or(1.0);
            NewLineItem {
                description,
                quantity,
                unit_price: amount(item, "unit_price").unwrap_or(0.0),
                amount: amount(item, "amount").unwrap_or(0.0),
            }
        })
        .collect()
}
