use serde_json::{json, Value};

/// Name attached to the annotation format sent to the OCR endpoint
pub const SCHEMA_NAME: &str = "invoice_annotation";

fn nullable(kind: &str) -> Value {
    json!({ "type": [kind, "null"] })
}

/// JSON Schema of the invoice annotation requested from the OCR endpoint
pub fn invoice_schema() -> Value {
    json!({
        "type": "object",
        "required": ["invoice_number", "vendor_name", "total_amount", "currency"],
        "properties": {
            "invoice_number": nullable("string"),
            "invoice_date": nullable("string"),
            "due_date": nullable("string"),
            "vendor_name": nullable("string"),
            "vendor_address": nullable("string"),
            "customer_name": nullable("string"),
            "customer_address": nullable("string"),
            "subtotal": nullable("number"),
            "tax_amount": nullable("number"),
            "discount_amount": nullable("number"),
            "total_amount": nullable("number"),
            "currency": nullable("string"),
            "payment_terms": nullable("string"),
            "payment_method": nullable("string"),
            "line_items": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "description": nullable("string"),
                        "quantity": nullable("number"),
                        "unit_price": nullable("number"),
                        "amount": nullable("number")
                    }
                }
            },
            "notes": nullable("string"),
            "bank_details": {
                "type": ["object", "null"],
                "properties": {
                    "bank_name": nullable("string"),
                    "account_name": nullable("string"),
                    "account_number": nullable("string"),
                    "iban": nullable("string"),
                    "swift": nullable("string")
                }
            }
        }
    })
}

/// Instruction given to the vision model; asks for the same field set as [`invoice_schema`]
pub fn vision_prompt() -> String {
    r#"You are an invoice extraction system. Read the attached invoice or receipt and return a single JSON object, with no prose and no markdown.
Fields:
- invoice_number (string|null)
- invoice_date (YYYY-MM-DD|null)
- due_date (YYYY-MM-DD|null)
- vendor_name (string|null)
- vendor_address (string|null)
- customer_name (string|null)
- customer_address (string|null)
- subtotal (number|null)
- tax_amount (number|null)
- discount_amount (number|null)
- total_amount (number|null)
- currency (ISO 4217 code|null)
- payment_terms (string|null)
- payment_method (string|null)
- line_items (array of {description, quantity, unit_price, amount})
- notes (string|null)
- bank_details ({bank_name, account_name, account_number, iban, swift}|null)
Use null for anything that is not printed on the document. Do not guess."#
        .to_string()
}
