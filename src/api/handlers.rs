use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use super::identity::{CallerIdentity, IdentityResolver};
use super::response::success;
use super::AppState;
use crate::error::GenieError;
use crate::ingest::{audit, ProcessRequest};
use crate::models::{InvoiceFields, NewInvoice, NewLineItem, ProcessingStatus};
use crate::store::{extracted, invoices};

type ApiResult = std::result::Result<Response, GenieError>;

fn json_body<T>(body: std::result::Result<Json<T>, JsonRejection>) -> std::result::Result<T, GenieError> {
    body.map(|Json(value)| value)
        .map_err(|rejection| GenieError::InvalidInput(rejection.body_text()))
}

async fn caller(resolver: &dyn IdentityResolver, headers: &HeaderMap) -> std::result::Result<CallerIdentity, GenieError> {
    resolver.resolve(headers).await
}

pub async fn health() -> Response {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "service": "invoice-genie",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
        .into_response()
}

async fn process(
    state: &AppState,
    resolver: &dyn IdentityResolver,
    headers: &HeaderMap,
    body: std::result::Result<Json<ProcessRequest>, JsonRejection>,
) -> ApiResult {
    let identity = caller(resolver, headers).await?;
    let request = json_body(body)?;
    let outcome = state.orchestrator.process(&identity.account_id, request).await?;
    Ok(success(StatusCode::OK, outcome))
}

/// `POST /api/process-invoice` (web session)
pub async fn process_web(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: std::result::Result<Json<ProcessRequest>, JsonRejection>,
) -> ApiResult {
    process(&state, state.web.as_ref(), &headers, body).await
}

/// `POST /api/mobile/process-invoice` (bearer token)
pub async fn process_mobile(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: std::result::Result<Json<ProcessRequest>, JsonRejection>,
) -> ApiResult {
    process(&state, state.mobile.as_ref(), &headers, body).await
}

pub async fn create_invoice(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: std::result::Result<Json<NewInvoice>, JsonRejection>,
) -> ApiResult {
    let identity = caller(state.any.as_ref(), &headers).await?;
    let new = json_body(body)?;
    let invoice = invoices::create_invoice(state.orchestrator.db(), &identity.account_id, new).await?;
    Ok(success(StatusCode::CREATED, invoice))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub project_id: Option<String>,
    pub status: Option<String>,
}

pub async fn list_invoices(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> ApiResult {
    let identity = caller(state.any.as_ref(), &headers).await?;
    let status = params
        .status
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(str::parse::<ProcessingStatus>)
        .transpose()?;
    let list = invoices::list_invoices(state.orchestrator.db(), &identity.account_id, params.project_id, status).await?;
    Ok(success(StatusCode::OK, list))
}

pub async fn get_invoice(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(invoice_id): Path<String>,
) -> ApiResult {
    let identity = caller(state.any.as_ref(), &headers).await?;
    let db = state.orchestrator.db();
    let invoice = invoices::get_invoice(db, &identity.account_id, &invoice_id)
        .await?
        .ok_or_else(|| GenieError::InvoiceNotFound(invoice_id.clone()))?;

    let projection = match extracted::get_extracted_for_invoice(db, &identity.account_id, &invoice_id).await? {
        Some(record) => {
            let items = extracted::list_line_items(db, &record.id).await?;
            Some(record.projection(&items))
        }
        None => None,
    };
    let events = audit::list_events(db, &identity.account_id, &invoice_id).await?;

    Ok(success(
        StatusCode::OK,
        json!({
            "invoice": invoice,
            "extracted": projection,
            "events": events,
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ReviewLineItem {
    pub description: Option<String>,
    pub quantity: Option<f64>,
    pub unit_price: Option<f64>,
    pub amount: Option<f64>,
}

impl From<ReviewLineItem> for NewLineItem {
    fn from(item: ReviewLineItem) -> Self {
        NewLineItem {
            description: item
                .description
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty())
                .unwrap_or_else(|| "Item".to_string()),
            quantity: item.quantity.unwrap_or(1.0),
            unit_price: item.unit_price.unwrap_or(0.0),
            amount: item.amount.unwrap_or(0.0),
        }
    }
}

/// Reviewer edit: the full field set plus the full line-item set
#[derive(Debug, Deserialize)]
pub struct ReviewRequest {
    #[serde(flatten)]
    pub fields: InvoiceFields,
    #[serde(default)]
    pub line_items: Vec<ReviewLineItem>,
}

pub async fn review_extracted(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(invoice_id): Path<String>,
    body: std::result::Result<Json<ReviewRequest>, JsonRejection>,
) -> ApiResult {
    let identity = caller(state.any.as_ref(), &headers).await?;
    let review = json_body(body)?;
    let items: Vec<NewLineItem> = review.line_items.into_iter().map(NewLineItem::from).collect();
    let (record, items) = extracted::apply_review(
        state.orchestrator.db(),
        &identity.account_id,
        &invoice_id,
        review.fields,
        items,
    )
    .await?;
    log::info!("Invoice {} reviewed ({} line items)", invoice_id, items.len());
    Ok(success(StatusCode::OK, record.projection(&items)))
}

pub async fn retry_invoice(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(invoice_id): Path<String>,
) -> ApiResult {
    let identity = caller(state.any.as_ref(), &headers).await?;
    let invoice = invoices::reset_for_retry(state.orchestrator.db(), &identity.account_id, &invoice_id).await?;
    Ok(success(StatusCode::OK, invoice))
}

pub async fn usage(State(state): State<AppState>, headers: HeaderMap) -> ApiResult {
    let identity = caller(state.any.as_ref(), &headers).await?;
    let counter = state.orchestrator.ledger().counter(&identity.account_id).await?;
    Ok(success(
        StatusCode::OK,
        json!({
            "period": counter.period,
            "pages_processed": counter.pages_processed,
            "page_quota": counter.page_quota,
            "remaining": counter.remaining(),
        }),
    ))
}
