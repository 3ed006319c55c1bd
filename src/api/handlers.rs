use std::convert::Infallible;
use std::sync::Arc;

use alloy_primitives::{Address, B256, U256};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    Json,
};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::request::decimal_u256;
use crate::models::{
    AuthorizationPayload, AuthorizationSignature, NewRequest, PaymentAuthorizationRequest,
};
use crate::notification::StatusChange;
use crate::relay::SubmitOutcome;
use crate::AppState;

/// Validity used when the merchant gives neither `valid_before` nor `valid_for_secs`.
pub const DEFAULT_VALID_FOR_SECS: i64 = 300;

// ── Request / Response DTOs ──────────────────────────────────

#[derive(Deserialize)]
pub struct CreateRequestBody {
    pub payee_address: Address,
    #[serde(with = "decimal_u256")]
    pub amount: U256,
    #[serde(default)]
    pub valid_after: i64,
    /// Absolute deadline (unix seconds). Takes precedence over `valid_for_secs`.
    pub valid_before: Option<i64>,
    pub valid_for_secs: Option<i64>,
}

#[derive(Serialize)]
pub struct SubmitResponse {
    pub id: Uuid,
    #[serde(flatten)]
    pub outcome: SubmitOutcome,
}

#[derive(Deserialize)]
pub struct PinLookupParams {
    /// When given, the response carries the typed data this payer must sign.
    pub payer: Option<Address>,
}

#[derive(Serialize)]
pub struct PinLookupResponse {
    pub request: PaymentAuthorizationRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub typed_data: Option<serde_json::Value>,
}

/// Signatures arrive either packed (`0x` + 65 bytes, r‖s‖v) or as components.
#[derive(Deserialize)]
#[serde(untagged)]
pub enum SignatureInput {
    Packed { signature: String },
    Components { v: u8, r: B256, s: B256 },
}

impl SignatureInput {
    pub fn into_signature(self) -> Result<AuthorizationSignature, AppError> {
        match self {
            SignatureInput::Packed { signature } => AuthorizationSignature::from_hex(&signature),
            SignatureInput::Components { v, r, s } => AuthorizationSignature::new(v, r, s),
        }
    }
}

#[derive(Deserialize)]
pub struct AttachSignatureBody {
    pub payer_address: Address,
    #[serde(flatten)]
    pub signature: SignatureInput,
}

// ── Merchant Handlers ────────────────────────────────────────

/// POST /api/v1/requests: create a pending request and return its PIN
pub async fn create_request(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateRequestBody>,
) -> Result<impl IntoResponse, AppError> {
    let now = state.lifecycle.clock().now().timestamp();
    let valid_before = match (payload.valid_before, payload.valid_for_secs) {
        (Some(at), _) => at,
        (None, Some(secs)) if secs > 0 => now.saturating_add(secs),
        (None, Some(_)) => {
            return Err(AppError::InvalidInput("valid_for_secs must be positive".into()))
        }
        (None, None) => now.saturating_add(DEFAULT_VALID_FOR_SECS),
    };

    let record = state
        .lifecycle
        .create(&NewRequest {
            payee_address: payload.payee_address,
            amount: payload.amount,
            valid_after: payload.valid_after,
            valid_before,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(record)))
}

/// POST /api/v1/requests/:id/submit: relay a signed request
pub async fn submit_request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SubmitResponse>, AppError> {
    let outcome = state.submitter.submit(id).await?;
    Ok(Json(SubmitResponse { id, outcome }))
}

// ── Read Handlers ────────────────────────────────────────────

/// GET /api/v1/requests/:id
pub async fn get_request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<PaymentAuthorizationRequest>, AppError> {
    Ok(Json(state.lifecycle.get(id).await?))
}

/// GET /api/v1/requests/:id/events: current status, then every change until terminal
pub async fn request_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let (snapshot, subscription) = state.lifecycle.watch(id).await?;

    let first = StatusChange {
        id,
        status: snapshot.status,
        timestamp: state.lifecycle.clock().now(),
    };
    let events = stream::once(async move { first })
        .chain(subscription.into_stream())
        .map(|change| Ok(status_event(&change)));

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn status_event(change: &StatusChange) -> Event {
    let data = serde_json::to_string(change).unwrap_or_default();
    Event::default().event("status").data(data)
}

// ── Payer Handlers ───────────────────────────────────────────

/// GET /api/v1/pins/:pin: what the payer is about to authorize
pub async fn lookup_pin(
    State(state): State<Arc<AppState>>,
    Path(pin): Path<String>,
    Query(params): Query<PinLookupParams>,
) -> Result<Json<PinLookupResponse>, AppError> {
    let request = state.lifecycle.get_by_pin(&pin).await?;
    let typed_data = params.payer.map(|payer| {
        AuthorizationPayload::for_request(&request, payer).typed_data(&state.domain)
    });
    Ok(Json(PinLookupResponse { request, typed_data }))
}

/// POST /api/v1/pins/:pin/signature: attach the payer's signature
pub async fn attach_signature(
    State(state): State<Arc<AppState>>,
    Path(pin): Path<String>,
    Json(payload): Json<AttachSignatureBody>,
) -> Result<Json<PaymentAuthorizationRequest>, AppError> {
    let signature = payload.signature.into_signature()?;
    let record = state
        .capture
        .attach_signature(&pin, payload.payer_address, signature)
        .await?;
    Ok(Json(record))
}

// ── Health ───────────────────────────────────────────────────

/// GET /healthz: process is up
pub async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// GET /readyz: the store answers queries
pub async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.lifecycle.store().get(Uuid::nil()).await {
        Ok(_) => (StatusCode::OK, Json(json!({ "status": "ready" }))),
        Err(e) => {
            tracing::error!("readiness check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable" })),
            )
        }
    }
}
