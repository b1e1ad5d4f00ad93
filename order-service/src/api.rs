use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::json;
use shared::*;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::confirm::{confirm_payment, ConfirmError};
use crate::coordinator::{Coordinator, ReconcileError};
use crate::processor::{PaymentProcessor, ProcessorError};
use crate::signature::SIGNATURE_HEADER;
use crate::webhook::EventIntake;

type ApiError = (StatusCode, Json<ErrorResponse>);

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Coordinator,
    pub processor: Arc<dyn PaymentProcessor>,
    pub intake: Arc<EventIntake>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/webhooks/payments", post(receive_webhook))
        .route("/payments/confirm", post(confirm))
        .route("/orders/by-reference/:reference", get(order_by_reference))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

fn api_error(status: StatusCode, error: impl ToString) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

/// Acknowledges as soon as the event is authenticated; reconciliation runs
/// in the background and the processor's redelivery covers any failure.
/// Only a bad signature or an unparseable envelope is a 400.
pub async fn receive_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "missing signature header"))?;

    match state.intake.accept(&body, signature) {
        Ok(intake) => {
            state.intake.dispatch(intake);
            Ok(Json(json!({ "received": true })))
        }
        Err(e) => {
            tracing::error!("Rejected webhook delivery: {}", e);
            Err(api_error(StatusCode::BAD_REQUEST, e))
        }
    }
}

pub async fn confirm(
    State(state): State<AppState>,
    Json(request): Json<ConfirmRequest>,
) -> Result<Json<ConfirmResponse>, ApiError> {
    match confirm_payment(state.processor.as_ref(), &state.coordinator, &request).await {
        Ok(response) => Ok(Json(response)),
        Err(e) => {
            tracing::error!(payment_reference = %request.payment_reference, "Confirmation failed: {}", e);
            let status = match &e {
                ConfirmError::Processor(ProcessorError::NotFound(_)) => StatusCode::NOT_FOUND,
                ConfirmError::Processor(_) => StatusCode::BAD_GATEWAY,
                ConfirmError::WrongUser(_) => StatusCode::FORBIDDEN,
                ConfirmError::Reconcile(ReconcileError::NotSucceeded { .. })
                | ConfirmError::Reconcile(ReconcileError::InvalidOrder { .. }) => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                ConfirmError::Reconcile(_) => StatusCode::SERVICE_UNAVAILABLE,
            };
            Err(api_error(status, e))
        }
    }
}

pub async fn order_by_reference(
    State(state): State<AppState>,
    Path(reference): Path<String>,
) -> Result<Json<OrderView>, ApiError> {
    match state.coordinator.find_order(&reference).await {
        Ok(Some(order)) => Ok(Json(order)),
        Ok(None) => Err(api_error(StatusCode::NOT_FOUND, "order not found")),
        Err(e) => {
            tracing::error!(payment_reference = %reference, "Order lookup failed: {}", e);
            Err(api_error(StatusCode::SERVICE_UNAVAILABLE, e))
        }
    }
}

pub async fn health_check() -> &'static str {
    "OK"
}
