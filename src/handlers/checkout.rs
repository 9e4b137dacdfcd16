use axum::{
    extract::{Path, State},
    response::Response,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::{
    entities::payment,
    errors::ServiceError,
    handlers::common::{created_response, success_response},
    services::{checkout_sessions::CreateSessionInput, orders::ConfirmedOrder},
    AppState,
};

#[derive(Debug, Deserialize)]
pub struct UpdateAddressRequest {
    pub address_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct ConfirmResponse {
    pub order: ConfirmedOrder,
    /// Absent when the provider could not be reached; the order stands and payment can be retried.
    pub payment: Option<payment::Model>,
}

/// POST /api/v1/checkout/sessions
pub async fn create_session(
    State(state): State<AppState>,
    Json(input): Json<CreateSessionInput>,
) -> Result<Response, ServiceError> {
    let session = state.services.checkout_sessions.create_session(input).await?;
    Ok(created_response(session))
}

/// GET /api/v1/checkout/sessions/:external_id
pub async fn get_session(
    State(state): State<AppState>,
    Path(external_id): Path<String>,
) -> Result<Response, ServiceError> {
    let session = state.services.checkout_sessions.get_session(&external_id).await?;
    Ok(success_response(session))
}

/// PUT /api/v1/checkout/sessions/:external_id/address
pub async fn update_session_address(
    State(state): State<AppState>,
    Path(external_id): Path<String>,
    Json(request): Json<UpdateAddressRequest>,
) -> Result<Response, ServiceError> {
    let session = state
        .services
        .checkout_sessions
        .update_session_address(&external_id, request.address_id)
        .await?;
    Ok(success_response(session))
}

/// POST /api/v1/checkout/sessions/:external_id/cancel
pub async fn cancel_session(
    State(state): State<AppState>,
    Path(external_id): Path<String>,
) -> Result<Response, ServiceError> {
    let session = state.services.checkout_sessions.cancel_session(&external_id).await?;
    Ok(success_response(session))
}

/// POST /api/v1/checkout/sessions/:external_id/confirm
///
/// Payment initiation runs after the order commits; its failure never undoes the order.
pub async fn confirm_session(
    State(state): State<AppState>,
    Path(external_id): Path<String>,
) -> Result<Response, ServiceError> {
    let order = state.services.orders.confirm_session(&external_id).await?;

    let payment = match state
        .services
        .payments
        .initiate_payment(&order.external_id)
        .await
    {
        Ok(payment) => Some(payment),
        Err(e) => {
            warn!(order = %order.external_id, error = %e, "Payment initiation failed after confirmation");
            None
        }
    };

    Ok(created_response(ConfirmResponse { order, payment }))
}
