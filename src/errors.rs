use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};

use crate::entities::OrderStatus;

fn current_request_id() -> Option<String> {
    crate::tracing::current_request_id().map(|rid| rid.as_str().to_string())
}

/// JSON body returned for every failed request.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g. "Not Found", "Unprocessable Entity")
    pub error: String,
    /// Machine-readable reason callers can branch on (e.g. "insufficient_stock")
    pub code: String,
    /// Human-readable error description
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    /// Transient storage failure (connection, transaction or commit).
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        DbErr,
    ),

    #[error("Checkout session not found: {0}")]
    SessionNotFound(String),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Variant not found: {0}")]
    VariantNotFound(String),

    #[error("Address not found: {0}")]
    AddressNotFound(String),

    #[error("Checkout session already confirmed: {0}")]
    AlreadyConfirmed(String),

    #[error("Checkout session is not pending: {0}")]
    SessionNotPending(String),

    #[error("Insufficient stock: {0}")]
    InsufficientStock(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidStatusTransition { from: OrderStatus, to: OrderStatus },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(
        #[from]
        #[serde(skip)]
        anyhow::Error,
    ),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl ServiceError {
    /// Returns the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DatabaseError(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::SessionNotFound(_)
            | Self::OrderNotFound(_)
            | Self::VariantNotFound(_)
            | Self::AddressNotFound(_) => StatusCode::NOT_FOUND,
            Self::AlreadyConfirmed(_)
            | Self::SessionNotPending(_)
            | Self::InvalidStatusTransition { .. }
            | Self::Conflict(_) => StatusCode::CONFLICT,
            Self::InsufficientStock(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::InvalidInput(_) | Self::ValidationError(_) | Self::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::ExternalServiceError(_) => StatusCode::BAD_GATEWAY,
            Self::InternalError(_) | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable reason code for callers that need to pick actionable copy.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DatabaseError(_) => "storage_error",
            Self::SessionNotFound(_) => "session_not_found",
            Self::OrderNotFound(_) => "order_not_found",
            Self::VariantNotFound(_) => "variant_not_found",
            Self::AddressNotFound(_) => "address_not_found",
            Self::AlreadyConfirmed(_) => "already_confirmed",
            Self::SessionNotPending(_) => "session_not_pending",
            Self::InsufficientStock(_) => "insufficient_stock",
            Self::InvalidInput(_) => "invalid_input",
            Self::ValidationError(_) => "validation_error",
            Self::InvalidStatusTransition { .. } => "invalid_status_transition",
            Self::Conflict(_) => "conflict",
            Self::Unauthorized(_) => "unauthorized",
            Self::BadRequest(_) => "bad_request",
            Self::ExternalServiceError(_) => "external_service_error",
            Self::InternalError(_) | Self::Other(_) => "internal_error",
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::DatabaseError(_) | Self::ExternalServiceError(_) | Self::Other(_)
        )
    }

    /// Returns the error message suitable for HTTP responses.
    /// Storage and internal errors return generic messages.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Temporary storage failure, please retry".to_string(),
            Self::InternalError(_) | Self::Other(_) => "Internal server error".to_string(),
            Self::ExternalServiceError(_) => "Payment provider unavailable".to_string(),
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, code = self.code(), "request failed");
        }

        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            code: self.code().to_string(),
            message: self.response_message(),
            request_id: current_request_id(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn error_response_carries_code_and_request_id() {
        let response =
            crate::tracing::scope_request_id(crate::tracing::RequestId::new("req-123"), async {
                ServiceError::InsufficientStock("variant v1".into()).into_response()
            })
            .await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let payload: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload.request_id.as_deref(), Some("req-123"));
        assert_eq!(payload.code, "insufficient_stock");
    }

    #[test]
    fn status_code_mapping() {
        assert_eq!(
            ServiceError::SessionNotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ServiceError::AlreadyConfirmed("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ServiceError::SessionNotPending("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ServiceError::InvalidInput("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServiceError::InvalidStatusTransition {
                from: OrderStatus::Paid,
                to: OrderStatus::Failed
            }
            .status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ServiceError::DatabaseError(DbErr::Custom("boom".into())).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn response_message_hides_storage_details() {
        let err = ServiceError::DatabaseError(DbErr::Custom("password=secret".into()));
        assert!(!err.response_message().contains("secret"));
        assert!(err.is_transient());

        assert_eq!(
            ServiceError::OrderNotFound("ord_1".into()).response_message(),
            "Order not found: ord_1"
        );
        assert!(!ServiceError::InsufficientStock("v".into()).is_transient());
    }

    #[test]
    fn transition_error_names_both_statuses() {
        let err = ServiceError::InvalidStatusTransition {
            from: OrderStatus::Paid,
            to: OrderStatus::Failed,
        };
        assert_eq!(
            err.to_string(),
            "Invalid status transition from paid to failed"
        );
    }
}
