use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use hmac::{Hmac, Mac};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;
use tracing::{info, warn};

use crate::{
    errors::ServiceError,
    services::payment_reconciliation::{PaymentCallback, ReconcileOutcome},
    AppState,
};

type HmacSha256 = Hmac<Sha256>;

pub const TIMESTAMP_HEADER: &str = "x-timestamp";
pub const SIGNATURE_HEADER: &str = "x-signature";

/// Callback body sent by the payment provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentWebhook {
    pub reference_id: String,
    pub payment_request_id: String,
    #[serde(default)]
    pub provider_payment_id: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookStatus {
    Paid,
    Failed,
    Ignored,
}

impl WebhookStatus {
    pub fn classify(status: &str) -> Self {
        match status.trim().to_ascii_uppercase().as_str() {
            "PAID" | "SUCCEEDED" => WebhookStatus::Paid,
            "FAILED" | "EXPIRED" => WebhookStatus::Failed,
            _ => WebhookStatus::Ignored,
        }
    }
}

fn acknowledged(result: &str) -> Response {
    (StatusCode::OK, Json(json!({ "result": result }))).into_response()
}

/// POST /api/v1/payments/webhook
///
/// Delivery is at least once and unordered. Duplicates and callbacks that
/// conflict with a final order status are acknowledged with 200 since a retry
/// would not change anything; missing orders and storage failures are not, so
/// the provider retries.
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServiceError> {
    if let Some(secret) = state.config.payment_webhook_secret.as_deref() {
        verify_signature(
            &headers,
            &body,
            secret,
            state.config.payment_webhook_tolerance_secs,
            chrono::Utc::now().timestamp(),
        )
        .map_err(|e| {
            warn!(reason = %e, "Payment webhook signature verification failed");
            counter!("marketplace_payment_webhook_rejected_total", 1);
            e
        })?;
    }

    let webhook: PaymentWebhook = serde_json::from_slice(&body)
        .map_err(|e| ServiceError::BadRequest(format!("invalid webhook payload: {}", e)))?;
    let callback = PaymentCallback {
        reference_id: webhook.reference_id.clone(),
        payment_request_id: webhook.payment_request_id.clone(),
        provider_payment_id: webhook.provider_payment_id.clone(),
    };

    let reconciliation = &state.services.reconciliation;
    let outcome = match WebhookStatus::classify(&webhook.status) {
        WebhookStatus::Paid => reconciliation.mark_as_paid(&callback).await,
        WebhookStatus::Failed => reconciliation.mark_as_failed(&callback).await,
        WebhookStatus::Ignored => {
            info!(
                reference_id = %webhook.reference_id,
                status = %webhook.status,
                "Ignoring payment webhook with unhandled status"
            );
            return Ok(acknowledged("ignored"));
        }
    };

    match outcome {
        Ok(ReconcileOutcome::Applied) => Ok(acknowledged("applied")),
        Ok(ReconcileOutcome::AlreadyApplied) => Ok(acknowledged("already_applied")),
        Err(ServiceError::InvalidStatusTransition { .. }) => Ok(acknowledged("ignored")),
        Err(e) => Err(e),
    }
}

/// Checks `x-signature` as hex HMAC-SHA256 over `"{x-timestamp}.{body}"`.
pub fn verify_signature(
    headers: &HeaderMap,
    body: &[u8],
    secret: &str,
    tolerance_secs: u64,
    now: i64,
) -> Result<(), ServiceError> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .ok_or_else(|| ServiceError::Unauthorized(format!("missing {} header", name)))
    };
    let timestamp = header(TIMESTAMP_HEADER)?;
    let signature = header(SIGNATURE_HEADER)?;

    let ts: i64 = timestamp
        .parse()
        .map_err(|_| ServiceError::Unauthorized("malformed webhook timestamp".to_string()))?;
    if now.abs_diff(ts) > tolerance_secs {
        return Err(ServiceError::Unauthorized(
            "webhook timestamp outside tolerance".to_string(),
        ));
    }

    let expected = hex::decode(signature)
        .map_err(|_| ServiceError::Unauthorized("malformed webhook signature".to_string()))?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ServiceError::InternalError(format!("webhook key: {}", e)))?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| ServiceError::Unauthorized("invalid webhook signature".to_string()))
}

/// Produces the signature the provider would send; used by tests and local tooling.
pub fn sign_payload(secret: &str, timestamp: i64, body: &[u8]) -> Result<String, ServiceError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ServiceError::InternalError(format!("webhook key: {}", e)))?;
    mac.update(format!("{}.", timestamp).as_bytes());
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}
