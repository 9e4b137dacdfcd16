use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::Response,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    db::query_builder::{OrderListParams, OrderQuery},
    entities::OrderStatus,
    errors::ServiceError,
    handlers::common::{created_response, require_admin, success_response, PaginatedResponse},
    AppState,
};

#[derive(Debug, Deserialize)]
pub struct UpdateOrderStatusRequest {
    pub status: String,
}

/// GET /api/v1/orders
pub async fn list_orders(
    State(state): State<AppState>,
    Query(params): Query<OrderListParams>,
) -> Result<Response, ServiceError> {
    let query = OrderQuery::try_from(params)?;
    let page = state.services.orders.list_orders(&query).await?;
    Ok(success_response(PaginatedResponse::new(
        page.orders,
        page.total,
        page.page,
        page.limit,
    )))
}

/// GET /api/v1/orders/:id
pub async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ServiceError> {
    let order = state.services.orders.get_order(id).await?;
    Ok(success_response(order))
}

/// GET /api/v1/orders/external/:external_id
pub async fn get_order_by_external_id(
    State(state): State<AppState>,
    Path(external_id): Path<String>,
) -> Result<Response, ServiceError> {
    let order = state
        .services
        .orders
        .get_order_by_external_id(&external_id)
        .await?;
    Ok(success_response(order))
}

/// POST /api/v1/orders/external/:external_id/payment
pub async fn initiate_payment(
    State(state): State<AppState>,
    Path(external_id): Path<String>,
) -> Result<Response, ServiceError> {
    let payment = state.services.payments.initiate_payment(&external_id).await?;
    Ok(created_response(payment))
}

/// PUT /api/v1/orders/:id/status
pub async fn update_order_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<UpdateOrderStatusRequest>,
) -> Result<Response, ServiceError> {
    require_admin(&headers, state.config.admin_api_token.as_deref())?;
    let status: OrderStatus = request
        .status
        .parse()
        .map_err(|_| ServiceError::InvalidInput(format!("unknown order status '{}'", request.status)))?;
    let order = state.services.orders.update_order_status(id, status).await?;
    Ok(success_response(order))
}
