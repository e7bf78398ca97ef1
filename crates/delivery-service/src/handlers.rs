//! HTTP 处理器

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use serde_json::{Value, json};

use crate::SERVICE_NAME;
use crate::dto::{OrderResponse, UpdateStatusRequest, UpdateStatusResponse};
use crate::error::{DeliveryError, Result};
use crate::state::AppState;

/// 查询配送订单
///
/// GET /orders/{order_number}
pub async fn get_order(
    State(state): State<AppState>,
    Path(order_number): Path<String>,
) -> Result<Json<OrderResponse>> {
    let order = state.status.get_order(&order_number).await?;

    Ok(Json(OrderResponse {
        ok: true,
        order: order.into(),
    }))
}

/// 推进配送状态
///
/// PATCH /orders/{order_number}/status
pub async fn update_status(
    State(state): State<AppState>,
    Path(order_number): Path<String>,
    payload: std::result::Result<Json<UpdateStatusRequest>, JsonRejection>,
) -> Result<Json<UpdateStatusResponse>> {
    let Json(request) = payload.map_err(|rejection| DeliveryError::Validation(rejection.body_text()))?;
    let requested = request.status.unwrap_or_default();

    let status = state.status.update_status(&order_number, &requested).await?;

    Ok(Json(UpdateStatusResponse {
        ok: true,
        order_number: order_number.trim().to_string(),
        status,
    }))
}

/// 存活探针
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": SERVICE_NAME,
    }))
}

/// 就绪探针：检查数据库连接
pub async fn ready(State(state): State<AppState>) -> Json<Value> {
    let db_ok = state.db.health_check().await.is_ok();

    Json(json!({
        "status": if db_ok { "ok" } else { "degraded" },
        "service": SERVICE_NAME,
        "checks": {
            "database": if db_ok { "ok" } else { "fail" }
        }
    }))
}
