//! HTTP 处理器

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use serde_json::{Value, json};
use tracing::warn;

use crate::SERVICE_NAME;
use crate::dto::{ApproveRequest, ApproveResponse};
use crate::error::{PaymentError, Result};
use crate::state::AppState;

/// 审批支付
///
/// POST /approve
pub async fn approve(
    State(state): State<AppState>,
    payload: std::result::Result<Json<ApproveRequest>, JsonRejection>,
) -> Result<Json<ApproveResponse>> {
    let Json(request) = payload.map_err(|rejection| {
        warn!(error = %rejection, "审批请求体无法解析");
        PaymentError::Validation(rejection.body_text())
    })?;

    let command = request.into_command()?;
    let outcome = state.approval.approve(&command).await?;

    Ok(Json(outcome.into()))
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
