//! 支付服务错误类型
//!
//! 业务错误映射为 4xx 并原样返回消息，系统错误只记录日志，对外返回通用提示。

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use fulfillment_shared::error::FulfillmentError;
use fulfillment_shared::status::TransitionError;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    // 验证错误
    #[error("orderNumber 不能为空")]
    OrderNumberRequired,
    #[error("参数验证失败: {0}")]
    Validation(String),

    // 资源不存在
    #[error("订单不存在: {0}")]
    OrderNotFound(String),

    // 业务冲突
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    // 系统错误
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Shared(#[from] FulfillmentError),
}

impl PaymentError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::OrderNumberRequired | Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::OrderNotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidTransition(_) => StatusCode::CONFLICT,
            Self::Database(_) | Self::Shared(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::OrderNumberRequired => "ORDER_NUMBER_REQUIRED",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::OrderNotFound(_) => "ORDER_NOT_FOUND",
            Self::InvalidTransition(_) => "INVALID_TRANSITION",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Shared(e) => e.code(),
        }
    }

    /// 对外返回的消息
    fn public_message(&self) -> String {
        match self {
            Self::InvalidTransition(e) => {
                format!(
                    "current={}, allowed={}",
                    e.current,
                    e.allowed.as_deref().unwrap_or("none")
                )
            }
            Self::Database(e) => {
                tracing::error!(error = %e, "数据库操作失败");
                "服务内部错误，请稍后重试".to_string()
            }
            Self::Shared(e) => {
                tracing::error!(error = %e, code = e.code(), "基础设施错误");
                "服务内部错误，请稍后重试".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for PaymentError {
    fn into_response(self) -> Response {
        let body = json!({
            "ok": false,
            "error": self.error_code(),
            "message": self.public_message(),
        });

        (self.status_code(), axum::Json(body)).into_response()
    }
}

impl From<validator::ValidationErrors> for PaymentError {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::Validation(errors.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PaymentError>;
