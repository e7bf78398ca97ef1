//! 配送服务错误类型

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use fulfillment_shared::error::FulfillmentError;
use fulfillment_shared::status::TransitionError;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    // 验证错误
    #[error("不支持的配送状态: {0}")]
    InvalidStatus(String),
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

impl DeliveryError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidStatus(_) | Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::OrderNotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidTransition(_) => StatusCode::CONFLICT,
            Self::Database(_) | Self::Shared(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidStatus(_) => "INVALID_STATUS",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::OrderNotFound(_) => "ORDER_NOT_FOUND",
            Self::InvalidTransition(_) => "INVALID_TRANSITION",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Shared(e) => e.code(),
        }
    }

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

impl IntoResponse for DeliveryError {
    fn into_response(self) -> Response {
        let body = json!({
            "ok": false,
            "error": self.error_code(),
            "message": self.public_message(),
        });

        (self.status_code(), axum::Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, DeliveryError>;

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_transition_conflict_reports_current_and_allowed() {
        let err = DeliveryError::from(TransitionError {
            current: "SHIPPING".to_string(),
            requested: "READY".to_string(),
            allowed: Some("DELIVERED".to_string()),
        });

        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let json = body_json(response).await;
        assert_eq!(json["ok"], false);
        assert_eq!(json["error"], "INVALID_TRANSITION");
        assert_eq!(json["message"], "current=SHIPPING, allowed=DELIVERED");
    }

    #[tokio::test]
    async fn test_terminal_state_reports_none() {
        let err = DeliveryError::from(TransitionError {
            current: "DELIVERED".to_string(),
            requested: "SHIPPING".to_string(),
            allowed: None,
        });

        let json = body_json(err.into_response()).await;
        assert_eq!(json["message"], "current=DELIVERED, allowed=none");
    }

    #[tokio::test]
    async fn test_database_error_hides_details() {
        let response = DeliveryError::Database(sqlx::Error::PoolTimedOut).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let json = body_json(response).await;
        assert_eq!(json["error"], "DATABASE_ERROR");
        assert_eq!(json["message"], "服务内部错误，请稍后重试");
    }

    #[tokio::test]
    async fn test_shared_error_is_internal() {
        let response =
            DeliveryError::from(FulfillmentError::Publish("broker 不可用".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let json = body_json(response).await;
        assert_eq!(json["error"], "PUBLISH_ERROR");
        assert_eq!(json["message"], "服务内部错误，请稍后重试");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            DeliveryError::InvalidStatus("LOST".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            DeliveryError::OrderNotFound("ORD-1".to_string()).status_code(),
            StatusCode::NOT_FOUND
        );
    }
}
