//! 请求与响应 DTO

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::error::PaymentError;

/// 未指定支付渠道时使用的默认值
pub const DEFAULT_PROVIDER: &str = "mockpay";

/// 响应中提示事件稍后由 outbox 中继发布
pub const PUBLISH_DEFERRED: &str = "PUBLISH_DEFERRED";

/// POST /approve 请求体
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproveRequest {
    #[serde(default)]
    pub order_number: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
}

/// 规范化后的审批命令
#[derive(Debug, Clone, PartialEq, Eq, Validate)]
pub struct ApproveCommand {
    #[validate(length(min = 1, max = 64, message = "订单号长度必须在1-64个字符之间"))]
    pub order_number: String,
    #[validate(length(min = 1, max = 64, message = "支付渠道长度必须在1-64个字符之间"))]
    pub provider: String,
}

impl ApproveRequest {
    /// 去除首尾空白后校验；订单号为空时不进入任何事务
    pub fn into_command(self) -> Result<ApproveCommand, PaymentError> {
        let order_number = self.order_number.unwrap_or_default().trim().to_string();
        if order_number.is_empty() {
            return Err(PaymentError::OrderNumberRequired);
        }

        let provider = match self.provider.as_deref().map(str::trim) {
            Some(p) if !p.is_empty() => p.to_string(),
            _ => DEFAULT_PROVIDER.to_string(),
        };

        let command = ApproveCommand {
            order_number,
            provider,
        };
        command.validate()?;
        Ok(command)
    }
}

/// POST /approve 响应体
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApproveResponse {
    pub ok: bool,
    pub order_number: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub already_paid: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}
