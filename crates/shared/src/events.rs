//! 领域事件模型
//!
//! 定义跨服务传递的事件信封与支付完成事件的负载格式，
//! 以及消费端使用的两段式解码：先读事件类型标签，再按类型解码负载。
//! 未来如果负载出现可选字段，应当新增带版本的事件类型，而不是在运行时探测字段。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// 事件类型标签常量，同时作为 Kafka 路由键使用
pub mod event_types {
    /// 支付完成
    pub const PAYMENT_ORDER_PAID: &str = "payment.order.paid";
}

// ---------------------------------------------------------------------------
// 负载
// ---------------------------------------------------------------------------

/// 订单行
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub skuid: String,
    pub qty: i32,
}

/// 支付完成事件负载
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPaidData {
    pub order_number: String,
    /// 没有客户信息时序列化为 null
    #[serde(default, deserialize_with = "integral::deserialize_option")]
    pub customer_id: Option<i64>,
    #[serde(default)]
    pub items: Vec<OrderItem>,
    /// 订单总额（最小货币单位）
    #[serde(deserialize_with = "integral::deserialize")]
    pub total_amount: i64,
}

impl OrderPaidData {
    /// 全部订单行的件数合计
    pub fn total_quantity(&self) -> i64 {
        self.items.iter().map(|item| item.qty as i64).sum()
    }
}

/// 线上格式中的数值字段是 JSON number
///
/// 其他生产者可能写出 `12000.0` 这类浮点表示；小数部分为零时按整数接收，
/// 带小数的金额无法无损换算成最小货币单位，解码失败。
mod integral {
    use serde::de::{self, Deserialize, Deserializer};

    fn to_i64<E: de::Error>(number: serde_json::Number) -> Result<i64, E> {
        if let Some(value) = number.as_i64() {
            return Ok(value);
        }

        match number.as_f64() {
            Some(value)
                if value.fract() == 0.0 && value >= i64::MIN as f64 && value < i64::MAX as f64 =>
            {
                Ok(value as i64)
            }
            _ => Err(E::custom(format!("expected an integral number, got {number}"))),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        to_i64(serde_json::Number::deserialize(deserializer)?)
    }

    pub fn deserialize_option<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<i64>, D::Error> {
        Option::<serde_json::Number>::deserialize(deserializer)?
            .map(to_i64::<D::Error>)
            .transpose()
    }
}

// ---------------------------------------------------------------------------
// DomainEvent — 事件信封
// ---------------------------------------------------------------------------

/// 领域事件信封
///
/// 由支付服务在审批事务内创建，之后只读。字段私有，只能通过构造函数生成，
/// 保证 `event_id` 与 `type` 在整个生命周期内不变。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    /// 全局唯一事件 ID，消费端据此去重
    event_id: Uuid,
    occurred_at: DateTime<Utc>,
    #[serde(rename = "type")]
    event_type: String,
    data: OrderPaidData,
}

impl DomainEvent {
    /// 构建支付完成事件，自动生成 UUID v7 并记录当前时间
    pub fn order_paid(data: OrderPaidData) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            occurred_at: Utc::now(),
            event_type: event_types::PAYMENT_ORDER_PAID.to_string(),
            data,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn data(&self) -> &OrderPaidData {
        &self.data
    }

    /// 路由键与事件类型一致
    pub fn routing_key(&self) -> &str {
        &self.event_type
    }

    /// 序列化为 JSON 字节
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// 序列化为 JSON 值（写入 outbox 的 JSONB 列）
    pub fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// 从 outbox 中存储的 JSON 值还原
    pub fn from_value(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

// ---------------------------------------------------------------------------
// 消费端解码
// ---------------------------------------------------------------------------

/// 消费端解码结果
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingEvent {
    /// 支付完成事件
    OrderPaid(DomainEvent),
    /// 本服务不关心的事件类型，确认后丢弃
    Unrecognized { event_type: String },
}

/// 解码失败
#[derive(Debug, Error)]
pub enum DecodeError {
    /// 不是 JSON 或没有类型标签，无从判断是否属于本服务
    #[error("消息体不是合法的事件信封: {0}")]
    Malformed(#[from] serde_json::Error),

    /// 类型标签可识别，但负载不符合该类型的格式
    #[error("{event_type} 事件负载无法解码: {source}")]
    InvalidPayload {
        event_type: String,
        source: serde_json::Error,
    },

    #[error("事件负载缺少必填字段: {0}")]
    MissingField(&'static str),
}

impl DecodeError {
    /// 已识别类型的事件解码失败，重投递也不会改变结果，需要隔离而不是丢弃
    pub fn is_recognized_event(&self) -> bool {
        matches!(self, Self::InvalidPayload { .. } | Self::MissingField(_))
    }
}

/// 只读取类型标签的信封头
#[derive(Deserialize)]
struct EnvelopeHeader {
    #[serde(rename = "type")]
    event_type: String,
}

/// 两段式解码：先识别事件类型，再解码对应负载
pub fn decode_event(payload: &[u8]) -> Result<IncomingEvent, DecodeError> {
    let header: EnvelopeHeader = serde_json::from_slice(payload)?;

    if header.event_type != event_types::PAYMENT_ORDER_PAID {
        return Ok(IncomingEvent::Unrecognized {
            event_type: header.event_type,
        });
    }

    let event: DomainEvent =
        serde_json::from_slice(payload).map_err(|source| DecodeError::InvalidPayload {
            event_type: header.event_type,
            source,
        })?;
    if event.data.order_number.trim().is_empty() {
        return Err(DecodeError::MissingField("data.orderNumber"));
    }

    Ok(IncomingEvent::OrderPaid(event))
}
