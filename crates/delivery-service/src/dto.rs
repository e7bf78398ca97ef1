//! 请求与响应 DTO

use chrono::{DateTime, Utc};
use fulfillment_shared::status::DeliveryStatus;
use serde::{Deserialize, Serialize};

use crate::repository::DeliveryOrderRow;

/// PATCH /orders/{order_number}/status 请求体
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateStatusRequest {
    #[serde(default)]
    pub status: Option<String>,
}

/// 订单快照，字段名与数据库列一致
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderView {
    pub order_number: String,
    pub center_id: i64,
    pub ordered_at: DateTime<Utc>,
    pub order_status: String,
    pub customer_id: Option<i64>,
    pub customer_address: Option<String>,
    pub unit: i32,
    pub cost: Option<i64>,
}

impl From<DeliveryOrderRow> for OrderView {
    fn from(row: DeliveryOrderRow) -> Self {
        Self {
            order_number: row.order_number,
            center_id: row.center_id,
            ordered_at: row.ordered_at,
            order_status: row.order_status,
            customer_id: row.customer_id,
            customer_address: row.customer_address,
            unit: row.unit,
            cost: row.cost,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderResponse {
    pub ok: bool,
    pub order: OrderView,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStatusResponse {
    pub ok: bool,
    pub order_number: String,
    pub status: DeliveryStatus,
}
