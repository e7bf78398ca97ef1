//! 支付侧仓储
//!
//! 审批与 outbox 中继的写操作都在调用方开启的事务里执行，
//! 这里的函数只接收 `&mut PgConnection`，事务边界由服务层掌握。

use chrono::{DateTime, Utc};
use fulfillment_shared::error::FulfillmentError;
use fulfillment_shared::events::{DomainEvent, OrderItem};
use fulfillment_shared::status::PaymentStatus;
use sqlx::{FromRow, PgConnection, PgPool};
use uuid::Uuid;

use crate::error::Result;

/// 支付记录状态
pub const PAY_STATUS_APPROVED: &str = "APPROVED";

/// 支付侧订单
#[derive(Debug, Clone, FromRow)]
pub struct OrderRow {
    pub order_id: i64,
    pub order_number: String,
    pub customer_id: Option<i64>,
    pub order_status: String,
    pub total_amount: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct PaymentRow {
    pub payment_id: i64,
    pub order_id: i64,
    pub customer_id: Option<i64>,
    pub pay_status: String,
    pub amount: i64,
    pub provider: String,
    pub approved_at: DateTime<Utc>,
}

/// 待发布的 outbox 记录
#[derive(Debug, Clone, FromRow)]
pub struct OutboxRow {
    pub event_id: Uuid,
    pub aggregate_id: String,
    pub routing_key: String,
    pub payload: serde_json::Value,
    pub attempts: i32,
}

/// 订单与支付记录
pub struct PaymentRepository {
    pool: PgPool,
}

impl PaymentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // ==================== 查询操作 ====================

    pub async fn get_order(&self, order_number: &str) -> Result<Option<OrderRow>> {
        let order = sqlx::query_as::<_, OrderRow>(
            r#"
            SELECT order_id, order_number, customer_id, order_status, total_amount
            FROM orders
            WHERE order_number = $1
            "#,
        )
        .bind(order_number)
        .fetch_optional(&self.pool)
        .await?;

        Ok(order)
    }

    pub async fn list_payments(&self, order_id: i64) -> Result<Vec<PaymentRow>> {
        let payments = sqlx::query_as::<_, PaymentRow>(
            r#"
            SELECT payment_id, order_id, customer_id, pay_status, amount, provider, approved_at
            FROM payments
            WHERE order_id = $1
            ORDER BY payment_id
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(payments)
    }

    // ==================== 事务操作 ====================

    /// 在事务中按订单号锁定订单行
    pub async fn find_order_for_update(
        conn: &mut PgConnection,
        order_number: &str,
    ) -> Result<Option<OrderRow>> {
        let order = sqlx::query_as::<_, OrderRow>(
            r#"
            SELECT order_id, order_number, customer_id, order_status, total_amount
            FROM orders
            WHERE order_number = $1
            FOR UPDATE
            "#,
        )
        .bind(order_number)
        .fetch_optional(conn)
        .await?;

        Ok(order)
    }

    /// 写入一条已批准的支付记录，金额取订单总额
    pub async fn insert_approved_payment(
        conn: &mut PgConnection,
        order: &OrderRow,
        provider: &str,
    ) -> Result<i64> {
        let (payment_id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO payments (order_id, customer_id, pay_status, amount, provider, approved_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            RETURNING payment_id
            "#,
        )
        .bind(order.order_id)
        .bind(order.customer_id)
        .bind(PAY_STATUS_APPROVED)
        .bind(order.total_amount)
        .bind(provider)
        .fetch_one(conn)
        .await?;

        Ok(payment_id)
    }

    pub async fn update_order_status(
        conn: &mut PgConnection,
        order_id: i64,
        status: PaymentStatus,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE orders
            SET order_status = $2, updated_at = NOW()
            WHERE order_id = $1
            "#,
        )
        .bind(order_id)
        .bind(status.as_str())
        .execute(conn)
        .await?;

        Ok(())
    }

    /// 订单行，按行 ID 升序
    pub async fn list_order_items(conn: &mut PgConnection, order_id: i64) -> Result<Vec<OrderItem>> {
        let rows: Vec<(String, i32)> = sqlx::query_as(
            r#"
            SELECT skuid, qty
            FROM order_items
            WHERE order_id = $1
            ORDER BY order_item_id ASC
            "#,
        )
        .bind(order_id)
        .fetch_all(conn)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(skuid, qty)| OrderItem { skuid, qty })
            .collect())
    }
}

/// outbox 表
pub struct OutboxRepository;

impl OutboxRepository {
    /// 在审批事务中写入待发布事件
    pub async fn insert(conn: &mut PgConnection, event: &DomainEvent) -> Result<()> {
        let payload = event.to_value().map_err(FulfillmentError::from)?;

        sqlx::query(
            r#"
            INSERT INTO outbox_events (event_id, aggregate_id, event_type, routing_key, payload, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.event_id())
        .bind(&event.data().order_number)
        .bind(event.event_type())
        .bind(event.routing_key())
        .bind(payload)
        .bind(event.occurred_at())
        .execute(conn)
        .await?;

        Ok(())
    }

    /// 锁定指定的未发布事件；已发布或正被其他中继持有时返回 None
    pub async fn lock_pending(conn: &mut PgConnection, event_id: Uuid) -> Result<Option<OutboxRow>> {
        let row = sqlx::query_as::<_, OutboxRow>(
            r#"
            SELECT event_id, aggregate_id, routing_key, payload, attempts
            FROM outbox_events
            WHERE event_id = $1 AND published_at IS NULL
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(event_id)
        .fetch_optional(conn)
        .await?;

        Ok(row)
    }

    /// 按创建顺序锁定一批未发布事件，跳过其他中继已持有的行
    pub async fn lock_pending_batch(conn: &mut PgConnection, limit: i64) -> Result<Vec<OutboxRow>> {
        let rows = sqlx::query_as::<_, OutboxRow>(
            r#"
            SELECT event_id, aggregate_id, routing_key, payload, attempts
            FROM outbox_events
            WHERE published_at IS NULL
            ORDER BY created_at
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(limit)
        .fetch_all(conn)
        .await?;

        Ok(rows)
    }

    pub async fn mark_published(conn: &mut PgConnection, event_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE outbox_events
            SET published_at = NOW(), attempts = attempts + 1, last_error = NULL
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .execute(conn)
        .await?;

        Ok(())
    }

    pub async fn record_failure(conn: &mut PgConnection, event_id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE outbox_events
            SET attempts = attempts + 1, last_error = $2
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(error)
        .execute(conn)
        .await?;

        Ok(())
    }

    pub async fn count_pending(pool: &PgPool) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM outbox_events WHERE published_at IS NULL")
                .fetch_one(pool)
                .await?;

        Ok(count)
    }
}
