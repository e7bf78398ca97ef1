//! 配送侧仓储
//!
//! 写操作只接收 `&mut PgConnection`，由处理器/服务层在同一事务里组合调用。

use chrono::{DateTime, Utc};
use fulfillment_shared::events::OrderPaidData;
use fulfillment_shared::status::DeliveryStatus;
use sqlx::{FromRow, PgConnection, PgPool};
use uuid::Uuid;

use crate::error::Result;

/// 默认配送中心
pub const DEFAULT_CENTER_ID: i64 = 1;
pub const DEFAULT_CENTER_NAME: &str = "DEFAULT_CENTER";

/// 配送侧订单快照
#[derive(Debug, Clone, FromRow)]
pub struct DeliveryOrderRow {
    pub order_id: i64,
    pub order_number: String,
    pub center_id: i64,
    pub ordered_at: DateTime<Utc>,
    pub order_status: String,
    pub customer_id: Option<i64>,
    pub customer_address: Option<String>,
    pub unit: i32,
    pub cost: Option<i64>,
}

/// 收件箱
pub struct InboxRepository;

impl InboxRepository {
    /// 认领事件；事件已被处理过时返回 false
    ///
    /// 主键冲突时不报错也不插入，并发认领同一事件时后到者会阻塞到先到者结束，
    /// 先到者提交则返回 false，回滚则认领成功。
    pub async fn claim(conn: &mut PgConnection, event_id: Uuid, event_type: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO inbox_events (event_id, event_type, processed_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .execute(conn)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn exists(pool: &PgPool, event_id: Uuid) -> Result<bool> {
        let (exists,): (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM inbox_events WHERE event_id = $1)")
                .bind(event_id)
                .fetch_one(pool)
                .await?;

        Ok(exists)
    }
}

/// 配送中心
pub struct CenterRepository;

impl CenterRepository {
    pub async fn ensure_default(conn: &mut PgConnection) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO centers (center_id, center_name)
            VALUES ($1, $2)
            ON CONFLICT (center_id) DO NOTHING
            "#,
        )
        .bind(DEFAULT_CENTER_ID)
        .bind(DEFAULT_CENTER_NAME)
        .execute(conn)
        .await?;

        Ok(())
    }
}

/// 配送订单
pub struct DeliveryOrderRepository {
    pool: PgPool,
}

impl DeliveryOrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // ==================== 查询操作 ====================

    pub async fn get_order(&self, order_number: &str) -> Result<Option<DeliveryOrderRow>> {
        let order = sqlx::query_as::<_, DeliveryOrderRow>(
            r#"
            SELECT order_id, order_number, center_id, ordered_at, order_status,
                   customer_id, customer_address, unit, cost
            FROM orders
            WHERE order_number = $1
            "#,
        )
        .bind(order_number)
        .fetch_optional(&self.pool)
        .await?;

        Ok(order)
    }

    // ==================== 事务操作 ====================

    /// 按订单号写入 READY 订单，返回 order_id
    ///
    /// 订单已存在时保留原有状态，只补全缺失的客户信息。
    pub async fn upsert_ready(conn: &mut PgConnection, data: &OrderPaidData) -> Result<i64> {
        let unit = i32::try_from(data.total_quantity()).unwrap_or(i32::MAX);

        let (order_id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO orders (order_number, center_id, ordered_at, order_status, customer_id, unit, cost)
            VALUES ($1, $2, NOW(), $3, $4, $5, $6)
            ON CONFLICT (order_number) DO UPDATE
            SET customer_id = COALESCE(orders.customer_id, EXCLUDED.customer_id),
                updated_at = NOW()
            RETURNING order_id
            "#,
        )
        .bind(&data.order_number)
        .bind(DEFAULT_CENTER_ID)
        .bind(DeliveryStatus::Ready.as_str())
        .bind(data.customer_id)
        .bind(unit)
        .bind(data.total_amount)
        .fetch_one(conn)
        .await?;

        Ok(order_id)
    }

    /// 在事务中锁定订单行，返回 (order_id, order_status)
    pub async fn find_for_update(
        conn: &mut PgConnection,
        order_number: &str,
    ) -> Result<Option<(i64, String)>> {
        let row = sqlx::query_as::<_, (i64, String)>(
            r#"
            SELECT order_id, order_status
            FROM orders
            WHERE order_number = $1
            FOR UPDATE
            "#,
        )
        .bind(order_number)
        .fetch_optional(conn)
        .await?;

        Ok(row)
    }

    pub async fn update_status(
        conn: &mut PgConnection,
        order_id: i64,
        status: DeliveryStatus,
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
}
