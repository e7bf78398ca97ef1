//! 支付完成事件处理
//!
//! 收件箱认领与订单落库在同一事务内完成：
//! 同一个事件 ID 在配送库里要么没有任何结果，要么恰好一组（收件箱行 + 订单）。

use async_trait::async_trait;
use fulfillment_shared::events::DomainEvent;
use sqlx::PgPool;
use tracing::{info, instrument};

use crate::error::Result;
use crate::repository::{CenterRepository, DeliveryOrderRepository, InboxRepository};

/// 处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaidOrderOutcome {
    /// 首次处理，订单已落库
    Created { order_id: i64 },
    /// 事件此前已处理，本次未做任何写入
    Duplicate,
}

/// 支付完成事件处理接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaidOrderHandler: Send + Sync {
    async fn handle_paid(&self, event: &DomainEvent) -> Result<PaidOrderOutcome>;
}

pub struct PaidOrderProcessor {
    pool: PgPool,
}

impl PaidOrderProcessor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PaidOrderHandler for PaidOrderProcessor {
    #[instrument(
        skip(self, event),
        fields(event_id = %event.event_id(), order_number = %event.data().order_number)
    )]
    async fn handle_paid(&self, event: &DomainEvent) -> Result<PaidOrderOutcome> {
        let mut tx = self.pool.begin().await?;

        if !InboxRepository::claim(&mut *tx, event.event_id(), event.event_type()).await? {
            tx.rollback().await?;
            info!("duplicated event ignored");
            return Ok(PaidOrderOutcome::Duplicate);
        }

        CenterRepository::ensure_default(&mut *tx).await?;
        let order_id = DeliveryOrderRepository::upsert_ready(&mut *tx, event.data()).await?;

        tx.commit().await?;

        info!(
            order_id,
            unit = event.data().total_quantity(),
            cost = event.data().total_amount,
            "order READY created"
        );
        Ok(PaidOrderOutcome::Created { order_id })
    }
}
