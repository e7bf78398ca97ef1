//! 配送状态服务
//!
//! 状态流转：目标状态先在内存中校验，合法后才开启事务；
//! 事务内锁定订单行，以锁内读到的状态为准判断流转是否合法。

use fulfillment_shared::observability::metrics;
use fulfillment_shared::status::{DeliveryStatus, check_stored_transition};
use sqlx::PgPool;
use tracing::{info, instrument, warn};

use crate::error::{DeliveryError, Result};
use crate::repository::{DeliveryOrderRepository, DeliveryOrderRow};

pub struct StatusService {
    pool: PgPool,
    orders: DeliveryOrderRepository,
}

impl StatusService {
    pub fn new(pool: PgPool) -> Self {
        Self {
            orders: DeliveryOrderRepository::new(pool.clone()),
            pool,
        }
    }

    pub async fn get_order(&self, order_number: &str) -> Result<DeliveryOrderRow> {
        let order_number = order_number.trim();
        self.orders
            .get_order(order_number)
            .await?
            .ok_or_else(|| DeliveryError::OrderNotFound(order_number.to_string()))
    }

    /// 推进配送状态，返回新状态
    #[instrument(skip(self))]
    pub async fn update_status(&self, order_number: &str, requested: &str) -> Result<DeliveryStatus> {
        let order_number = order_number.trim();
        let target: DeliveryStatus = requested
            .parse()
            .map_err(|_| DeliveryError::InvalidStatus(requested.trim().to_uppercase()))?;

        let mut tx = self.pool.begin().await?;

        let (order_id, current) = DeliveryOrderRepository::find_for_update(&mut *tx, order_number)
            .await?
            .ok_or_else(|| DeliveryError::OrderNotFound(order_number.to_string()))?;

        let next = match check_stored_transition(&current, target) {
            Ok(next) => next,
            Err(e) => {
                metrics::record_status_transition(target.as_str(), false);
                warn!(current = %e.current, "非法状态流转");
                return Err(e.into());
            }
        };

        DeliveryOrderRepository::update_status(&mut *tx, order_id, next).await?;
        tx.commit().await?;

        metrics::record_status_transition(next.as_str(), true);
        info!(from = %current, to = %next, "配送状态已更新");
        Ok(next)
    }
}
