//! 支付审批服务
//!
//! 审批流程：
//! 1. 开启事务，按订单号 `FOR UPDATE` 锁定订单
//! 2. 订单已是 PAID：直接提交，不做任何写入（幂等）
//! 3. 校验 CREATED -> PAID 流转，写支付记录、更新订单状态、读取订单行
//! 4. 在同一事务内把支付完成事件写入 outbox，提交
//! 5. 提交后立即尝试发布；失败不影响审批结果，由 outbox 中继补发

use std::sync::Arc;
use std::time::Instant;

use fulfillment_shared::events::{DomainEvent, OrderPaidData};
use fulfillment_shared::observability::metrics;
use fulfillment_shared::status::{PaymentStatus, check_stored_transition};
use sqlx::PgPool;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::dto::{ApproveCommand, ApproveResponse, PUBLISH_DEFERRED};
use crate::error::{PaymentError, Result};
use crate::outbox::OutboxRelay;
use crate::repository::{OutboxRepository, PaymentRepository};

/// 审批结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalOutcome {
    /// 订单此前已支付，本次未做任何写入
    AlreadyPaid { order_number: String },
    /// 本次完成支付；`published` 表示事件是否已在本次请求中得到 broker 确认
    Approved {
        order_number: String,
        event_id: Uuid,
        published: bool,
    },
}

impl ApprovalOutcome {
    fn metric_label(&self) -> &'static str {
        match self {
            Self::AlreadyPaid { .. } => "already_paid",
            Self::Approved {
                published: true, ..
            } => "approved",
            Self::Approved {
                published: false,
                ..
            } => "approved_deferred",
        }
    }
}

impl From<ApprovalOutcome> for ApproveResponse {
    fn from(outcome: ApprovalOutcome) -> Self {
        match outcome {
            ApprovalOutcome::AlreadyPaid { order_number } => Self {
                ok: true,
                order_number,
                already_paid: Some(true),
                published: None,
                event_id: None,
                warning: None,
            },
            ApprovalOutcome::Approved {
                order_number,
                event_id,
                published,
            } => Self {
                ok: true,
                order_number,
                already_paid: None,
                published: Some(published),
                event_id: Some(event_id),
                warning: (!published).then(|| PUBLISH_DEFERRED.to_string()),
            },
        }
    }
}

pub struct ApprovalService {
    pool: PgPool,
    relay: Arc<OutboxRelay>,
}

impl ApprovalService {
    pub fn new(pool: PgPool, relay: Arc<OutboxRelay>) -> Self {
        Self { pool, relay }
    }

    #[instrument(skip(self, command), fields(order_number = %command.order_number, provider = %command.provider))]
    pub async fn approve(&self, command: &ApproveCommand) -> Result<ApprovalOutcome> {
        let started = Instant::now();

        let outcome = match self.commit_approval(command).await {
            Ok(Some(event_id)) => {
                let published = match self.relay.dispatch(event_id).await {
                    Ok(published) => published,
                    Err(e) => {
                        warn!(%event_id, error = %e, "审批后立即发布失败，交由 outbox 中继");
                        false
                    }
                };
                ApprovalOutcome::Approved {
                    order_number: command.order_number.clone(),
                    event_id,
                    published,
                }
            }
            Ok(None) => ApprovalOutcome::AlreadyPaid {
                order_number: command.order_number.clone(),
            },
            Err(e) => {
                let label = match &e {
                    PaymentError::OrderNotFound(_) => "not_found",
                    PaymentError::InvalidTransition(_) => "invalid_transition",
                    _ => "error",
                };
                metrics::record_payment_approval(label, started.elapsed().as_secs_f64());
                return Err(e);
            }
        };

        metrics::record_payment_approval(outcome.metric_label(), started.elapsed().as_secs_f64());
        Ok(outcome)
    }

    /// 审批事务；订单已支付时返回 None，否则返回写入 outbox 的事件 ID
    async fn commit_approval(&self, command: &ApproveCommand) -> Result<Option<Uuid>> {
        let mut tx = self.pool.begin().await?;

        let order = PaymentRepository::find_order_for_update(&mut *tx, &command.order_number)
            .await?
            .ok_or_else(|| PaymentError::OrderNotFound(command.order_number.clone()))?;

        if order.order_status.trim().eq_ignore_ascii_case(PaymentStatus::Paid.as_str()) {
            tx.commit().await?;
            info!("订单已支付，忽略重复审批");
            return Ok(None);
        }

        // 非法流转直接返回，事务随 tx 析构回滚
        let next = check_stored_transition(&order.order_status, PaymentStatus::Paid)?;

        let payment_id =
            PaymentRepository::insert_approved_payment(&mut *tx, &order, &command.provider).await?;
        PaymentRepository::update_order_status(&mut *tx, order.order_id, next).await?;
        let items = PaymentRepository::list_order_items(&mut *tx, order.order_id).await?;

        let event = DomainEvent::order_paid(OrderPaidData {
            order_number: order.order_number.clone(),
            customer_id: order.customer_id,
            items,
            total_amount: order.total_amount,
        });
        OutboxRepository::insert(&mut *tx, &event).await?;

        tx.commit().await?;

        info!(
            payment_id,
            event_id = %event.event_id(),
            amount = order.total_amount,
            "支付审批完成"
        );
        Ok(Some(event.event_id()))
    }
}
