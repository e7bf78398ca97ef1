//! Outbox 中继
//!
//! 审批事务只把事件写进 `outbox_events`，发布由这里完成：
//!
//! - `dispatch`：审批提交后立即尝试发布刚写入的那一条；
//! - `run`：后台按固定间隔扫描未发布的事件，补发 `dispatch` 失败或进程崩溃遗留的记录。
//!
//! 每条记录在发布期间以 `FOR UPDATE SKIP LOCKED` 持有行锁，多个实例不会并发发布同一条。
//! 只有 broker 确认后才写 `published_at`；失败时累加 `attempts` 并记录错误，记录永不丢弃。

use std::sync::Arc;
use std::time::Instant;

use fulfillment_shared::config::OutboxConfig;
use fulfillment_shared::events::DomainEvent;
use fulfillment_shared::observability::metrics;
use sqlx::{PgConnection, PgPool};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::publisher::EventPublisher;
use crate::repository::{OutboxRepository, OutboxRow};

/// 发布入口，用于指标区分
const PATH_INLINE: &str = "inline";
const PATH_RELAY: &str = "relay";

#[derive(Clone)]
pub struct OutboxRelay {
    pool: PgPool,
    publisher: Arc<dyn EventPublisher>,
    config: OutboxConfig,
}

impl OutboxRelay {
    pub fn new(pool: PgPool, publisher: Arc<dyn EventPublisher>, config: OutboxConfig) -> Self {
        Self {
            pool,
            publisher,
            config,
        }
    }

    /// 立即发布指定事件
    ///
    /// 返回 true 表示本次调用完成了发布；事件已发布、正被其他中继持有或发布失败时返回 false，
    /// 未发布的记录留给后台中继。
    #[instrument(skip(self))]
    pub async fn dispatch(&self, event_id: Uuid) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let Some(row) = OutboxRepository::lock_pending(&mut *tx, event_id).await? else {
            debug!("事件已发布或正由其他中继处理");
            tx.commit().await?;
            return Ok(false);
        };

        let published = self.publish_row(&mut *tx, &row, PATH_INLINE).await?;
        tx.commit().await?;

        Ok(published)
    }

    /// 发布一批未发布事件，返回成功条数
    pub async fn relay_batch(&self) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let rows =
            OutboxRepository::lock_pending_batch(&mut *tx, self.config.batch_limit()).await?;

        if rows.is_empty() {
            tx.commit().await?;
            metrics::set_outbox_pending(0);
            return Ok(0);
        }

        let mut published = 0;
        for row in &rows {
            if self.publish_row(&mut *tx, row, PATH_RELAY).await? {
                published += 1;
            }
        }
        tx.commit().await?;

        metrics::set_outbox_pending(OutboxRepository::count_pending(&self.pool).await?);
        info!(
            locked = rows.len(),
            published, "outbox 中继完成一批"
        );

        Ok(published)
    }

    /// 按配置的间隔持续中继，收到关闭信号后退出
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            batch_size = self.config.batch_size,
            "outbox 中继已启动"
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("收到关闭信号，outbox 中继退出");
                        break;
                    }
                }

                _ = ticker.tick() => {
                    // 一批满载时说明还有积压，立即继续下一批
                    loop {
                        match self.relay_batch().await {
                            Ok(n) if n as i64 >= self.config.batch_limit() => continue,
                            Ok(_) => break,
                            Err(e) => {
                                error!(error = %e, "outbox 中继失败");
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    /// 在已锁定的行上执行发布，并记录结果
    async fn publish_row(
        &self,
        conn: &mut PgConnection,
        row: &OutboxRow,
        path: &str,
    ) -> Result<bool> {
        let started = Instant::now();

        let outcome = match DomainEvent::from_value(row.payload.clone()) {
            Ok(event) => self.publisher.publish(&event).await,
            Err(e) => Err(e.into()),
        };

        match outcome {
            Ok(()) => {
                OutboxRepository::mark_published(conn, row.event_id).await?;
                metrics::record_event_published(path, true);
                debug!(
                    event_id = %row.event_id,
                    order_number = %row.aggregate_id,
                    latency_ms = started.elapsed().as_millis() as u64,
                    "outbox 事件已发布"
                );
                Ok(true)
            }
            Err(e) => {
                OutboxRepository::record_failure(conn, row.event_id, &e.to_string()).await?;
                metrics::record_event_published(path, false);
                warn!(
                    event_id = %row.event_id,
                    order_number = %row.aggregate_id,
                    routing_key = %row.routing_key,
                    attempts = row.attempts + 1,
                    error = %e,
                    "outbox 事件发布失败，稍后重试"
                );
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use fulfillment_shared::error::FulfillmentError;
    use fulfillment_shared::events::{OrderItem, OrderPaidData};

    use super::*;
    use crate::publisher::MockEventPublisher;

    // 中继会认领库里所有未发布的行，同一进程内的数据库测试串行执行
    static DB_GUARD: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

    /// 记录发布过的事件 ID
    #[derive(Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<Uuid>>,
    }

    impl RecordingPublisher {
        fn count(&self, event_id: Uuid) -> usize {
            self.published
                .lock()
                .unwrap()
                .iter()
                .filter(|id| **id == event_id)
                .count()
        }
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish(&self, event: &DomainEvent) -> std::result::Result<(), FulfillmentError> {
            self.published.lock().unwrap().push(event.event_id());
            Ok(())
        }
    }

    /// 反复中继直到没有可发布的行
    async fn drain(relay: &OutboxRelay) {
        while relay.relay_batch().await.unwrap() > 0 {}
    }

    async fn published_at(
        pool: &PgPool,
        event_id: Uuid,
    ) -> Option<chrono::DateTime<chrono::Utc>> {
        let (published_at,): (Option<chrono::DateTime<chrono::Utc>>,) =
            sqlx::query_as("SELECT published_at FROM outbox_events WHERE event_id = $1")
                .bind(event_id)
                .fetch_one(pool)
                .await
                .unwrap();
        published_at
    }

    async fn test_pool() -> PgPool {
        let url = std::env::var("TEST_PAYMENT_DATABASE_URL")
            .expect("TEST_PAYMENT_DATABASE_URL must be set");
        let pool = PgPool::connect(&url).await.unwrap();
        crate::MIGRATOR.run(&pool).await.unwrap();
        pool
    }

    async fn insert_outbox_event(pool: &PgPool) -> DomainEvent {
        let event = DomainEvent::order_paid(OrderPaidData {
            order_number: format!("ORD-OUTBOX-{}", Uuid::new_v4()),
            customer_id: Some(1),
            items: vec![OrderItem {
                skuid: "SKU-A".to_string(),
                qty: 1,
            }],
            total_amount: 500,
        });
        let mut conn = pool.acquire().await.unwrap();
        OutboxRepository::insert(&mut conn, &event).await.unwrap();
        event
    }

    #[tokio::test]
    #[ignore] // 需要数据库连接
    async fn test_dispatch_marks_event_published() {
        let _guard = DB_GUARD.lock().await;
        let pool = test_pool().await;
        let event = insert_outbox_event(&pool).await;
        let expected_id = event.event_id();

        let mut publisher = MockEventPublisher::new();
        publisher
            .expect_publish()
            .withf(move |e| e.event_id() == expected_id)
            .times(1)
            .returning(|_| Ok(()));

        let relay = OutboxRelay::new(pool.clone(), Arc::new(publisher), OutboxConfig::default());
        assert!(relay.dispatch(event.event_id()).await.unwrap());

        // 已发布的事件不会再次发布
        assert!(!relay.dispatch(event.event_id()).await.unwrap());
    }

    #[tokio::test]
    #[ignore] // 需要数据库连接
    async fn test_failed_dispatch_keeps_event_pending() {
        let _guard = DB_GUARD.lock().await;
        let pool = test_pool().await;
        let event = insert_outbox_event(&pool).await;

        let mut publisher = MockEventPublisher::new();
        publisher
            .expect_publish()
            .times(1)
            .returning(|_| Err(FulfillmentError::Publish("broker 不可用".to_string())));

        let relay = OutboxRelay::new(pool.clone(), Arc::new(publisher), OutboxConfig::default());
        assert!(!relay.dispatch(event.event_id()).await.unwrap());

        let (attempts, published_at, last_error): (i32, Option<chrono::DateTime<chrono::Utc>>, Option<String>) =
            sqlx::query_as(
                "SELECT attempts, published_at, last_error FROM outbox_events WHERE event_id = $1",
            )
            .bind(event.event_id())
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(attempts, 1);
        assert!(published_at.is_none());
        assert!(last_error.unwrap().contains("broker 不可用"));
    }

    #[tokio::test]
    #[ignore] // 需要数据库连接
    async fn test_relay_publishes_deferred_event_once() {
        let _guard = DB_GUARD.lock().await;
        let pool = test_pool().await;
        let event = insert_outbox_event(&pool).await;
        let config = OutboxConfig {
            batch_size: 2,
            ..Default::default()
        };

        // 即时发布失败，事件留在 outbox
        let mut failing = MockEventPublisher::new();
        failing
            .expect_publish()
            .times(1)
            .returning(|_| Err(FulfillmentError::Publish("broker 不可用".to_string())));
        let inline = OutboxRelay::new(pool.clone(), Arc::new(failing), config.clone());
        assert!(!inline.dispatch(event.event_id()).await.unwrap());
        assert!(published_at(&pool, event.event_id()).await.is_none());

        // broker 恢复后由后台中继补发
        let publisher = Arc::new(RecordingPublisher::default());
        let relay = OutboxRelay::new(pool.clone(), publisher.clone(), config);
        drain(&relay).await;

        assert_eq!(publisher.count(event.event_id()), 1);
        assert!(published_at(&pool, event.event_id()).await.is_some());

        // 再跑一轮不会重复发布
        assert_eq!(relay.relay_batch().await.unwrap(), 0);
        assert_eq!(publisher.count(event.event_id()), 1);
    }

    #[tokio::test]
    #[ignore] // 需要数据库连接
    async fn test_relay_skips_row_locked_by_dispatch() {
        let _guard = DB_GUARD.lock().await;
        let pool = test_pool().await;
        let event = insert_outbox_event(&pool).await;

        // 模拟 dispatch 正在发布：另一个事务持有该行的锁
        let mut holder = pool.begin().await.unwrap();
        let locked = OutboxRepository::lock_pending(&mut *holder, event.event_id())
            .await
            .unwrap();
        assert!(locked.is_some());

        let publisher = Arc::new(RecordingPublisher::default());
        let relay = OutboxRelay::new(pool.clone(), publisher.clone(), OutboxConfig::default());
        drain(&relay).await;
        assert_eq!(publisher.count(event.event_id()), 0);

        // 持锁方未完成发布就退出，行重新变为可认领
        holder.rollback().await.unwrap();
        drain(&relay).await;
        assert_eq!(publisher.count(event.event_id()), 1);
        assert!(published_at(&pool, event.event_id()).await.is_some());
    }
}
