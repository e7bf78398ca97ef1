//! 测试环境管理

use std::sync::Arc;

use delivery_service::processor::PaidOrderProcessor;
use delivery_service::service::StatusService;
use fulfillment_shared::config::OutboxConfig;
use payment_service::outbox::OutboxRelay;
use payment_service::service::ApprovalService;
use sqlx::PgPool;

use super::BrokerBridge;

/// 两个服务各自的数据库，加上连接它们的内存桥接
pub struct TestEnvironment {
    pub payment_pool: PgPool,
    pub delivery_pool: PgPool,
    pub bridge: Arc<BrokerBridge>,
    pub approval: ApprovalService,
    pub status: StatusService,
}

impl TestEnvironment {
    pub async fn setup() -> Self {
        let payment_pool = connect("TEST_PAYMENT_DATABASE_URL").await;
        payment_service::MIGRATOR.run(&payment_pool).await.unwrap();

        let delivery_pool = connect("TEST_DELIVERY_DATABASE_URL").await;
        delivery_service::MIGRATOR.run(&delivery_pool).await.unwrap();

        let bridge = Arc::new(BrokerBridge::new(Arc::new(PaidOrderProcessor::new(
            delivery_pool.clone(),
        ))));

        let relay = OutboxRelay::new(
            payment_pool.clone(),
            bridge.clone(),
            OutboxConfig::default(),
        );

        Self {
            approval: ApprovalService::new(payment_pool.clone(), Arc::new(relay)),
            status: StatusService::new(delivery_pool.clone()),
            payment_pool,
            delivery_pool,
            bridge,
        }
    }

    /// 在支付库中创建一张 CREATED 订单
    pub async fn create_order(
        &self,
        order_number: &str,
        customer_id: Option<i64>,
        total_amount: i64,
        items: &[(&str, i32)],
    ) {
        let (order_id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO orders (order_number, customer_id, order_status, total_amount)
            VALUES ($1, $2, 'CREATED', $3)
            RETURNING order_id
            "#,
        )
        .bind(order_number)
        .bind(customer_id)
        .bind(total_amount)
        .fetch_one(&self.payment_pool)
        .await
        .unwrap();

        for (skuid, qty) in items {
            sqlx::query("INSERT INTO order_items (order_id, skuid, qty) VALUES ($1, $2, $3)")
                .bind(order_id)
                .bind(skuid)
                .bind(qty)
                .execute(&self.payment_pool)
                .await
                .unwrap();
        }
    }
}

async fn connect(var: &str) -> PgPool {
    let url = std::env::var(var).unwrap_or_else(|_| panic!("{var} must be set"));
    PgPool::connect(&url).await.unwrap()
}
