//! 内存消息桥接
//!
//! 实现支付侧的 `EventPublisher`：事件编码为 Kafka 消息后立即交给配送侧的
//! `handle_message`，并保留消息与处置结果，供测试重投递或断言。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use delivery_service::consumer::{Disposition, handle_message};
use delivery_service::processor::PaidOrderHandler;
use fulfillment_shared::error::FulfillmentError;
use fulfillment_shared::events::DomainEvent;
use fulfillment_shared::kafka::{ConsumerMessage, headers, topics};
use payment_service::publisher::EventPublisher;
use tokio::sync::Mutex;

const BINDING_KEY: &str = "payment.order.paid";
const MAX_REDELIVERIES: u32 = 5;

pub struct BrokerBridge {
    handler: Arc<dyn PaidOrderHandler>,
    log: Mutex<Vec<(ConsumerMessage, Disposition)>>,
}

impl BrokerBridge {
    pub fn new(handler: Arc<dyn PaidOrderHandler>) -> Self {
        Self {
            handler,
            log: Mutex::new(Vec::new()),
        }
    }

    /// 已投递的消息及其处置结果
    pub async fn deliveries(&self) -> Vec<(ConsumerMessage, Disposition)> {
        self.log.lock().await.clone()
    }

    /// 把一条消息再投递一次（模拟 broker 重投）
    pub async fn redeliver(&self, msg: &ConsumerMessage) -> Disposition {
        let mut redelivered = msg.clone();
        redelivered.headers = msg.requeue_headers();
        self.deliver(redelivered).await
    }

    async fn deliver(&self, msg: ConsumerMessage) -> Disposition {
        let disposition =
            handle_message(self.handler.as_ref(), BINDING_KEY, MAX_REDELIVERIES, &msg).await;
        self.log.lock().await.push((msg, disposition.clone()));
        disposition
    }
}

#[async_trait]
impl EventPublisher for BrokerBridge {
    async fn publish(&self, event: &DomainEvent) -> Result<(), FulfillmentError> {
        let offset = self.log.lock().await.len() as i64;
        let msg = ConsumerMessage {
            topic: topics::PAYMENT_EVENTS.to_string(),
            partition: 0,
            offset,
            key: Some(event.data().order_number.clone()),
            payload: event.to_bytes()?,
            timestamp: Some(event.occurred_at().timestamp_millis()),
            headers: HashMap::from([
                (headers::ROUTING_KEY.to_string(), event.routing_key().to_string()),
                (headers::EVENT_ID.to_string(), event.event_id().to_string()),
            ]),
        };

        self.deliver(msg).await;
        Ok(())
    }
}
