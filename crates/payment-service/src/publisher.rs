//! 事件发布
//!
//! 服务层只依赖 `EventPublisher`，Kafka 实现在进程启动时构造一次并注入。

use std::collections::HashMap;

use async_trait::async_trait;
use fulfillment_shared::error::FulfillmentError;
use fulfillment_shared::events::DomainEvent;
use fulfillment_shared::kafka::{KafkaProducer, Topology, headers};
use fulfillment_shared::observability::tracing::inject_to_headers;
use tracing::{debug, instrument};

/// 事件发布接口
///
/// 返回 Ok 表示 broker 已确认持久化。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &DomainEvent) -> Result<(), FulfillmentError>;
}

/// 基于 Kafka 的发布者
///
/// 首次发布前懒声明 topic；消息 key 为订单号，保证同一订单的事件进入同一分区。
pub struct KafkaEventPublisher {
    producer: KafkaProducer,
    topology: Topology,
    topic: String,
}

impl KafkaEventPublisher {
    pub fn new(producer: KafkaProducer, topology: Topology, topic: &str) -> Self {
        Self {
            producer,
            topology,
            topic: topic.to_string(),
        }
    }

    fn message_headers(event: &DomainEvent) -> HashMap<String, String> {
        let mut message_headers = HashMap::from([
            (
                headers::ROUTING_KEY.to_string(),
                event.routing_key().to_string(),
            ),
            (headers::EVENT_ID.to_string(), event.event_id().to_string()),
            (
                headers::CONTENT_TYPE.to_string(),
                "application/json".to_string(),
            ),
        ]);
        inject_to_headers(&mut message_headers);
        message_headers
    }
}

#[async_trait]
impl EventPublisher for KafkaEventPublisher {
    #[instrument(
        skip(self, event),
        fields(event_id = %event.event_id(), order_number = %event.data().order_number)
    )]
    async fn publish(&self, event: &DomainEvent) -> Result<(), FulfillmentError> {
        self.topology.ensure().await?;

        let payload = event.to_bytes()?;
        let (partition, offset) = self
            .producer
            .send(
                &self.topic,
                &event.data().order_number,
                &payload,
                &Self::message_headers(event),
            )
            .await?;

        debug!(partition, offset, routing_key = event.routing_key(), "事件已发布");
        Ok(())
    }
}
