//! 支付事件消费者
//!
//! 每条消息的处置只有三种：
//! - 确认：处理成功、重复事件、或与本服务无关的消息（不是事件信封、类型或路由键不匹配）；
//! - 重新入队：处理失败，带着投递次数 +1 重新发布到 topic 尾部后确认原消息；
//! - 死信：支付完成事件的负载无法解码，或投递次数超过上限仍失败，写入死信 topic 后确认原消息。
//!
//! 重新入队或写死信失败时消费循环退出，原消息未确认，重启后会重新投递。

use std::sync::Arc;

use fulfillment_shared::config::KafkaConfig;
use fulfillment_shared::dlq::DlqProducer;
use fulfillment_shared::error::FulfillmentError;
use fulfillment_shared::events::{IncomingEvent, decode_event};
use fulfillment_shared::kafka::{
    ConsumerMessage, KafkaConsumer, KafkaProducer, Topology, routing_key_matches, topics,
};
use fulfillment_shared::observability::metrics;
use fulfillment_shared::observability::tracing::set_parent_from_headers;
use fulfillment_shared::retry::{RetryPolicy, retry_with_policy};
use tokio::sync::watch;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::SERVICE_NAME;
use crate::processor::{PaidOrderHandler, PaidOrderOutcome};

/// 单条消息的处置结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// 直接确认
    Ack { outcome: AckOutcome },
    /// 重新发布到 topic 尾部后确认
    Requeue { error: String },
    /// 写入死信 topic 后确认
    DeadLetter { error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Created,
    Duplicate,
    /// 不是事件信封、类型或路由键不匹配，丢弃
    Discarded,
}

impl Disposition {
    /// 指标标签
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ack {
                outcome: AckOutcome::Created,
            } => "created",
            Self::Ack {
                outcome: AckOutcome::Duplicate,
            } => "duplicate",
            Self::Ack {
                outcome: AckOutcome::Discarded,
            } => "discarded",
            Self::Requeue { .. } => "requeued",
            Self::DeadLetter { .. } => "dead_lettered",
        }
    }

    fn discarded() -> Self {
        Self::Ack {
            outcome: AckOutcome::Discarded,
        }
    }
}

/// 配送侧消费者
///
/// 组合 KafkaConsumer（拉取）、PaidOrderHandler（业务处理）、
/// KafkaProducer（重新入队）和 DlqProducer（死信）。
pub struct FulfillmentConsumer {
    consumer: KafkaConsumer,
    topology: Topology,
    handler: Arc<dyn PaidOrderHandler>,
    producer: KafkaProducer,
    dlq: DlqProducer,
    config: KafkaConfig,
}

impl FulfillmentConsumer {
    pub fn new(
        config: &KafkaConfig,
        handler: Arc<dyn PaidOrderHandler>,
        producer: KafkaProducer,
    ) -> Result<Self, FulfillmentError> {
        let dlq_topic = topics::dead_letter_for(&config.topic);
        let consumer = KafkaConsumer::new(config)?;
        let topology = Topology::new(config, &[config.topic.as_str(), dlq_topic.as_str()]);
        let dlq = DlqProducer::new(producer.clone(), &dlq_topic, SERVICE_NAME);

        Ok(Self {
            consumer,
            topology,
            handler,
            producer,
            dlq,
            config: config.clone(),
        })
    }

    /// 启动消费循环，直到收到关闭信号或重新入队/死信投递失败
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), FulfillmentError> {
        self.topology.ensure().await?;
        self.consumer.subscribe(&[self.config.topic.as_str()])?;

        info!(
            topic = %self.config.topic,
            binding_key = %self.config.binding_key,
            group_id = %self.config.consumer_group,
            prefetch = self.config.prefetch,
            max_redeliveries = self.config.max_redeliveries,
            "支付事件消费者已启动"
        );

        let Self {
            consumer,
            handler,
            producer,
            dlq,
            config,
            ..
        } = self;
        let backoff = RetryPolicy::redelivery(config.max_redeliveries);

        let result = consumer
            .run(shutdown, config.prefetch, |msg| {
                let handler = &handler;
                let producer = &producer;
                let dlq = &dlq;
                let config = &config;
                let backoff = &backoff;
                async move {
                    if msg.redelivered() {
                        let delay = backoff.delay_before_delivery(msg.delivery_attempt());
                        debug!(
                            attempt = msg.delivery_attempt(),
                            delay_ms = delay.as_millis() as u64,
                            "重投递消息退避"
                        );
                        tokio::time::sleep(delay).await;
                    }

                    let disposition = handle_message(
                        handler.as_ref(),
                        &config.binding_key,
                        config.max_redeliveries,
                        &msg,
                    )
                    .await;

                    settle(producer, dlq, &msg, &disposition).await?;
                    metrics::record_message_consumed(disposition.label());
                    Ok(())
                }
            })
            .await;

        info!("支付事件消费者已停止");
        result
    }
}

/// 处理单条消息，返回处置结果
///
/// 不做任何 Kafka 操作，便于在测试中直接调用。
pub async fn handle_message(
    handler: &dyn PaidOrderHandler,
    binding_key: &str,
    max_redeliveries: u32,
    msg: &ConsumerMessage,
) -> Disposition {
    let span = info_span!(
        "consume_message",
        topic = %msg.topic,
        partition = msg.partition,
        offset = msg.offset,
        attempt = msg.delivery_attempt(),
    );
    set_parent_from_headers(&span, &msg.headers);

    async move {
        // 没有路由键头的消息按事件类型判断
        if let Some(routing_key) = msg.routing_key()
            && !routing_key_matches(binding_key, routing_key)
        {
            debug!(routing_key, binding_key, "路由键不匹配，丢弃");
            return Disposition::discarded();
        }

        let event = match decode_event(&msg.payload) {
            Ok(IncomingEvent::OrderPaid(event)) => event,
            Ok(IncomingEvent::Unrecognized { event_type }) => {
                debug!(%event_type, "非支付完成事件，丢弃");
                return Disposition::discarded();
            }
            Err(e) if e.is_recognized_event() => {
                warn!(error = %e, "支付完成事件负载无效，转入死信");
                return Disposition::DeadLetter {
                    error: e.to_string(),
                };
            }
            Err(e) => {
                warn!(error = %e, "消息不是事件信封，丢弃");
                return Disposition::discarded();
            }
        };

        match handler.handle_paid(&event).await {
            Ok(PaidOrderOutcome::Created { .. }) => Disposition::Ack {
                outcome: AckOutcome::Created,
            },
            Ok(PaidOrderOutcome::Duplicate) => Disposition::Ack {
                outcome: AckOutcome::Duplicate,
            },
            Err(e) if msg.delivery_attempt() > max_redeliveries => {
                warn!(
                    event_id = %event.event_id(),
                    error = %e,
                    "超过最大重投递次数，转入死信"
                );
                Disposition::DeadLetter {
                    error: e.to_string(),
                }
            }
            Err(e) => {
                warn!(
                    event_id = %event.event_id(),
                    error = %e,
                    "处理失败，重新入队"
                );
                Disposition::Requeue {
                    error: e.to_string(),
                }
            }
        }
    }
    .instrument(span)
    .await
}

/// 执行处置；返回错误时原消息不会被确认
async fn settle(
    producer: &KafkaProducer,
    dlq: &DlqProducer,
    msg: &ConsumerMessage,
    disposition: &Disposition,
) -> Result<(), FulfillmentError> {
    let policy = RetryPolicy::default();

    match disposition {
        Disposition::Ack { .. } => Ok(()),
        Disposition::Requeue { .. } => {
            let requeue_headers = msg.requeue_headers();
            let key = msg.key.as_deref().unwrap_or_default();
            retry_with_policy(&policy, "requeue", FulfillmentError::is_retryable, || {
                producer.send(&msg.topic, key, &msg.payload, &requeue_headers)
            })
            .await?;
            Ok(())
        }
        Disposition::DeadLetter { error } => {
            retry_with_policy(&policy, "dead_letter", FulfillmentError::is_retryable, || {
                dlq.send_to_dlq(msg, error)
            })
            .await
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use fulfillment_shared::events::{DomainEvent, OrderItem, OrderPaidData};
    use fulfillment_shared::kafka::headers;

    use super::*;
    use crate::error::DeliveryError;
    use crate::processor::MockPaidOrderHandler;

    const BINDING_KEY: &str = "payment.order.paid";

    fn paid_event() -> DomainEvent {
        DomainEvent::order_paid(OrderPaidData {
            order_number: "ORD-1".to_string(),
            customer_id: Some(42),
            items: vec![OrderItem {
                skuid: "SKU-A".to_string(),
                qty: 2,
            }],
            total_amount: 12000,
        })
    }

    fn message(payload: Vec<u8>, routing_key: Option<&str>, attempt: Option<u32>) -> ConsumerMessage {
        let mut message_headers = HashMap::new();
        if let Some(key) = routing_key {
            message_headers.insert(headers::ROUTING_KEY.to_string(), key.to_string());
        }
        if let Some(n) = attempt {
            message_headers.insert(headers::DELIVERY_ATTEMPT.to_string(), n.to_string());
        }

        ConsumerMessage {
            topic: "payment.events".to_string(),
            partition: 0,
            offset: 7,
            key: Some("ORD-1".to_string()),
            payload,
            timestamp: None,
            headers: message_headers,
        }
    }

    fn paid_message(attempt: Option<u32>) -> (DomainEvent, ConsumerMessage) {
        let event = paid_event();
        let msg = message(event.to_bytes().unwrap(), Some(BINDING_KEY), attempt);
        (event, msg)
    }

    fn untouched_handler() -> MockPaidOrderHandler {
        let mut handler = MockPaidOrderHandler::new();
        handler.expect_handle_paid().times(0);
        handler
    }

    #[tokio::test]
    async fn test_paid_event_is_materialized_and_acked() {
        let (event, msg) = paid_message(None);
        let expected_id = event.event_id();

        let mut handler = MockPaidOrderHandler::new();
        handler
            .expect_handle_paid()
            .withf(move |e| e.event_id() == expected_id && e.data().order_number == "ORD-1")
            .times(1)
            .returning(|_| Ok(PaidOrderOutcome::Created { order_id: 1 }));

        let disposition = handle_message(&handler, BINDING_KEY, 5, &msg).await;
        assert_eq!(disposition.label(), "created");
    }

    #[tokio::test]
    async fn test_duplicate_event_is_acked() {
        let (_, msg) = paid_message(Some(2));

        let mut handler = MockPaidOrderHandler::new();
        handler
            .expect_handle_paid()
            .times(1)
            .returning(|_| Ok(PaidOrderOutcome::Duplicate));

        let disposition = handle_message(&handler, BINDING_KEY, 5, &msg).await;
        assert_eq!(
            disposition,
            Disposition::Ack {
                outcome: AckOutcome::Duplicate
            }
        );
    }

    #[tokio::test]
    async fn test_unparseable_body_is_discarded() {
        let msg = message(b"not json at all".to_vec(), Some(BINDING_KEY), None);

        let disposition = handle_message(&untouched_handler(), BINDING_KEY, 5, &msg).await;
        assert_eq!(disposition.label(), "discarded");
    }

    #[tokio::test]
    async fn test_missing_order_number_is_dead_lettered() {
        let payload = serde_json::json!({
            "eventId": "0190a6b2-6c1e-7c4a-9c3e-1f2a3b4c5d6e",
            "occurredAt": "2026-01-01T00:00:00Z",
            "type": "payment.order.paid",
            "data": {"orderNumber": "  ", "customerId": null, "items": [], "totalAmount": 0}
        });
        let msg = message(serde_json::to_vec(&payload).unwrap(), Some(BINDING_KEY), None);

        let disposition = handle_message(&untouched_handler(), BINDING_KEY, 5, &msg).await;
        assert_eq!(disposition.label(), "dead_lettered");
    }

    #[tokio::test]
    async fn test_fractional_total_amount_is_dead_lettered_not_dropped() {
        let payload = serde_json::json!({
            "eventId": "0190a6b2-6c1e-7c4a-9c3e-1f2a3b4c5d6e",
            "occurredAt": "2026-01-01T00:00:00Z",
            "type": "payment.order.paid",
            "data": {"orderNumber": "ORD-1", "customerId": null,
                     "items": [{"skuid": "SKU-A", "qty": 1}], "totalAmount": 99.5}
        });
        let msg = message(serde_json::to_vec(&payload).unwrap(), Some(BINDING_KEY), None);

        // 首次投递即隔离，不等重投递次数耗尽
        let disposition = handle_message(&untouched_handler(), BINDING_KEY, 5, &msg).await;
        match disposition {
            Disposition::DeadLetter { error } => {
                assert!(error.contains("expected an integral number"))
            }
            other => panic!("expected DeadLetter, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_whole_float_total_amount_is_materialized() {
        let payload = serde_json::json!({
            "eventId": "0190a6b2-6c1e-7c4a-9c3e-1f2a3b4c5d6e",
            "occurredAt": "2026-01-01T00:00:00Z",
            "type": "payment.order.paid",
            "data": {"orderNumber": "ORD-1", "customerId": 42,
                     "items": [{"skuid": "SKU-A", "qty": 1}], "totalAmount": 12000.0}
        });
        let msg = message(serde_json::to_vec(&payload).unwrap(), Some(BINDING_KEY), None);

        let mut handler = MockPaidOrderHandler::new();
        handler
            .expect_handle_paid()
            .withf(|e| e.data().total_amount == 12000)
            .times(1)
            .returning(|_| Ok(PaidOrderOutcome::Created { order_id: 9 }));

        let disposition = handle_message(&handler, BINDING_KEY, 5, &msg).await;
        assert_eq!(disposition.label(), "created");
    }

    #[tokio::test]
    async fn test_other_event_type_is_discarded() {
        let payload = br#"{"type":"payment.order.refunded","data":{}}"#.to_vec();
        let msg = message(payload, None, None);

        let disposition = handle_message(&untouched_handler(), BINDING_KEY, 5, &msg).await;
        assert_eq!(disposition.label(), "discarded");
    }

    #[tokio::test]
    async fn test_routing_key_outside_binding_is_discarded() {
        let event = paid_event();
        let msg = message(event.to_bytes().unwrap(), Some("payment.order.refunded"), None);

        let disposition = handle_message(&untouched_handler(), BINDING_KEY, 5, &msg).await;
        assert_eq!(disposition.label(), "discarded");
    }

    #[tokio::test]
    async fn test_wildcard_binding_accepts_paid_event() {
        let (_, msg) = paid_message(None);

        let mut handler = MockPaidOrderHandler::new();
        handler
            .expect_handle_paid()
            .times(1)
            .returning(|_| Ok(PaidOrderOutcome::Created { order_id: 3 }));

        let disposition = handle_message(&handler, "payment.#", 5, &msg).await;
        assert_eq!(disposition.label(), "created");
    }

    #[tokio::test]
    async fn test_handler_failure_requeues() {
        let (_, msg) = paid_message(Some(3));

        let mut handler = MockPaidOrderHandler::new();
        handler
            .expect_handle_paid()
            .times(1)
            .returning(|_| Err(DeliveryError::Database(sqlx::Error::PoolTimedOut)));

        let disposition = handle_message(&handler, BINDING_KEY, 5, &msg).await;
        assert!(matches!(disposition, Disposition::Requeue { .. }));
    }

    #[tokio::test]
    async fn test_failure_beyond_max_redeliveries_dead_letters() {
        // 首次投递 + 5 次重投递之后仍失败
        let (_, msg) = paid_message(Some(6));

        let mut handler = MockPaidOrderHandler::new();
        handler
            .expect_handle_paid()
            .times(1)
            .returning(|_| Err(DeliveryError::Database(sqlx::Error::PoolTimedOut)));

        let disposition = handle_message(&handler, BINDING_KEY, 5, &msg).await;
        match disposition {
            Disposition::DeadLetter { error } => assert!(error.contains("数据库错误")),
            other => panic!("expected DeadLetter, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_last_allowed_redelivery_still_requeues() {
        let (_, msg) = paid_message(Some(5));

        let mut handler = MockPaidOrderHandler::new();
        handler
            .expect_handle_paid()
            .times(1)
            .returning(|_| Err(DeliveryError::Database(sqlx::Error::PoolTimedOut)));

        let disposition = handle_message(&handler, BINDING_KEY, 5, &msg).await;
        assert_eq!(disposition.label(), "requeued");
    }
}
