//! 死信队列
//!
//! 重投递次数超过上限的消息连同失败原因写入死信 topic，
//! 原消息随后被确认，避免一条毒消息反复占用消费者。死信只归档，不自动回放。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::FulfillmentError;
use crate::kafka::{ConsumerMessage, KafkaProducer, headers};

/// 死信消息信封
///
/// 原始负载按字符串保存，消息本身不是合法 UTF-8 时做有损转换。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterMessage {
    /// 原始消息 key（订单号），缺失时用 topic/partition/offset 定位
    pub message_id: String,
    pub source_topic: String,
    pub source_partition: i32,
    pub source_offset: i64,
    pub routing_key: Option<String>,
    pub payload: String,
    /// 最后一次失败原因
    pub error: String,
    pub delivery_attempts: u32,
    pub failed_at: DateTime<Utc>,
    pub source_service: String,
}

impl DeadLetterMessage {
    pub fn from_consumed(msg: &ConsumerMessage, error: &str, source_service: &str) -> Self {
        let message_id = msg
            .key
            .clone()
            .unwrap_or_else(|| format!("{}/{}/{}", msg.topic, msg.partition, msg.offset));

        Self {
            message_id,
            source_topic: msg.topic.clone(),
            source_partition: msg.partition,
            source_offset: msg.offset,
            routing_key: msg.routing_key().map(String::from),
            payload: String::from_utf8_lossy(&msg.payload).into_owned(),
            error: error.to_string(),
            delivery_attempts: msg.delivery_attempt(),
            failed_at: Utc::now(),
            source_service: source_service.to_string(),
        }
    }
}

/// 死信生产者
#[derive(Clone)]
pub struct DlqProducer {
    producer: KafkaProducer,
    dlq_topic: String,
    source_service: String,
}

impl DlqProducer {
    pub fn new(producer: KafkaProducer, dlq_topic: &str, source_service: &str) -> Self {
        Self {
            producer,
            dlq_topic: dlq_topic.to_string(),
            source_service: source_service.to_string(),
        }
    }

    /// 将消费失败的消息写入死信 topic，等待 broker 确认后返回
    pub async fn send_to_dlq(
        &self,
        msg: &ConsumerMessage,
        error: &str,
    ) -> Result<(), FulfillmentError> {
        let dead_letter = DeadLetterMessage::from_consumed(msg, error, &self.source_service);
        let payload = serde_json::to_vec(&dead_letter)?;

        let mut dlq_headers = HashMap::new();
        dlq_headers.insert(
            headers::CONTENT_TYPE.to_string(),
            "application/json".to_string(),
        );

        self.producer
            .send(
                &self.dlq_topic,
                &dead_letter.message_id,
                &payload,
                &dlq_headers,
            )
            .await?;

        warn!(
            message_id = %dead_letter.message_id,
            source_topic = %dead_letter.source_topic,
            delivery_attempts = dead_letter.delivery_attempts,
            error,
            "消息已发送到死信队列"
        );
        Ok(())
    }
}
