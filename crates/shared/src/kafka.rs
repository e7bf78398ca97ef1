//! Kafka 基础设施封装
//!
//! 事件总线按 topic exchange 的语义使用 Kafka：
//!
//! - topic 对应交换机，消息头 `routing-key` 携带路由键，消息 key 为订单号；
//! - 消费组对应持久队列，消费端按绑定模式（`*` 匹配一个词，`#` 匹配零或多个词）过滤；
//! - 生产端 `acks=all` 并等待投递回执，相当于发布确认；
//! - 消费端关闭自动存储 offset，只有处理完成（确认）后才存储，相当于手动 ack。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use tokio::sync::{OnceCell, watch};
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::error::FulfillmentError;

// ---------------------------------------------------------------------------
// Topic 与消息头常量
// ---------------------------------------------------------------------------

/// 集中管理 topic 名称
pub mod topics {
    pub const PAYMENT_EVENTS: &str = "payment.events";
    pub const PAYMENT_EVENTS_DLQ: &str = "payment.events.dlq";

    /// 由事件 topic 推导对应的死信 topic
    pub fn dead_letter_for(topic: &str) -> String {
        format!("{topic}.dlq")
    }
}

/// 消息头名称
pub mod headers {
    /// 路由键
    pub const ROUTING_KEY: &str = "routing-key";
    /// 第几次投递，首次投递时缺省为 1
    pub const DELIVERY_ATTEMPT: &str = "x-delivery-attempt";
    /// 事件 ID，便于不解码负载就能在日志中定位
    pub const EVENT_ID: &str = "event-id";
    pub const CONTENT_TYPE: &str = "content-type";
}

/// 按 topic exchange 规则判断路由键是否匹配绑定模式
///
/// 模式与路由键都以 `.` 分词；`*` 恰好匹配一个词，`#` 匹配零个或多个词。
pub fn routing_key_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&head, tail)) if word == "*" || word == head => match_words(rest, tail),
            _ => false,
        },
    }
}

// ---------------------------------------------------------------------------
// ConsumerMessage
// ---------------------------------------------------------------------------

/// 消费到的 Kafka 消息的统一表示
///
/// 将 rdkafka 的 `BorrowedMessage`（带生命周期约束）转换为拥有所有权的结构体，
/// 使消息可以安全地跨 await 点传递给异步处理函数。
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
}

impl ConsumerMessage {
    fn from_borrowed(msg: &BorrowedMessage<'_>) -> Self {
        let key = msg
            .key()
            .and_then(|k| std::str::from_utf8(k).ok())
            .map(String::from);

        let payload = msg.payload().map(|p| p.to_vec()).unwrap_or_default();

        let mut headers = HashMap::new();
        if let Some(h) = msg.headers() {
            for idx in 0..h.count() {
                let header = h.get(idx);
                if let Some(raw) = header.value
                    && let Ok(value) = std::str::from_utf8(raw)
                {
                    headers.insert(header.key.to_string(), value.to_string());
                }
            }
        }

        Self {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            payload,
            timestamp: msg.timestamp().to_millis(),
            headers,
        }
    }

    /// 消息头中的路由键
    pub fn routing_key(&self) -> Option<&str> {
        self.headers.get(headers::ROUTING_KEY).map(String::as_str)
    }

    /// 当前是第几次投递（首次为 1）
    pub fn delivery_attempt(&self) -> u32 {
        self.headers
            .get(headers::DELIVERY_ATTEMPT)
            .and_then(|v| v.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(1)
    }

    /// 是否为重投递
    pub fn redelivered(&self) -> bool {
        self.delivery_attempt() > 1
    }

    /// 构造重新入队时携带的消息头：投递次数加一，其余原样保留
    pub fn requeue_headers(&self) -> HashMap<String, String> {
        let mut headers = self.headers.clone();
        headers.insert(
            headers::DELIVERY_ATTEMPT.to_string(),
            (self.delivery_attempt() + 1).to_string(),
        );
        headers
    }
}

// ---------------------------------------------------------------------------
// Topology — 懒声明 topic
// ---------------------------------------------------------------------------

/// 按需创建 topic，每个进程只声明一次
///
/// 已存在的 topic 视为成功，多个进程或多个服务并发声明同一 topic 不会出错。
#[derive(Clone)]
pub struct Topology {
    admin_config: ClientConfig,
    topics: Vec<String>,
    partitions: i32,
    replication_factor: i32,
    declared: Arc<OnceCell<()>>,
}

impl Topology {
    pub fn new(config: &KafkaConfig, topics: &[&str]) -> Self {
        let mut admin_config = ClientConfig::new();
        admin_config.set("bootstrap.servers", &config.brokers);

        Self {
            admin_config,
            topics: topics.iter().map(|t| t.to_string()).collect(),
            partitions: config.partitions,
            replication_factor: config.replication_factor,
            declared: Arc::new(OnceCell::new()),
        }
    }

    /// 确保全部 topic 已存在；失败时不缓存结果，下一次调用会重新声明
    pub async fn ensure(&self) -> Result<(), FulfillmentError> {
        self.declared
            .get_or_try_init(|| self.declare())
            .await
            .map(|_| ())
    }

    async fn declare(&self) -> Result<(), FulfillmentError> {
        let admin: AdminClient<DefaultClientContext> = self
            .admin_config
            .create()
            .map_err(|e| FulfillmentError::Kafka(format!("创建管理客户端失败: {e}")))?;

        let new_topics: Vec<NewTopic<'_>> = self
            .topics
            .iter()
            .map(|name| {
                NewTopic::new(
                    name,
                    self.partitions,
                    TopicReplication::Fixed(self.replication_factor),
                )
            })
            .collect();

        let results = admin
            .create_topics(new_topics.iter(), &AdminOptions::new())
            .await
            .map_err(|e| FulfillmentError::Kafka(format!("声明 topic 失败: {e}")))?;

        for result in results {
            match result {
                Ok(name) => info!(topic = %name, "已创建 topic"),
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!(topic = %name, "topic 已存在")
                }
                Err((name, code)) => {
                    return Err(FulfillmentError::Kafka(format!(
                        "声明 topic {name} 失败: {code}"
                    )));
                }
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// KafkaProducer
// ---------------------------------------------------------------------------

/// 带发布确认的 Kafka 生产者
///
/// `FutureProducer` 内部是 Arc 包装的，克隆开销很小。
#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
    send_timeout: Duration,
}

impl KafkaProducer {
    /// 根据配置创建生产者
    ///
    /// `acks=all` 加幂等写入，只有所有同步副本落盘后投递回执才会成功。
    pub fn new(config: &KafkaConfig) -> Result<Self, FulfillmentError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("message.timeout.ms", config.message_timeout_ms.to_string())
            .create()
            .map_err(|e| FulfillmentError::Kafka(format!("创建生产者失败: {e}")))?;

        info!(brokers = %config.brokers, "Kafka 生产者已初始化");
        Ok(Self {
            producer,
            send_timeout: config.message_timeout(),
        })
    }

    /// 发送消息并等待 broker 确认
    pub async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
        headers: &HashMap<String, String>,
    ) -> Result<(i32, i64), FulfillmentError> {
        let mut owned_headers = OwnedHeaders::new_with_capacity(headers.len());
        for (name, value) in headers {
            owned_headers = owned_headers.insert(Header {
                key: name.as_str(),
                value: Some(value.as_bytes()),
            });
        }

        let record = FutureRecord::to(topic)
            .key(key)
            .payload(payload)
            .headers(owned_headers);

        let delivery = self
            .producer
            .send(record, self.send_timeout)
            .await
            .map_err(|(e, _)| FulfillmentError::Publish(format!("发送消息失败: {e}")))?;

        debug!(
            topic,
            key,
            partition = delivery.partition,
            offset = delivery.offset,
            "消息已确认"
        );
        Ok((delivery.partition, delivery.offset))
    }

    /// 关闭前刷出队列中尚未投递的消息
    pub fn flush(&self, timeout: Duration) {
        if let Err(e) = self.producer.flush(timeout) {
            warn!(error = %e, "关闭前刷出 Kafka 生产者队列失败");
        }
    }
}

// ---------------------------------------------------------------------------
// KafkaConsumer
// ---------------------------------------------------------------------------

/// 手动确认的 Kafka 消费者
///
/// 关闭自动存储 offset：处理函数返回成功才存储该消息的 offset，
/// 由后台自动提交写回 broker。处理函数返回错误时消费循环立即退出，
/// 未确认的消息会在重启或再均衡后重新投递。
pub struct KafkaConsumer {
    consumer: StreamConsumer,
}

impl KafkaConsumer {
    pub fn new(config: &KafkaConfig) -> Result<Self, FulfillmentError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.consumer_group)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .create()
            .map_err(|e| FulfillmentError::Kafka(format!("创建消费者失败: {e}")))?;

        info!(
            brokers = %config.brokers,
            group_id = %config.consumer_group,
            "Kafka 消费者已初始化"
        );
        Ok(Self { consumer })
    }

    pub fn subscribe(&self, topics: &[&str]) -> Result<(), FulfillmentError> {
        self.consumer
            .subscribe(topics)
            .map_err(|e| FulfillmentError::Kafka(format!("订阅 topic 失败: {e}")))?;

        info!(?topics, "已订阅 Kafka topics");
        Ok(())
    }

    /// 启动消费循环
    ///
    /// 最多 `prefetch` 条消息同时处理，结果按接收顺序确认。
    /// 关闭信号到来后不再拉取新消息，已在处理中的消息处理完并确认后返回。
    pub async fn run<F, Fut>(
        self,
        shutdown: watch::Receiver<bool>,
        prefetch: usize,
        handler: F,
    ) -> Result<(), FulfillmentError>
    where
        F: Fn(ConsumerMessage) -> Fut,
        Fut: std::future::Future<Output = Result<(), FulfillmentError>>,
    {
        let mut shutdown = shutdown;
        let stop = async move {
            let _ = shutdown.wait_for(|stopping| *stopping).await;
            info!("收到关闭信号，停止拉取新消息");
        };

        let handler = &handler;
        let in_flight = self
            .consumer
            .stream()
            .take_until(stop)
            .filter_map(received_to_owned)
            .map(|msg| {
                debug!(
                    topic = %msg.topic,
                    partition = msg.partition,
                    offset = msg.offset,
                    "收到 Kafka 消息"
                );
                let position = (msg.topic.clone(), msg.partition, msg.offset);
                let fut = handler(msg);
                async move { (position, fut.await) }
            })
            .buffered(prefetch.max(1));
        futures::pin_mut!(in_flight);

        info!(prefetch, "Kafka 消费循环已启动");

        while let Some(((topic, partition, offset), result)) = in_flight.next().await {
            result?;
            // librdkafka 存储的是 offset + 1，即下一条待消费的位置
            self.consumer
                .store_offset(&topic, partition, offset)
                .map_err(|e| FulfillmentError::Kafka(format!("存储 offset 失败: {e}")))?;
        }

        info!("Kafka 消费循环已退出");
        Ok(())
    }
}

/// 将接收结果转换为拥有所有权的消息，接收出错时记录并跳过
fn received_to_owned(
    received: Result<BorrowedMessage<'_>, rdkafka::error::KafkaError>,
) -> futures::future::Ready<Option<ConsumerMessage>> {
    futures::future::ready(match received {
        Ok(borrowed) => Some(ConsumerMessage::from_borrowed(&borrowed)),
        Err(e) => {
            error!(error = %e, "接收 Kafka 消息出错");
            None
        }
    })
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------
