//! 履约链路端到端测试
//!
//! 支付审批 → 事件发布 → 配送消费 → 配送状态流转。
//! Kafka 由内存桥接替代：发布的事件按线上格式编码，直接交给配送侧的消息处理逻辑。
//! 需要两个 PostgreSQL 库（TEST_PAYMENT_DATABASE_URL / TEST_DELIVERY_DATABASE_URL），以 `--ignored` 运行。

pub mod setup;
pub mod suites;

pub use setup::TestEnvironment;
