//! 共享库
//!
//! 支付服务与配送服务共用的配置、错误处理、数据库连接、Kafka、事件模型、
//! 订单状态机与可观测性基础设施。

pub mod config;
pub mod database;
pub mod dlq;
pub mod error;
pub mod events;
pub mod kafka;
pub mod observability;
pub mod retry;
pub mod status;
