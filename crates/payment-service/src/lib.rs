//! 支付服务
//!
//! 负责订单支付审批：在一个事务里完成订单状态流转、支付记录与 outbox 事件写入，
//! 事件随后发布到 Kafka，由配送服务消费。

pub mod dto;
pub mod error;
pub mod handlers;
pub mod outbox;
pub mod publisher;
pub mod repository;
pub mod routes;
pub mod service;
pub mod state;

use sqlx::migrate::Migrator;

pub const SERVICE_NAME: &str = "payment-service";

/// 支付库迁移
pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations/payment");
