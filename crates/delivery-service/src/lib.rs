//! 配送服务
//!
//! 消费支付完成事件，借助收件箱表去重后生成待发货订单，
//! 并通过 HTTP 接口推进 `READY -> SHIPPING -> DELIVERED` 配送状态。

pub mod consumer;
pub mod dto;
pub mod error;
pub mod handlers;
pub mod processor;
pub mod repository;
pub mod routes;
pub mod service;
pub mod state;

use sqlx::migrate::Migrator;

pub const SERVICE_NAME: &str = "delivery-service";

/// 配送库迁移
pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations/delivery");
