//! 应用状态定义

use std::sync::Arc;

use fulfillment_shared::database::Database;

use crate::service::StatusService;

/// Axum 应用共享状态
#[derive(Clone)]
pub struct AppState {
    /// 数据库连接池，就绪探针使用
    pub db: Database,
    pub status: Arc<StatusService>,
}

impl AppState {
    pub fn new(db: Database, status: Arc<StatusService>) -> Self {
        Self { db, status }
    }
}
