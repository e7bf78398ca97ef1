//! 应用状态定义

use std::sync::Arc;

use fulfillment_shared::database::Database;

use crate::service::ApprovalService;

/// Axum 应用共享状态
#[derive(Clone)]
pub struct AppState {
    /// 数据库连接池，就绪探针使用
    pub db: Database,
    pub approval: Arc<ApprovalService>,
}

impl AppState {
    pub fn new(db: Database, approval: Arc<ApprovalService>) -> Self {
        Self { db, approval }
    }
}
