//! 统一错误处理模块
//!
//! 定义两个服务共用的基础设施错误类型，使用 thiserror 提供良好的错误信息。
//! 业务错误（订单不存在、非法状态流转等）由各服务自己的错误类型表达。

use thiserror::Error;

/// 系统错误类型
#[derive(Debug, Error)]
pub enum FulfillmentError {
    // ==================== 数据库错误 ====================
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库迁移失败: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // ==================== 消息中间件错误 ====================
    #[error("Kafka 错误: {0}")]
    Kafka(String),

    #[error("事件发布失败: {0}")]
    Publish(String),

    #[error("序列化失败: {0}")]
    Serialization(#[from] serde_json::Error),

    // ==================== 验证错误 ====================
    #[error("参数验证失败: {0}")]
    Validation(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, FulfillmentError>;

impl FulfillmentError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Database(_) => "DATABASE_ERROR",
            Self::Migration(_) => "MIGRATION_ERROR",
            Self::Kafka(_) => "KAFKA_ERROR",
            Self::Publish(_) => "PUBLISH_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Validation(_) => "VALIDATION_ERROR",
        }
    }

    /// 是否为可重试错误
    ///
    /// 只有基础设施类的瞬时故障值得重试，业务冲突重试多少次结果都一样。
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Kafka(_) | Self::Publish(_))
    }
}
