//! 测试环境

mod bridge;
mod environment;

pub use bridge::BrokerBridge;
pub use environment::TestEnvironment;
