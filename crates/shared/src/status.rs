//! 订单状态机
//!
//! 支付侧与配送侧各自维护一条线性的订单生命周期：
//!
//! - 支付侧：`CREATED -> PAID`
//! - 配送侧：`READY -> SHIPPING -> DELIVERED`
//!
//! 每个状态至多有一个合法的后继状态，不允许跳跃，也不允许回退。
//! 状态机本身是纯函数，行锁与事务由调用方（仓储/服务层）负责。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 非法状态流转
///
/// 携带当前状态与唯一允许的下一状态，便于调用方原样返回给客户端。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "非法状态流转: current={current}, requested={requested}, allowed={}",
    .allowed.as_deref().unwrap_or("none")
)]
pub struct TransitionError {
    pub current: String,
    pub requested: String,
    /// 当前状态唯一合法的后继；终态为 None
    pub allowed: Option<String>,
}

/// 无法识别的状态字面量
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("未知的订单状态: {0}")]
pub struct UnknownStatus(pub String);

/// 线性生命周期
///
/// 实现者只需给出每个状态的唯一后继，流转校验逻辑由默认方法统一提供。
pub trait LinearLifecycle: Copy + Eq + fmt::Display + FromStr<Err = UnknownStatus> {
    /// 当前状态唯一合法的后继状态
    fn next(self) -> Option<Self>;

    /// 是否为终态
    fn is_terminal(self) -> bool {
        self.next().is_none()
    }

    /// 校验从 `self` 流转到 `target` 是否合法
    fn transition_to(self, target: Self) -> Result<Self, TransitionError> {
        match self.next() {
            Some(next) if next == target => Ok(target),
            allowed => Err(TransitionError {
                current: self.to_string(),
                requested: target.to_string(),
                allowed: allowed.map(|s| s.to_string()),
            }),
        }
    }
}

/// 校验数据库中读出的原始状态能否流转到 `target`
///
/// 库里的值可能大小写不一致，也可能是本服务不认识的历史状态；
/// 不认识的状态一律视为没有合法后继。
pub fn check_stored_transition<S: LinearLifecycle>(
    stored: &str,
    target: S,
) -> Result<S, TransitionError> {
    match stored.parse::<S>() {
        Ok(current) => current.transition_to(target),
        Err(_) => Err(TransitionError {
            current: stored.trim().to_uppercase(),
            requested: target.to_string(),
            allowed: None,
        }),
    }
}

// ---------------------------------------------------------------------------
// DeliveryStatus — 配送侧
// ---------------------------------------------------------------------------

/// 配送订单状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    /// 待发货 - 消费到支付完成事件后创建
    Ready,
    /// 配送中
    Shipping,
    /// 已送达（终态）
    Delivered,
}

impl DeliveryStatus {
    pub const ALL: [DeliveryStatus; 3] = [Self::Ready, Self::Shipping, Self::Delivered];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::Shipping => "SHIPPING",
            Self::Delivered => "DELIVERED",
        }
    }
}

impl LinearLifecycle for DeliveryStatus {
    fn next(self) -> Option<Self> {
        match self {
            Self::Ready => Some(Self::Shipping),
            Self::Shipping => Some(Self::Delivered),
            Self::Delivered => None,
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = UnknownStatus;

    /// 大小写不敏感，忽略首尾空白
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "READY" => Ok(Self::Ready),
            "SHIPPING" => Ok(Self::Shipping),
            "DELIVERED" => Ok(Self::Delivered),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// PaymentStatus — 支付侧
// ---------------------------------------------------------------------------

/// 支付侧订单状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    /// 已下单，待支付
    Created,
    /// 已支付（终态）
    Paid,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Paid => "PAID",
        }
    }
}

impl LinearLifecycle for PaymentStatus {
    fn next(self) -> Option<Self> {
        match self {
            Self::Created => Some(Self::Paid),
            Self::Paid => None,
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "CREATED" => Ok(Self::Created),
            "PAID" => Ok(Self::Paid),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}
