//! 熔断器：按组件统计失败 / 成功并维护 Closed → Open → HalfOpen 状态机
//!
//! ```text
//! Closed   → Open:     failure_count >= threshold
//! Open     → HalfOpen: 距上次失败超过 open_timeout 后的第一次调用
//! HalfOpen → Closed:   连续 half_open_max_calls 次成功（failure_count 归零）
//! HalfOpen → Open:     探测调用失败
//! ```
//!
//! Closed 状态下成功只把 failure_count 减一（下限 0），避免抖动时瞬间清零。

pub mod registry;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::core::{ComponentError, EmergencyError};

use crate::config::BreakerSection;

pub use registry::BreakerRegistry;

/// 熔断状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// 熔断参数
#[derive(Clone, Copy, Debug)]
pub struct BreakerConfig {
    pub threshold: u32,
    pub open_timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            open_timeout: Duration::from_millis(30_000),
            half_open_max_calls: 3,
        }
    }
}

impl From<&BreakerSection> for BreakerConfig {
    fn from(section: &BreakerSection) -> Self {
        Self {
            threshold: section.failure_threshold.max(1),
            open_timeout: Duration::from_millis(section.open_timeout_ms),
            half_open_max_calls: section.half_open_max_calls.max(1),
        }
    }
}

/// 准入结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// 刚从 Open 迁移到 HalfOpen，本次调用是探测
    Probe,
    Rejected,
}

/// 一次调用结束后发生的状态迁移
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    None,
    Opened,
    Closed,
}

/// 单个组件的熔断器，只由 BreakerRegistry 持有和修改
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    component: String,
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    config: BreakerConfig,
    last_failure_at: Option<DateTime<Utc>>,
    /// 单调时钟上的最近失败时刻，用于判断 Open 超时
    last_failure: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(component: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            component: component.into(),
            state: BreakerState::Closed,
            failure_count: 0,
            success_count: 0,
            config,
            last_failure_at: None,
            last_failure: None,
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn success_count(&self) -> u32 {
        self.success_count
    }

    fn open_elapsed(&self, now: Instant) -> bool {
        match self.last_failure {
            Some(at) => now.saturating_duration_since(at) >= self.config.open_timeout,
            None => true,
        }
    }

    /// 调用前检查：Open 且未超时则拒绝；Open 且已超时则迁移到 HalfOpen 并放行探测
    pub fn admit(&mut self, now: Instant) -> Admission {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => Admission::Allowed,
            BreakerState::Open if self.open_elapsed(now) => {
                self.state = BreakerState::HalfOpen;
                self.success_count = 0;
                tracing::info!(component = %self.component, "Circuit breaker moved to half-open");
                Admission::Probe
            }
            BreakerState::Open => Admission::Rejected,
        }
    }

    pub fn on_success(&mut self) -> Transition {
        match self.state {
            BreakerState::HalfOpen => {
                self.success_count += 1;
                if self.success_count >= self.config.half_open_max_calls {
                    self.state = BreakerState::Closed;
                    self.failure_count = 0;
                    self.success_count = 0;
                    tracing::info!(component = %self.component, "Circuit breaker closed, component recovered");
                    return Transition::Closed;
                }
                Transition::None
            }
            _ => {
                self.failure_count = self.failure_count.saturating_sub(1);
                Transition::None
            }
        }
    }

    pub fn on_failure(&mut self, now: Instant) -> Transition {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure = Some(now);
        self.last_failure_at = Some(Utc::now());

        let reopen = self.state == BreakerState::HalfOpen;
        if self.state != BreakerState::Open
            && (reopen || self.failure_count >= self.config.threshold)
        {
            self.state = BreakerState::Open;
            self.success_count = 0;
            tracing::warn!(
                component = %self.component,
                failures = self.failure_count,
                "Circuit breaker opened"
            );
            return Transition::Opened;
        }
        Transition::None
    }

    /// 强制关闭并清零计数（人工重置）
    pub fn reset(&mut self) {
        self.state = BreakerState::Closed;
        self.failure_count = 0;
        self.success_count = 0;
        self.last_failure = None;
        self.last_failure_at = None;
    }

    /// 强制打开（circuit_break 响应动作）
    pub fn trip(&mut self, now: Instant) {
        self.state = BreakerState::Open;
        self.failure_count = self.failure_count.max(self.config.threshold);
        self.success_count = 0;
        self.last_failure = Some(now);
        self.last_failure_at = Some(Utc::now());
    }

    /// 不修改状态地判断当前是否会放行
    pub fn is_available(&self, now: Instant) -> bool {
        self.state != BreakerState::Open || self.open_elapsed(now)
    }

    pub fn status(&self, now: Instant) -> BreakerStatus {
        BreakerStatus {
            component: self.component.clone(),
            state: self.state,
            failure_count: self.failure_count,
            success_count: self.success_count,
            threshold: self.config.threshold,
            last_failure_at: self.last_failure_at,
            available: self.is_available(now),
        }
    }
}

/// 熔断器对外状态
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerStatus {
    pub component: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u32,
    pub threshold: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub available: bool,
}

/// 受保护调用的错误：熔断拒绝，或操作本身失败（tripped 表示这次失败打开了熔断）
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("Circuit breaker is open for {component}")]
    Open { component: String },

    #[error("{error}")]
    Operation { error: E, tripped: bool },
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

impl From<BreakerError<ComponentError>> for EmergencyError {
    fn from(err: BreakerError<ComponentError>) -> Self {
        match err {
            BreakerError::Open { component } => EmergencyError::CircuitOpen { component },
            BreakerError::Operation { error, .. } => EmergencyError::Component(error),
        }
    }
}
