//! 系统状态：进程级唯一的 SystemState
//!
//! 只有应急门面会推动状态迁移（冻结 → Recovery，恢复 → Normal，回滚失败 → Degraded，
//! 降级期间关键事故仍未恢复 → Emergency，关闭 → Shutdown）；
//! 其它组件只读。

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// 进程级系统状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemState {
    Normal,
    Degraded,
    Emergency,
    /// 回滚期间：入口应拒绝新请求
    Recovery,
    Shutdown,
}

impl SystemState {
    /// 入口准入：Recovery / Shutdown 时拒绝新请求
    pub fn accepts_requests(self) -> bool {
        !matches!(self, Self::Recovery | Self::Shutdown)
    }
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Normal => "normal",
            Self::Degraded => "degraded",
            Self::Emergency => "emergency",
            Self::Recovery => "recovery",
            Self::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// 共享的系统状态单元
#[derive(Debug)]
pub struct SystemStateCell {
    state: RwLock<SystemState>,
}

impl SystemStateCell {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(SystemState::Normal),
        }
    }

    pub async fn get(&self) -> SystemState {
        *self.state.read().await
    }

    /// 仅当当前状态为 `from` 时迁移到 `to`
    pub async fn transition(&self, from: SystemState, to: SystemState) -> bool {
        let mut guard = self.state.write().await;
        if *guard != from {
            return false;
        }
        if from != to {
            tracing::info!(from = %from, to = %to, "System state transition");
        }
        *guard = to;
        true
    }

    /// 设置新状态，返回旧状态
    pub async fn set(&self, next: SystemState) -> SystemState {
        let mut guard = self.state.write().await;
        let prev = *guard;
        if prev != next {
            tracing::info!(from = %prev, to = %next, "System state transition");
        }
        *guard = next;
        prev
    }
}

impl Default for SystemStateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_state_cell_transitions() {
        let cell = SystemStateCell::new();
        assert_eq!(cell.get().await, SystemState::Normal);
        let prev = cell.set(SystemState::Recovery).await;
        assert_eq!(prev, SystemState::Normal);
        assert_eq!(cell.get().await, SystemState::Recovery);
    }

    #[tokio::test]
    async fn test_conditional_transition() {
        let cell = SystemStateCell::new();
        assert!(!cell.transition(SystemState::Degraded, SystemState::Emergency).await);
        assert_eq!(cell.get().await, SystemState::Normal);

        cell.set(SystemState::Degraded).await;
        assert!(cell.transition(SystemState::Degraded, SystemState::Emergency).await);
        assert_eq!(cell.get().await, SystemState::Emergency);
    }

    #[test]
    fn test_admission_by_state() {
        assert!(SystemState::Normal.accepts_requests());
        assert!(SystemState::Degraded.accepts_requests());
        assert!(SystemState::Emergency.accepts_requests());
        assert!(!SystemState::Recovery.accepts_requests());
        assert!(!SystemState::Shutdown.accepts_requests());
    }
}
