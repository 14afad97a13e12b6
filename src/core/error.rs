//! 错误类型
//!
//! - `ComponentError`：被保护组件抛出的结构化错误（名称 / 代码 / 消息 / 组件），是分类器的输入
//! - `EmergencyError`：韧性子系统自身的错误分类（熔断打开、完整性校验失败、单组件回滚失败、应急系统不可用等）

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 组件抛出的错误：name 近似异常类型（TimeoutError、SecurityError…），code 为业务错误码（SYSTEM_CRASH…）
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{name}: {message}")]
pub struct ComponentError {
    pub name: String,
    pub code: Option<String>,
    pub message: String,
    /// 抛出错误的组件（若已知）
    pub component: Option<String>,
}

impl ComponentError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            name: "Error".to_string(),
            code: None,
            message: message.into(),
            component: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }
}

impl From<anyhow::Error> for ComponentError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}

impl From<std::io::Error> for ComponentError {
    fn from(err: std::io::Error) -> Self {
        let code = format!("{:?}", err.kind());
        Self::new(err.to_string()).with_name("IoError").with_code(code)
    }
}

/// 韧性子系统错误
#[derive(Error, Debug)]
pub enum EmergencyError {
    /// 熔断打开，快速失败（不会调用被保护的操作）
    #[error("Circuit breaker is open for {component}")]
    CircuitOpen { component: String },

    /// 备份哈希不匹配，回滚在任何修改之前被拒绝
    #[error("Backup {backup_id} failed integrity check (expected {expected}, computed {actual})")]
    Integrity {
        backup_id: String,
        expected: String,
        actual: String,
    },

    /// 单组件回滚失败（不影响其它组件）
    #[error("Rollback of component {component} failed: {reason}")]
    RollbackComponent { component: String, reason: String },

    /// 应急系统自身降级或拒绝准入
    #[error("Emergency system unavailable: {0}")]
    SystemUnavailable(String),

    #[error("Backup {0} not found")]
    BackupNotFound(String),

    #[error("Backup {backup_id} failed: {reason}")]
    BackupFailed { backup_id: String, reason: String },

    /// 事故无法持久化：唯一会上抛到进程级故障处理的内部错误
    #[error("Incident log error: {0}")]
    IncidentLog(String),

    /// 受保护操作本身的失败（经熔断器透传）
    #[error("Component error: {0}")]
    Component(#[from] ComponentError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type EmergencyResult<T> = Result<T, EmergencyError>;
