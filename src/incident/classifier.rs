//! 错误分类器：把组件错误 + 上下文映射为严重级别、类型、影响面与是否需要回滚
//!
//! 严重级别按顺序判定：critical → high → medium → low。

use serde::{Deserialize, Serialize};

use crate::core::ComponentError;

/// 严重级别（可比较：Low < Medium < High < Critical）
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// 错误类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    CodeError,
    PerformanceError,
    CommunicationError,
    SecurityError,
    DataError,
    ConfigError,
    AgentError,
    SystemError,
    UnknownError,
}

impl ErrorType {
    /// 固定查找表：先按 name，再按 code
    fn lookup(key: &str) -> Option<Self> {
        let t = match key {
            "TypeError" | "ReferenceError" => Self::CodeError,
            "TimeoutError" => Self::PerformanceError,
            "NetworkError" | "COMMUNICATION_ERROR" => Self::CommunicationError,
            "SecurityError" => Self::SecurityError,
            "ValidationError" => Self::DataError,
            "ConfigurationError" => Self::ConfigError,
            "AGENT_FAILURE" => Self::AgentError,
            "SYSTEM_CRASH" => Self::SystemError,
            _ => return None,
        };
        Some(t)
    }
}

/// 影响面
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Impact {
    Low,
    Medium,
    High,
}

/// 错误发生时的上下文
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorContext {
    /// 出错的目标组件（优先于错误自身携带的组件）
    pub target_component: Option<String>,
    /// 检测到数据损坏
    #[serde(default)]
    pub data_corruption: bool,
    /// 性能下降比例（0.0 - 1.0）
    pub performance_drop: Option<f64>,
    pub user_impact: Option<Impact>,
    #[serde(default)]
    pub optimization_failure: bool,
    /// 影响全系统
    #[serde(default)]
    pub system_wide: bool,
    /// 这次失败使目标组件的熔断器打开
    #[serde(default)]
    pub circuit_tripped: bool,
    /// 进程级致命故障路径设置
    #[serde(default)]
    pub critical: bool,
    /// 触发错误的原始请求（可选，仅用于记录）
    pub request: Option<String>,
}

impl ErrorContext {
    pub fn for_component(component: impl Into<String>) -> Self {
        Self {
            target_component: Some(component.into()),
            ..Self::default()
        }
    }
}

/// 分类结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub severity: Severity,
    #[serde(rename = "type")]
    pub error_type: ErrorType,
    pub impact: Impact,
    pub containable: bool,
    pub rollback_required: bool,
    pub affected_components: Vec<String>,
}

const SYSTEM_WIDE_MARKERS: [&str; 12] = [
    "enospc", "enomem", "enotdir", "eacces", "database", "connection", "network", "timeout",
    "system", "critical", "fatal", "no space left",
];

/// 错误分类器（无状态，可并发调用）
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, error: &ComponentError, context: &ErrorContext) -> Classification {
        Classification {
            severity: self.severity(error, context),
            error_type: self.error_type(error),
            impact: self.impact(context),
            containable: error.code() != Some("SYSTEM_CRASH"),
            rollback_required: self.requires_rollback(error, context),
            affected_components: self.affected_components(error, context),
        }
    }

    fn signals_crash(error: &ComponentError, context: &ErrorContext) -> bool {
        error.code() == Some("SYSTEM_CRASH") || error.message.contains("FATAL") || context.critical
    }

    fn signals_security(error: &ComponentError) -> bool {
        error.name == "SecurityError"
    }

    fn signals_corruption(error: &ComponentError, context: &ErrorContext) -> bool {
        context.data_corruption
            || error.code() == Some("data_corruption")
            || error.name == "data_corruption"
    }

    fn severity(&self, error: &ComponentError, context: &ErrorContext) -> Severity {
        if Self::signals_crash(error, context)
            || Self::signals_security(error)
            || Self::signals_corruption(error, context)
        {
            return Severity::Critical;
        }

        if error.code() == Some("AGENT_FAILURE")
            || context.performance_drop.is_some_and(|d| d > 0.5)
            || context.user_impact == Some(Impact::High)
        {
            return Severity::High;
        }

        if error.code() == Some("COMMUNICATION_ERROR")
            || error.name == "TimeoutError"
            || error.name == "NetworkError"
            || context.optimization_failure
            || context.circuit_tripped
        {
            return Severity::Medium;
        }

        Severity::Low
    }

    fn error_type(&self, error: &ComponentError) -> ErrorType {
        ErrorType::lookup(&error.name)
            .or_else(|| error.code().and_then(ErrorType::lookup))
            .unwrap_or(ErrorType::UnknownError)
    }

    fn impact(&self, context: &ErrorContext) -> Impact {
        if let Some(impact) = context.user_impact {
            return impact;
        }
        if context.system_wide {
            Impact::High
        } else {
            Impact::Medium
        }
    }

    /// 仅崩溃 / 数据损坏 / 安全信号需要回滚
    fn requires_rollback(&self, error: &ComponentError, context: &ErrorContext) -> bool {
        error.code() == Some("SYSTEM_CRASH")
            || Self::signals_security(error)
            || Self::signals_corruption(error, context)
    }

    fn affected_components(&self, error: &ComponentError, context: &ErrorContext) -> Vec<String> {
        if let Some(target) = &context.target_component {
            return vec![target.clone()];
        }
        if let Some(component) = &error.component {
            return vec![component.clone()];
        }
        vec!["unknown".to_string()]
    }

    /// 粗略判断错误是否波及全系统（磁盘满、内存不足、数据库 / 网络连接等）
    pub fn is_system_wide(&self, error: &ComponentError) -> bool {
        let haystack = format!(
            "{} {} {}",
            error.name,
            error.code().unwrap_or_default(),
            error.message
        )
        .to_lowercase();
        SYSTEM_WIDE_MARKERS.iter().any(|m| haystack.contains(m))
    }
}
