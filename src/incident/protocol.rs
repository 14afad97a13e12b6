//! 响应协议：严重级别 → 有序动作列表 + 截止时间
//!
//! 静态查表，无状态访问，可在任意线程并发调用。

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::Severity;

/// 响应动作（封闭枚举；未识别的名称保留在 Unknown 中，执行时为成功的空操作）
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ActionKind {
    FreezeSystem,
    ExecuteRollback,
    NotifyAdmin,
    CircuitBreak,
    FallbackMode,
    Escalate,
    Retry,
    LogWarning,
    Monitor,
    LogInfo,
    ScheduleReview,
    CreateEmergencyBackup,
    Unknown(String),
}

impl ActionKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::FreezeSystem => "freeze_system",
            Self::ExecuteRollback => "execute_rollback",
            Self::NotifyAdmin => "notify_admin",
            Self::CircuitBreak => "circuit_break",
            Self::FallbackMode => "fallback_mode",
            Self::Escalate => "escalate",
            Self::Retry => "retry",
            Self::LogWarning => "log_warning",
            Self::Monitor => "monitor",
            Self::LogInfo => "log_info",
            Self::ScheduleReview => "schedule_review",
            Self::CreateEmergencyBackup => "create_emergency_backup",
            Self::Unknown(name) => name,
        }
    }
}

impl From<&str> for ActionKind {
    fn from(s: &str) -> Self {
        match s {
            "freeze_system" => Self::FreezeSystem,
            "execute_rollback" => Self::ExecuteRollback,
            "notify_admin" => Self::NotifyAdmin,
            "circuit_break" => Self::CircuitBreak,
            "fallback_mode" => Self::FallbackMode,
            "escalate" => Self::Escalate,
            "retry" => Self::Retry,
            "log_warning" => Self::LogWarning,
            "monitor" => Self::Monitor,
            "log_info" => Self::LogInfo,
            "schedule_review" => Self::ScheduleReview,
            "create_emergency_backup" => Self::CreateEmergencyBackup,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl From<String> for ActionKind {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<ActionKind> for String {
    fn from(kind: ActionKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 响应协议
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ResponseProtocol {
    pub severity: Severity,
    pub actions: Vec<ActionKind>,
    /// 整个协议的执行截止时间
    #[serde(rename = "timeout_ms", serialize_with = "serialize_millis")]
    pub timeout: Duration,
    pub requires_approval: bool,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// 协议选择器
#[derive(Debug, Default, Clone, Copy)]
pub struct ProtocolSelector;

impl ProtocolSelector {
    pub fn new() -> Self {
        Self
    }

    pub fn select(&self, severity: Severity) -> ResponseProtocol {
        use ActionKind::*;

        let (actions, secs) = match severity {
            Severity::Critical => (vec![FreezeSystem, ExecuteRollback, NotifyAdmin], 30),
            Severity::High => (vec![CircuitBreak, FallbackMode, Escalate], 60),
            Severity::Medium => (vec![Retry, LogWarning, Monitor], 120),
            Severity::Low => (vec![LogInfo, ScheduleReview], 300),
        };

        ResponseProtocol {
            severity,
            actions,
            timeout: Duration::from_secs(secs),
            requires_approval: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_table() {
        let selector = ProtocolSelector::new();

        let critical = selector.select(Severity::Critical);
        assert_eq!(
            critical.actions,
            vec![
                ActionKind::FreezeSystem,
                ActionKind::ExecuteRollback,
                ActionKind::NotifyAdmin
            ]
        );
        assert_eq!(critical.timeout, Duration::from_secs(30));

        assert_eq!(selector.select(Severity::High).timeout, Duration::from_secs(60));
        assert_eq!(selector.select(Severity::Medium).timeout, Duration::from_secs(120));
        let low = selector.select(Severity::Low);
        assert_eq!(low.timeout, Duration::from_secs(300));
        assert_eq!(low.actions, vec![ActionKind::LogInfo, ActionKind::ScheduleReview]);
        assert!(!low.requires_approval);
    }

    #[test]
    fn test_action_kind_names_roundtrip_including_unknown() {
        assert_eq!(ActionKind::from("circuit_break"), ActionKind::CircuitBreak);
        assert_eq!(
            ActionKind::from("page_on_call"),
            ActionKind::Unknown("page_on_call".to_string())
        );
        let json = serde_json::to_string(&ActionKind::CreateEmergencyBackup).unwrap();
        assert_eq!(json, "\"create_emergency_backup\"");
        let parsed: ActionKind = serde_json::from_str("\"page_on_call\"").unwrap();
        assert_eq!(parsed.as_str(), "page_on_call");
    }
}
