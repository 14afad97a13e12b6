//! 事件通知：子系统对外发布的类型化事件，供路由层与备份触发器订阅
//!
//! 每个订阅者持有一个无界 mpsc 接收端；只要接收端存活，事件就一定送达（不会像 broadcast 那样因滞后丢失）。

use serde::Serialize;
use tokio::sync::{mpsc, RwLock};

use crate::health::HealthSnapshot;
use crate::incident::{Incident, Severity};
use crate::rollback::RollbackResult;

/// 子系统事件（可序列化为 JSON，`event` 字段为点分事件名）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum EmergencyEvent {
    #[serde(rename = "circuit.opened")]
    CircuitOpened { component: String, error: String },
    #[serde(rename = "circuit.closed")]
    CircuitClosed { component: String },
    #[serde(rename = "system.freeze")]
    SystemFreeze { reason: String },
    #[serde(rename = "system.resume")]
    SystemResume,
    #[serde(rename = "system.fallback")]
    SystemFallback { components: Vec<String> },
    #[serde(rename = "incident.created")]
    IncidentCreated { incident: Box<Incident> },
    #[serde(rename = "incident.resolved")]
    IncidentResolved { incident_id: String },
    #[serde(rename = "incident.escalated")]
    IncidentEscalated {
        incident_id: String,
        severity: Severity,
    },
    #[serde(rename = "rollback.success")]
    RollbackSuccess {
        rollback_id: String,
        result: Box<RollbackResult>,
    },
    #[serde(rename = "rollback.failed")]
    RollbackFailed { rollback_id: String, error: String },
    #[serde(rename = "health.check")]
    HealthCheck { snapshot: Box<HealthSnapshot> },
    /// 健康状态从 healthy 迁移到 degraded（增量备份的触发条件）
    #[serde(rename = "health.degraded")]
    HealthDegraded { snapshot: Box<HealthSnapshot> },
}

impl EmergencyEvent {
    /// 点分事件名（与序列化后的 `event` 字段一致）
    pub fn name(&self) -> &'static str {
        match self {
            Self::CircuitOpened { .. } => "circuit.opened",
            Self::CircuitClosed { .. } => "circuit.closed",
            Self::SystemFreeze { .. } => "system.freeze",
            Self::SystemResume => "system.resume",
            Self::SystemFallback { .. } => "system.fallback",
            Self::IncidentCreated { .. } => "incident.created",
            Self::IncidentResolved { .. } => "incident.resolved",
            Self::IncidentEscalated { .. } => "incident.escalated",
            Self::RollbackSuccess { .. } => "rollback.success",
            Self::RollbackFailed { .. } => "rollback.failed",
            Self::HealthCheck { .. } => "health.check",
            Self::HealthDegraded { .. } => "health.degraded",
        }
    }
}

/// 事件总线：按订阅顺序向每个存活的订阅者投递
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<mpsc::UnboundedSender<EmergencyEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// 订阅全部事件；丢弃接收端即退订
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<EmergencyEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subs = self.subscribers.write().await;
        subs.retain(|s| !s.is_closed());
        subs.push(tx);
        rx
    }

    pub async fn publish(&self, event: EmergencyEvent) {
        tracing::debug!(event = event.name(), "Publishing event");
        let subs = self.subscribers.read().await;
        for sub in subs.iter() {
            let _ = sub.send(event.clone());
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .await
            .iter()
            .filter(|s| !s.is_closed())
            .count()
    }
}
