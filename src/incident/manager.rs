//! 事故管理：创建、持久化、执行响应协议、解决
//!
//! 事故只由 IncidentManager 修改；所有动作成功才会解决并移出活跃集合，
//! 部分失败时事故保持 open，返回 success=false（正常结果，不是错误）。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::log::{IncidentLog, LogEntry, LogEvent};
use super::{ActionKind, Classification, ErrorContext, ResponseProtocol};
use crate::core::events::{EmergencyEvent, EventBus};
use crate::core::{ComponentError, EmergencyResult};

/// 事故状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Open,
    Resolved,
}

/// 事故中记录的原始错误
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentErrorRecord {
    pub message: String,
    #[serde(rename = "type")]
    pub name: String,
    pub code: Option<String>,
}

impl From<&ComponentError> for IncidentErrorRecord {
    fn from(err: &ComponentError) -> Self {
        Self {
            message: err.message.clone(),
            name: err.name.clone(),
            code: err.code.clone(),
        }
    }
}

/// 单个响应动作的执行结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub action: ActionKind,
    pub success: bool,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl ActionOutcome {
    pub fn ok(action: &ActionKind, message: impl Into<String>) -> Self {
        Self {
            action: action.clone(),
            success: true,
            message: message.into(),
            at: Utc::now(),
        }
    }

    pub fn failed(action: &ActionKind, message: impl Into<String>) -> Self {
        Self {
            action: action.clone(),
            success: false,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub at: DateTime<Utc>,
    /// auto（协议全部成功）或 manual
    pub method: String,
}

/// 事故记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub error: IncidentErrorRecord,
    pub classification: Classification,
    pub context: ErrorContext,
    pub status: IncidentStatus,
    pub response_actions: Vec<ActionOutcome>,
    pub resolution: Option<Resolution>,
}

/// 协议执行结果
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub incident_id: String,
    /// 所有动作都成功
    pub success: bool,
    pub actions: Vec<ActionOutcome>,
    pub resolved: bool,
    pub elapsed_ms: u64,
}

impl ExecutionResult {
    /// 是否执行过（且成功）某个动作
    pub fn performed(&self, kind: &ActionKind) -> bool {
        self.actions.iter().any(|a| &a.action == kind && a.success)
    }
}

/// 响应动作的执行者（门面实现完整语义；缺省实现只记录日志）
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, action: &ActionKind, incident: &Incident) -> ActionOutcome;
}

/// 只做日志记录的动作执行者；非日志动作一律视为成功的空操作
#[derive(Debug, Default)]
pub struct LoggingActionHandler;

#[async_trait]
impl ActionHandler for LoggingActionHandler {
    async fn handle(&self, action: &ActionKind, incident: &Incident) -> ActionOutcome {
        match action {
            ActionKind::LogWarning => {
                tracing::warn!(incident = %incident.id, "Incident warning: {}", incident.error.message);
                ActionOutcome::ok(action, "Warning logged")
            }
            ActionKind::LogInfo => {
                tracing::info!(incident = %incident.id, "Incident info: {}", incident.error.message);
                ActionOutcome::ok(action, "Info logged")
            }
            _ => ActionOutcome::ok(action, "Action completed"),
        }
    }
}

/// 事故管理器
pub struct IncidentManager {
    log: IncidentLog,
    active: RwLock<HashMap<String, Incident>>,
    review_queue: RwLock<Vec<String>>,
    events: Arc<EventBus>,
}

impl IncidentManager {
    pub fn new(log: IncidentLog, events: Arc<EventBus>) -> Self {
        Self {
            log,
            active: RwLock::new(HashMap::new()),
            review_queue: RwLock::new(Vec::new()),
            events,
        }
    }

    /// 创建事故：分配 ID → 写入事故日志 → 加入活跃集合 → 通知订阅者
    ///
    /// 日志写入失败时返回错误且不加入活跃集合。
    pub async fn open(
        &self,
        error: &ComponentError,
        classification: Classification,
        context: ErrorContext,
    ) -> EmergencyResult<Incident> {
        let incident = Incident {
            id: format!("incident_{}", uuid::Uuid::new_v4().simple()),
            created_at: Utc::now(),
            error: IncidentErrorRecord::from(error),
            classification,
            context,
            status: IncidentStatus::Open,
            response_actions: Vec::new(),
            resolution: None,
        };

        self.log.append(LogEvent::Created, &incident).await?;
        self.active
            .write()
            .await
            .insert(incident.id.clone(), incident.clone());

        tracing::info!(
            incident = %incident.id,
            severity = ?incident.classification.severity,
            "Incident created"
        );
        self.events
            .publish(EmergencyEvent::IncidentCreated {
                incident: Box::new(incident.clone()),
            })
            .await;

        Ok(incident)
    }

    /// 按协议顺序执行动作；协议截止时间耗尽后剩余动作记为失败
    pub async fn execute(
        &self,
        protocol: &ResponseProtocol,
        incident: &Incident,
        handler: &dyn ActionHandler,
    ) -> ExecutionResult {
        let started = Instant::now();
        let deadline = started + protocol.timeout;
        let mut outcomes = Vec::with_capacity(protocol.actions.len());

        for action in &protocol.actions {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let outcome = if remaining.is_zero() {
                ActionOutcome::failed(action, "Protocol deadline exceeded before action started")
            } else {
                match tokio::time::timeout(remaining, handler.handle(action, incident)).await {
                    Ok(outcome) => outcome,
                    Err(_) => ActionOutcome::failed(
                        action,
                        format!("Protocol deadline of {:?} exceeded", protocol.timeout),
                    ),
                }
            };

            if outcome.success {
                tracing::debug!(incident = %incident.id, action = %action, "Response action succeeded");
            } else {
                tracing::warn!(
                    incident = %incident.id,
                    action = %action,
                    "Response action failed: {}",
                    outcome.message
                );
            }

            if let Some(active) = self.active.write().await.get_mut(&incident.id) {
                active.response_actions.push(outcome.clone());
            }
            outcomes.push(outcome);
        }

        let success = outcomes.iter().all(|o| o.success);
        let resolved = if success {
            self.resolve(&incident.id, "auto").await.is_some()
        } else {
            self.record_update(&incident.id).await;
            false
        };

        ExecutionResult {
            incident_id: incident.id.clone(),
            success,
            actions: outcomes,
            resolved,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn record_update(&self, id: &str) {
        let snapshot = self.active.read().await.get(id).cloned();
        if let Some(incident) = snapshot {
            if let Err(e) = self.log.append(LogEvent::Updated, &incident).await {
                tracing::warn!(incident = %id, "Failed to record incident update: {}", e);
            }
        }
    }

    /// 解决事故并移出活跃集合；事故不在活跃集合时返回 None
    pub async fn resolve(&self, id: &str, method: &str) -> Option<Incident> {
        let mut incident = self.active.write().await.remove(id)?;
        incident.status = IncidentStatus::Resolved;
        incident.resolution = Some(Resolution {
            at: Utc::now(),
            method: method.to_string(),
        });

        if let Err(e) = self.log.append(LogEvent::Resolved, &incident).await {
            tracing::warn!(incident = %id, "Failed to record incident resolution: {}", e);
        }
        tracing::info!(incident = %id, method, "Incident resolved");
        self.events
            .publish(EmergencyEvent::IncidentResolved {
                incident_id: id.to_string(),
            })
            .await;
        Some(incident)
    }

    pub async fn get(&self, id: &str) -> Option<Incident> {
        self.active.read().await.get(id).cloned()
    }

    /// 活跃事故（按创建时间升序）
    pub async fn active(&self) -> Vec<Incident> {
        let mut list: Vec<Incident> = self.active.read().await.values().cloned().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        list
    }

    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    /// 从事故日志重放全部历史
    pub async fn history(&self) -> EmergencyResult<Vec<LogEntry>> {
        self.log.replay().await
    }

    /// 加入人工复查队列
    pub async fn schedule_review(&self, id: &str) {
        let mut queue = self.review_queue.write().await;
        if !queue.iter().any(|q| q == id) {
            queue.push(id.to_string());
        }
    }

    pub async fn review_queue(&self) -> Vec<String> {
        self.review_queue.read().await.clone()
    }
}
