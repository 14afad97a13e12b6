//! 应急门面：路由层与被包装的 Agent 唯一需要打交道的入口
//!
//! `handle_error` 串起 分类 → 建立事故 → 选协议 → 执行协议；协议中的动作由门面赋予具体语义
//! （冻结、紧急回滚、熔断、降级、应急备份……）。门面自身出错时返回 `fallback=true` 的结果，
//! 从不把错误抛给调用方。

pub mod agent;
pub mod builder;
pub mod fault;

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backup::{Backup, BackupManager, BackupScheduler, BackupStatistics, BackupSummary};
use crate::breaker::{BreakerError, BreakerRegistry, BreakerStatus};
use crate::config::AppConfig;
use crate::core::events::{EmergencyEvent, EventBus};
use crate::core::shutdown::ShutdownManager;
use crate::core::{ComponentError, EmergencyError, EmergencyResult, SystemState, SystemStateCell};
use crate::health::{HealthMonitor, HealthSnapshot, OverallHealth};
use crate::incident::{
    ActionHandler, ActionKind, ActionOutcome, ErrorClassifier, ErrorContext, Incident,
    IncidentManager, ProtocolSelector, Severity,
};
use crate::rollback::{
    EmergencyRollbackOutcome, RollbackCoordinator, RollbackOptions, RollbackRecord,
    RollbackRequest, RollbackResult,
};

pub use agent::{Agent, AgentOutcome, AgentResponse, GuardedAgent};
pub use builder::EmergencySystemBuilder;
pub use fault::{FatalFault, FatalFaultReport, FaultSource, FinalBackupCleanup};

/// 看起来具有破坏性的请求关键词（命中时先做一次 pre_request 增量备份）
const DESTRUCTIVE_KEYWORDS: [&str; 12] = [
    "delete",
    "remove",
    "clear",
    "reset",
    "purge",
    "modify all",
    "change all",
    "update all",
    "critical",
    "emergency",
    "urgent",
    "drop",
];

/// 错误处理结果
#[derive(Debug, Clone, Default, Serialize)]
pub struct Outcome {
    pub handled: bool,
    pub incident_id: Option<String>,
    pub severity: Option<Severity>,
    /// 协议全部动作成功（且若执行了回滚，回滚成功）
    pub recovered: bool,
    /// create_emergency_backup 动作创建的备份
    pub backup_created: Option<String>,
    pub rollback_performed: bool,
    /// 门面内部失败，走了本地兜底
    pub fallback: bool,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl Outcome {
    fn fallback(error: impl Into<String>) -> Self {
        Self {
            handled: true,
            fallback: true,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// 系统状态汇总
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub state: SystemState,
    pub active_incidents: usize,
    pub pending_reviews: usize,
    pub breakers: BTreeMap<String, BreakerStatus>,
    pub health: Option<HealthSnapshot>,
    pub backups: BackupStatistics,
    pub latest_backup: Option<BackupSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SelfTestCheck {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SelfTestReport {
    pub passed: bool,
    pub checks: Vec<SelfTestCheck>,
}

/// 应急系统门面
pub struct EmergencySystem {
    config: AppConfig,
    state: Arc<SystemStateCell>,
    events: Arc<EventBus>,
    breakers: Arc<BreakerRegistry>,
    classifier: ErrorClassifier,
    protocols: ProtocolSelector,
    incidents: Arc<IncidentManager>,
    health: Arc<HealthMonitor>,
    backups: Arc<BackupManager>,
    rollback: Arc<RollbackCoordinator>,
    shutdown: Arc<ShutdownManager>,
    fault_tx: OnceLock<mpsc::UnboundedSender<FatalFault>>,
}

impl EmergencySystem {
    pub fn builder(config: AppConfig) -> EmergencySystemBuilder {
        EmergencySystemBuilder::new(config)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn incidents(&self) -> &Arc<IncidentManager> {
        &self.incidents
    }

    pub fn health_monitor(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn backups(&self) -> &Arc<BackupManager> {
        &self.backups
    }

    pub fn rollback_coordinator(&self) -> &Arc<RollbackCoordinator> {
        &self.rollback
    }

    pub fn shutdown_manager(&self) -> &Arc<ShutdownManager> {
        &self.shutdown
    }

    pub async fn state(&self) -> SystemState {
        self.state.get().await
    }

    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<EmergencyEvent> {
        self.events.subscribe().await
    }

    /// 处理组件错误；门面内部失败时返回兜底结果（handled=true, fallback=true）
    pub async fn handle_error(&self, error: &ComponentError, context: ErrorContext) -> Outcome {
        let handled = AssertUnwindSafe(self.try_handle_error(error, context))
            .catch_unwind()
            .await;
        match handled {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                tracing::error!("Emergency handling failed, using local fallback: {}", e);
                if matches!(e, EmergencyError::IncidentLog(_)) {
                    self.report_fault(FatalFault::internal(e.to_string()));
                }
                Outcome::fallback(e.to_string())
            }
            Err(_) => {
                tracing::error!("Emergency handling panicked, using local fallback");
                Outcome::fallback("emergency handling panicked")
            }
        }
    }

    /// 与 `handle_error` 相同，但把门面内部错误返回给调用方
    pub async fn try_handle_error(
        &self,
        error: &ComponentError,
        mut context: ErrorContext,
    ) -> EmergencyResult<Outcome> {
        let started = Instant::now();
        let state_before = self.state.get().await;
        if context.target_component.is_none() {
            context.target_component = error.component.clone();
        }
        if !context.system_wide && self.classifier.is_system_wide(error) {
            context.system_wide = true;
        }

        let classification = self.classifier.classify(error, &context);
        let severity = classification.severity;
        let incident = self.incidents.open(error, classification, context).await?;
        let protocol = self.protocols.select(severity);

        let actions = ProtocolActions::new(self);
        let execution = self.incidents.execute(&protocol, &incident, &actions).await;
        let effects = actions.into_effects();

        let rollback_ok = effects.rollback.as_ref().map_or(true, |r| r.success);
        let recovered = execution.success && rollback_ok;
        if severity == Severity::Critical
            && !recovered
            && matches!(state_before, SystemState::Degraded | SystemState::Emergency)
            && self
                .state
                .transition(SystemState::Degraded, SystemState::Emergency)
                .await
        {
            tracing::error!(incident = %incident.id, "Critical incident unrecovered while degraded, entering emergency state");
        }
        let elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            incident = %incident.id,
            severity = ?severity,
            success = execution.success,
            elapsed_ms,
            "Error handled"
        );

        Ok(Outcome {
            handled: true,
            incident_id: Some(incident.id),
            severity: Some(severity),
            recovered,
            backup_created: effects.backup_id,
            rollback_performed: effects.rollback.as_ref().is_some_and(|r| r.success),
            fallback: false,
            error: None,
            elapsed_ms,
        })
    }

    /// 在熔断保护下执行操作；这次失败使熔断打开时，按 circuit_tripped 上下文建立事故
    pub async fn execute_with_circuit_breaker<T, F, Fut>(
        &self,
        component: &str,
        operation: F,
    ) -> Result<T, BreakerError<ComponentError>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ComponentError>>,
    {
        let result = self.breakers.protect(component, operation).await;
        if let Err(BreakerError::Operation {
            error,
            tripped: true,
        }) = &result
        {
            let context = ErrorContext {
                circuit_tripped: true,
                ..ErrorContext::for_component(component)
            };
            self.handle_error(error, context).await;
        }
        result
    }

    /// 同 `execute_with_circuit_breaker`，错误统一为 `EmergencyError`（熔断拒绝为 `CircuitOpen`）
    pub async fn execute_protected<T, F, Fut>(&self, component: &str, operation: F) -> EmergencyResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ComponentError>>,
    {
        self.execute_with_circuit_breaker(component, operation)
            .await
            .map_err(EmergencyError::from)
    }

    /// 最近一次健康快照；还没有时立即检查一次
    pub async fn system_health(&self) -> HealthSnapshot {
        match self.health.latest().await {
            Some(snapshot) => snapshot,
            None => self.health.check_now().await,
        }
    }

    /// 系统级紧急回滚
    pub async fn execute_rollback(&self, request: RollbackRequest) -> EmergencyRollbackOutcome {
        self.rollback.emergency_rollback(request).await
    }

    pub async fn active_incidents(&self) -> Vec<Incident> {
        self.incidents.active().await
    }

    pub fn wrap_agent<A: Agent>(self: &Arc<Self>, agent: A) -> GuardedAgent<A> {
        GuardedAgent::new(agent, Arc::clone(self))
    }

    pub async fn status(&self) -> SystemStatus {
        SystemStatus {
            state: self.state.get().await,
            active_incidents: self.incidents.active_count().await,
            pending_reviews: self.incidents.review_queue().await.len(),
            breakers: self.breakers.statuses().await,
            health: self.health.latest().await,
            backups: self.backups.statistics().await,
            latest_backup: self.backups.list_available().await.into_iter().next(),
        }
    }

    /// 冻结：SystemState=Recovery，入口开始拒绝新请求
    pub async fn freeze(&self, reason: &str) {
        self.state.set(SystemState::Recovery).await;
        tracing::warn!(reason, "System frozen");
        self.events
            .publish(EmergencyEvent::SystemFreeze {
                reason: reason.to_string(),
            })
            .await;
    }

    pub async fn unfreeze(&self) {
        self.state.set(SystemState::Normal).await;
        tracing::info!("System resumed");
        self.events.publish(EmergencyEvent::SystemResume).await;
    }

    /// 入口准入检查；破坏性请求先做一次 pre_request 增量备份，返回其 ID
    pub async fn admit(&self, request: &str) -> EmergencyResult<Option<String>> {
        let state = self.state.get().await;
        if !state.accepts_requests() {
            return Err(EmergencyError::SystemUnavailable(format!(
                "system is in {state} state"
            )));
        }

        let lowered = request.to_lowercase();
        if !DESTRUCTIVE_KEYWORDS.iter().any(|k| lowered.contains(k)) {
            return Ok(None);
        }

        let data = serde_json::json!({
            "request": request,
            "at": chrono::Utc::now(),
        });
        match self
            .backups
            .create_incremental("pre_request", data, "pre_critical_request")
            .await
        {
            Ok(backup) => Ok(Some(backup.id)),
            Err(e) => {
                tracing::warn!("Pre-request backup failed, admitting anyway: {}", e);
                Ok(None)
            }
        }
    }

    pub async fn create_emergency_backup(&self) -> EmergencyResult<Backup> {
        self.backups
            .create_full("emergency", serde_json::json!({ "emergency": true }))
            .await
    }

    pub async fn rollback_to(
        &self,
        backup_id: &str,
        options: &RollbackOptions,
    ) -> EmergencyResult<RollbackResult> {
        self.rollback.rollback(backup_id, options).await
    }

    pub async fn rollback_history(&self) -> Vec<RollbackRecord> {
        self.rollback.history().await
    }

    pub async fn breaker_status(&self) -> BTreeMap<String, BreakerStatus> {
        self.breakers.statuses().await
    }

    pub async fn reset_breaker(&self, component: &str) -> bool {
        self.breakers.reset(component).await
    }

    /// 自检：错误处理、增量备份、对最新备份的 dry-run 回滚
    pub async fn self_test(&self) -> SelfTestReport {
        let mut checks = Vec::new();

        let error = ComponentError::new("self test probe").with_name("SelfTestError");
        let context = ErrorContext {
            request: Some("self_test".to_string()),
            ..ErrorContext::default()
        };
        let outcome = self.handle_error(&error, context).await;
        checks.push(SelfTestCheck {
            name: "error_handling",
            passed: outcome.handled && !outcome.fallback,
            detail: match &outcome.incident_id {
                Some(id) => format!("incident {id}"),
                None => outcome.error.clone().unwrap_or_default(),
            },
        });

        let backup = self
            .backups
            .create_incremental(
                "self_test",
                serde_json::json!({ "at": chrono::Utc::now() }),
                "self_test",
            )
            .await;
        checks.push(SelfTestCheck {
            name: "incremental_backup",
            passed: backup.is_ok(),
            detail: match backup {
                Ok(b) => b.id,
                Err(e) => e.to_string(),
            },
        });

        let rollback_check = match self.backups.latest_completed().await {
            None => SelfTestCheck {
                name: "dry_run_rollback",
                passed: true,
                detail: "skipped: no full backup available".to_string(),
            },
            Some(latest) => match self
                .rollback
                .rollback(&latest.id, &RollbackOptions::dry_run())
                .await
            {
                Ok(result) => SelfTestCheck {
                    name: "dry_run_rollback",
                    passed: result.success,
                    detail: format!("{} components checked", result.components.len()),
                },
                Err(e) => SelfTestCheck {
                    name: "dry_run_rollback",
                    passed: false,
                    detail: e.to_string(),
                },
            },
        };
        checks.push(rollback_check);

        let passed = checks.iter().all(|c| c.passed);
        tracing::info!(passed, "Emergency self test finished");
        SelfTestReport { passed, checks }
    }

    /// 启动健康监控与定时备份，token 取消后退出
    pub async fn start_background_tasks(
        self: &Arc<Self>,
        token: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let period = std::time::Duration::from_secs(self.config.health.interval_secs.max(1));
        let mut handles = vec![self.spawn_supervised(
            "health_monitor",
            Arc::clone(&self.health).run(period, token.clone()),
        )];

        let scheduler = BackupScheduler::new(Arc::clone(&self.backups), Arc::clone(&self.events));
        handles.extend(scheduler.spawn(token).await);
        handles
    }
}

#[derive(Debug, Default)]
struct Effects {
    backup_id: Option<String>,
    rollback: Option<EmergencyRollbackOutcome>,
}

/// 门面对协议动作的具体实现（单次 handle_error 内有效）
struct ProtocolActions<'a> {
    system: &'a EmergencySystem,
    effects: Mutex<Effects>,
}

impl<'a> ProtocolActions<'a> {
    fn new(system: &'a EmergencySystem) -> Self {
        Self {
            system,
            effects: Mutex::new(Effects::default()),
        }
    }

    fn into_effects(self) -> Effects {
        self.effects.into_inner()
    }

    fn affected(incident: &Incident) -> Vec<String> {
        incident
            .classification
            .affected_components
            .iter()
            .filter(|c| c.as_str() != "unknown")
            .cloned()
            .collect()
    }
}

#[async_trait]
impl<'a> ActionHandler for ProtocolActions<'a> {
    async fn handle(&self, action: &ActionKind, incident: &Incident) -> ActionOutcome {
        let system = self.system;
        match action {
            ActionKind::FreezeSystem => {
                system.freeze(&format!("incident {}", incident.id)).await;
                ActionOutcome::ok(action, "System frozen")
            }
            ActionKind::ExecuteRollback => {
                if !incident.classification.rollback_required {
                    if system.state.get().await == SystemState::Recovery {
                        system.unfreeze().await;
                    }
                    return ActionOutcome::ok(action, "Rollback not required");
                }
                let outcome = system
                    .rollback
                    .emergency_rollback(RollbackRequest::new(format!("incident {}", incident.id)))
                    .await;
                let result = if outcome.success {
                    ActionOutcome::ok(action, format!("Rollback {} completed", outcome.rollback_id))
                } else {
                    ActionOutcome::failed(
                        action,
                        outcome.error.clone().unwrap_or_else(|| "rollback failed".to_string()),
                    )
                };
                self.effects.lock().await.rollback = Some(outcome);
                result
            }
            ActionKind::NotifyAdmin | ActionKind::Escalate => {
                tracing::warn!(
                    incident = %incident.id,
                    severity = ?incident.classification.severity,
                    "Incident escalated: {}",
                    incident.error.message
                );
                system
                    .events
                    .publish(EmergencyEvent::IncidentEscalated {
                        incident_id: incident.id.clone(),
                        severity: incident.classification.severity,
                    })
                    .await;
                ActionOutcome::ok(action, "Escalation published")
            }
            ActionKind::CircuitBreak => {
                let components = Self::affected(incident);
                for component in &components {
                    system.breakers.trip(component).await;
                }
                ActionOutcome::ok(action, format!("Isolated {} component(s)", components.len()))
            }
            ActionKind::FallbackMode => {
                let components = Self::affected(incident);
                system
                    .events
                    .publish(EmergencyEvent::SystemFallback {
                        components: components.clone(),
                    })
                    .await;
                ActionOutcome::ok(action, format!("Fallback enabled for {components:?}"))
            }
            ActionKind::Retry => ActionOutcome::ok(action, "Retry advised to caller"),
            ActionKind::LogWarning => {
                tracing::warn!(incident = %incident.id, "Incident warning: {}", incident.error.message);
                ActionOutcome::ok(action, "Warning logged")
            }
            ActionKind::LogInfo => {
                tracing::info!(incident = %incident.id, "Incident info: {}", incident.error.message);
                ActionOutcome::ok(action, "Info logged")
            }
            ActionKind::Monitor => {
                let snapshot = system.health.check_now().await;
                if snapshot.overall == OverallHealth::Error {
                    ActionOutcome::failed(action, "Health check reported an error")
                } else {
                    ActionOutcome::ok(action, format!("Health {:?}", snapshot.overall))
                }
            }
            ActionKind::ScheduleReview => {
                system.incidents.schedule_review(&incident.id).await;
                ActionOutcome::ok(action, "Queued for review")
            }
            ActionKind::CreateEmergencyBackup => {
                match system
                    .backups
                    .create_full(
                        &format!("error_response_{}", incident.id),
                        serde_json::json!({ "incident_id": incident.id }),
                    )
                    .await
                {
                    Ok(backup) => {
                        self.effects.lock().await.backup_id = Some(backup.id.clone());
                        ActionOutcome::ok(action, format!("Backup {} created", backup.id))
                    }
                    Err(e) => ActionOutcome::failed(action, e.to_string()),
                }
            }
            ActionKind::Unknown(name) => {
                tracing::debug!(action = %name, "Unknown protocol action treated as no-op");
                ActionOutcome::ok(action, "Unknown action skipped")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::fs;

    async fn system(dir: &TempDir) -> Arc<EmergencySystem> {
        let cfg = AppConfig::with_data_dir(dir.path().join("data"));
        EmergencySystem::builder(cfg).build().await.unwrap()
    }

    #[tokio::test]
    async fn test_low_severity_error_is_resolved() {
        let dir = TempDir::new().unwrap();
        let sys = system(&dir).await;

        let outcome = sys
            .handle_error(&ComponentError::new("label typo"), ErrorContext::default())
            .await;
        assert!(outcome.handled);
        assert!(!outcome.fallback);
        assert!(outcome.recovered);
        assert_eq!(outcome.severity, Some(Severity::Low));
        assert!(sys.active_incidents().await.is_empty());
        assert_eq!(sys.status().await.pending_reviews, 1);
    }

    #[tokio::test]
    async fn test_agent_failure_trips_affected_breaker() {
        let dir = TempDir::new().unwrap();
        let sys = system(&dir).await;
        let mut rx = sys.subscribe().await;

        let error = ComponentError::new("agent gave up")
            .with_code("AGENT_FAILURE")
            .with_component("WPA");
        let outcome = sys.handle_error(&error, ErrorContext::default()).await;
        assert_eq!(outcome.severity, Some(Severity::High));
        assert!(outcome.recovered);
        assert!(!sys.breakers().is_available("WPA").await);

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name());
        }
        assert!(names.contains(&"system.fallback"));
        assert!(names.contains(&"incident.escalated"));
    }

    #[tokio::test]
    async fn test_critical_without_backup_leaves_incident_open() {
        let dir = TempDir::new().unwrap();
        let sys = system(&dir).await;

        let error = ComponentError::new("process died").with_code("SYSTEM_CRASH");
        let outcome = sys.handle_error(&error, ErrorContext::default()).await;
        assert_eq!(outcome.severity, Some(Severity::Critical));
        assert!(!outcome.recovered);
        assert!(!outcome.rollback_performed);
        assert_eq!(sys.state().await, SystemState::Degraded);
        assert_eq!(sys.active_incidents().await.len(), 1);
        assert!(!sys.rollback_history().await[0].success);
    }

    #[tokio::test]
    async fn test_repeated_unrecovered_critical_enters_emergency() {
        let dir = TempDir::new().unwrap();
        let sys = system(&dir).await;
        let error = ComponentError::new("process died").with_code("SYSTEM_CRASH");

        sys.handle_error(&error, ErrorContext::default()).await;
        assert_eq!(sys.state().await, SystemState::Degraded);
        sys.handle_error(&error, ErrorContext::default()).await;
        assert_eq!(sys.state().await, SystemState::Emergency);
        assert_eq!(sys.health_monitor().check_now().await.overall, OverallHealth::Error);
        assert!(sys.admit("hello").await.is_ok());

        sys.handle_error(&error, ErrorContext::default()).await;
        assert_eq!(sys.state().await, SystemState::Emergency);
    }

    #[tokio::test]
    async fn test_open_circuit_maps_to_circuit_open_error() {
        let dir = TempDir::new().unwrap();
        let sys = system(&dir).await;
        sys.breakers().trip("MCA").await;

        let mut called = false;
        let err = sys
            .execute_protected("MCA", || {
                called = true;
                async { Ok(()) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EmergencyError::CircuitOpen { ref component } if component == "MCA"));
        assert!(!called);

        let err = sys
            .execute_protected::<(), _, _>("NPA", || async {
                Err(ComponentError::new("bad gateway").with_code("UPSTREAM"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EmergencyError::Component(ref e) if e.code() == Some("UPSTREAM")));
    }

    #[tokio::test]
    async fn test_critical_with_backup_rolls_back_and_resumes() {
        let dir = TempDir::new().unwrap();
        let sys = system(&dir).await;
        let budgets = dir.path().join("data/budgets");
        fs::create_dir_all(&budgets).await.unwrap();
        fs::write(budgets.join("limits.json"), b"{\"daily\":10}").await.unwrap();
        sys.backups().create_full("manual", serde_json::Value::Null).await.unwrap();
        fs::write(budgets.join("limits.json"), b"corrupt").await.unwrap();

        let ctx = ErrorContext {
            data_corruption: true,
            ..ErrorContext::for_component("budgets")
        };
        let outcome = sys.handle_error(&ComponentError::new("checksum mismatch"), ctx).await;
        assert!(outcome.recovered, "{outcome:?}");
        assert!(outcome.rollback_performed);
        assert_eq!(sys.state().await, SystemState::Normal);
        assert_eq!(
            fs::read_to_string(budgets.join("limits.json")).await.unwrap(),
            "{\"daily\":10}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollback_outlives_protocol_deadline() {
        let dir = TempDir::new().unwrap();
        let mut cfg = AppConfig::with_data_dir(dir.path().join("data"));
        cfg.rollback.grace_period_ms = 60_000;
        let sys = EmergencySystem::builder(cfg).build().await.unwrap();

        let guarded = Arc::clone(&sys);
        let slow_call = tokio::spawn(async move {
            guarded
                .breakers()
                .protect("NPA", || async {
                    tokio::time::sleep(std::time::Duration::from_secs(120)).await;
                    Ok::<(), String>(())
                })
                .await
        });
        while sys.breakers().in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        let error = ComponentError::new("process died").with_code("SYSTEM_CRASH");
        let outcome = sys.handle_error(&error, ErrorContext::default()).await;
        assert!(!outcome.recovered);
        let incident = sys.incidents().get(outcome.incident_id.as_ref().unwrap()).await.unwrap();
        assert!(incident.response_actions.iter().any(|a| a.message.contains("deadline")));

        while sys.rollback_history().await.is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        }
        assert_eq!(sys.state().await, SystemState::Degraded);
        assert!(!sys.rollback_history().await[0].success);
        slow_call.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_fatal_message_freezes_then_resumes() {
        let dir = TempDir::new().unwrap();
        let sys = system(&dir).await;
        let outcome = sys
            .handle_error(&ComponentError::new("FATAL: worker lost"), ErrorContext::default())
            .await;
        assert_eq!(outcome.severity, Some(Severity::Critical));
        assert!(outcome.recovered);
        assert!(!outcome.rollback_performed);
        assert_eq!(sys.state().await, SystemState::Normal);
    }

    #[tokio::test]
    async fn test_incident_log_failure_falls_back() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"file, not a directory").await.unwrap();
        let mut cfg = AppConfig::with_data_dir(dir.path().join("data"));
        cfg.incident.log_file = Some(blocker.join("incidents.jsonl"));
        let sys = EmergencySystem::builder(cfg).build().await.unwrap();

        let outcome = sys
            .handle_error(&ComponentError::new("anything"), ErrorContext::default())
            .await;
        assert!(outcome.handled);
        assert!(outcome.fallback);
        assert!(outcome.incident_id.is_none());
        assert!(sys.active_incidents().await.is_empty());
    }

    #[tokio::test]
    async fn test_admission_and_pre_request_backup() {
        let dir = TempDir::new().unwrap();
        let sys = system(&dir).await;

        assert_eq!(sys.admit("show my budget").await.unwrap(), None);
        let backup = sys.admit("Delete all conversations").await.unwrap();
        assert!(backup.unwrap().starts_with("inc_"));

        sys.freeze("maintenance").await;
        assert!(matches!(
            sys.admit("hello").await,
            Err(EmergencyError::SystemUnavailable(_))
        ));
        sys.unfreeze().await;
        assert!(sys.admit("hello").await.is_ok());
    }

    #[tokio::test]
    async fn test_self_test_passes() {
        let dir = TempDir::new().unwrap();
        let sys = system(&dir).await;
        sys.create_emergency_backup().await.unwrap();
        let report = sys.self_test().await;
        assert!(report.passed, "{:?}", report.checks);
        assert_eq!(report.checks.len(), 3);
    }
}
