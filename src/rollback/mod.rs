//! 回滚协调：按组件从备份恢复实时数据
//!
//! 单次回滚流程：解析备份 → （可选）完整性校验 → （可选）回滚前安全备份 → 逐组件恢复。
//! 完整性校验失败时不触碰任何组件；单组件失败只记录在结果里，不中断其它组件。
//!
//! 系统级紧急回滚在此之外：冻结（Recovery）→ 等待在途调用 → 选定目标 → 回滚 →
//! 健康校验 → 恢复（Normal）。任何失败都会把系统置为 Degraded 并返回结构化结果。

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

use crate::backup::integrity::verify_backup;
use crate::backup::{store, Backup, BackupManager};
use crate::breaker::BreakerRegistry;
use crate::config::RollbackSection;
use crate::core::events::{EmergencyEvent, EventBus};
use crate::core::{EmergencyError, EmergencyResult, SystemState, SystemStateCell};
use crate::health::{HealthMonitor, OverallHealth};

const IN_FLIGHT_POLL: Duration = Duration::from_millis(50);

/// 回滚选项
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackOptions {
    /// 只校验与模拟，不修改任何数据
    pub dry_run: bool,
    pub verify_integrity: bool,
    pub create_pre_rollback_backup: bool,
    /// 只恢复这些组件；None 表示备份中的全部组件
    pub components: Option<Vec<String>>,
}

impl Default for RollbackOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            verify_integrity: true,
            create_pre_rollback_backup: false,
            components: None,
        }
    }
}

impl RollbackOptions {
    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentRollbackResult {
    pub component: String,
    pub success: bool,
    pub files: u64,
    pub error: Option<String>,
}

/// 回滚结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackResult {
    pub backup_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub components: Vec<ComponentRollbackResult>,
    pub success: bool,
    pub pre_rollback_backup_id: Option<String>,
}

impl RollbackResult {
    pub fn failed_components(&self) -> Vec<&str> {
        self.components
            .iter()
            .filter(|c| !c.success)
            .map(|c| c.component.as_str())
            .collect()
    }
}

/// 系统级紧急回滚请求
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollbackRequest {
    /// 目标备份；None 时选最后已知良好的全量备份
    pub backup_id: Option<String>,
    pub reason: String,
    /// None 时使用配置默认值
    pub create_pre_rollback_backup: Option<bool>,
}

impl RollbackRequest {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            ..Self::default()
        }
    }

    pub fn with_backup(mut self, backup_id: impl Into<String>) -> Self {
        self.backup_id = Some(backup_id.into());
        self
    }
}

/// 紧急回滚的结构化结果（失败也通过它返回）
#[derive(Debug, Clone, Serialize)]
pub struct EmergencyRollbackOutcome {
    pub rollback_id: String,
    pub success: bool,
    pub backup_id: Option<String>,
    pub result: Option<RollbackResult>,
    pub error: Option<String>,
    pub health: Option<OverallHealth>,
}

/// 回滚历史记录
#[derive(Debug, Clone, Serialize)]
pub struct RollbackRecord {
    pub rollback_id: String,
    pub reason: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub backup_id: Option<String>,
    pub result: Option<RollbackResult>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RollbackSettings {
    pub grace_period: Duration,
    pub create_pre_rollback_backup: bool,
    pub history_limit: usize,
}

impl From<&RollbackSection> for RollbackSettings {
    fn from(section: &RollbackSection) -> Self {
        Self {
            grace_period: Duration::from_millis(section.grace_period_ms),
            create_pre_rollback_backup: section.create_pre_rollback_backup,
            history_limit: section.history_limit.max(1),
        }
    }
}

struct EmergencyFailure {
    backup_id: Option<String>,
    result: Option<RollbackResult>,
    error: String,
}

impl EmergencyFailure {
    fn new(error: impl Into<String>) -> Self {
        Self {
            backup_id: None,
            result: None,
            error: error.into(),
        }
    }
}

struct EmergencySuccess {
    result: RollbackResult,
    health: OverallHealth,
}

/// 回滚协调器
pub struct RollbackCoordinator {
    settings: RollbackSettings,
    backups: Arc<BackupManager>,
    breakers: Arc<BreakerRegistry>,
    health: Arc<HealthMonitor>,
    state: Arc<SystemStateCell>,
    events: Arc<EventBus>,
    history: RwLock<VecDeque<RollbackRecord>>,
    /// 同一时间只允许一次系统级回滚
    exclusive: Mutex<()>,
}

impl RollbackCoordinator {
    pub fn new(
        settings: RollbackSettings,
        backups: Arc<BackupManager>,
        breakers: Arc<BreakerRegistry>,
        health: Arc<HealthMonitor>,
        state: Arc<SystemStateCell>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            settings,
            backups,
            breakers,
            health,
            state,
            events,
            history: RwLock::new(VecDeque::new()),
            exclusive: Mutex::new(()),
        }
    }

    /// 回滚到指定备份
    pub async fn rollback(
        &self,
        backup_id: &str,
        options: &RollbackOptions,
    ) -> EmergencyResult<RollbackResult> {
        let _pin = self.backups.pin(backup_id);
        self.rollback_pinned(backup_id, options).await
    }

    async fn rollback_pinned(
        &self,
        backup_id: &str,
        options: &RollbackOptions,
    ) -> EmergencyResult<RollbackResult> {
        let backup = self
            .backups
            .get(backup_id)
            .await
            .ok_or_else(|| EmergencyError::BackupNotFound(backup_id.to_string()))?;
        if !backup.is_completed() {
            return Err(EmergencyError::BackupFailed {
                backup_id: backup_id.to_string(),
                reason: "backup did not complete and cannot be restored".to_string(),
            });
        }

        if options.verify_integrity {
            verify_backup(&backup)?;
        }

        self.restore(&backup, options).await
    }

    async fn restore(
        &self,
        backup: &Backup,
        options: &RollbackOptions,
    ) -> EmergencyResult<RollbackResult> {
        let started_at = Utc::now();
        tracing::info!(backup = %backup.id, dry_run = options.dry_run, "Rollback started");

        let pre_rollback_backup_id = if !options.dry_run && options.create_pre_rollback_backup {
            let safety = self
                .backups
                .create_full(
                    "pre_rollback",
                    serde_json::json!({ "rollback_target": backup.id }),
                )
                .await?;
            Some(safety.id)
        } else {
            None
        };

        let selected: Vec<String> = match &options.components {
            Some(list) => list.clone(),
            None => backup.components.keys().cloned().collect(),
        };

        let mut components = Vec::with_capacity(selected.len());
        for name in selected {
            let outcome = match backup.components.get(&name) {
                None => Err(EmergencyError::RollbackComponent {
                    component: name.clone(),
                    reason: "component not present in backup".to_string(),
                }),
                Some(record) if options.dry_run => fs::metadata(&record.artifact)
                    .await
                    .map_err(EmergencyError::from)
                    .and_then(|meta| {
                        if meta.is_dir() {
                            Ok(record.files)
                        } else {
                            Err(EmergencyError::RollbackComponent {
                                component: name.clone(),
                                reason: "artifact is not a directory".to_string(),
                            })
                        }
                    }),
                Some(record) => store::restore_tree(&record.artifact, &record.source)
                    .await
                    .map(|stats| stats.files)
                    .map_err(|e| EmergencyError::RollbackComponent {
                        component: name.clone(),
                        reason: e.to_string(),
                    }),
            };

            let result = match outcome {
                Ok(files) => {
                    tracing::info!(component = %name, files, dry_run = options.dry_run, "Component rolled back");
                    ComponentRollbackResult {
                        component: name,
                        success: true,
                        files,
                        error: None,
                    }
                }
                Err(e) => {
                    tracing::error!(component = %name, "Component rollback failed: {}", e);
                    ComponentRollbackResult {
                        component: name,
                        success: false,
                        files: 0,
                        error: Some(e.to_string()),
                    }
                }
            };
            components.push(result);
        }

        let success = components.iter().all(|c| c.success);
        tracing::info!(backup = %backup.id, success, "Rollback finished");
        Ok(RollbackResult {
            backup_id: backup.id.clone(),
            started_at,
            finished_at: Utc::now(),
            dry_run: options.dry_run,
            components,
            success,
            pre_rollback_backup_id,
        })
    }

    /// 系统级紧急回滚；从不返回错误，失败体现在 outcome 中
    ///
    /// 回滚在独立任务中执行到底：调用方的 future 被丢弃（例如协议截止时间到了）时，
    /// 回滚照常完成，系统状态、事件与历史照常落定，不会停在 Recovery。
    pub async fn emergency_rollback(
        self: &Arc<Self>,
        request: RollbackRequest,
    ) -> EmergencyRollbackOutcome {
        let rollback_id = format!("rollback_{}", uuid::Uuid::new_v4().simple());
        let started_at = Utc::now();
        let reason = request.reason.clone();

        let coordinator = Arc::clone(self);
        let id = rollback_id.clone();
        let task = tokio::spawn(async move { coordinator.run_to_completion(id, request).await });
        match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                let error = format!("emergency rollback task aborted: {e}");
                tracing::error!(rollback = %rollback_id, "{}", error);
                self.state.set(SystemState::Degraded).await;
                let outcome = EmergencyRollbackOutcome {
                    rollback_id,
                    success: false,
                    backup_id: None,
                    result: None,
                    error: Some(error),
                    health: None,
                };
                self.record(RollbackRecord {
                    rollback_id: outcome.rollback_id.clone(),
                    reason,
                    started_at,
                    finished_at: Utc::now(),
                    success: false,
                    backup_id: None,
                    result: None,
                    error: outcome.error.clone(),
                })
                .await;
                outcome
            }
        }
    }

    async fn run_to_completion(
        &self,
        rollback_id: String,
        request: RollbackRequest,
    ) -> EmergencyRollbackOutcome {
        let _exclusive = self.exclusive.lock().await;
        let started_at = Utc::now();
        tracing::warn!(rollback = %rollback_id, reason = %request.reason, "Emergency rollback initiated");

        let outcome = match AssertUnwindSafe(self.run_emergency(&request)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => Err(EmergencyFailure::new("emergency rollback panicked")),
        };

        let outcome = match outcome {
            Ok(done) => {
                self.state.set(SystemState::Normal).await;
                self.events.publish(EmergencyEvent::SystemResume).await;
                self.events
                    .publish(EmergencyEvent::RollbackSuccess {
                        rollback_id: rollback_id.clone(),
                        result: Box::new(done.result.clone()),
                    })
                    .await;
                tracing::info!(rollback = %rollback_id, "Emergency rollback completed");
                EmergencyRollbackOutcome {
                    rollback_id,
                    success: true,
                    backup_id: Some(done.result.backup_id.clone()),
                    result: Some(done.result),
                    error: None,
                    health: Some(done.health),
                }
            }
            Err(failure) => {
                self.state.set(SystemState::Degraded).await;
                self.events
                    .publish(EmergencyEvent::RollbackFailed {
                        rollback_id: rollback_id.clone(),
                        error: failure.error.clone(),
                    })
                    .await;
                tracing::error!(rollback = %rollback_id, "Emergency rollback failed: {}", failure.error);
                EmergencyRollbackOutcome {
                    rollback_id,
                    success: false,
                    backup_id: failure.backup_id,
                    result: failure.result,
                    error: Some(failure.error),
                    health: None,
                }
            }
        };

        self.record(RollbackRecord {
            rollback_id: outcome.rollback_id.clone(),
            reason: request.reason,
            started_at,
            finished_at: Utc::now(),
            success: outcome.success,
            backup_id: outcome.backup_id.clone(),
            result: outcome.result.clone(),
            error: outcome.error.clone(),
        })
        .await;
        outcome
    }

    async fn run_emergency(
        &self,
        request: &RollbackRequest,
    ) -> Result<EmergencySuccess, EmergencyFailure> {
        self.state.set(SystemState::Recovery).await;
        self.events
            .publish(EmergencyEvent::SystemFreeze {
                reason: request.reason.clone(),
            })
            .await;
        self.await_in_flight().await;

        let target = match &request.backup_id {
            Some(id) => id.clone(),
            None => self
                .backups
                .latest_known_good()
                .await
                .map(|b| b.id)
                .ok_or_else(|| EmergencyFailure::new("no completed backup available as rollback target"))?,
        };

        let options = RollbackOptions {
            dry_run: false,
            verify_integrity: true,
            create_pre_rollback_backup: request
                .create_pre_rollback_backup
                .unwrap_or(self.settings.create_pre_rollback_backup),
            components: None,
        };
        let result = self
            .rollback(&target, &options)
            .await
            .map_err(|e| EmergencyFailure {
                backup_id: Some(target.clone()),
                result: None,
                error: e.to_string(),
            })?;

        if !result.success {
            return Err(EmergencyFailure {
                backup_id: Some(target),
                error: format!(
                    "components failed to restore: {}",
                    result.failed_components().join(", ")
                ),
                result: Some(result),
            });
        }

        let snapshot = self.health.check_now().await;
        if snapshot.overall == OverallHealth::Error {
            return Err(EmergencyFailure {
                backup_id: Some(target),
                error: format!("post-rollback health check failed: {}", snapshot.issues.join("; ")),
                result: Some(result),
            });
        }

        Ok(EmergencySuccess {
            result,
            health: snapshot.overall,
        })
    }

    /// 协作式等待：在途调用归零或宽限期耗尽，不强制取消
    async fn await_in_flight(&self) {
        let deadline = tokio::time::Instant::now() + self.settings.grace_period;
        while self.breakers.in_flight() > 0 {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    in_flight = self.breakers.in_flight(),
                    "Grace period elapsed with operations still in flight"
                );
                return;
            }
            tokio::time::sleep(IN_FLIGHT_POLL).await;
        }
    }

    async fn record(&self, record: RollbackRecord) {
        let mut history = self.history.write().await;
        history.push_back(record);
        while history.len() > self.settings.history_limit {
            history.pop_front();
        }
    }

    /// 回滚历史（最新在前）
    pub async fn history(&self) -> Vec<RollbackRecord> {
        self.history.read().await.iter().rev().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupSettings;
    use crate::breaker::BreakerConfig;
    use crate::config::AppConfig;
    use crate::incident::{IncidentLog, IncidentManager};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        data: std::path::PathBuf,
        backups: Arc<BackupManager>,
        state: Arc<SystemStateCell>,
        events: Arc<EventBus>,
        breakers: Arc<BreakerRegistry>,
        coordinator: Arc<RollbackCoordinator>,
    }

    async fn fixture() -> Fixture {
        fixture_with_grace(Duration::from_millis(100)).await
    }

    async fn fixture_with_grace(grace: Duration) -> Fixture {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("data");
        let cfg = AppConfig::with_data_dir(&data);
        let events = Arc::new(EventBus::new());
        let state = Arc::new(SystemStateCell::new());
        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig::default(), Arc::clone(&events)));
        let incidents = Arc::new(IncidentManager::new(
            IncidentLog::new(cfg.incident_log_path()),
            Arc::clone(&events),
        ));
        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&breakers),
            incidents,
            Arc::clone(&state),
            Arc::clone(&events),
        ));
        let backups = Arc::new(BackupManager::new(
            BackupSettings::from_config(&cfg),
            Arc::clone(&state),
        ));
        let mut settings = RollbackSettings::from(&cfg.rollback);
        settings.grace_period = grace;
        let coordinator = Arc::new(RollbackCoordinator::new(
            settings,
            Arc::clone(&backups),
            Arc::clone(&breakers),
            health,
            Arc::clone(&state),
            Arc::clone(&events),
        ));

        fs::create_dir_all(data.join("budgets")).await.unwrap();
        fs::write(data.join("budgets/limits.json"), b"{\"daily\":10}").await.unwrap();

        Fixture {
            _dir: dir,
            data,
            backups,
            state,
            events,
            breakers,
            coordinator,
        }
    }

    #[tokio::test]
    async fn test_unknown_backup_is_not_found() {
        let fx = fixture().await;
        let err = fx
            .coordinator
            .rollback("backup_missing", &RollbackOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EmergencyError::BackupNotFound(_)));
    }

    #[tokio::test]
    async fn test_dry_run_does_not_mutate() {
        let fx = fixture().await;
        let backup = fx.backups.create_full("manual", serde_json::Value::Null).await.unwrap();
        fs::write(fx.data.join("budgets/limits.json"), b"{\"daily\":99}").await.unwrap();

        let result = fx
            .coordinator
            .rollback(&backup.id, &RollbackOptions::dry_run())
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.dry_run);
        assert!(result.failed_components().is_empty());
        assert_eq!(result.components.len(), 4);
        assert_eq!(
            fs::read_to_string(fx.data.join("budgets/limits.json")).await.unwrap(),
            "{\"daily\":99}"
        );
    }

    #[tokio::test]
    async fn test_restore_and_pre_rollback_backup() {
        let fx = fixture().await;
        let backup = fx.backups.create_full("manual", serde_json::Value::Null).await.unwrap();
        fs::write(fx.data.join("budgets/limits.json"), b"{\"daily\":99}").await.unwrap();
        fs::write(fx.data.join("budgets/extra.json"), b"{}").await.unwrap();

        let options = RollbackOptions {
            create_pre_rollback_backup: true,
            components: Some(vec!["budgets".to_string(), "ghost".to_string()]),
            ..RollbackOptions::default()
        };
        let result = fx.coordinator.rollback(&backup.id, &options).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.failed_components(), vec!["ghost"]);
        assert_eq!(
            fs::read_to_string(fx.data.join("budgets/limits.json")).await.unwrap(),
            "{\"daily\":10}"
        );
        assert!(!fx.data.join("budgets/extra.json").exists());

        let safety = fx.backups.get(result.pre_rollback_backup_id.as_ref().unwrap()).await.unwrap();
        assert_eq!(safety.reason, "pre_rollback");
        assert_eq!(safety.metadata["rollback_target"], backup.id.as_str());
    }

    #[tokio::test]
    async fn test_emergency_rollback_success_restores_normal() {
        let fx = fixture().await;
        fx.backups.create_full("manual", serde_json::Value::Null).await.unwrap();
        let mut rx = fx.events.subscribe().await;

        let outcome = fx
            .coordinator
            .emergency_rollback(RollbackRequest::new("critical incident"))
            .await;
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(fx.state.get().await, SystemState::Normal);

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name());
        }
        assert!(names.contains(&"system.freeze"));
        assert!(names.contains(&"system.resume"));
        assert!(names.contains(&"rollback.success"));

        let history = fx.coordinator.history().await;
        assert_eq!(history.len(), 1);
        assert!(history[0].success);
    }

    #[tokio::test]
    async fn test_emergency_rollback_without_target_degrades() {
        let fx = fixture().await;
        let outcome = fx
            .coordinator
            .emergency_rollback(RollbackRequest::new("nothing to restore"))
            .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("no completed backup"));
        assert_eq!(fx.state.get().await, SystemState::Degraded);
        assert!(!fx.coordinator.history().await[0].success);
    }

    #[tokio::test]
    async fn test_emergency_rollback_finishes_after_caller_gives_up() {
        let fx = fixture_with_grace(Duration::from_millis(1500)).await;
        let backup = fx.backups.create_full("manual", serde_json::Value::Null).await.unwrap();
        fs::write(fx.data.join("budgets/limits.json"), b"{\"daily\":99}").await.unwrap();
        let mut rx = fx.events.subscribe().await;

        let breakers = Arc::clone(&fx.breakers);
        let slow_call = tokio::spawn(async move {
            breakers
                .protect("NPA", || async {
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    Ok::<(), String>(())
                })
                .await
        });
        while fx.breakers.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        let abandoned = tokio::time::timeout(
            Duration::from_millis(200),
            fx.coordinator.emergency_rollback(RollbackRequest::new("deadline exceeded")),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(fx.state.get().await, SystemState::Recovery);

        tokio::time::timeout(Duration::from_secs(10), async {
            while fx.coordinator.history().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("rollback should finish without its caller");

        let history = fx.coordinator.history().await;
        assert!(history[0].success, "{:?}", history[0].error);
        assert_eq!(history[0].backup_id.as_deref(), Some(backup.id.as_str()));
        assert_eq!(fx.state.get().await, SystemState::Normal);
        assert!(!fx.backups.is_pinned(&backup.id));
        assert_eq!(
            fs::read_to_string(fx.data.join("budgets/limits.json")).await.unwrap(),
            "{\"daily\":10}"
        );

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name());
        }
        assert!(names.contains(&"rollback.success"));
        slow_call.await.unwrap().unwrap();
    }
}
