//! 进程级致命故障处理
//!
//! 后台任务通过 `spawn_supervised` 启动，panic 会以 `FatalFault` 上报；事故日志写不进去时门面也会上报。
//! 故障处理只执行一次：关键备份 → 严重事故 → （前两步有失败时）取证记录 → 触发关闭。

use std::any::Any;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::EmergencySystem;
use crate::backup::store;
use crate::core::shutdown::{ShutdownCleanup, ShutdownReason};
use crate::core::{ComponentError, SystemState};
use crate::incident::ErrorContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultSource {
    /// 被监管的后台任务 panic
    Panic,
    /// 应急系统内部不可恢复的错误
    Internal,
}

#[derive(Debug, Clone, Serialize)]
pub struct FatalFault {
    pub source: FaultSource,
    pub message: String,
    pub task: Option<String>,
    pub at: DateTime<Utc>,
}

impl FatalFault {
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            source: FaultSource::Internal,
            message: message.into(),
            task: None,
            at: Utc::now(),
        }
    }

    pub fn panic(task: &str, payload: &(dyn Any + Send)) -> Self {
        Self {
            source: FaultSource::Panic,
            message: panic_message(payload),
            task: Some(task.to_string()),
            at: Utc::now(),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// 一次致命故障处理的结果
#[derive(Debug, Clone, Serialize)]
pub struct FatalFaultReport {
    pub fault: FatalFault,
    pub backup_id: Option<String>,
    pub incident_id: Option<String>,
    /// 备份或事故记录失败时写下的取证文件
    pub forensic_record: Option<PathBuf>,
    pub errors: Vec<String>,
}

impl EmergencySystem {
    /// 上报致命故障；未安装故障处理器时只记日志并返回 false
    pub fn report_fault(&self, fault: FatalFault) -> bool {
        match self.fault_tx.get() {
            Some(tx) => tx.send(fault).is_ok(),
            None => {
                tracing::error!(
                    source = ?fault.source,
                    "Fatal fault reported without a handler: {}",
                    fault.message
                );
                false
            }
        }
    }

    /// 安装进程级故障处理器；只处理第一次上报的故障。已安装时返回 None
    pub fn install_fault_handler(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let (tx, mut rx) = mpsc::unbounded_channel::<FatalFault>();
        if self.fault_tx.set(tx).is_err() {
            return None;
        }

        let system: Weak<Self> = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            let Some(fault) = rx.recv().await else {
                return;
            };
            if let Some(system) = system.upgrade() {
                system.handle_fatal_fault(fault).await;
            }
        }))
    }

    /// 启动被监管的后台任务：任务 panic 时上报致命故障
    pub fn spawn_supervised<F>(self: &Arc<Self>, name: &'static str, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task = tokio::spawn(fut);
        let system = Arc::downgrade(self);
        tokio::spawn(async move {
            match task.await {
                Ok(()) => tracing::debug!(task = name, "Supervised task finished"),
                Err(e) if e.is_panic() => {
                    let fault = FatalFault::panic(name, e.into_panic().as_ref());
                    tracing::error!(task = name, "Supervised task panicked: {}", fault.message);
                    if let Some(system) = system.upgrade() {
                        system.report_fault(fault);
                    }
                }
                Err(_) => tracing::debug!(task = name, "Supervised task cancelled"),
            }
        })
    }

    /// 关键备份、严重事故、取证记录，最后触发关闭
    pub async fn handle_fatal_fault(&self, fault: FatalFault) -> FatalFaultReport {
        tracing::error!(
            source = ?fault.source,
            task = ?fault.task,
            "Fatal fault, starting emergency shutdown: {}",
            fault.message
        );
        let mut report = FatalFaultReport {
            fault: fault.clone(),
            backup_id: None,
            incident_id: None,
            forensic_record: None,
            errors: Vec::new(),
        };

        match self
            .backups
            .create_full("critical", serde_json::json!({ "fault": &fault }))
            .await
        {
            Ok(backup) => report.backup_id = Some(backup.id),
            Err(e) => report.errors.push(format!("critical backup: {e}")),
        }

        // 不带 SYSTEM_CRASH：致命故障只记事故，不回滚实时数据
        let error = ComponentError::new(fault.message.clone()).with_name("FatalFault");
        let context = ErrorContext {
            critical: true,
            system_wide: true,
            target_component: fault.task.clone(),
            ..ErrorContext::default()
        };
        match self.try_handle_error(&error, context).await {
            Ok(outcome) => report.incident_id = outcome.incident_id,
            Err(e) => report.errors.push(format!("incident: {e}")),
        }

        if !report.errors.is_empty() {
            let path = self.config.emergency_dir().join(format!(
                "critical_error_{}.json",
                Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
            ));
            match store::write_json(&path, &report).await {
                Ok(()) => {
                    tracing::warn!(path = %path.display(), "Forensic record written");
                    report.forensic_record = Some(path);
                }
                Err(e) => tracing::error!("Failed to write forensic record: {}", e),
            }
        }

        self.shutdown
            .shutdown(ShutdownReason::FatalFault(fault.message));
        report
    }
}

/// 关闭清理：先把系统状态置为 Shutdown，非致命关闭时再创建最终备份
pub struct FinalBackupCleanup {
    system: Arc<EmergencySystem>,
}

impl FinalBackupCleanup {
    pub fn new(system: Arc<EmergencySystem>) -> Self {
        Self { system }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for FinalBackupCleanup {
    async fn cleanup(&self, reason: &ShutdownReason) -> anyhow::Result<()> {
        // 状态先于备份落定，备份可能被清理超时丢弃
        self.system.state.set(SystemState::Shutdown).await;
        if reason.is_fatal() {
            return Ok(());
        }
        let label = reason.label();
        let backup = self
            .system
            .backups
            .create_full(
                &format!("shutdown_{label}"),
                serde_json::json!({ "shutdown": label }),
            )
            .await?;
        tracing::info!(backup = %backup.id, "Final backup created");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "final_backup"
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::AppConfig;
    use crate::core::shutdown::{ShutdownCoordinator, ShutdownManager};
    use tempfile::TempDir;

    async fn system(cfg: AppConfig) -> (Arc<EmergencySystem>, Arc<ShutdownManager>) {
        let manager = Arc::new(ShutdownManager::new());
        let sys = EmergencySystem::builder(cfg)
            .with_shutdown(Arc::clone(&manager))
            .with_existing_backups(false)
            .build()
            .await
            .unwrap();
        (sys, manager)
    }

    #[tokio::test]
    async fn test_report_without_handler_is_dropped() {
        let dir = TempDir::new().unwrap();
        let (sys, manager) = system(AppConfig::with_data_dir(dir.path())).await;
        assert!(!sys.report_fault(FatalFault::internal("nobody listening")));
        assert!(!manager.is_shutdown());
    }

    #[tokio::test]
    async fn test_handler_installs_once() {
        let dir = TempDir::new().unwrap();
        let (sys, _) = system(AppConfig::with_data_dir(dir.path())).await;
        assert!(sys.install_fault_handler().is_some());
        assert!(sys.install_fault_handler().is_none());
    }

    #[tokio::test]
    async fn test_supervised_panic_triggers_fatal_shutdown() {
        let dir = TempDir::new().unwrap();
        let (sys, manager) = system(AppConfig::with_data_dir(dir.path())).await;
        sys.install_fault_handler().unwrap();

        sys.spawn_supervised("exploding_task", async { panic!("boom") });
        tokio::time::timeout(Duration::from_secs(10), manager.wait_for_shutdown())
            .await
            .expect("fatal fault should trigger shutdown");

        assert_eq!(
            manager.reason(),
            Some(ShutdownReason::FatalFault("boom".to_string()))
        );
        let reasons: Vec<String> = sys
            .backups()
            .list_available()
            .await
            .into_iter()
            .map(|b| b.reason)
            .collect();
        assert!(reasons.contains(&"critical".to_string()));
    }

    #[tokio::test]
    async fn test_forensic_record_when_backup_fails() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not_a_dir");
        tokio::fs::write(&blocker, b"x").await.unwrap();
        let mut cfg = AppConfig::with_data_dir(dir.path().join("data"));
        cfg.backup.root = Some(blocker);
        let (sys, manager) = system(cfg).await;

        let report = sys
            .handle_fatal_fault(FatalFault::internal("disk gone"))
            .await;
        assert!(report.backup_id.is_none());
        assert!(report.incident_id.is_some());
        assert!(!report.errors.is_empty());
        let record = report.forensic_record.expect("forensic record");
        assert!(record.starts_with(dir.path().join("data/emergency")));
        assert!(record.exists());
        assert!(manager.reason().unwrap().is_fatal());
    }

    #[tokio::test]
    async fn test_fatal_fault_keeps_live_data() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("data");
        let budgets = data.join("budgets");
        tokio::fs::create_dir_all(&budgets).await.unwrap();
        tokio::fs::write(budgets.join("limits.json"), b"v1").await.unwrap();
        let (sys, manager) = system(AppConfig::with_data_dir(&data)).await;
        sys.backups()
            .create_full("manual", serde_json::Value::Null)
            .await
            .unwrap();
        tokio::fs::write(budgets.join("limits.json"), b"v2").await.unwrap();

        let report = sys
            .handle_fatal_fault(FatalFault::internal("health monitor task panicked"))
            .await;
        assert!(report.errors.is_empty(), "{:?}", report.errors);
        assert!(report.incident_id.is_some());
        assert!(sys.rollback_history().await.is_empty());
        assert_eq!(
            tokio::fs::read_to_string(budgets.join("limits.json"))
                .await
                .unwrap(),
            "v2"
        );
        assert_ne!(sys.state().await, SystemState::Recovery);
        assert!(manager.reason().unwrap().is_fatal());
    }

    #[test]
    fn test_panic_message_downcast() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(owned.as_ref()), "owned");
        let borrowed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(borrowed.as_ref()), "static");
        let other: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }

    #[tokio::test]
    async fn test_final_backup_on_signal_shutdown() {
        let dir = TempDir::new().unwrap();
        let (sys, _) = system(AppConfig::with_data_dir(dir.path())).await;
        let cleanup = FinalBackupCleanup::new(Arc::clone(&sys));

        cleanup
            .cleanup(&ShutdownReason::Signal("SIGTERM".to_string()))
            .await
            .unwrap();
        let latest = sys.backups().latest_completed().await.unwrap();
        assert_eq!(latest.reason, "shutdown_SIGTERM");
        assert_eq!(sys.state().await, SystemState::Shutdown);
    }

    #[tokio::test]
    async fn test_state_is_shutdown_when_final_backup_times_out() {
        let dir = TempDir::new().unwrap();
        let (sys, manager) = system(AppConfig::with_data_dir(dir.path())).await;

        let mut coordinator = ShutdownCoordinator::new(Arc::clone(&manager)).with_timeout(0);
        coordinator.register(FinalBackupCleanup::new(Arc::clone(&sys)));
        manager.shutdown(ShutdownReason::Signal("SIGTERM".to_string()));
        coordinator.run_cleanup().await;

        assert_eq!(sys.state().await, SystemState::Shutdown);
    }

    #[tokio::test]
    async fn test_no_final_backup_after_fatal_fault() {
        let dir = TempDir::new().unwrap();
        let (sys, _) = system(AppConfig::with_data_dir(dir.path())).await;
        FinalBackupCleanup::new(Arc::clone(&sys))
            .cleanup(&ShutdownReason::FatalFault("boom".to_string()))
            .await
            .unwrap();
        assert!(sys.backups().latest_completed().await.is_none());
        assert_eq!(sys.state().await, SystemState::Shutdown);
    }
}
