//! 定时备份：全量定时器 + 每组件定时器 + 健康降级触发的增量备份
//!
//! 每个任务独立运行并自行捕获错误与 panic，互不影响，也不阻塞请求路径。

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::BackupManager;
use crate::core::events::{EmergencyEvent, EventBus};

/// 健康降级时创建的增量备份所属组件
pub const SYSTEM_STATE_COMPONENT: &str = "system_state";

pub struct BackupScheduler {
    manager: Arc<BackupManager>,
    events: Arc<EventBus>,
}

/// 执行一次备份任务，错误与 panic 只记日志
async fn run_guarded<F, T>(job: &str, fut: F)
where
    F: Future<Output = crate::core::EmergencyResult<T>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(_)) => tracing::debug!(job, "Scheduled backup finished"),
        Ok(Err(e)) => tracing::error!(job, "Scheduled backup failed: {}", e),
        Err(_) => tracing::error!(job, "Scheduled backup panicked"),
    }
}

impl BackupScheduler {
    pub fn new(manager: Arc<BackupManager>, events: Arc<EventBus>) -> Self {
        Self { manager, events }
    }

    /// 启动全部定时任务与事件监听，token 取消后全部退出
    pub async fn spawn(&self, token: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        let settings = self.manager.settings().clone();

        if settings.full_interval_secs > 0 {
            let manager = Arc::clone(&self.manager);
            let period = Duration::from_secs(settings.full_interval_secs);
            handles.push(spawn_timer("full", period, token.clone(), move || {
                let manager = Arc::clone(&manager);
                async move {
                    run_guarded("full", manager.create_full("scheduled", serde_json::Value::Null))
                        .await
                }
            }));
        }

        for component in settings.components.into_iter().filter(|c| c.interval_secs > 0) {
            let manager = Arc::clone(&self.manager);
            let period = Duration::from_secs(component.interval_secs);
            let name = component.name;
            handles.push(spawn_timer(&name.clone(), period, token.clone(), move || {
                let manager = Arc::clone(&manager);
                let name = name.clone();
                async move {
                    run_guarded(&name, manager.create_component_backup(&name, "scheduled")).await
                }
            }));
        }

        handles.push(self.spawn_degradation_listener(token).await);
        tracing::info!(tasks = handles.len(), "Backup scheduler started");
        handles
    }

    async fn spawn_degradation_listener(&self, token: CancellationToken) -> JoinHandle<()> {
        let mut rx = self.events.subscribe().await;
        let manager = Arc::clone(&self.manager);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = rx.recv() => event,
                };
                match event {
                    Some(EmergencyEvent::HealthDegraded { snapshot }) => {
                        let data = match serde_json::to_value(&*snapshot) {
                            Ok(data) => data,
                            Err(e) => {
                                tracing::error!("Failed to serialize health snapshot: {}", e);
                                continue;
                            }
                        };
                        run_guarded(
                            SYSTEM_STATE_COMPONENT,
                            manager.create_incremental(SYSTEM_STATE_COMPONENT, data, "health_degradation"),
                        )
                        .await;
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        })
    }
}

/// 按周期执行 job；第一次在一个周期之后触发
fn spawn_timer<F, Fut>(
    name: &str,
    period: Duration,
    token: CancellationToken,
    mut job: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let name = name.to_string();
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + period;
        let mut ticker = tokio::time::interval_at(start, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => job().await,
            }
        }
        tracing::debug!(job = %name, "Backup timer stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupSettings;
    use crate::config::AppConfig;
    use crate::core::SystemStateCell;
    use crate::health::{HealthSnapshot, OverallHealth};
    use tempfile::TempDir;

    fn setup(dir: &TempDir, full_interval_secs: u64) -> (Arc<BackupManager>, Arc<EventBus>) {
        let mut cfg = AppConfig::with_data_dir(dir.path());
        cfg.backup.full_interval_secs = full_interval_secs;
        cfg.backup.components.clear();
        let manager = Arc::new(BackupManager::new(
            BackupSettings::from_config(&cfg),
            Arc::new(SystemStateCell::new()),
        ));
        (manager, Arc::new(EventBus::new()))
    }

    fn degraded_snapshot() -> HealthSnapshot {
        HealthSnapshot {
            timestamp: chrono::Utc::now(),
            overall: OverallHealth::Degraded,
            components: Default::default(),
            metrics: None,
            issues: vec!["NPA: circuit open".to_string()],
        }
    }

    #[tokio::test]
    async fn test_health_degradation_triggers_incremental_backup() {
        let dir = TempDir::new().unwrap();
        let (manager, events) = setup(&dir, 0);
        let scheduler = BackupScheduler::new(Arc::clone(&manager), Arc::clone(&events));
        let token = CancellationToken::new();
        let handles = scheduler.spawn(token.clone()).await;
        assert_eq!(handles.len(), 1);

        events
            .publish(EmergencyEvent::HealthDegraded {
                snapshot: Box::new(degraded_snapshot()),
            })
            .await;

        let mut found = None;
        for _ in 0..100 {
            if let Some(inc) = manager.list_incremental().await.into_iter().next() {
                found = Some(inc);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let inc = found.expect("incremental backup created");
        assert_eq!(inc.component_type, SYSTEM_STATE_COMPONENT);
        assert_eq!(inc.reason, "health_degradation");

        token.cancel();
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_full_timer_runs_after_one_period() {
        let dir = TempDir::new().unwrap();
        let (manager, events) = setup(&dir, 1);
        let scheduler = BackupScheduler::new(Arc::clone(&manager), events);
        let token = CancellationToken::new();
        let handles = scheduler.spawn(token.clone()).await;

        assert!(manager.list_available().await.is_empty());
        let mut created = false;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if !manager.list_available().await.is_empty() {
                created = true;
                break;
            }
        }
        assert!(created);

        token.cancel();
        for h in handles {
            h.await.unwrap();
        }
    }
}
