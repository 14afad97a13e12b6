//! 应急系统构建器：统一的组件装配逻辑
//!
//! 路由进程与测试用同一套装配顺序：事件总线 → 状态 → 熔断 → 事故 → 健康 → 备份 → 回滚。

use std::sync::{Arc, OnceLock};

use tokio::fs;

use super::EmergencySystem;
use crate::backup::{BackupManager, BackupSettings};
use crate::breaker::{BreakerConfig, BreakerRegistry};
use crate::config::AppConfig;
use crate::core::events::EventBus;
use crate::core::shutdown::ShutdownManager;
use crate::core::{EmergencyResult, SystemStateCell};
use crate::health::{HealthMonitor, ResourceProbe};
use crate::incident::{ErrorClassifier, IncidentLog, IncidentManager, ProtocolSelector};
use crate::rollback::{RollbackCoordinator, RollbackSettings};

pub struct EmergencySystemBuilder {
    config: AppConfig,
    probe: Option<Arc<dyn ResourceProbe>>,
    shutdown: Option<Arc<ShutdownManager>>,
    load_existing_backups: bool,
}

impl EmergencySystemBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            probe: None,
            shutdown: None,
            load_existing_backups: true,
        }
    }

    /// 替换默认的进程资源探针
    pub fn with_probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// 与进程入口共用一个关闭管理器（致命故障据此触发关闭）
    pub fn with_shutdown(mut self, shutdown: Arc<ShutdownManager>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// 启动时是否从备份根目录加载已有备份元数据
    pub fn with_existing_backups(mut self, enable: bool) -> Self {
        self.load_existing_backups = enable;
        self
    }

    pub async fn build(self) -> EmergencyResult<Arc<EmergencySystem>> {
        let config = self.config;
        fs::create_dir_all(config.emergency_dir()).await?;

        let events = Arc::new(EventBus::new());
        let state = Arc::new(SystemStateCell::new());

        let breakers = Arc::new(BreakerRegistry::new(
            BreakerConfig::from(&config.breaker),
            Arc::clone(&events),
        ));
        for component in &config.breaker.components {
            breakers.register(component).await;
        }

        let incidents = Arc::new(IncidentManager::new(
            IncidentLog::new(config.incident_log_path()),
            Arc::clone(&events),
        ));

        let mut health = HealthMonitor::new(
            Arc::clone(&breakers),
            Arc::clone(&incidents),
            Arc::clone(&state),
            Arc::clone(&events),
        );
        if let Some(probe) = self.probe {
            health = health.with_probe(probe);
        }
        let health = Arc::new(health);

        let backups = Arc::new(BackupManager::new(
            BackupSettings::from_config(&config),
            Arc::clone(&state),
        ));
        if self.load_existing_backups {
            let loaded = backups.load_existing().await?;
            tracing::info!(loaded, root = %backups.root().display(), "Existing backups loaded");
        }

        let rollback = Arc::new(RollbackCoordinator::new(
            RollbackSettings::from(&config.rollback),
            Arc::clone(&backups),
            Arc::clone(&breakers),
            Arc::clone(&health),
            Arc::clone(&state),
            Arc::clone(&events),
        ));

        tracing::info!(
            app = %config.app.name,
            data_dir = %config.app.data_dir.display(),
            breakers = config.breaker.components.len(),
            "Emergency system assembled"
        );

        Ok(Arc::new(EmergencySystem {
            config,
            state,
            events,
            breakers,
            classifier: ErrorClassifier::new(),
            protocols: ProtocolSelector::new(),
            incidents,
            health,
            backups,
            rollback,
            shutdown: self.shutdown.unwrap_or_default(),
            fault_tx: OnceLock::new(),
        }))
    }
}
