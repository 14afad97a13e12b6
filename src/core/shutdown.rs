//! 优雅关闭处理
//!
//! 提供统一的关闭信号监听和清理逻辑，确保：
//! - 健康监控与定时备份任务收到取消信号
//! - 退出前创建最终备份、系统状态置为 Shutdown
//! - 致命故障与信号退出走同一条清理路径

use std::future::Future;
use std::sync::{Arc, OnceLock};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    /// 关闭信号 token
    shutdown_token: CancellationToken,
    /// 关闭原因广播
    reason_tx: broadcast::Sender<ShutdownReason>,
    /// 第一次触发的原因（后续触发不覆盖）
    reason: Arc<OnceLock<ShutdownReason>>,
}

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// 调用方主动退出
    UserInitiated,
    /// 系统信号（SIGINT / SIGTERM）
    Signal(String),
    /// 致命故障（panic 或不可恢复的内部错误）
    FatalFault(String),
}

impl ShutdownReason {
    /// 用于备份原因标签，如 shutdown_SIGTERM
    pub fn label(&self) -> String {
        match self {
            Self::UserInitiated => "user".to_string(),
            Self::Signal(sig) => sig.clone(),
            Self::FatalFault(_) => "fatal".to_string(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalFault(_))
    }
}

impl ShutdownManager {
    /// 创建新的关闭管理器
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(4);
        Self {
            shutdown_token: CancellationToken::new(),
            reason_tx,
            reason: Arc::new(OnceLock::new()),
        }
    }

    /// 获取关闭 token（后台任务据此退出循环）
    pub fn token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// 触发关闭
    pub fn shutdown(&self, reason: ShutdownReason) {
        let _ = self.reason.set(reason.clone());
        let _ = self.reason_tx.send(reason);
        self.shutdown_token.cancel();
    }

    /// 是否已触发关闭
    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// 第一次触发关闭的原因
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.get().cloned()
    }

    /// 订阅关闭原因
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    /// 等待关闭信号
    pub async fn wait_for_shutdown(&self) {
        self.shutdown_token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received SIGINT, initiating graceful shutdown...");
                manager.shutdown(ShutdownReason::Signal("SIGINT".to_string()));
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    manager.shutdown(ShutdownReason::Signal("SIGTERM".to_string()));
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭时需要执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    /// 执行清理；reason 为触发关闭的原因
    async fn cleanup(&self, reason: &ShutdownReason) -> anyhow::Result<()>;

    /// 清理任务名称（用于日志）
    fn name(&self) -> &'static str;
}

/// 关闭协调器：按注册顺序执行清理任务，每个任务有独立超时
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    cleanup_tasks: Vec<Arc<dyn ShutdownCleanup>>,
    /// 单个清理任务的超时时间（秒）
    timeout_secs: u64,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            cleanup_tasks: Vec::new(),
            timeout_secs: 30,
        }
    }

    /// 设置清理超时时间
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// 注册清理任务
    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.cleanup_tasks.push(Arc::new(task));
    }

    /// 执行所有清理任务；失败与超时只记录日志
    pub async fn run_cleanup(&self) {
        let reason = self
            .manager
            .reason()
            .unwrap_or(ShutdownReason::UserInitiated);
        tracing::info!(
            "Running {} cleanup tasks (reason: {:?})...",
            self.cleanup_tasks.len(),
            reason
        );

        let timeout = tokio::time::Duration::from_secs(self.timeout_secs);

        for task in &self.cleanup_tasks {
            let name = task.name();
            match tokio::time::timeout(timeout, task.cleanup(&reason)).await {
                Ok(Ok(())) => {
                    tracing::info!("Cleanup task '{}' completed successfully", name);
                }
                Ok(Err(e)) => {
                    tracing::warn!("Cleanup task '{}' failed: {:#}", name, e);
                }
                Err(_) => {
                    tracing::warn!("Cleanup task '{}' timed out after {}s", name, self.timeout_secs);
                }
            }
        }

        tracing::info!("All cleanup tasks finished");
    }

    /// 获取关闭管理器
    pub fn manager(&self) -> &Arc<ShutdownManager> {
        &self.manager
    }
}

/// 运行主服务直到其结束或收到关闭信号，然后执行清理
pub async fn run_with_graceful_shutdown<F, Fut>(
    shutdown_manager: Arc<ShutdownManager>,
    app: F,
    cleanup: impl FnOnce() -> Fut,
) where
    F: Future<Output = ()>,
    Fut: Future<Output = ()>,
{
    shutdown_manager.install_signal_handlers();

    tokio::select! {
        _ = app => {
            tracing::info!("Services finished normally");
        }
        _ = shutdown_manager.wait_for_shutdown() => {
            tracing::info!("Shutdown signal received");
        }
    }

    cleanup().await;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[test]
    fn test_first_reason_wins() {
        let manager = ShutdownManager::new();
        assert!(!manager.is_shutdown());
        manager.shutdown(ShutdownReason::FatalFault("panic".to_string()));
        manager.shutdown(ShutdownReason::UserInitiated);
        assert!(manager.is_shutdown());
        assert!(manager.reason().unwrap().is_fatal());
    }

    #[test]
    fn test_token_cancelled_on_shutdown() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        manager.shutdown(ShutdownReason::Signal("SIGTERM".to_string()));
        assert!(token.is_cancelled());
        assert_eq!(manager.reason().unwrap().label(), "SIGTERM");
    }

    struct MockCleanup {
        called: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl ShutdownCleanup for MockCleanup {
        async fn cleanup(&self, reason: &ShutdownReason) -> anyhow::Result<()> {
            assert_eq!(reason, &ShutdownReason::UserInitiated);
            self.called.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "MockCleanup"
        }
    }

    #[tokio::test]
    async fn test_shutdown_coordinator_runs_tasks() {
        let manager = Arc::new(ShutdownManager::new());
        manager.shutdown(ShutdownReason::UserInitiated);
        let mut coordinator = ShutdownCoordinator::new(manager).with_timeout(1);

        let called = Arc::new(AtomicBool::new(false));
        coordinator.register(MockCleanup {
            called: called.clone(),
        });

        coordinator.run_cleanup().await;
        assert!(called.load(Ordering::SeqCst));
    }
}
