//! Hive - 多智能体路由器的韧性子系统
//!
//! 入口：加载配置、初始化日志、装配应急系统、启动后台任务，等待关闭信号后执行清理。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use hive::config::load_config;
use hive::core::{run_with_graceful_shutdown, ShutdownCoordinator, ShutdownManager};
use hive::emergency::{EmergencySystem, FinalBackupCleanup};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    // 可选参数：额外的配置文件，覆盖 config/default.toml
    let config = load_config(std::env::args().nth(1).map(PathBuf::from))
        .context("Failed to load config")?;

    let shutdown = Arc::new(ShutdownManager::new());
    let system = EmergencySystem::builder(config)
        .with_shutdown(Arc::clone(&shutdown))
        .build()
        .await
        .context("Failed to build emergency system")?;

    system.install_fault_handler();
    let tasks = system.start_background_tasks(shutdown.token()).await;
    tracing::info!(tasks = tasks.len(), "Emergency system running");

    let mut coordinator = ShutdownCoordinator::new(Arc::clone(&shutdown));
    coordinator.register(FinalBackupCleanup::new(Arc::clone(&system)));

    let waiter = Arc::clone(&shutdown);
    run_with_graceful_shutdown(
        Arc::clone(&shutdown),
        async move { waiter.wait_for_shutdown().await },
        || async move { coordinator.run_cleanup().await },
    )
    .await;

    for task in tasks {
        let _ = task.await;
    }

    if shutdown.reason().is_some_and(|r| r.is_fatal()) {
        tracing::error!("Exiting after fatal fault");
        std::process::exit(1);
    }
    Ok(())
}
