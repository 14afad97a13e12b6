//! 健康监控：独立于请求路径的周期任务
//!
//! 每个周期读取全部熔断器状态，得出 overall（任一组件非 Closed 即 degraded），
//! 采集资源指标并发布为 latest。单次检查内部的错误或 panic 只会让该快照 overall=error，
//! 监控循环继续运行。

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::breaker::{BreakerRegistry, BreakerState};
use crate::core::events::{EmergencyEvent, EventBus};
use crate::core::{SystemState, SystemStateCell};
use crate::incident::IncidentManager;

/// 整体健康度
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallHealth {
    Healthy,
    Degraded,
    /// 检查本身出错
    Error,
}

/// 单组件健康度（由熔断状态推出）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    Healthy,
    Recovering,
    Unhealthy,
}

impl From<BreakerState> for ComponentStatus {
    fn from(state: BreakerState) -> Self {
        match state {
            BreakerState::Closed => Self::Healthy,
            BreakerState::HalfOpen => Self::Recovering,
            BreakerState::Open => Self::Unhealthy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    pub failures: u32,
    pub last_failure: Option<DateTime<Utc>>,
}

/// 资源指标
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceMetrics {
    /// 常驻内存；平台不支持时为 None
    pub rss_bytes: Option<u64>,
    pub uptime_secs: u64,
    pub active_incidents: usize,
    pub system_state: SystemState,
}

/// 某一时刻的健康快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub timestamp: DateTime<Utc>,
    pub overall: OverallHealth,
    pub components: BTreeMap<String, ComponentHealth>,
    pub metrics: Option<ResourceMetrics>,
    pub issues: Vec<String>,
}

impl HealthSnapshot {
    fn error(issue: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            overall: OverallHealth::Error,
            components: BTreeMap::new(),
            metrics: None,
            issues: vec![issue.into()],
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.overall == OverallHealth::Degraded
    }
}

/// 进程资源采样
#[async_trait]
pub trait ResourceProbe: Send + Sync {
    /// 常驻内存字节数；无法获取时返回 Ok(None)
    async fn rss_bytes(&self) -> anyhow::Result<Option<u64>>;
}

/// 读取 /proc/self/status 的 VmRSS（非 Linux 平台返回 None）
#[derive(Debug, Default)]
pub struct ProcessProbe;

#[async_trait]
impl ResourceProbe for ProcessProbe {
    async fn rss_bytes(&self) -> anyhow::Result<Option<u64>> {
        let status = match tokio::fs::read_to_string("/proc/self/status").await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(parse_vm_rss(&status))
    }
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

/// 健康监控器
pub struct HealthMonitor {
    breakers: Arc<BreakerRegistry>,
    incidents: Arc<IncidentManager>,
    state: Arc<SystemStateCell>,
    events: Arc<EventBus>,
    probe: Arc<dyn ResourceProbe>,
    started: Instant,
    latest: RwLock<Option<HealthSnapshot>>,
}

impl HealthMonitor {
    pub fn new(
        breakers: Arc<BreakerRegistry>,
        incidents: Arc<IncidentManager>,
        state: Arc<SystemStateCell>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            breakers,
            incidents,
            state,
            events,
            probe: Arc::new(ProcessProbe),
            started: Instant::now(),
            latest: RwLock::new(None),
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// 最近一次快照
    pub async fn latest(&self) -> Option<HealthSnapshot> {
        self.latest.read().await.clone()
    }

    /// 立即执行一次检查并发布；从不返回错误
    pub async fn check_now(&self) -> HealthSnapshot {
        let snapshot = match AssertUnwindSafe(self.collect()).catch_unwind().await {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => {
                tracing::error!("Health check failed: {:#}", e);
                HealthSnapshot::error(format!("health check failed: {e:#}"))
            }
            Err(_) => {
                tracing::error!("Health check panicked");
                HealthSnapshot::error("health check panicked")
            }
        };

        let previous = self.latest.write().await.replace(snapshot.clone());
        let entered_degraded = snapshot.is_degraded()
            && previous.as_ref().map_or(true, |p| !p.is_degraded());

        self.events
            .publish(EmergencyEvent::HealthCheck {
                snapshot: Box::new(snapshot.clone()),
            })
            .await;
        if entered_degraded {
            tracing::warn!(issues = ?snapshot.issues, "System health degraded");
            self.events
                .publish(EmergencyEvent::HealthDegraded {
                    snapshot: Box::new(snapshot.clone()),
                })
                .await;
        }
        snapshot
    }

    async fn collect(&self) -> anyhow::Result<HealthSnapshot> {
        let statuses = self.breakers.statuses().await;
        let mut components = BTreeMap::new();
        let mut issues = Vec::new();

        for (name, status) in statuses {
            let health = ComponentStatus::from(status.state);
            match status.state {
                BreakerState::Closed => {}
                BreakerState::Open => issues.push(format!("{name}: circuit open")),
                BreakerState::HalfOpen => issues.push(format!("{name}: circuit half-open")),
            }
            components.insert(
                name,
                ComponentHealth {
                    status: health,
                    failures: status.failure_count,
                    last_failure: status.last_failure_at,
                },
            );
        }

        let system_state = self.state.get().await;
        let overall = if system_state == SystemState::Emergency {
            issues.push("system in emergency state".to_string());
            OverallHealth::Error
        } else if issues.is_empty() {
            OverallHealth::Healthy
        } else {
            OverallHealth::Degraded
        };

        let metrics = ResourceMetrics {
            rss_bytes: self.probe.rss_bytes().await?,
            uptime_secs: self.started.elapsed().as_secs(),
            active_incidents: self.incidents.active_count().await,
            system_state,
        };

        Ok(HealthSnapshot {
            timestamp: Utc::now(),
            overall,
            components,
            metrics: Some(metrics),
            issues,
        })
    }

    /// 周期运行直到 token 取消（第一次检查立即执行）
    pub async fn run(self: Arc<Self>, period: Duration, token: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_secs = period.as_secs(), "Health monitor started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let snapshot = self.check_now().await;
                    tracing::debug!(overall = ?snapshot.overall, "Health check completed");
                }
            }
        }
        tracing::info!("Health monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::incident::IncidentLog;
    use tempfile::TempDir;

    struct FailingProbe;

    #[async_trait]
    impl ResourceProbe for FailingProbe {
        async fn rss_bytes(&self) -> anyhow::Result<Option<u64>> {
            anyhow::bail!("probe unavailable")
        }
    }

    struct PanickingProbe;

    #[async_trait]
    impl ResourceProbe for PanickingProbe {
        async fn rss_bytes(&self) -> anyhow::Result<Option<u64>> {
            panic!("probe exploded")
        }
    }

    fn monitor(dir: &TempDir) -> (HealthMonitor, Arc<BreakerRegistry>, Arc<EventBus>) {
        let events = Arc::new(EventBus::new());
        let breakers = Arc::new(BreakerRegistry::new(
            BreakerConfig::default(),
            Arc::clone(&events),
        ));
        let incidents = Arc::new(IncidentManager::new(
            IncidentLog::new(dir.path().join("incidents.jsonl")),
            Arc::clone(&events),
        ));
        let monitor = HealthMonitor::new(
            Arc::clone(&breakers),
            incidents,
            Arc::new(SystemStateCell::new()),
            Arc::clone(&events),
        );
        (monitor, breakers, events)
    }

    #[test]
    fn test_parse_vm_rss() {
        let status = "Name:\thive\nVmRSS:\t   2048 kB\nThreads:\t4\n";
        assert_eq!(parse_vm_rss(status), Some(2048 * 1024));
        assert_eq!(parse_vm_rss("Name:\thive\n"), None);
    }

    #[tokio::test]
    async fn test_healthy_when_all_closed() {
        let dir = TempDir::new().unwrap();
        let (monitor, breakers, _events) = monitor(&dir);
        breakers.register("MCA").await;

        let snapshot = monitor.check_now().await;
        assert_eq!(snapshot.overall, OverallHealth::Healthy);
        assert_eq!(snapshot.components["MCA"].status, ComponentStatus::Healthy);
        let metrics = snapshot.metrics.unwrap();
        assert_eq!(metrics.active_incidents, 0);
        assert_eq!(metrics.system_state, SystemState::Normal);
        assert!(monitor.latest().await.is_some());
    }

    #[tokio::test]
    async fn test_open_breaker_degrades_and_publishes_once() {
        let dir = TempDir::new().unwrap();
        let (monitor, breakers, events) = monitor(&dir);
        breakers.trip("NPA").await;
        let mut rx = events.subscribe().await;

        let snapshot = monitor.check_now().await;
        assert_eq!(snapshot.overall, OverallHealth::Degraded);
        assert_eq!(snapshot.components["NPA"].status, ComponentStatus::Unhealthy);
        monitor.check_now().await;

        let mut degraded = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, EmergencyEvent::HealthDegraded { .. }) {
                degraded += 1;
            }
        }
        assert_eq!(degraded, 1);
    }

    #[tokio::test]
    async fn test_emergency_state_is_an_error() {
        let dir = TempDir::new().unwrap();
        let (monitor, _breakers, _events) = monitor(&dir);
        monitor.state.set(SystemState::Emergency).await;

        let snapshot = monitor.check_now().await;
        assert_eq!(snapshot.overall, OverallHealth::Error);
        assert!(snapshot.issues.iter().any(|i| i.contains("emergency")));
    }

    #[tokio::test]
    async fn test_probe_error_yields_error_snapshot() {
        let dir = TempDir::new().unwrap();
        let (monitor, _breakers, _events) = monitor(&dir);
        let monitor = monitor.with_probe(Arc::new(FailingProbe));
        let snapshot = monitor.check_now().await;
        assert_eq!(snapshot.overall, OverallHealth::Error);
        assert!(snapshot.issues[0].contains("probe unavailable"));
    }

    #[tokio::test]
    async fn test_probe_panic_does_not_escape() {
        let dir = TempDir::new().unwrap();
        let (monitor, _breakers, _events) = monitor(&dir);
        let monitor = monitor.with_probe(Arc::new(PanickingProbe));
        let snapshot = monitor.check_now().await;
        assert_eq!(snapshot.overall, OverallHealth::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let dir = TempDir::new().unwrap();
        let (monitor, _breakers, _events) = monitor(&dir);
        let monitor = Arc::new(monitor);
        let token = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&monitor).run(Duration::from_secs(30), token.clone()));

        tokio::time::sleep(Duration::from_secs(61)).await;
        token.cancel();
        handle.await.unwrap();
        assert!(monitor.latest().await.is_some());
    }
}
