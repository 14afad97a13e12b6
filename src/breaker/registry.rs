//! 熔断器注册表：熔断状态的唯一修改者
//!
//! 每个组件一个槽位：`breaker` 保存状态（健康检查只读它），`gate` 把同一组件的
//! 「检查 → 调用 → 记录」串成一个原子单元，并发调用不会丢失计数更新。

use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use super::{Admission, BreakerConfig, BreakerError, BreakerStatus, CircuitBreaker, Transition};
use crate::core::events::{EmergencyEvent, EventBus};

struct BreakerSlot {
    breaker: RwLock<CircuitBreaker>,
    gate: Mutex<()>,
}

impl BreakerSlot {
    fn new(component: &str, config: BreakerConfig) -> Self {
        Self {
            breaker: RwLock::new(CircuitBreaker::new(component, config)),
            gate: Mutex::new(()),
        }
    }
}

/// 在途调用计数守卫（drop 时减一，panic 也不会泄漏）
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 熔断器注册表
pub struct BreakerRegistry {
    config: BreakerConfig,
    slots: RwLock<HashMap<String, Arc<BreakerSlot>>>,
    events: Arc<EventBus>,
    in_flight: AtomicUsize,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig, events: Arc<EventBus>) -> Self {
        Self {
            config,
            slots: RwLock::new(HashMap::new()),
            events,
            in_flight: AtomicUsize::new(0),
        }
    }

    /// 预注册组件（已存在则忽略）
    pub async fn register(&self, component: &str) {
        self.slot(component).await;
    }

    async fn slot(&self, component: &str) -> Arc<BreakerSlot> {
        if let Some(slot) = self.slots.read().await.get(component) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write().await;
        Arc::clone(
            slots
                .entry(component.to_string())
                .or_insert_with(|| Arc::new(BreakerSlot::new(component, self.config))),
        )
    }

    async fn existing(&self, component: &str) -> Option<Arc<BreakerSlot>> {
        self.slots.read().await.get(component).cloned()
    }

    /// 在熔断保护下执行 operation
    ///
    /// Open 且未超时：直接返回 `BreakerError::Open`，不调用 operation。
    /// 失败使熔断打开时发布 `circuit.opened`。
    pub async fn protect<T, E, F, Fut>(
        &self,
        component: &str,
        operation: F,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let slot = self.slot(component).await;
        let _gate = slot.gate.lock().await;

        let admission = slot.breaker.write().await.admit(Instant::now());
        if admission == Admission::Rejected {
            tracing::debug!(component, "Call rejected, circuit open");
            return Err(BreakerError::Open {
                component: component.to_string(),
            });
        }

        let result = {
            let _flight = InFlight::enter(&self.in_flight);
            operation().await
        };

        match result {
            Ok(value) => {
                let transition = slot.breaker.write().await.on_success();
                if transition == Transition::Closed {
                    self.events
                        .publish(EmergencyEvent::CircuitClosed {
                            component: component.to_string(),
                        })
                        .await;
                }
                Ok(value)
            }
            Err(error) => {
                let transition = slot.breaker.write().await.on_failure(Instant::now());
                let tripped = transition == Transition::Opened;
                if tripped {
                    self.events
                        .publish(EmergencyEvent::CircuitOpened {
                            component: component.to_string(),
                            error: error.to_string(),
                        })
                        .await;
                }
                Err(BreakerError::Operation { error, tripped })
            }
        }
    }

    /// 组件当前是否放行调用（未知组件视为可用）
    pub async fn is_available(&self, component: &str) -> bool {
        match self.existing(component).await {
            Some(slot) => slot.breaker.read().await.is_available(Instant::now()),
            None => true,
        }
    }

    pub async fn status(&self, component: &str) -> Option<BreakerStatus> {
        let slot = self.existing(component).await?;
        let status = slot.breaker.read().await.status(Instant::now());
        Some(status)
    }

    /// 所有熔断器状态（按组件名排序）
    pub async fn statuses(&self) -> BTreeMap<String, BreakerStatus> {
        let slots: Vec<(String, Arc<BreakerSlot>)> = self
            .slots
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        let now = Instant::now();
        let mut out = BTreeMap::new();
        for (name, slot) in slots {
            out.insert(name, slot.breaker.read().await.status(now));
        }
        out
    }

    /// 人工重置为 Closed；组件不存在返回 false
    pub async fn reset(&self, component: &str) -> bool {
        match self.existing(component).await {
            Some(slot) => {
                slot.breaker.write().await.reset();
                tracing::info!(component, "Circuit breaker manually reset");
                true
            }
            None => false,
        }
    }

    /// 强制打开（组件不存在时先创建）
    pub async fn trip(&self, component: &str) {
        let slot = self.slot(component).await;
        slot.breaker.write().await.trip(Instant::now());
        tracing::warn!(component, "Circuit breaker tripped by response protocol");
    }

    /// 正在执行的受保护调用数量
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub async fn components(&self) -> Vec<String> {
        let mut names: Vec<String> = self.slots.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}
