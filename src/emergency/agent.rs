//! 被包装的 Agent：调用方总是拿到结构化结果（正常 / 不可用 / 降级 / 失败），不会收到未处理的错误

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use super::EmergencySystem;
use crate::breaker::BreakerError;
use crate::core::ComponentError;
use crate::incident::ErrorContext;

/// 降级响应的置信度
pub const DEGRADED_CONFIDENCE: f64 = 0.3;

/// Agent 的一次响应
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentResponse {
    pub content: String,
    pub confidence: f64,
    pub metadata: serde_json::Value,
}

impl AgentResponse {
    pub fn new(content: impl Into<String>, confidence: f64) -> Self {
        Self {
            content: content.into(),
            confidence,
            metadata: serde_json::Value::Null,
        }
    }
}

/// 可被应急系统包装的工作 Agent
#[async_trait]
pub trait Agent: Send + Sync {
    /// 熔断器使用的组件 ID（如 NPA、WPA）
    fn component_id(&self) -> &str;

    async fn process(&self, request: &str) -> Result<AgentResponse, ComponentError>;
}

/// 包装后的调用结果
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentOutcome {
    Normal(AgentResponse),
    /// 熔断打开，未调用 Agent
    Unavailable { component: String },
    /// Agent 失败但应急处理成功，返回低置信度的兜底响应
    Degraded {
        response: AgentResponse,
        incident_id: Option<String>,
    },
    Failed {
        error: ComponentError,
        incident_id: Option<String>,
    },
}

impl AgentOutcome {
    pub fn is_normal(&self) -> bool {
        matches!(self, Self::Normal(_))
    }
}

/// 熔断 + 应急处理装饰器
pub struct GuardedAgent<A> {
    inner: A,
    system: Arc<EmergencySystem>,
}

impl<A: Agent> GuardedAgent<A> {
    pub fn new(inner: A, system: Arc<EmergencySystem>) -> Self {
        Self { inner, system }
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }

    pub async fn process(&self, request: &str) -> AgentOutcome {
        let component = self.inner.component_id().to_string();
        let result = self
            .system
            .breakers
            .protect(&component, || self.inner.process(request))
            .await;

        match result {
            Ok(response) => AgentOutcome::Normal(response),
            Err(BreakerError::Open { component }) => {
                tracing::debug!(component = %component, "Agent unavailable, circuit open");
                AgentOutcome::Unavailable { component }
            }
            Err(BreakerError::Operation { error, tripped }) => {
                let error = match error.component {
                    Some(_) => error,
                    None => error.with_component(component.clone()),
                };
                let context = ErrorContext {
                    circuit_tripped: tripped,
                    request: Some(request.to_string()),
                    ..ErrorContext::for_component(component)
                };
                let outcome = self.system.handle_error(&error, context).await;

                if outcome.recovered && !outcome.fallback {
                    let mut response = AgentResponse::new(
                        "I encountered an issue but I've recovered. Please try your request again.",
                        DEGRADED_CONFIDENCE,
                    );
                    response.metadata = serde_json::json!({ "emergency": true });
                    AgentOutcome::Degraded {
                        response,
                        incident_id: outcome.incident_id,
                    }
                } else {
                    AgentOutcome::Failed {
                        error,
                        incident_id: outcome.incident_id,
                    }
                }
            }
        }
    }
}
