//! Hive - 多智能体路由器的韧性子系统
//!
//! 模块划分：
//! - **backup**: 逻辑组件的全量 / 增量备份、完整性哈希、保留策略与定时任务
//! - **breaker**: 按组件的熔断器注册表（Closed / Open / HalfOpen）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、系统状态、事件总线、优雅关闭
//! - **emergency**: 应急门面、Agent 包装、致命故障处理
//! - **health**: 周期健康检查与降级检测
//! - **incident**: 错误分类、响应协议、事故生命周期与事故日志
//! - **observability**: 日志初始化
//! - **rollback**: 回滚协调（冻结、宽限期、校验、恢复、复核）

pub mod backup;
pub mod breaker;
pub mod config;
pub mod core;
pub mod emergency;
pub mod health;
pub mod incident;
pub mod observability;
pub mod rollback;

pub use crate::core::{ComponentError, EmergencyError, EmergencyResult, SystemState};
pub use emergency::{EmergencySystem, Outcome};
