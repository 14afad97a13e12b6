//! 核心层：错误类型、系统状态、事件总线、优雅关闭

pub mod error;
pub mod events;
pub mod shutdown;
pub mod state;

pub use error::{ComponentError, EmergencyError, EmergencyResult};
pub use events::{EmergencyEvent, EventBus};
pub use shutdown::{
    run_with_graceful_shutdown, ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason,
};
pub use state::{SystemState, SystemStateCell};
