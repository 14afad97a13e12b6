//! 事故处理：错误分类、响应协议选择、事故记录与协议执行

pub mod classifier;
pub mod log;
pub mod manager;
pub mod protocol;

pub use classifier::{Classification, ErrorClassifier, ErrorContext, ErrorType, Impact, Severity};
pub use log::{IncidentLog, LogEntry, LogEvent};
pub use manager::{
    ActionHandler, ActionOutcome, ExecutionResult, Incident, IncidentErrorRecord, IncidentManager,
    IncidentStatus, LoggingActionHandler, Resolution,
};
pub use protocol::{ActionKind, ProtocolSelector, ResponseProtocol};
