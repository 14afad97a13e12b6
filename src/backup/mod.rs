//! 备份：逻辑组件的全量 / 增量快照，带完整性哈希与保留策略
//!
//! 磁盘布局（均位于备份根目录下）：
//!
//! ```text
//! <root>/<id>_metadata.json          每个全量备份一份元数据
//! <root>/<component>/<id>/           每个组件备份任务一棵产物目录
//! <root>/incremental/<inc_id>.json   增量备份
//! ```

pub mod integrity;
pub mod manager;
pub mod scheduler;
pub mod store;

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::SystemState;

pub use manager::{BackupManager, BackupPin, BackupSettings, BackupStatistics, BackupSummary};
pub use scheduler::BackupScheduler;

/// 备份状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    InProgress,
    Completed,
    /// 失败的备份仍会持久化，供事后取证
    Failed,
}

/// 单个组件的备份记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentBackupRecord {
    pub component: String,
    /// 备份时的实时数据目录（回滚的恢复目标）
    pub source: PathBuf,
    /// 本次备份的产物目录
    pub artifact: PathBuf,
    /// 备份时源目录是否存在（不存在时产物为空目录）
    pub source_existed: bool,
    pub files: u64,
    pub size_bytes: u64,
}

/// 备份时采集的进程状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemCapture {
    pub pid: u32,
    pub uptime_secs: u64,
    pub rss_bytes: Option<u64>,
    pub system_state: SystemState,
}

/// 全量备份
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backup {
    pub id: String,
    /// 同一管理器内单调递增，时间戳相同时用于排序
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    pub status: BackupStatus,
    pub components: BTreeMap<String, ComponentBackupRecord>,
    /// 调用方附带的元数据（如回滚目标、事故 ID）
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub system: Option<SystemCapture>,
    /// 对 {id, timestamp, components} 的 SHA-256（仅 Completed 有值）
    pub integrity_hash: Option<String>,
    pub error: Option<String>,
}

impl Backup {
    pub fn is_completed(&self) -> bool {
        self.status == BackupStatus::Completed
    }

    /// 按创建先后比较（时间戳，再序号）
    pub fn order_key(&self) -> (DateTime<Utc>, u64) {
        (self.timestamp, self.sequence)
    }

    pub fn recorded_size(&self) -> u64 {
        self.components.values().map(|c| c.size_bytes).sum()
    }
}

/// 增量备份：单个组件的数据（与全量备份的保留策略无关）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncrementalBackup {
    pub id: String,
    pub sequence: u64,
    pub component_type: String,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    pub data: serde_json::Value,
    /// 对 data 序列化结果的 SHA-256
    pub integrity_hash: String,
    pub size_bytes: u64,
}
