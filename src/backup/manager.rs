//! 备份管理器：全量 / 增量 / 单组件备份，回滚点索引与保留策略

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::integrity::{backup_hash, data_hash};
use super::store::{self, TreeStats};
use super::{Backup, BackupStatus, ComponentBackupRecord, IncrementalBackup, SystemCapture};
use crate::config::AppConfig;
use crate::core::{EmergencyError, EmergencyResult, SystemStateCell};
use crate::health::{ProcessProbe, ResourceProbe};

const METADATA_SUFFIX: &str = "_metadata.json";
const INCREMENTAL_DIR: &str = "incremental";

/// 故障响应过程中拍下的快照，不作为「最后已知良好状态」
const FAULT_SNAPSHOT_REASONS: [&str; 2] = ["critical", "pre_rollback"];

fn is_fault_snapshot(reason: &str) -> bool {
    FAULT_SNAPSHOT_REASONS.contains(&reason) || reason.starts_with("error_response_")
}

/// 一个参与备份的逻辑组件
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupComponent {
    pub name: String,
    /// 实时数据目录
    pub source: PathBuf,
    /// 定时增量备份周期（秒），0 表示不定时
    pub interval_secs: u64,
}

/// 备份管理器参数
#[derive(Debug, Clone)]
pub struct BackupSettings {
    pub root: PathBuf,
    pub max_backups: usize,
    pub full_interval_secs: u64,
    pub components: Vec<BackupComponent>,
}

impl BackupSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            root: cfg.backup_root(),
            max_backups: cfg.backup.max_backups.max(1),
            full_interval_secs: cfg.backup.full_interval_secs,
            components: cfg
                .backup
                .components
                .iter()
                .map(|entry| BackupComponent {
                    name: entry.name.clone(),
                    source: cfg.component_source(entry),
                    interval_secs: entry.interval_secs,
                })
                .collect(),
        }
    }
}

/// 列表视图（大小按磁盘产物实时统计）
#[derive(Debug, Clone, Serialize)]
pub struct BackupSummary {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    pub status: BackupStatus,
    pub components: Vec<String>,
    pub size_bytes: u64,
    pub integrity_hash: Option<String>,
}

/// 备份统计
#[derive(Debug, Clone, Serialize)]
pub struct BackupStatistics {
    pub total_backups: usize,
    pub failed_backups: usize,
    pub incremental_backups: usize,
    pub total_size_bytes: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    pub max_backups: usize,
    pub components: Vec<BackupComponent>,
}

/// 回滚期间对备份的保护；drop（包括 future 被取消）时释放
#[must_use = "the backup is unpinned as soon as the guard is dropped"]
pub struct BackupPin<'a> {
    manager: &'a BackupManager,
    id: String,
}

impl Drop for BackupPin<'_> {
    fn drop(&mut self) {
        self.manager.release_pin(&self.id);
    }
}

/// 备份管理器
///
/// `index` 只保存 Completed 的全量备份（回滚点索引）；失败的备份进入 `failed` 供取证。
pub struct BackupManager {
    settings: BackupSettings,
    index: RwLock<HashMap<String, Backup>>,
    failed: RwLock<HashMap<String, Backup>>,
    incrementals: RwLock<HashMap<String, IncrementalBackup>>,
    /// 回滚目标的引用计数；计数归零才解除保护
    pinned: Mutex<HashMap<String, usize>>,
    sequence: AtomicU64,
    state: Arc<SystemStateCell>,
    probe: Arc<dyn ResourceProbe>,
    started: Instant,
}

impl BackupManager {
    pub fn new(settings: BackupSettings, state: Arc<SystemStateCell>) -> Self {
        Self {
            settings,
            index: RwLock::new(HashMap::new()),
            failed: RwLock::new(HashMap::new()),
            incrementals: RwLock::new(HashMap::new()),
            pinned: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            state,
            probe: Arc::new(ProcessProbe),
            started: Instant::now(),
        }
    }

    pub fn settings(&self) -> &BackupSettings {
        &self.settings
    }

    pub fn root(&self) -> &Path {
        &self.settings.root
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    fn metadata_path(&self, id: &str) -> PathBuf {
        self.settings.root.join(format!("{id}{METADATA_SUFFIX}"))
    }

    fn incremental_path(&self, id: &str) -> PathBuf {
        self.settings.root.join(INCREMENTAL_DIR).join(format!("{id}.json"))
    }

    async fn capture_system(&self) -> SystemCapture {
        let rss_bytes = match self.probe.rss_bytes().await {
            Ok(rss) => rss,
            Err(e) => {
                tracing::debug!("RSS sample unavailable: {}", e);
                None
            }
        };
        SystemCapture {
            pid: std::process::id(),
            uptime_secs: self.started.elapsed().as_secs(),
            rss_bytes,
            system_state: self.state.get().await,
        }
    }

    /// 从磁盘恢复索引（启动时调用），返回加载的全量备份数
    pub async fn load_existing(&self) -> EmergencyResult<usize> {
        let mut loaded = 0;
        let mut max_sequence = None;

        if let Ok(mut entries) = fs::read_dir(&self.settings.root).await {
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if !name.ends_with(METADATA_SUFFIX) {
                    continue;
                }
                let backup: Backup = match store::read_json(&entry.path()).await {
                    Ok(b) => b,
                    Err(e) => {
                        tracing::warn!(file = %name, "Skipping unreadable backup metadata: {}", e);
                        continue;
                    }
                };
                max_sequence = max_sequence.max(Some(backup.sequence));
                if backup.is_completed() {
                    self.index.write().await.insert(backup.id.clone(), backup);
                    loaded += 1;
                } else {
                    self.failed.write().await.insert(backup.id.clone(), backup);
                }
            }
        }

        let inc_dir = self.settings.root.join(INCREMENTAL_DIR);
        if let Ok(mut entries) = fs::read_dir(&inc_dir).await {
            while let Some(entry) = entries.next_entry().await? {
                match store::read_json::<IncrementalBackup>(&entry.path()).await {
                    Ok(inc) => {
                        max_sequence = max_sequence.max(Some(inc.sequence));
                        self.incrementals.write().await.insert(inc.id.clone(), inc);
                    }
                    Err(e) => tracing::warn!(
                        file = %entry.path().display(),
                        "Skipping unreadable incremental backup: {}",
                        e
                    ),
                }
            }
        }

        if let Some(max) = max_sequence {
            self.sequence.fetch_max(max + 1, Ordering::SeqCst);
        }
        tracing::info!(backups = loaded, root = %self.settings.root.display(), "Backup index loaded");
        Ok(loaded)
    }

    /// 全量备份：按顺序备份每个组件
    ///
    /// 源目录不存在的组件得到空记录；其它组件错误使整个备份标记为 Failed（仍写入元数据）并返回错误。
    pub async fn create_full(
        &self,
        reason: &str,
        metadata: serde_json::Value,
    ) -> EmergencyResult<Backup> {
        let mut backup = Backup {
            id: format!("backup_{}", uuid::Uuid::new_v4().simple()),
            sequence: self.next_sequence(),
            timestamp: Utc::now(),
            reason: reason.to_string(),
            status: BackupStatus::InProgress,
            components: BTreeMap::new(),
            metadata,
            system: Some(self.capture_system().await),
            integrity_hash: None,
            error: None,
        };
        tracing::info!(backup = %backup.id, reason, "Full backup started");

        let mut failure = None;
        for component in &self.settings.components {
            match self.backup_component(&backup.id, component).await {
                Ok(record) => {
                    backup.components.insert(component.name.clone(), record);
                }
                Err(e) => {
                    failure = Some(format!("{}: {e}", component.name));
                    break;
                }
            }
        }

        if let Some(reason) = failure {
            backup.status = BackupStatus::Failed;
            backup.error = Some(reason.clone());
            tracing::error!(backup = %backup.id, "Full backup failed: {}", reason);
            if let Err(e) = store::write_json(&self.metadata_path(&backup.id), &backup).await {
                tracing::warn!(backup = %backup.id, "Failed to persist failed backup record: {}", e);
            }
            self.failed.write().await.insert(backup.id.clone(), backup.clone());
            return Err(EmergencyError::BackupFailed {
                backup_id: backup.id,
                reason,
            });
        }

        backup.integrity_hash = Some(backup_hash(&backup.id, &backup.timestamp, &backup.components)?);
        backup.status = BackupStatus::Completed;
        store::write_json(&self.metadata_path(&backup.id), &backup).await?;
        self.index.write().await.insert(backup.id.clone(), backup.clone());

        tracing::info!(
            backup = %backup.id,
            components = backup.components.len(),
            size_bytes = backup.recorded_size(),
            "Full backup completed"
        );
        self.enforce_retention().await;
        Ok(backup)
    }

    async fn backup_component(
        &self,
        backup_id: &str,
        component: &BackupComponent,
    ) -> std::io::Result<ComponentBackupRecord> {
        let artifact = self.settings.root.join(&component.name).join(backup_id);
        let (source_existed, stats) = match fs::metadata(&component.source).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                fs::create_dir_all(&artifact).await?;
                (false, TreeStats::default())
            }
            Err(e) => return Err(e),
            Ok(meta) if !meta.is_dir() => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("{} is not a directory", component.source.display()),
                ))
            }
            Ok(_) => (true, store::copy_tree(&component.source, &artifact).await?),
        };

        tracing::debug!(
            component = %component.name,
            files = stats.files,
            existed = source_existed,
            "Component backed up"
        );
        Ok(ComponentBackupRecord {
            component: component.name.clone(),
            source: component.source.clone(),
            artifact,
            source_existed,
            files: stats.files,
            size_bytes: stats.bytes,
        })
    }

    /// 超出 max_backups 时删除最旧的备份（跳过正被回滚使用的备份）
    async fn enforce_retention(&self) {
        let pinned: Vec<String> = self.pins().keys().cloned().collect();
        let evicted: Vec<Backup> = {
            let mut index = self.index.write().await;
            let excess = index.len().saturating_sub(self.settings.max_backups);
            if excess == 0 {
                return;
            }
            let mut candidates: Vec<(DateTime<Utc>, u64, String)> = index
                .values()
                .filter(|b| !pinned.contains(&b.id))
                .map(|b| (b.timestamp, b.sequence, b.id.clone()))
                .collect();
            candidates.sort();
            candidates
                .into_iter()
                .take(excess)
                .filter_map(|(_, _, id)| index.remove(&id))
                .collect()
        };

        for backup in evicted {
            tracing::info!(backup = %backup.id, "Pruning backup beyond retention limit");
            self.remove_artifacts(&backup).await;
        }
    }

    async fn remove_artifacts(&self, backup: &Backup) {
        for record in backup.components.values() {
            if let Err(e) = store::remove_path(&record.artifact).await {
                tracing::warn!(backup = %backup.id, component = %record.component, "Failed to remove artifact: {}", e);
            }
        }
        if let Err(e) = store::remove_path(&self.metadata_path(&backup.id)).await {
            tracing::warn!(backup = %backup.id, "Failed to remove metadata: {}", e);
        }
    }

    /// 增量备份：序列化单个组件的数据并单独计算哈希
    pub async fn create_incremental(
        &self,
        component_type: &str,
        data: serde_json::Value,
        reason: &str,
    ) -> EmergencyResult<IncrementalBackup> {
        let id = format!("inc_{}", uuid::Uuid::new_v4().simple());
        self.store_incremental(id, component_type, data, reason).await
    }

    async fn store_incremental(
        &self,
        id: String,
        component_type: &str,
        data: serde_json::Value,
        reason: &str,
    ) -> EmergencyResult<IncrementalBackup> {
        let integrity_hash = data_hash(&data)?;
        let size_bytes = serde_json::to_vec(&data)?.len() as u64;
        let backup = IncrementalBackup {
            id,
            sequence: self.next_sequence(),
            component_type: component_type.to_string(),
            timestamp: Utc::now(),
            reason: reason.to_string(),
            data,
            integrity_hash,
            size_bytes,
        };
        store::write_json(&self.incremental_path(&backup.id), &backup).await?;
        self.incrementals
            .write()
            .await
            .insert(backup.id.clone(), backup.clone());
        tracing::info!(backup = %backup.id, component = component_type, reason, "Incremental backup created");
        Ok(backup)
    }

    /// 单组件备份：复制实时目录为产物，并记为一次增量备份
    pub async fn create_component_backup(
        &self,
        name: &str,
        reason: &str,
    ) -> EmergencyResult<IncrementalBackup> {
        let component = self
            .settings
            .components
            .iter()
            .find(|c| c.name == name)
            .cloned()
            .ok_or_else(|| EmergencyError::BackupFailed {
                backup_id: String::new(),
                reason: format!("unknown component {name}"),
            })?;

        let id = format!("inc_{}", uuid::Uuid::new_v4().simple());
        let record = self
            .backup_component(&id, &component)
            .await
            .map_err(|e| EmergencyError::BackupFailed {
                backup_id: id.clone(),
                reason: format!("{name}: {e}"),
            })?;
        let data = serde_json::to_value(&record)?;
        self.store_incremental(id, name, data, reason).await
    }

    pub async fn get(&self, id: &str) -> Option<Backup> {
        if let Some(b) = self.index.read().await.get(id) {
            return Some(b.clone());
        }
        self.failed.read().await.get(id).cloned()
    }

    /// 最新的已完成全量备份
    pub async fn latest_completed(&self) -> Option<Backup> {
        self.index
            .read()
            .await
            .values()
            .max_by_key(|b| b.order_key())
            .cloned()
    }

    /// 最后已知良好状态：最新的、非故障响应期间创建的已完成备份
    pub async fn latest_known_good(&self) -> Option<Backup> {
        self.index
            .read()
            .await
            .values()
            .filter(|b| !is_fault_snapshot(&b.reason))
            .max_by_key(|b| b.order_key())
            .cloned()
    }

    /// 已完成的全量备份（最新在前），大小按磁盘产物统计
    pub async fn list_available(&self) -> Vec<BackupSummary> {
        let mut backups: Vec<Backup> = self.index.read().await.values().cloned().collect();
        backups.sort_by_key(|b| std::cmp::Reverse(b.order_key()));

        let mut out = Vec::with_capacity(backups.len());
        for backup in backups {
            let mut size_bytes = 0;
            for record in backup.components.values() {
                size_bytes += store::tree_stats(&record.artifact)
                    .await
                    .map(|s| s.bytes)
                    .unwrap_or(0);
            }
            out.push(BackupSummary {
                id: backup.id,
                timestamp: backup.timestamp,
                reason: backup.reason,
                status: backup.status,
                components: backup.components.into_keys().collect(),
                size_bytes,
                integrity_hash: backup.integrity_hash,
            });
        }
        out
    }

    /// 增量备份（最新在前）
    pub async fn list_incremental(&self) -> Vec<IncrementalBackup> {
        let mut list: Vec<IncrementalBackup> =
            self.incrementals.read().await.values().cloned().collect();
        list.sort_by_key(|b| std::cmp::Reverse((b.timestamp, b.sequence)));
        list
    }

    /// 删除一个全量备份及其产物；正被回滚使用时拒绝
    pub async fn delete(&self, id: &str) -> EmergencyResult<bool> {
        if self.is_pinned(id) {
            return Err(EmergencyError::BackupFailed {
                backup_id: id.to_string(),
                reason: "backup is in use by a rollback".to_string(),
            });
        }
        let removed = match self.index.write().await.remove(id) {
            Some(b) => Some(b),
            None => self.failed.write().await.remove(id),
        };
        match removed {
            Some(backup) => {
                self.remove_artifacts(&backup).await;
                tracing::info!(backup = %id, "Backup deleted");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn pins(&self) -> MutexGuard<'_, HashMap<String, usize>> {
        self.pinned.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 标记为回滚目标，保留策略与 delete 不会删除它；guard drop 时解除（可重入，按引用计数）
    pub fn pin(&self, id: &str) -> BackupPin<'_> {
        *self.pins().entry(id.to_string()).or_insert(0) += 1;
        BackupPin {
            manager: self,
            id: id.to_string(),
        }
    }

    pub fn is_pinned(&self, id: &str) -> bool {
        self.pins().contains_key(id)
    }

    fn release_pin(&self, id: &str) {
        let mut pins = self.pins();
        if let Some(count) = pins.get_mut(id) {
            *count -= 1;
            if *count == 0 {
                pins.remove(id);
            }
        }
    }

    pub async fn statistics(&self) -> BackupStatistics {
        let index = self.index.read().await;
        let total_size_bytes = index.values().map(|b| b.recorded_size()).sum();
        let oldest = index.values().map(|b| b.timestamp).min();
        let newest = index.values().map(|b| b.timestamp).max();
        BackupStatistics {
            total_backups: index.len(),
            failed_backups: self.failed.read().await.len(),
            incremental_backups: self.incrementals.read().await.len(),
            total_size_bytes,
            oldest,
            newest,
            max_backups: self.settings.max_backups,
            components: self.settings.components.clone(),
        }
    }
}
