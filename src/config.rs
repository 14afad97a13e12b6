//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__BREAKER__FAILURE_THRESHOLD=3`）。

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub breaker: BreakerSection,
    pub health: HealthSection,
    pub incident: IncidentSection,
    pub backup: BackupSection,
    pub rollback: RollbackSection,
}

/// [app] 段：应用名、数据根目录
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    #[serde(default = "default_app_name")]
    pub name: String,
    /// 数据根目录，未设置时用 ./data
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_app_name() -> String {
    "hive".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

/// [breaker] 段：熔断阈值、打开时长、半开探测次数、预注册组件
#[derive(Debug, Clone, Deserialize)]
pub struct BreakerSection {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Open 状态持续时间（毫秒），超时后第一次调用进入 HalfOpen
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
    /// 启动时预注册的组件 ID（其它组件在首次调用时按默认值创建）
    #[serde(default = "default_breaker_components")]
    pub components: Vec<String>,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_timeout_ms: default_open_timeout_ms(),
            half_open_max_calls: default_half_open_max_calls(),
            components: default_breaker_components(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_open_timeout_ms() -> u64 {
    30_000
}

fn default_half_open_max_calls() -> u32 {
    3
}

fn default_breaker_components() -> Vec<String> {
    vec!["MCA".into(), "NPA".into(), "WPA".into(), "BMA".into()]
}

/// [health] 段：健康检查周期
#[derive(Debug, Clone, Deserialize)]
pub struct HealthSection {
    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: u64,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval_secs(),
        }
    }
}

fn default_health_interval_secs() -> u64 {
    30
}

/// [incident] 段：事故日志位置
#[derive(Debug, Clone, Deserialize, Default)]
pub struct IncidentSection {
    /// 追加式事故日志（JSON Lines），未设置时为 <data_dir>/emergency/incidents.jsonl
    pub log_file: Option<PathBuf>,
}

/// [backup] 段：备份根目录、保留数量、定时备份周期、逻辑组件列表
#[derive(Debug, Clone, Deserialize)]
pub struct BackupSection {
    /// 未设置时为 <data_dir>/backups
    pub root: Option<PathBuf>,
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
    /// 全量定时备份周期（秒），0 表示关闭
    #[serde(default = "default_full_interval_secs")]
    pub full_interval_secs: u64,
    #[serde(default = "default_backup_components")]
    pub components: Vec<ComponentEntry>,
}

impl Default for BackupSection {
    fn default() -> Self {
        Self {
            root: None,
            max_backups: default_max_backups(),
            full_interval_secs: default_full_interval_secs(),
            components: default_backup_components(),
        }
    }
}

/// [[backup.components]]：一个参与备份的逻辑组件
#[derive(Debug, Clone, Deserialize)]
pub struct ComponentEntry {
    pub name: String,
    /// 组件的实时数据目录，未设置时为 <data_dir>/<name>
    pub source: Option<PathBuf>,
    /// 该组件增量备份周期（秒），0 表示不定时
    #[serde(default)]
    pub interval_secs: u64,
}

impl ComponentEntry {
    pub fn new(name: impl Into<String>, interval_secs: u64) -> Self {
        Self {
            name: name.into(),
            source: None,
            interval_secs,
        }
    }

    pub fn with_source(mut self, source: impl Into<PathBuf>) -> Self {
        self.source = Some(source.into());
        self
    }
}

fn default_max_backups() -> usize {
    50
}

fn default_full_interval_secs() -> u64 {
    3600
}

fn default_backup_components() -> Vec<ComponentEntry> {
    vec![
        ComponentEntry::new("conversations", 1800),
        ComponentEntry::new("budgets", 3600),
        ComponentEntry::new("agent_configs", 7200),
        ComponentEntry::new("user_profiles", 1800),
    ]
}

/// [rollback] 段：冻结宽限期、是否默认创建回滚前备份、历史条数
#[derive(Debug, Clone, Deserialize)]
pub struct RollbackSection {
    /// 冻结后等待在途操作结束的最长时间（毫秒）
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    #[serde(default = "default_true")]
    pub create_pre_rollback_backup: bool,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for RollbackSection {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
            create_pre_rollback_backup: true,
            history_limit: default_history_limit(),
        }
    }
}

fn default_grace_period_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

fn default_history_limit() -> usize {
    100
}

impl AppConfig {
    /// 以 data_dir 为根生成一份默认配置（测试与嵌入场景常用）
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let mut cfg = Self::default();
        cfg.app.data_dir = data_dir.into();
        cfg
    }

    /// 事故日志文件路径
    pub fn incident_log_path(&self) -> PathBuf {
        self.incident
            .log_file
            .clone()
            .unwrap_or_else(|| self.emergency_dir().join("incidents.jsonl"))
    }

    /// 应急数据目录（事故日志、取证记录）
    pub fn emergency_dir(&self) -> PathBuf {
        self.app.data_dir.join("emergency")
    }

    /// 备份根目录
    pub fn backup_root(&self) -> PathBuf {
        self.backup
            .root
            .clone()
            .unwrap_or_else(|| self.app.data_dir.join("backups"))
    }

    /// 组件的实时数据目录
    pub fn component_source(&self, entry: &ComponentEntry) -> PathBuf {
        entry
            .source
            .clone()
            .unwrap_or_else(|| self.app.data_dir.join(&entry.name))
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置（运行时热更新由调用方决定是否重建组件）
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.breaker.failure_threshold, 5);
        assert_eq!(cfg.breaker.open_timeout_ms, 30_000);
        assert_eq!(cfg.breaker.half_open_max_calls, 3);
        assert_eq!(cfg.backup.max_backups, 50);
        assert_eq!(cfg.health.interval_secs, 30);
        assert!(cfg.rollback.create_pre_rollback_backup);
        assert_eq!(cfg.backup.components.len(), 4);
    }

    #[test]
    fn test_derived_paths_follow_data_dir() {
        let cfg = AppConfig::with_data_dir("/tmp/hive-test");
        assert_eq!(
            cfg.incident_log_path(),
            PathBuf::from("/tmp/hive-test/emergency/incidents.jsonl")
        );
        assert_eq!(cfg.backup_root(), PathBuf::from("/tmp/hive-test/backups"));
        let entry = ComponentEntry::new("budgets", 0);
        assert_eq!(
            cfg.component_source(&entry),
            PathBuf::from("/tmp/hive-test/budgets")
        );
        let custom = ComponentEntry::new("budgets", 0).with_source("/srv/budgets");
        assert_eq!(cfg.component_source(&custom), PathBuf::from("/srv/budgets"));
    }

    #[test]
    fn test_load_config_from_explicit_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("hive.toml");
        std::fs::write(
            &path,
            "[breaker]\nfailure_threshold = 2\n\n[backup]\nmax_backups = 3\n",
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.breaker.failure_threshold, 2);
        assert_eq!(cfg.breaker.open_timeout_ms, 30_000);
        assert_eq!(cfg.backup.max_backups, 3);
    }
}
