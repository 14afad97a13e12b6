//! 追加式事故日志（JSON Lines）
//!
//! 每行一条 `{event, at, incident}`；只追加不改写，重放即可得到事故的完整历史。

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::Incident;
use crate::core::{EmergencyError, EmergencyResult};

/// 日志条目类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    Created,
    Updated,
    Resolved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub event: LogEvent,
    pub at: DateTime<Utc>,
    pub incident: Incident,
}

/// 事故日志文件；写入串行化，保证每行完整
#[derive(Debug)]
pub struct IncidentLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl IncidentLog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 追加一条记录并 flush；父目录不存在时自动创建
    pub async fn append(&self, event: LogEvent, incident: &Incident) -> EmergencyResult<()> {
        let entry = LogEntry {
            event,
            at: Utc::now(),
            incident: incident.clone(),
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        self.write_line(&line)
            .await
            .map_err(|e| EmergencyError::IncidentLog(format!("{}: {e}", self.path.display())))
    }

    async fn write_line(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }

    /// 读取全部条目；文件不存在时返回空，损坏的行跳过并告警
    pub async fn replay(&self) -> EmergencyResult<Vec<LogEntry>> {
        let data = match fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for (lineno, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::warn!(line = lineno + 1, "Skipping malformed incident log line: {}", e)
                }
            }
        }
        Ok(entries)
    }
}
