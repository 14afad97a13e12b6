//! 备份完整性：SHA-256（十六进制小写）

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::{Backup, ComponentBackupRecord, IncrementalBackup};
use crate::core::{EmergencyError, EmergencyResult};

#[derive(Serialize)]
struct HashInput<'a> {
    id: &'a str,
    timestamp: &'a DateTime<Utc>,
    components: &'a BTreeMap<String, ComponentBackupRecord>,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// 全量备份的哈希：覆盖 id、时间戳与组件集合（BTreeMap 保证序列化顺序稳定）
pub fn backup_hash(
    id: &str,
    timestamp: &DateTime<Utc>,
    components: &BTreeMap<String, ComponentBackupRecord>,
) -> EmergencyResult<String> {
    let input = serde_json::to_vec(&HashInput {
        id,
        timestamp,
        components,
    })?;
    Ok(sha256_hex(&input))
}

/// 重新计算并比对；不匹配返回 `EmergencyError::Integrity`
pub fn verify_backup(backup: &Backup) -> EmergencyResult<()> {
    let actual = backup_hash(&backup.id, &backup.timestamp, &backup.components)?;
    let expected = backup.integrity_hash.clone().unwrap_or_default();
    if actual != expected {
        return Err(EmergencyError::Integrity {
            backup_id: backup.id.clone(),
            expected,
            actual,
        });
    }
    Ok(())
}

pub fn data_hash(data: &serde_json::Value) -> EmergencyResult<String> {
    Ok(sha256_hex(&serde_json::to_vec(data)?))
}

pub fn verify_incremental(backup: &IncrementalBackup) -> EmergencyResult<()> {
    let actual = data_hash(&backup.data)?;
    if actual != backup.integrity_hash {
        return Err(EmergencyError::Integrity {
            backup_id: backup.id.clone(),
            expected: backup.integrity_hash.clone(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::backup::BackupStatus;

    fn record(name: &str) -> ComponentBackupRecord {
        ComponentBackupRecord {
            component: name.to_string(),
            source: PathBuf::from(format!("data/{name}")),
            artifact: PathBuf::from(format!("backups/{name}/b1")),
            source_existed: true,
            files: 2,
            size_bytes: 10,
        }
    }

    fn sealed() -> Backup {
        let mut components = BTreeMap::new();
        components.insert("budgets".to_string(), record("budgets"));
        components.insert("conversations".to_string(), record("conversations"));
        let timestamp = Utc::now();
        let hash = backup_hash("b1", &timestamp, &components).unwrap();
        Backup {
            id: "b1".to_string(),
            sequence: 0,
            timestamp,
            reason: "manual".to_string(),
            status: BackupStatus::Completed,
            components,
            metadata: serde_json::Value::Null,
            system: None,
            integrity_hash: Some(hash),
            error: None,
        }
    }

    #[test]
    fn test_sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_verify_detects_hash_and_component_tampering() {
        let backup = sealed();
        assert!(verify_backup(&backup).is_ok());

        let mut forged = backup.clone();
        forged.integrity_hash = Some("00".repeat(32));
        assert!(matches!(
            verify_backup(&forged),
            Err(EmergencyError::Integrity { .. })
        ));

        let mut dropped = backup;
        dropped.components.remove("budgets");
        assert!(verify_backup(&dropped).is_err());
    }

    #[test]
    fn test_metadata_is_not_covered_by_hash() {
        let mut backup = sealed();
        backup.metadata = serde_json::json!({ "note": "annotated later" });
        assert!(verify_backup(&backup).is_ok());
    }
}
