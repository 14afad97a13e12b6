//! 备份产物的文件系统原语（全部异步，不阻塞运行时）

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// 目录统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub files: u64,
    pub bytes: u64,
}

impl TreeStats {
    fn add(&mut self, other: TreeStats) {
        self.files += other.files;
        self.bytes += other.bytes;
    }
}

type IoFuture<'a, T> = Pin<Box<dyn Future<Output = io::Result<T>> + Send + 'a>>;

/// 递归复制目录（目标目录不存在时创建）
pub fn copy_tree<'a>(src: &'a Path, dst: &'a Path) -> IoFuture<'a, TreeStats> {
    Box::pin(async move {
        fs::create_dir_all(dst).await?;
        let mut stats = TreeStats::default();
        let mut entries = fs::read_dir(src).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let target = dst.join(entry.file_name());
            if file_type.is_dir() {
                stats.add(copy_tree(&entry.path(), &target).await?);
            } else if file_type.is_file() {
                stats.bytes += fs::copy(entry.path(), &target).await?;
                stats.files += 1;
            }
        }
        Ok(stats)
    })
}

/// 统计目录下文件数与字节数；目录不存在时为 0
pub fn tree_stats(path: &Path) -> IoFuture<'_, TreeStats> {
    Box::pin(async move {
        let mut stats = TreeStats::default();
        let mut entries = match fs::read_dir(path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(stats),
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                stats.add(tree_stats(&entry.path()).await?);
            } else {
                stats.files += 1;
                stats.bytes += meta.len();
            }
        }
        Ok(stats)
    })
}

/// 清空目录（删除后重建为空目录）
pub async fn clear_dir(path: &Path) -> io::Result<()> {
    remove_path(path).await?;
    fs::create_dir_all(path).await
}

/// 用产物替换实时目录：先清空 live，再把 artifact 复制进去
pub async fn restore_tree(artifact: &Path, live: &Path) -> io::Result<TreeStats> {
    let meta = fs::metadata(artifact).await?;
    if !meta.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("artifact {} is not a directory", artifact.display()),
        ));
    }
    clear_dir(live).await?;
    copy_tree(artifact, live).await
}

/// 删除文件或目录；不存在视为成功
pub async fn remove_path(path: &Path) -> io::Result<()> {
    let meta = match fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if meta.is_dir() {
        fs::remove_dir_all(path).await
    } else {
        fs::remove_file(path).await
    }
}

/// 先写临时文件再 rename，读者不会看到半截 JSON
pub async fn write_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let data = serde_json::to_vec_pretty(value)?;
    let tmp = tmp_path(path);
    let mut file = fs::File::create(&tmp).await?;
    file.write_all(&data).await?;
    file.flush().await?;
    drop(file);
    fs::rename(&tmp, path).await
}

pub async fn read_json<T: DeserializeOwned>(path: &Path) -> io::Result<T> {
    let data = fs::read(path).await?;
    serde_json::from_slice(&data).map_err(io::Error::from)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}
