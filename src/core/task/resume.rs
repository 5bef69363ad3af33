use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use std::path::{Path, PathBuf};

use crate::core::error::DownloadError;
use super::chunk_manager::ChunkCheckpoint;

/// 断点信息，保存在目标文件旁边
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ResumeInfo {
    pub location: String,
    pub total_size: u64,
    pub chunks: Vec<ChunkCheckpoint>,
    pub saved_at: DateTime<Utc>,
}

pub fn resume_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_os_string();
    name.push(".pcsdown.json");
    PathBuf::from(name)
}

impl ResumeInfo {
    pub fn new(location: &str, total_size: u64, chunks: Vec<ChunkCheckpoint>) -> Self {
        Self {
            location: location.to_string(),
            total_size,
            chunks,
            saved_at: Utc::now(),
        }
    }

    /// 同一个远程文件、同样大小才允许续传
    pub fn matches(&self, location: &str, total_size: u64) -> bool {
        self.location == location && self.total_size == total_size
    }

    pub fn downloaded(&self) -> u64 {
        self.chunks.iter().map(|c| c.written).sum()
    }

    pub async fn save(&self, destination: &Path) -> Result<(), DownloadError> {
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(resume_path(destination), json).await?;
        Ok(())
    }

    /// 没有断点文件时返回 None；文件损坏视为没有断点
    pub async fn load(destination: &Path) -> Result<Option<Self>, DownloadError> {
        let path = resume_path(destination);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&data) {
            Ok(info) => Ok(Some(info)),
            Err(e) => {
                log::warn!("断点文件 {} 已损坏，将重新下载: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    pub async fn remove(destination: &Path) {
        let path = resume_path(destination);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("删除断点文件 {} 失败: {}", path.display(), e);
            }
        }
    }
}
