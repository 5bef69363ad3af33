use std::path::Path;
use url::Url;

use crate::core::error::DownloadError;

pub fn is_valid_url(url: &str) -> bool {
    Url::parse(url)
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false)
}

pub fn validate_urls(urls: &[String]) -> Result<(), DownloadError> {
    if urls.is_empty() {
        return Err(DownloadError::Validation("URL列表不能为空".to_string()));
    }
    if let Some(bad) = urls.iter().find(|u| !is_valid_url(u)) {
        return Err(DownloadError::Validation(format!("无效的URL: {}", bad)));
    }
    Ok(())
}

/// 目标路径不能是目录，所在目录必须已存在
pub fn validate_destination(path: &Path) -> Result<(), DownloadError> {
    if path.as_os_str().is_empty() {
        return Err(DownloadError::Validation("输出路径不能为空".to_string()));
    }
    if path.is_dir() {
        return Err(DownloadError::Validation(format!("输出路径是一个目录: {}", path.display())));
    }
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    if !parent.is_dir() {
        return Err(DownloadError::Validation(format!("输出目录不存在: {}", parent.display())));
    }
    Ok(())
}

/// 从 URL 推断文件名，失败时返回 None
pub fn file_name_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed
        .path_segments()?
        .filter(|s| !s.is_empty())
        .last()
        .map(|s| s.to_string())
}
