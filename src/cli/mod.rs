//! CLI: 命令行接口和参数解析模块
//!
//! ## 支持的命令
//!
//! - 基本下载：`pcsdown <url>`
//! - 批量下载：`pcsdown -f urls.txt`
//! - 编辑配置：`pcsdown -e`
//! - 指定配置：`pcsdown -c pcsdown.toml <url>`
//!
//! ## 配置文件位置
//!
//! - Windows: `%APPDATA%/pcsdown/pcsdown.toml`
//! - macOS: `~/Library/Application Support/pcsdown/pcsdown.toml`
//! - Linux: `~/.config/pcsdown/pcsdown.toml`

use clap::Parser;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::core::error::DownloadError;
use crate::utils::validator;

/// 获取平台默认配置文件路径
pub fn default_config_path() -> String {
    #[cfg(target_os = "windows")]
    {
        let appdata = env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
        format!("{}/pcsdown/pcsdown.toml", appdata)
    }
    #[cfg(target_os = "macos")]
    {
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{}/Library/Application Support/pcsdown/pcsdown.toml", home)
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{}/.config/pcsdown/pcsdown.toml", home)
    }
}

/// 用系统编辑器打开配置文件
pub fn open_config_in_editor(config_path: &str) {
    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("notepad").arg(config_path).status().ok();
    }
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("open").arg("-e").arg(config_path).status().ok();
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        // 优先 xdg-open，否则 nano
        if std::process::Command::new("xdg-open").arg(config_path).status().is_err() {
            let _ = std::process::Command::new("nano").arg(config_path).status();
        }
    }
}

/// pcsdown 命令行参数
///
/// 示例用法：
///   pcsdown https://example.com/file.zip
///   pcsdown -e
///   pcsdown -c /path/to/pcsdown.toml -t 8 https://example.com/file.zip
#[derive(Parser, Debug, Clone)]
#[command(
    name = "pcsdown",
    version = env!("CARGO_PKG_VERSION"),
    about = "网盘文件分块并行下载器",
    long_about = "按字节范围把文件切成若干块并行下载，支持暂停、恢复、取消和断点续传。\n\n下载过程中按 p 暂停，r 恢复，c 取消，q 退出。"
)]
pub struct Args {
    /// 要下载的URL列表（可同时指定多个）
    #[arg(required = false)]
    pub urls: Vec<String>,

    /// 包含URL列表的文件路径，每行一个URL，# 开头为注释
    #[arg(short, long)]
    pub file: Option<String>,

    /// 配置文件路径
    #[arg(short = 'c', long, default_value_t = default_config_path())]
    pub config: String,

    /// 用系统默认编辑器打开配置文件并退出
    #[arg(short = 'e', long = "edit")]
    pub edit_config: bool,

    /// 下载目录，覆盖配置文件中的设置
    #[arg(long, short = 'd')]
    pub download_dir: Option<String>,

    /// 指定下载文件名，只对单个URL生效
    #[arg(long, short = 'n')]
    pub file_name: Option<String>,

    /// 单任务最大并发数
    #[arg(long, short = 't')]
    pub max_parallel: Option<usize>,

    /// 同时下载的文件数
    #[arg(long, short = 'j')]
    pub max_download_load: Option<usize>,

    /// 下载缓存大小（字节）
    #[arg(long)]
    pub cache_size: Option<usize>,

    /// 日志级别: error / warn / info / debug / trace
    #[arg(long)]
    pub log_level: Option<String>,
}

impl Args {
    /// 解析命令行，加载配置并合并参数
    pub fn parse_args() -> Result<(Self, Config), DownloadError> {
        let args = Args::parse();

        if args.edit_config {
            // 先保证文件存在，编辑器才有东西可打开
            Config::load(&args.config)?;
            open_config_in_editor(&args.config);
            std::process::exit(0);
        }

        let config = args.load_config()?;
        Ok((args, config))
    }

    pub fn load_config(&self) -> Result<Config, DownloadError> {
        let mut config = Config::load(&self.config)?;
        config.merge_from_args(self);
        config.validate()?;
        Ok(config)
    }

    /// 合并命令行与URL文件中的地址
    pub fn get_urls(&self) -> Result<Vec<String>, DownloadError> {
        let mut urls = Vec::new();
        urls.extend_from_slice(&self.urls);

        if let Some(file_path) = &self.file {
            if !Path::new(file_path).exists() {
                return Err(DownloadError::Validation(format!("URL文件不存在: {}", file_path)));
            }
            let content = fs::read_to_string(file_path)?;
            for line in content.lines() {
                let line = line.trim();
                if !line.is_empty() && !line.starts_with('#') {
                    urls.push(line.to_string());
                }
            }
        }

        if urls.is_empty() {
            return Err(DownloadError::Validation(
                "未提供任何URL。请通过命令行参数或文件提供至少一个URL。".to_string(),
            ));
        }
        validator::validate_urls(&urls)?;
        Ok(urls)
    }

    /// 计算某个URL的保存路径
    pub fn destination_for(&self, config: &Config, url: &str, single: bool) -> PathBuf {
        let name = match (&self.file_name, single) {
            (Some(name), true) => name.clone(),
            _ => validator::file_name_from_url(url)
                .unwrap_or_else(|| format!("download_{}", chrono::Utc::now().timestamp_millis())),
        };
        Path::new(&config.download_dir).join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parsing() {
        let args = Args::try_parse_from(["pcsdown", "-t", "8", "-j", "3", "https://example.com/file.zip"]).unwrap();
        assert_eq!(args.urls, vec!["https://example.com/file.zip".to_string()]);
        assert_eq!(args.max_parallel, Some(8));
        assert_eq!(args.max_download_load, Some(3));
        assert_eq!(args.cache_size, None);
    }

    #[test]
    fn test_args_override_config() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("pcsdown.toml");
        let args = Args::try_parse_from([
            "pcsdown",
            "-c", config_path.to_str().unwrap(),
            "-d", "/tmp/pcs",
            "--cache-size", "4096",
            "--log-level", "debug",
            "https://example.com/file.zip",
        ]).unwrap();

        let config = args.load_config().unwrap();
        assert!(config_path.exists());
        assert_eq!(config.download_dir, "/tmp/pcs");
        assert_eq!(config.cache_size, 4096);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.max_parallel, Config::default().max_parallel);
    }

    #[test]
    fn test_invalid_override_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("pcsdown.toml");
        let args = Args::try_parse_from([
            "pcsdown", "-c", config_path.to_str().unwrap(), "-t", "0", "https://example.com/a",
        ]).unwrap();
        assert!(matches!(args.load_config(), Err(DownloadError::Config(_))));
    }

    #[test]
    fn test_url_file_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let url_file = dir.path().join("urls.txt");
        fs::write(&url_file, "# 这是一个注释\nhttps://example.com/file1.zip\n\nhttps://example.com/file2.zip\n").unwrap();

        let args = Args::try_parse_from(["pcsdown", "-f", url_file.to_str().unwrap()]).unwrap();
        let urls = args.get_urls().unwrap();
        assert_eq!(urls, vec![
            "https://example.com/file1.zip".to_string(),
            "https://example.com/file2.zip".to_string(),
        ]);
    }

    #[test]
    fn test_missing_urls() {
        let args = Args::try_parse_from(["pcsdown"]).unwrap();
        assert!(args.get_urls().is_err());

        let args = Args::try_parse_from(["pcsdown", "not-a-url"]).unwrap();
        assert!(matches!(args.get_urls(), Err(DownloadError::Validation(_))));
    }

    #[test]
    fn test_destination_for() {
        let config = Config { download_dir: "/data".to_string(), ..Config::default() };
        let args = Args::try_parse_from(["pcsdown", "-n", "custom.bin", "https://example.com/a/b.zip"]).unwrap();
        assert_eq!(args.destination_for(&config, "https://example.com/a/b.zip", true), PathBuf::from("/data/custom.bin"));
        assert_eq!(args.destination_for(&config, "https://example.com/a/b.zip", false), PathBuf::from("/data/b.zip"));
    }
}
