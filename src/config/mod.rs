use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use crate::core::error::DownloadError;
use crate::core::task::retry::RetryStrategy;

/// 缓存大小允许的范围（字节）
pub const MIN_CACHE_SIZE: usize = 1024;
pub const MAX_CACHE_SIZE: usize = 16 * 1024 * 1024;

/// 配置结构体
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    /// 默认下载目录
    pub download_dir: String,
    /// 下载缓存大小（字节），每个 worker 每次落盘的数据量
    pub cache_size: usize,
    /// 单任务最大并发 worker 数
    pub max_parallel: usize,
    /// 同时处于下载中的任务上限
    pub max_download_load: usize,
    /// 最小分块大小（字节）
    pub min_chunk_size: u64,
    /// 网络超时时间（秒）
    pub timeout: u64,
    /// User-Agent
    pub user_agent: String,
    /// 单个分块连续重试次数
    pub retry_count: u32,
    /// 首次重试延迟（毫秒）
    pub retry_delay_ms: u64,
    /// 最大重试延迟（毫秒）
    pub retry_max_delay_ms: u64,
    /// 速度采样间隔（毫秒）
    pub status_interval_ms: u64,
    /// 是否保存断点信息
    pub enable_resume: bool,
    /// 日志文件，为空时输出到终端
    pub log_file: Option<String>,
    /// 日志级别: error / warn / info / debug / trace
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_dir: "./downloads".to_string(),
            cache_size: 64 * 1024,
            max_parallel: 4,
            max_download_load: 2,
            min_chunk_size: 256 * 1024,
            timeout: 30,
            user_agent: "pcsdown/0.1".to_string(),
            retry_count: 5,
            retry_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            status_interval_ms: 1000,
            enable_resume: true,
            log_file: None,
            log_level: "info".to_string(),
        }
    }
}

/// 创建任务时截取的配置快照，之后不再变化
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub max_parallel: usize,
    pub cache_size: usize,
    pub min_chunk_size: u64,
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub status_interval_ms: u64,
    pub enable_resume: bool,
}

impl TaskConfig {
    pub fn retry_strategy(&self) -> RetryStrategy {
        RetryStrategy {
            max_retries: self.retry_count,
            base_delay: Duration::from_millis(self.retry_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms.max(self.retry_delay_ms)),
            ..RetryStrategy::default()
        }
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms.max(1))
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Config::default().task_config()
    }
}

impl Config {
    /// 加载配置文件，不存在时写入带注释的默认配置
    pub fn load(path: &str) -> Result<Self, DownloadError> {
        if Path::new(path).exists() {
            let content = fs::read_to_string(path)?;
            match toml::from_str(&content) {
                Ok(config) => Ok(config),
                Err(e) => {
                    log::warn!("配置文件格式错误: {}，将使用默认配置", e);
                    Ok(Config::default())
                }
            }
        } else {
            let config = Config::default();
            config.save_with_tutorial(path)?;
            Ok(config)
        }
    }

    /// 保存带说明的配置文件
    pub fn save_with_tutorial(&self, path: &str) -> Result<(), DownloadError> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let config_content = toml::to_string_pretty(self)?;
        let full_content = format!("{}\n{}", Config::generate_tutorial_content(), config_content);
        fs::write(path, full_content)?;
        Ok(())
    }

    fn generate_tutorial_content() -> String {
        r#"# pcsdown 配置文件
# ====================
#
# TOML 格式。命令行参数优先于配置文件，配置文件优先于默认值。
# 每个任务创建时会截取一份配置快照，修改配置只影响之后创建的任务。
#
# download_dir        下载文件的储存目录
# cache_size          下载缓存（字节），建议 1024 ~ 262144，
#                     硬盘占用高或下载速度慢时请尝试调大
# max_parallel        单任务最大并发数（同时下载的分块数）
# max_download_load   同时进行下载的文件数量，建议 1 ~ 5
# min_chunk_size      最小分块大小（字节），小文件会少分几块
# timeout             网络超时（秒）
# retry_count         单个分块连续失败的重试次数
# retry_delay_ms      首次重试等待（毫秒），之后指数退避
# retry_max_delay_ms  重试等待上限（毫秒）
# status_interval_ms  速度采样间隔（毫秒）
# enable_resume       暂停或失败时在目标文件旁保存断点信息
# log_file            日志文件路径，不设置则输出到终端
# log_level           error / warn / info / debug / trace
"#.to_string()
    }

    /// 校验配置合法性
    pub fn validate(&self) -> Result<(), DownloadError> {
        if self.max_parallel == 0 {
            return Err(DownloadError::Config("单任务并发数必须大于0".to_string()));
        }
        if self.max_download_load == 0 {
            return Err(DownloadError::Config("同时下载数量必须大于0".to_string()));
        }
        if !(MIN_CACHE_SIZE..=MAX_CACHE_SIZE).contains(&self.cache_size) {
            return Err(DownloadError::Config(format!(
                "下载缓存必须在 {} 到 {} 字节之间", MIN_CACHE_SIZE, MAX_CACHE_SIZE
            )));
        }
        if self.min_chunk_size == 0 {
            return Err(DownloadError::Config("最小分块大小必须大于0".to_string()));
        }
        if self.timeout == 0 {
            return Err(DownloadError::Config("超时时间必须大于0".to_string()));
        }
        if self.download_dir.is_empty() {
            return Err(DownloadError::Config("下载目录不能为空".to_string()));
        }
        if self.status_interval_ms == 0 {
            return Err(DownloadError::Config("采样间隔必须大于0".to_string()));
        }
        Ok(())
    }

    /// 合并命令行参数到配置
    pub fn merge_from_args(&mut self, args: &crate::cli::Args) {
        if let Some(dir) = &args.download_dir {
            self.download_dir = dir.clone();
        }
        if let Some(parallel) = args.max_parallel {
            self.max_parallel = parallel;
        }
        if let Some(load) = args.max_download_load {
            self.max_download_load = load;
        }
        if let Some(cache) = args.cache_size {
            self.cache_size = cache;
        }
        if let Some(level) = &args.log_level {
            self.log_level = level.clone();
        }
    }

    /// 截取任务配置快照
    pub fn task_config(&self) -> TaskConfig {
        TaskConfig {
            max_parallel: self.max_parallel,
            cache_size: self.cache_size,
            min_chunk_size: self.min_chunk_size,
            retry_count: self.retry_count,
            retry_delay_ms: self.retry_delay_ms,
            retry_max_delay_ms: self.retry_max_delay_ms,
            status_interval_ms: self.status_interval_ms,
            enable_resume: self.enable_resume,
        }
    }

    pub fn log_level(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }

    /// 获取配置摘要信息
    pub fn get_summary(&self) -> String {
        format!(
            "配置摘要:\n\
            - 下载目录: {}\n\
            - 下载缓存: {} 字节\n\
            - 单任务并发: {}\n\
            - 同时下载: {}\n\
            - 超时时间: {} 秒\n\
            - 重试次数: {}\n\
            - 断点续传: {}",
            self.download_dir,
            self.cache_size,
            self.max_parallel,
            self.max_download_load,
            self.timeout,
            self.retry_count,
            if self.enable_resume { "启用" } else { "禁用" }
        )
    }
}
