use chrono::Local; // 用于获取本地时间
use log::{Level, LevelFilter, Metadata, Record};
use std::io::{Write, BufWriter};
use std::fs::{File, OpenOptions};
use std::path::Path;
use actix::prelude::*;

use crate::config::Config;
use crate::core::error::DownloadError;

/// 日志文件默认轮转大小
pub const DEFAULT_MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;

/// 日志消息
pub struct LogMsg {
    pub level: Level,
    pub target: String,
    pub message: String,
}
impl Message for LogMsg { type Result = (); }

/// 把缓冲区写入文件
pub struct FlushLog;
impl Message for FlushLog { type Result = (); }

/// 日志Actor，写文件并按大小轮转
pub struct LoggerActor {
    writer: BufWriter<File>,
    file_path: String,
    max_size: u64, // 最大文件大小 (bytes)
    current_size: u64,
}

impl LoggerActor {
    pub fn new(file_path: &str, max_size: u64) -> Result<Self, std::io::Error> {
        // 确保日志目录存在
        if let Some(parent) = Path::new(file_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;
        let current_size = file.metadata().map(|m| m.len()).unwrap_or(0);

        Ok(Self {
            writer: BufWriter::new(file),
            file_path: file_path.to_string(),
            max_size,
            current_size,
        })
    }

    /// 检查并执行日志轮转
    fn check_rotation(&mut self) -> Result<(), std::io::Error> {
        if self.current_size > self.max_size {
            self.writer.flush()?;

            let backup_path = format!("{}.backup", self.file_path);
            if Path::new(&backup_path).exists() {
                std::fs::remove_file(&backup_path)?;
            }
            std::fs::rename(&self.file_path, &backup_path)?;

            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.file_path)?;

            self.writer = BufWriter::new(file);
            self.current_size = 0;
        }
        Ok(())
    }

    fn write_log(&mut self, level: Level, target: &str, message: &str) -> Result<(), std::io::Error> {
        let log_entry = format!(
            "{} [{}] {} - {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            level,
            target,
            message
        );

        self.check_rotation()?;
        self.writer.write_all(log_entry.as_bytes())?;
        self.current_size += log_entry.len() as u64;

        // 警告以上立即落盘
        if level <= Level::Warn {
            self.writer.flush()?;
        }
        Ok(())
    }
}

impl Actor for LoggerActor {
    type Context = Context<Self>;

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        let _ = self.writer.flush();
    }
}

impl Handler<LogMsg> for LoggerActor {
    type Result = ();
    fn handle(&mut self, msg: LogMsg, _ctx: &mut Self::Context) {
        if let Err(e) = self.write_log(msg.level, &msg.target, &msg.message) {
            eprintln!("日志写入失败: {}", e);
        }
    }
}

impl Handler<FlushLog> for LoggerActor {
    type Result = ();
    fn handle(&mut self, _msg: FlushLog, _ctx: &mut Self::Context) {
        if let Err(e) = self.writer.flush() {
            eprintln!("日志刷新失败: {}", e);
        }
    }
}

/// `log` 门面的实现，把记录转发给 LoggerActor
pub struct ActorLogger {
    addr: Addr<LoggerActor>,
    level: LevelFilter,
}

impl log::Log for ActorLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            self.addr.do_send(LogMsg {
                level: record.level(),
                target: record.target().to_string(),
                message: record.args().to_string(),
            });
        }
    }

    fn flush(&self) {
        self.addr.do_send(FlushLog);
    }
}

/// 初始化日志：配置了日志文件时写文件（需要在 actix System 内调用），否则输出到终端
pub fn init_logging(config: &Config) -> Result<Option<Addr<LoggerActor>>, DownloadError> {
    let level = config.log_level();
    match &config.log_file {
        Some(path) => {
            let addr = LoggerActor::new(path, DEFAULT_MAX_LOG_SIZE)?.start();
            log::set_boxed_logger(Box::new(ActorLogger { addr: addr.clone(), level }))
                .map_err(|e| DownloadError::Config(format!("日志初始化失败: {}", e)))?;
            log::set_max_level(level);
            Ok(Some(addr))
        }
        None => {
            env_logger::Builder::new()
                .filter_level(level)
                .parse_default_env()
                .try_init()
                .map_err(|e| DownloadError::Config(format!("日志初始化失败: {}", e)))?;
            Ok(None)
        }
    }
}
