use actix::prelude::*;
use crossterm::{
    cursor, execute, terminal,
    event::{self, Event, KeyCode},
};
use pcsdown::cli;
use pcsdown::config::Config;
use pcsdown::core::{
    ControlTask, GetStats, HttpSource, ListTasks, RegisterTask, Shutdown, TaskCommand, TaskId,
    TaskRegistry,
};
use pcsdown::ui::{self, DownloadSummary, ProgressManager};
use pcsdown::utils::logger;
use std::sync::Arc;
use std::time::{Duration, Instant};

const PROGRESS_UPDATE_INTERVAL: Duration = Duration::from_millis(200);
// actix 运行时是单线程的，键盘轮询不能阻塞
const TICK: Duration = Duration::from_millis(20);

#[actix::main]
async fn main() -> anyhow::Result<()> {
    let (args, config) = match cli::Args::parse_args() {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("参数解析失败: {}", e);
            std::process::exit(1);
        }
    };
    let _log_actor = logger::init_logging(&config)?;
    log::info!(
        "pcsdown {} ({}) 启动",
        env!("CARGO_PKG_VERSION"),
        option_env!("VERGEN_GIT_SHA").unwrap_or("unknown")
    );

    let urls = match args.get_urls() {
        Ok(urls) => urls,
        Err(e) => {
            eprintln!("获取URL列表失败: {}", e);
            std::process::exit(1);
        }
    };
    log::info!("配置文件路径: {}", args.config);
    log::debug!("{}", config.get_summary());
    println!("{}", config.get_summary());

    std::fs::create_dir_all(&config.download_dir)?;
    let registry = TaskRegistry::from_config(&config).start();

    let task_ids = register_tasks(&registry, &args, &config, &urls).await;
    if task_ids.is_empty() {
        eprintln!("没有可下载的任务");
        return Ok(());
    }

    println!("\n开始下载... (按 'p' 暂停, 'r' 恢复, 'c' 取消, 'q' 退出)");
    let started = Instant::now();
    run_download_loop(&registry, &task_ids).await?;

    let stats = registry.send(GetStats).await?;
    println!("{}", DownloadSummary::from_stats(&stats, started.elapsed()));
    log::info!("下载结束 - 成功: {}, 失败: {}", stats.completed, stats.failed);

    registry.send(Shutdown).await?;
    log::Log::flush(log::logger());
    Ok(())
}

/// 为每个URL注册下载任务
async fn register_tasks(
    registry: &Addr<TaskRegistry>,
    args: &cli::Args,
    config: &Config,
    urls: &[String],
) -> Vec<TaskId> {
    let mut task_ids = Vec::new();
    let single = urls.len() == 1;

    for url in urls {
        let destination = args.destination_for(config, url, single);
        let source = match HttpSource::new(url, config) {
            Ok(source) => source,
            Err(e) => {
                ui::print_error(&format!("无效的下载地址: {} - {}", url, e));
                continue;
            }
        };

        let registered = registry.send(RegisterTask {
            source: Arc::new(source),
            destination: destination.clone(),
            config: config.task_config(),
        }).await;

        match registered {
            Ok(Ok(task_id)) => {
                task_ids.push(task_id);
                log::info!("[{}] 创建下载任务: {} -> {}", task_id, url, destination.display());
                ui::print_success(&format!("创建下载任务 {}: {}", task_id, destination.display()));
            }
            Ok(Err(e)) => {
                log::error!("创建下载任务失败: {} - {}", url, e);
                ui::print_error(&format!("创建下载任务失败: {} - {}", url, e));
            }
            Err(e) => {
                log::error!("任务管理器不可用: {}", e);
                ui::print_error(&format!("任务管理器不可用: {}", e));
            }
        }
    }
    task_ids
}

/// 向所有任务下发同一个命令，不等待回复
fn broadcast(registry: &Addr<TaskRegistry>, task_ids: &[TaskId], command: TaskCommand) {
    for &id in task_ids {
        let request = registry.send(ControlTask { id, command });
        actix::spawn(async move {
            match request.await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => log::debug!("[{}] 命令 {:?} 未执行: {}", id, command, e),
                Err(e) => log::warn!("[{}] 发送命令失败: {}", id, e),
            }
        });
    }
}

/// 主循环：处理键盘输入并刷新进度
async fn run_download_loop(registry: &Addr<TaskRegistry>, task_ids: &[TaskId]) -> anyhow::Result<()> {
    terminal::enable_raw_mode()?;
    execute!(std::io::stdout(), cursor::Hide)?;

    let mut progress = ProgressManager::new();
    let mut last_update = Instant::now();
    let result: anyhow::Result<()> = loop {
        if let Ok(true) = event::poll(Duration::ZERO) {
            if let Ok(Event::Key(key_event)) = event::read() {
                match key_event.code {
                    KeyCode::Char('q') | KeyCode::Char('Q') => {
                        log::info!("用户主动退出下载");
                        break Ok(());
                    }
                    KeyCode::Char('p') | KeyCode::Char('P') => {
                        log::info!("用户暂停所有下载任务");
                        broadcast(registry, task_ids, TaskCommand::Pause);
                    }
                    KeyCode::Char('r') | KeyCode::Char('R') => {
                        log::info!("用户恢复所有下载任务");
                        broadcast(registry, task_ids, TaskCommand::Resume);
                    }
                    KeyCode::Char('c') | KeyCode::Char('C') => {
                        log::info!("用户取消所有下载任务");
                        broadcast(registry, task_ids, TaskCommand::Cancel);
                    }
                    _ => {}
                }
            }
        }

        if last_update.elapsed() >= PROGRESS_UPDATE_INTERVAL {
            let snapshots = match registry.send(ListTasks).await {
                Ok(snapshots) => snapshots,
                Err(e) => break Err(e.into()),
            };
            for snapshot in &snapshots {
                progress.update(snapshot);
            }
            if !snapshots.is_empty() && snapshots.iter().all(|s| s.state.is_terminal()) {
                break Ok(());
            }
            last_update = Instant::now();
        }

        tokio::time::sleep(TICK).await;
    };

    progress.finish();
    execute!(std::io::stdout(), cursor::Show)?;
    terminal::disable_raw_mode()?;
    result
}
