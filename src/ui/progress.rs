use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::HashMap;

use crate::core::task::{StatusSnapshot, TaskId, TaskState};
use super::format_size;

const BAR_TEMPLATE: &str = "{prefix:>6} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {msg}";

pub fn format_speed(speed: u64) -> String {
    if speed > 1024 * 1024 {
        format!("{:.2} MB/s", speed as f64 / (1024.0 * 1024.0))
    } else if speed > 1024 {
        format!("{:.2} KB/s", speed as f64 / 1024.0)
    } else {
        format!("{} B/s", speed)
    }
}

/// 剩余时间，速度为 0 时未知
pub fn format_eta(remaining: u64, speed: u64) -> String {
    if speed == 0 || remaining == 0 {
        return "未知".to_string();
    }
    let seconds = remaining / speed;
    if seconds > 3600 {
        format!("{}h{}m", seconds / 3600, (seconds % 3600) / 60)
    } else if seconds > 60 {
        format!("{}m{}s", seconds / 60, seconds % 60)
    } else {
        format!("{}s", seconds)
    }
}

/// 每个任务一条进度条，数据全部来自状态快照
pub struct ProgressManager {
    multi: MultiProgress,
    bars: HashMap<TaskId, ProgressBar>,
}

impl ProgressManager {
    pub fn new() -> Self {
        Self::with_draw_target(ProgressDrawTarget::stderr())
    }

    pub fn hidden() -> Self {
        Self::with_draw_target(ProgressDrawTarget::hidden())
    }

    fn with_draw_target(target: ProgressDrawTarget) -> Self {
        ProgressManager {
            multi: MultiProgress::with_draw_target(target),
            bars: HashMap::new(),
        }
    }

    fn bar_for(&mut self, snapshot: &StatusSnapshot) -> &ProgressBar {
        let multi = &self.multi;
        self.bars.entry(snapshot.task_id).or_insert_with(|| {
            let pb = multi.add(ProgressBar::new(snapshot.total_size));
            let style = ProgressStyle::with_template(BAR_TEMPLATE)
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-");
            pb.set_style(style);
            pb.set_prefix(snapshot.task_id.to_string());
            pb
        })
    }

    pub fn update(&mut self, snapshot: &StatusSnapshot) {
        let pb = self.bar_for(snapshot);
        if pb.is_finished() {
            return;
        }
        pb.set_length(snapshot.total_size);
        pb.set_position(snapshot.bytes_downloaded);

        let message = match snapshot.state {
            TaskState::Running => format!(
                "{:.1}% | {} | ETA:{} | {}块下载中",
                snapshot.progress(),
                format_speed(snapshot.speed),
                format_eta(snapshot.total_size.saturating_sub(snapshot.bytes_downloaded), snapshot.speed),
                snapshot.in_flight()
            ),
            TaskState::Failed => format!(
                "{} {}",
                snapshot.state,
                snapshot.error.as_deref().unwrap_or_default()
            ),
            state => state.to_string(),
        };
        pb.set_message(message);

        if snapshot.state.is_terminal() {
            pb.finish_with_message(format!("{} {}", snapshot.state, format_size(snapshot.bytes_downloaded)));
        }
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn finish(&self) {
        for pb in self.bars.values() {
            if !pb.is_finished() {
                pb.abandon();
            }
        }
    }
}

impl Default for ProgressManager {
    fn default() -> Self {
        Self::new()
    }
}
