// 进度显示：按主机统计完成情况
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct ProgressTracker {
    progress_bar: ProgressBar,
    failed_hosts: Arc<AtomicU64>,
    start_time: Arc<Instant>,
}

impl ProgressTracker {
    pub fn new(total_hosts: u64, description: &str) -> Self {
        Self::with_bar(ProgressBar::new(total_hosts), description)
    }

    /// 进度条不输出到终端，用于库调用和测试
    pub fn hidden() -> Self {
        Self::with_bar(ProgressBar::hidden(), "")
    }

    fn with_bar(progress_bar: ProgressBar, description: &str) -> Self {
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} hosts {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        progress_bar.set_style(style);
        progress_bar.set_message(description.to_string());

        Self {
            progress_bar,
            failed_hosts: Arc::new(AtomicU64::new(0)),
            start_time: Arc::new(Instant::now()),
        }
    }

    pub fn set_total(&self, total_hosts: u64) {
        self.progress_bar.set_length(total_hosts);
    }

    pub fn host_done(&self, host: &str, success: bool) {
        if !success {
            let failed = self.failed_hosts.fetch_add(1, Ordering::Relaxed) + 1;
            self.progress_bar.set_message(format!("{} failed (last: {})", failed, host));
        }
        self.progress_bar.inc(1);
    }

    pub fn failed(&self) -> u64 {
        self.failed_hosts.load(Ordering::Relaxed)
    }

    pub fn finish(&self) {
        let elapsed = self.start_time.elapsed();
        let failed = self.failed();
        let message = if failed == 0 {
            format!("All hosts succeeded in {:.1}s", elapsed.as_secs_f64())
        } else {
            format!("{} host(s) failed, finished in {:.1}s", failed, elapsed.as_secs_f64())
        };
        self.progress_bar.finish_with_message(message);
    }
}
