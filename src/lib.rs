// 库文件，导出模块
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod ssh;
pub mod telemetry;
pub mod threadpool;
pub mod transfer;
pub mod utils;

use config::Config;
use dispatch::{DispatchJob, DispatchReport, Dispatcher};
use ssh::SshConnector;
use std::sync::Arc;
use transfer::ProgressTracker;

pub use utils::error::{FleetError, Result};

pub fn run_fleet(config: Config) -> DispatchReport {
    let job = DispatchJob {
        hosts: config.hosts,
        operation: config.operation,
        timeout: config.timeout,
    };

    let progress = ProgressTracker::new(job.hosts.len() as u64, "Dispatching");
    let mut dispatcher = Dispatcher::new(Arc::new(SshConnector), config.session).with_progress(progress);
    if let Some(max_parallel) = config.max_parallel {
        dispatcher = dispatcher.with_max_parallel(max_parallel);
    }

    dispatcher.dispatch(&job)
}
