//! Fan-out of one operation over many hosts.
//!
//! Every host gets its own session and its own worker; workers report a
//! [`HostOutcome`] over a channel to a single collector, so no container is
//! shared between them. One host failing never stops the others.

use crate::config::{CliCredentials, CliSettings, HostEndpoint, SessionOptions};
use crate::ssh::cli_session::CliSession;
use crate::ssh::session::{ChannelId, Session};
use crate::ssh::transport::Connector;
use crate::threadpool::ThreadPool;
use crate::transfer::progress::ProgressTracker;
use crate::utils::error::{FleetError, Result};
use crate::utils::probe;
use crossbeam_channel::unbounded;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, info_span, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostOutcome {
    pub host: String,
    pub success: bool,
    pub message: String,
}

impl HostOutcome {
    pub fn success(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            success: true,
            message: message.into(),
        }
    }

    pub fn failure(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            success: false,
            message: message.into(),
        }
    }
}

/// What to run on every host.
#[derive(Debug, Clone)]
pub enum Operation {
    /// Shell command; the exit-status probe is appended before sending.
    Command { command: String },
    /// `mkdir -p` of the remote directory, then a mirror upload of a local
    /// directory (or a copy of a single file) into it.
    Upload { local_path: PathBuf, remote_path: String },
    /// Command run inside the management CLI.
    Cli {
        command: String,
        credentials: CliCredentials,
        settings: CliSettings,
        expected_prompt: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct DispatchJob {
    pub hosts: Vec<HostEndpoint>,
    pub operation: Operation,
    /// Per-host command timeout.
    pub timeout: Duration,
}

/// Outcomes in the order the hosts were given.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub outcomes: Vec<HostOutcome>,
}

impl DispatchReport {
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.success)
    }

    pub fn failures(&self) -> Vec<&HostOutcome> {
        self.outcomes.iter().filter(|o| !o.success).collect()
    }

    /// Fails with every failed host listed when any host failed.
    pub fn into_result(self) -> Result<DispatchReport> {
        if self.is_success() {
            return Ok(self);
        }
        let failures = self.outcomes.into_iter().filter(|o| !o.success).collect();
        Err(FleetError::Dispatch { failures })
    }
}

/// Everything a worker needs to reach its host.
#[derive(Clone)]
pub struct HostContext {
    pub endpoint: HostEndpoint,
    pub connector: Arc<dyn Connector>,
    pub options: SessionOptions,
}

impl HostContext {
    pub fn host(&self) -> &str {
        &self.endpoint.address
    }

    pub fn connect(&self) -> Result<Session> {
        Session::connect(self.connector.as_ref(), self.endpoint.clone(), self.options.clone())
    }
}

pub struct Dispatcher {
    connector: Arc<dyn Connector>,
    options: SessionOptions,
    max_parallel: Option<usize>,
    progress: ProgressTracker,
}

impl Dispatcher {
    pub fn new(connector: Arc<dyn Connector>, options: SessionOptions) -> Self {
        Self {
            connector,
            options,
            max_parallel: None,
            progress: ProgressTracker::hidden(),
        }
    }

    /// 限制同时处理的主机数，默认每台主机一个线程
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = Some(max_parallel.max(1));
        self
    }

    pub fn with_progress(mut self, progress: ProgressTracker) -> Self {
        self.progress = progress;
        self
    }

    pub fn dispatch(&self, job: &DispatchJob) -> DispatchReport {
        let operation = job.operation.clone();
        let timeout = job.timeout;
        self.run_on_each(&job.hosts, move |ctx| match &operation {
            Operation::Command { command } => run_command(ctx, command, timeout),
            Operation::Upload { local_path, remote_path } => run_upload(ctx, local_path, remote_path, timeout),
            Operation::Cli {
                command,
                credentials,
                settings,
                expected_prompt,
            } => run_cli(ctx, command, credentials, settings, expected_prompt.as_deref(), timeout),
        })
    }

    /// Runs `operation` once per host, each on its own worker, and collects
    /// every outcome. A worker that panics counts as a failure of its host.
    pub fn run_on_each<F>(&self, hosts: &[HostEndpoint], operation: F) -> DispatchReport
    where
        F: Fn(&HostContext) -> HostOutcome + Send + Sync + 'static,
    {
        if hosts.is_empty() {
            return DispatchReport::default();
        }

        let operation = Arc::new(operation);
        let workers = self.max_parallel.unwrap_or(hosts.len()).min(hosts.len());
        let pool = ThreadPool::new(workers);
        let (tx, rx) = unbounded::<(usize, HostOutcome)>();
        let mut slots: Vec<Option<HostOutcome>> = vec![None; hosts.len()];

        self.progress.set_total(hosts.len() as u64);

        for (index, endpoint) in hosts.iter().enumerate() {
            let ctx = HostContext {
                endpoint: endpoint.clone(),
                connector: Arc::clone(&self.connector),
                options: self.options.clone(),
            };
            let operation = Arc::clone(&operation);
            let tx = tx.clone();

            let submitted = pool.execute(move || {
                let span = info_span!("dispatch", host = %ctx.host());
                let _guard = span.enter();
                let outcome = match panic::catch_unwind(AssertUnwindSafe(|| operation(&ctx))) {
                    Ok(outcome) => outcome,
                    Err(payload) => HostOutcome::failure(
                        ctx.host(),
                        format!("On node({}): worker panicked: {}", ctx.host(), panic_message(payload.as_ref())),
                    ),
                };
                tx.send((index, outcome)).ok();
            });

            if let Err(e) = submitted {
                slots[index] = Some(HostOutcome::failure(
                    &endpoint.address,
                    format!("On node({}): could not schedule work: {}", endpoint.address, e),
                ));
            }
        }
        drop(tx);

        // 所有发送端释放后 recv 返回错误，即全部任务结束
        while let Ok((index, outcome)) = rx.recv() {
            if outcome.success {
                info!(host = %outcome.host, "{}", outcome.message);
            } else {
                error!(host = %outcome.host, "{}", outcome.message);
            }
            self.progress.host_done(&outcome.host, outcome.success);
            slots[index] = Some(outcome);
        }
        if let Err(e) = pool.join() {
            warn!(error = %e, "Worker pool shut down uncleanly");
        }
        self.progress.finish();

        let outcomes = slots
            .into_iter()
            .zip(hosts)
            .map(|(slot, endpoint)| {
                slot.unwrap_or_else(|| {
                    HostOutcome::failure(
                        &endpoint.address,
                        format!("On node({}): worker ended without reporting", endpoint.address),
                    )
                })
            })
            .collect();

        DispatchReport { outcomes }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn close_quietly(session: &mut Session) {
    if let Err(e) = session.close() {
        warn!(error = %e, "Closing session failed");
    }
}

/// 执行 shell 命令，输出中出现 `----0----` 才算成功
pub fn run_command(ctx: &HostContext, command: &str, timeout: Duration) -> HostOutcome {
    let host = ctx.host();
    let mut session = match ctx.connect() {
        Ok(session) => session,
        Err(e) => return HostOutcome::failure(host, format!("On node({}): {}", host, e)),
    };

    let prompt = ctx.options.prompt_terminator().to_string();
    let probed = probe::with_probe(command);
    let outcome = match session.execute(&probed, &[prompt.as_str()], timeout, ChannelId::PRIMARY) {
        Ok(result) if result.succeeded() => {
            HostOutcome::success(host, format!("On node({}): execute the cmd({}) succeeded", host, command))
        }
        Ok(result) if result.timed_out() => HostOutcome::failure(
            host,
            format!("On node({}): execute the cmd({}) timed out after {:?}", host, command, timeout),
        ),
        Ok(result) => HostOutcome::failure(
            host,
            format!(
                "On node({}): execute the cmd({}) failed (exit code {}): {}",
                host,
                command,
                result.exit_code.map_or_else(|| "unknown".to_string(), |c| c.to_string()),
                result.output
            ),
        ),
        Err(e) => HostOutcome::failure(host, format!("On node({}): execute the cmd({}) failed: {}", host, command, e)),
    };

    close_quietly(&mut session);
    outcome
}

/// 先创建远程目录，再按本地路径类型上传目录或文件
pub fn run_upload(ctx: &HostContext, local_path: &std::path::Path, remote_path: &str, timeout: Duration) -> HostOutcome {
    let host = ctx.host();
    let mut session = match ctx.connect() {
        Ok(session) => session,
        Err(e) => return HostOutcome::failure(host, format!("On node({}): {}", host, e)),
    };

    let outcome = upload_with(&mut session, local_path, remote_path, timeout);
    close_quietly(&mut session);

    match outcome {
        Ok(target) => HostOutcome::success(
            host,
            format!("On node({}): uploaded {} to {}", host, local_path.display(), target),
        ),
        Err(e) => HostOutcome::failure(
            host,
            format!("On node({}): upload of {} to {} failed: {}", host, local_path.display(), remote_path, e),
        ),
    }
}

fn upload_with(session: &mut Session, local_path: &std::path::Path, remote_path: &str, timeout: Duration) -> Result<String> {
    let host = session.endpoint().address.clone();
    let prompt = session.options().prompt_terminator().to_string();
    let mkdir = probe::with_probe(&format!("mkdir -p {}", remote_path));
    let made = session.execute(&mkdir, &[prompt.as_str()], timeout, ChannelId::PRIMARY)?;
    if !made.succeeded() {
        return Err(FleetError::remote_fs(
            "mkdir",
            remote_path,
            std::io::Error::other(format!("make the directory failed on {}: {}", host, made.output)),
        ));
    }
    info!("Make the directory({}) succeeded", remote_path);

    let mirror = session.mirror()?;
    if local_path.is_dir() {
        mirror.upload_tree(local_path, remote_path, true)
    } else if local_path.is_file() {
        mirror.upload_file(local_path, remote_path, true)
    } else {
        Err(FleetError::InvalidConfig(format!(
            "Upload source {} is neither a file nor a directory",
            local_path.display()
        )))
    }
}

/// 在管理 CLI 中执行命令，结束后退出 CLI
///
/// `timeout` is the job's per-host timeout; it bounds the resend after a
/// desynchronized CLI has been logged into again.
pub fn run_cli(
    ctx: &HostContext,
    command: &str,
    credentials: &CliCredentials,
    settings: &CliSettings,
    expected_prompt: Option<&str>,
    timeout: Duration,
) -> HostOutcome {
    let host = ctx.host();
    let mut settings = settings.clone();
    settings.recovery_timeout = timeout;
    let mut cli = CliSession::new(
        Arc::clone(&ctx.connector),
        ctx.endpoint.clone(),
        ctx.options.clone(),
        settings,
        credentials.clone(),
    );

    let outcome = match cli.execute_as(command, None, expected_prompt) {
        Ok(result) if result.timed_out() => HostOutcome::failure(
            host,
            format!("On node({}): CLI command({}) timed out: {}", host, command, result.output),
        ),
        Ok(result) => HostOutcome::success(
            host,
            format!("On node({}): CLI command({}) finished: {}", host, command, result.output),
        ),
        Err(e) => HostOutcome::failure(host, format!("On node({}): CLI command({}) failed: {}", host, command, e)),
    };

    if let Err(e) = cli.close() {
        warn!(error = %e, "Closing CLI session failed");
    }
    outcome
}
