// 配置管理
use crate::cli::{Cli, Commands};
use crate::dispatch::Operation;
use anyhow::{bail, Context, Result};
use dialoguer::Password;
use secrecy::{Secret, SecretString};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// 目标主机的操作系统类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OsType {
    #[default]
    Linux,
    Unix,
    Windows,
}

/// 一台目标主机的连接信息，构造后不再修改
#[derive(Debug, Clone, Deserialize)]
pub struct HostEndpoint {
    pub address: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    #[serde(default)]
    pub os: OsType,
}

fn default_ssh_port() -> u16 {
    22
}

impl HostEndpoint {
    pub fn new(address: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            port: default_ssh_port(),
            username: username.into(),
            password: Secret::new(password.into()),
            os: OsType::default(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_os(mut self, os: OsType) -> Self {
        self.os = os;
        self
    }

    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// 交互式会话参数
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// 连接建立后设置为 PS1 的提示符
    pub prompt: String,
    pub connect_timeout: Duration,
    pub secondary_timeout: Duration,
    pub command_timeout: Duration,
    pub poll_interval: Duration,
    pub retry_backoff: Duration,
    pub connect_attempts: u32,
    pub keepalive_secs: u32,
    pub term: String,
    pub term_size: (u32, u32),
    pub chunk_size: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            prompt: "[dfv]# ".to_string(),
            connect_timeout: Duration::from_secs(10),
            secondary_timeout: Duration::from_secs(2),
            command_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
            retry_backoff: Duration::from_secs(2),
            connect_attempts: 2,
            keepalive_secs: 30,
            term: "dumb".to_string(),
            term_size: (500, 500),
            chunk_size: 1024 * 1024,
        }
    }
}

impl SessionOptions {
    /// 命令完成判定使用的提示符（去掉尾部空白）
    pub fn prompt_terminator(&self) -> &str {
        self.prompt.trim()
    }
}

#[derive(Debug, Clone)]
pub struct CliCredentials {
    pub username: String,
    pub password: SecretString,
}

impl CliCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Secret::new(password.into()),
        }
    }
}

/// 管理 CLI 的登录参数与提示符约定
#[derive(Debug, Clone)]
pub struct CliSettings {
    pub start_command: String,
    pub prompt: String,
    /// 掉回系统 shell 时输出的结尾字符
    pub shell_marker: String,
    pub password_prompt: String,
    pub exit_command: String,
    pub interrupt: String,
    /// 常规 CLI 命令的短超时
    pub probe_timeout: Duration,
    /// 会话失步重新登录后，重发命令使用的超时
    pub recovery_timeout: Duration,
    pub login_timeout: Duration,
}

impl CliSettings {
    pub fn new(start_command: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            start_command: start_command.into(),
            prompt: prompt.into(),
            shell_marker: "#".to_string(),
            password_prompt: "Please input password:".to_string(),
            exit_command: "exit".to_string(),
            interrupt: "\x03".to_string(),
            probe_timeout: Duration::from_secs(5),
            recovery_timeout: Duration::from_secs(30),
            login_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Deserialize)]
struct InventoryEntry {
    address: String,
    port: Option<u16>,
    username: Option<String>,
    password: Option<SecretString>,
    #[serde(default)]
    os: OsType,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Inventory {
    Wrapped { hosts: Vec<InventoryEntry> },
    List(Vec<InventoryEntry>),
}

impl Inventory {
    fn into_entries(self) -> Vec<InventoryEntry> {
        match self {
            Inventory::Wrapped { hosts } => hosts,
            Inventory::List(hosts) => hosts,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub hosts: Vec<HostEndpoint>,
    pub session: SessionOptions,
    pub max_parallel: Option<usize>,
    pub timeout: Duration,
    pub verbose: bool,
    pub operation: Operation,
}

impl Config {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let mut entries = Vec::new();
        if let Some(path) = &cli.inventory {
            entries.extend(load_inventory(path)?);
        }
        for host in &cli.host {
            entries.push(parse_host_arg(host)?);
        }
        if entries.is_empty() {
            bail!("No target host given, use --host or --inventory");
        }

        // 只有存在缺少密码的主机时才交互式询问
        let needs_password = cli.password.is_none() && entries.iter().any(|e| e.password.is_none());
        let shared_password = match &cli.password {
            Some(p) => Some(p.clone()),
            None if needs_password => Some(
                Password::new()
                    .with_prompt(format!("Enter SSH password for {}", cli.username))
                    .interact()?,
            ),
            None => None,
        };

        let hosts = entries
            .into_iter()
            .map(|e| HostEndpoint {
                address: e.address,
                port: e.port.unwrap_or(cli.port),
                username: e.username.unwrap_or_else(|| cli.username.clone()),
                password: e
                    .password
                    .unwrap_or_else(|| Secret::new(shared_password.clone().unwrap_or_default())),
                os: e.os,
            })
            .collect();

        let session = SessionOptions {
            prompt: cli.prompt.clone(),
            ..SessionOptions::default()
        };
        let timeout = Duration::from_secs(cli.timeout);

        let operation = match &cli.command {
            Commands::Run { command } => Operation::Command {
                command: command.clone(),
            },
            Commands::Upload { local_path, remote_path } => Operation::Upload {
                local_path: local_path.clone(),
                remote_path: remote_path.clone(),
            },
            Commands::Cli {
                command,
                cli_user,
                cli_password,
                start_command,
                cli_prompt,
                expect,
            } => {
                let password = match cli_password {
                    Some(p) => p.clone(),
                    None => Password::new()
                        .with_prompt(format!("Enter CLI password for {}", cli_user))
                        .interact()?,
                };
                let settings = CliSettings::new(start_command.clone(), cli_prompt.clone());
                Operation::Cli {
                    command: command.clone(),
                    credentials: CliCredentials::new(cli_user.clone(), password),
                    settings,
                    expected_prompt: expect.clone(),
                }
            }
        };

        if cli.max_parallel == Some(0) {
            bail!("--max-parallel must be at least 1");
        }

        Ok(Config {
            hosts,
            session,
            max_parallel: cli.max_parallel,
            timeout,
            verbose: cli.verbose,
            operation,
        })
    }
}

fn load_inventory(path: &Path) -> Result<Vec<InventoryEntry>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read inventory {}", path.display()))?;
    let inventory: Inventory = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse inventory {}", path.display()))?;
    Ok(inventory.into_entries())
}

fn parse_host_arg(arg: &str) -> Result<InventoryEntry> {
    let arg = arg.trim();
    let (address, port) = match arg.rsplit_once(':') {
        Some((addr, port)) if !addr.contains(':') => {
            let port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid port in host {}", arg))?;
            (addr.to_string(), Some(port))
        }
        _ => (arg.to_string(), None),
    };
    if address.is_empty() {
        bail!("Empty host address");
    }
    Ok(InventoryEntry {
        address,
        port,
        username: None,
        password: None,
        os: OsType::default(),
    })
}
