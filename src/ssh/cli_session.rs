// 管理 CLI 会话：登录、切换账号重新登录、高危确认提示处理
use crate::config::{CliCredentials, CliSettings, HostEndpoint, SessionOptions};
use crate::ssh::session::{ChannelId, CommandResult, Session};
use crate::ssh::transport::Connector;
use crate::utils::error::{FleetError, Result};
use std::mem;
use std::sync::Arc;
use tracing::{info, info_span, warn, Span};

/// Login state of a [`CliSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliState {
    LoggedOut,
    LoggedInAs(String),
}

enum Link {
    LoggedOut,
    LoggedIn { username: String, session: Session },
}

/// A management CLI reached by running a start script inside an SSH shell.
///
/// The session is logged in lazily, logged in again whenever a command is
/// issued for a different CLI account, and recovered once if the CLI drops
/// back to the system shell in the middle of a command.
pub struct CliSession {
    connector: Arc<dyn Connector>,
    endpoint: HostEndpoint,
    options: SessionOptions,
    settings: CliSettings,
    credentials: CliCredentials,
    link: Link,
    span: Span,
}

impl CliSession {
    pub fn new(
        connector: Arc<dyn Connector>,
        endpoint: HostEndpoint,
        options: SessionOptions,
        settings: CliSettings,
        credentials: CliCredentials,
    ) -> Self {
        let span = info_span!("cli", host = %endpoint.address);
        Self {
            connector,
            endpoint,
            options,
            settings,
            credentials,
            link: Link::LoggedOut,
            span,
        }
    }

    pub fn state(&self) -> CliState {
        match &self.link {
            Link::LoggedOut => CliState::LoggedOut,
            Link::LoggedIn { username, .. } => CliState::LoggedInAs(username.clone()),
        }
    }

    pub fn settings(&self) -> &CliSettings {
        &self.settings
    }

    /// Opens a fresh SSH session and logs into the CLI as `credentials.username`.
    pub fn login(&mut self, credentials: &CliCredentials) -> Result<()> {
        let span = self.span.clone();
        let _guard = span.enter();
        self.drop_link();

        let mut session = Session::connect(self.connector.as_ref(), self.endpoint.clone(), self.options.clone())?;
        let timeout = self.settings.login_timeout;

        let start = format!("{} -u {}", self.settings.start_command, credentials.username);
        let out = session.execute(&start, &[self.settings.password_prompt.as_str()], timeout, ChannelId::PRIMARY)?;
        if !out.ends_with(&self.settings.password_prompt) {
            session.close().ok();
            return Err(self.rejected(&credentials.username, out));
        }

        // 登录成功一定以 CLI 提示符结尾，否则是超时或密码错误
        let out = session.send_secret(&credentials.password, &[self.settings.prompt.as_str()], timeout)?;
        if !out.ends_with(&self.settings.prompt) {
            session.close().ok();
            return Err(self.rejected(&credentials.username, out));
        }

        info!(user = %credentials.username, "Logged into CLI");
        self.credentials = credentials.clone();
        self.link = Link::LoggedIn {
            username: credentials.username.clone(),
            session,
        };
        Ok(())
    }

    /// Runs `command` as the current CLI account, expecting the normal prompt.
    pub fn execute(&mut self, command: &str) -> Result<CommandResult> {
        self.execute_as(command, None, None)
    }

    /// Runs `command` as `credentials` (default: the current account) and
    /// waits for `expected_prompt` (default: the normal CLI prompt).
    pub fn execute_as(
        &mut self,
        command: &str,
        credentials: Option<&CliCredentials>,
        expected_prompt: Option<&str>,
    ) -> Result<CommandResult> {
        let span = self.span.clone();
        let _guard = span.enter();

        let credentials = credentials.cloned().unwrap_or_else(|| self.credentials.clone());
        let normal_prompt = self.settings.prompt.clone();
        let expected = expected_prompt.unwrap_or(normal_prompt.as_str()).to_string();

        // 提交命令的账号发生变化时需要重新登录
        let previous = match &self.link {
            Link::LoggedIn { username, .. } if *username != credentials.username => Some(username.clone()),
            _ => None,
        };
        if let Some(previous) = previous {
            info!(from = %previous, to = %credentials.username, "CLI account changed, logging in again");
            self.close()?;
        }
        if matches!(self.link, Link::LoggedOut) {
            self.login(&credentials)?;
        }
        // 未发生重新登录时也记住最近一次给出的密码
        self.credentials.password = credentials.password.clone();

        let probe_timeout = self.settings.probe_timeout;
        let out = self.session_mut()?.execute(command, &[expected.as_str()], probe_timeout, ChannelId::PRIMARY)?;

        if is_desynchronized(&out, &expected, &self.settings) {
            warn!("CLI dropped back to the system shell, logging in again");
            self.login(&credentials)?;
            let recovery_timeout = self.settings.recovery_timeout;
            let retry =
                self.session_mut()?.execute(command, &[expected.as_str()], recovery_timeout, ChannelId::PRIMARY)?;
            if is_desynchronized(&retry, &expected, &self.settings) {
                warn!("CLI still desynchronized after one recovery attempt");
            }
            return Ok(retry);
        }

        // 期望高危确认提示却回到了普通提示符：发送 Ctrl+C 重新同步
        if expected != normal_prompt && out.output.contains(normal_prompt.as_str()) {
            warn!(expected = %expected, "Expected prompt not shown, interrupting");
            let interrupt = self.settings.interrupt.clone();
            let timeout = self.options.command_timeout;
            self.session_mut()?.execute(&interrupt, &[normal_prompt.as_str()], timeout, ChannelId::PRIMARY)?;
        }

        Ok(out)
    }

    /// Leaves the CLI and tears the SSH session down.
    pub fn close(&mut self) -> Result<()> {
        if let Link::LoggedIn { username, mut session } = mem::replace(&mut self.link, Link::LoggedOut) {
            let span = self.span.clone();
            let _guard = span.enter();
            let exit = self.settings.exit_command.clone();
            let marker = self.settings.shell_marker.clone();
            let timeout = self.options.command_timeout;
            if let Err(e) = session.execute(&exit, &[marker.as_str()], timeout, ChannelId::PRIMARY) {
                warn!(user = %username, error = %e, "Leaving CLI failed");
            }
            session.close()?;
            info!(user = %username, "CLI session closed");
        }
        Ok(())
    }

    fn session_mut(&mut self) -> Result<&mut Session> {
        match &mut self.link {
            Link::LoggedIn { session, .. } => Ok(session),
            Link::LoggedOut => Err(FleetError::ChannelClosed {
                host: self.endpoint.address.clone(),
                channel: ChannelId::PRIMARY.index(),
            }),
        }
    }

    /// 丢弃当前会话，不发送退出命令（会话已失步时使用）
    fn drop_link(&mut self) {
        if let Link::LoggedIn { mut session, .. } = mem::replace(&mut self.link, Link::LoggedOut) {
            session.close().ok();
        }
    }

    fn rejected(&self, username: &str, out: CommandResult) -> FleetError {
        FleetError::LoginRejected {
            host: self.endpoint.address.clone(),
            username: username.to_string(),
            output: out.output,
        }
    }
}

/// 输出没有以期望提示符结尾，而是以系统 shell 提示符结尾
fn is_desynchronized(out: &CommandResult, expected: &str, settings: &CliSettings) -> bool {
    !out.ends_with(expected) && out.ends_with(&settings.shell_marker)
}
