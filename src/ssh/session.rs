// SSH会话管理：长连接、提示符判定命令结束
use crate::config::{HostEndpoint, SessionOptions};
use crate::ssh::transport::{Connection, Connector, RemoteFs, ShellChannel};
use crate::transfer::mirror::RemoteFileMirror;
use crate::utils::error::{FleetError, Result};
use crate::utils::probe;
use secrecy::{ExposeSecret, SecretString};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn, Span};

/// Identifies one interactive channel of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(usize);

impl ChannelId {
    pub const PRIMARY: ChannelId = ChannelId(0);

    pub fn index(self) -> usize {
        self.0
    }
}

/// How a command exchange ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The output ended with one of the expected terminators.
    Terminated,
    /// The timeout expired first; the output is partial and the remote
    /// command keeps running.
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub output: String,
    pub completion: Completion,
    pub exit_code: Option<i32>,
}

impl CommandResult {
    pub fn timed_out(&self) -> bool {
        self.completion == Completion::TimedOut
    }

    pub fn ends_with(&self, terminator: &str) -> bool {
        self.output.ends_with(terminator.trim_end())
    }

    /// 输出中出现退出码 0 的探针标记
    pub fn succeeded(&self) -> bool {
        probe::succeeded(&self.output)
    }
}

struct ChannelSlot {
    shell: Box<dyn ShellChannel>,
    closed: bool,
}

/// One authenticated connection to a host plus its interactive channels.
///
/// Commands on a channel are strictly sequential: every call takes `&mut self`.
/// A session is owned by one worker and torn down explicitly with [`Session::close`].
pub struct Session {
    endpoint: HostEndpoint,
    options: SessionOptions,
    connection: Box<dyn Connection>,
    channels: Vec<ChannelSlot>,
    fs: Option<Box<dyn RemoteFs>>,
    connected: bool,
    span: Span,
}

impl Session {
    /// Connects, authenticates and prepares the primary channel.
    ///
    /// Connection failures are retried `connect_attempts` times with
    /// `retry_backoff` in between. A channel that does not become ready, or
    /// sends no greeting, within `connect_timeout` fails immediately.
    pub fn connect(connector: &dyn Connector, endpoint: HostEndpoint, options: SessionOptions) -> Result<Session> {
        let span = info_span!("session", host = %endpoint.address);
        let _guard = span.enter();

        let attempts = options.connect_attempts.max(1);
        let mut attempt = 0;
        let (mut connection, mut shell) = loop {
            attempt += 1;
            match Self::establish(connector, &endpoint, &options) {
                Ok(pair) => break pair,
                Err(e) if attempt < attempts => {
                    warn!(attempt, error = %e, "Connection failed, retrying in {:?}", options.retry_backoff);
                    thread::sleep(options.retry_backoff);
                }
                Err(e) => {
                    error!(attempt, error = %e, "Connection failed");
                    return Err(FleetError::Connection {
                        host: endpoint.address.clone(),
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
            }
        };

        if let Err(e) = prepare_channel(shell.as_mut(), &endpoint.address, &options, options.connect_timeout) {
            error!(error = %e, "Primary channel not usable");
            shell.close().ok();
            connection.disconnect().ok();
            return Err(e);
        }

        drop(_guard);
        Ok(Session {
            endpoint,
            options,
            connection,
            channels: vec![ChannelSlot { shell, closed: false }],
            fs: None,
            connected: true,
            span,
        })
    }

    fn establish(
        connector: &dyn Connector,
        endpoint: &HostEndpoint,
        options: &SessionOptions,
    ) -> Result<(Box<dyn Connection>, Box<dyn ShellChannel>)> {
        let mut connection = connector.connect(endpoint, options)?;
        match connection.open_shell(options) {
            Ok(shell) => Ok((connection, shell)),
            Err(e) => {
                connection.disconnect().ok();
                Err(e)
            }
        }
    }

    /// Opens another interactive channel on the already authenticated connection.
    pub fn open_secondary_channel(&mut self, timeout: Option<Duration>) -> Result<ChannelId> {
        let span = self.span.clone();
        let _guard = span.enter();
        self.ensure_connected()?;

        let timeout = timeout.unwrap_or(self.options.secondary_timeout);
        let attempts = self.options.connect_attempts.max(1);
        let mut attempt = 0;
        let shell = loop {
            attempt += 1;
            match self.connection.open_shell(&self.options) {
                Ok(shell) => break shell,
                Err(e) if attempt < attempts => {
                    warn!(attempt, error = %e, "Opening channel failed, retrying");
                    thread::sleep(self.options.retry_backoff);
                }
                Err(e) => return Err(e),
            }
        };

        let mut shell = shell;
        if let Err(e) = prepare_channel(shell.as_mut(), &self.endpoint.address, &self.options, timeout) {
            shell.close().ok();
            return Err(e);
        }

        self.channels.push(ChannelSlot { shell, closed: false });
        let id = ChannelId(self.channels.len() - 1);
        debug!(channel = id.index(), "Secondary channel ready");
        Ok(id)
    }

    /// Runs `command` on the primary channel, waiting for the session prompt.
    pub fn run(&mut self, command: &str) -> Result<CommandResult> {
        let prompt = self.options.prompt_terminator().to_string();
        let timeout = self.options.command_timeout;
        self.execute(command, &[prompt.as_str()], timeout, ChannelId::PRIMARY)
    }

    /// Sends `command` and collects output until it ends with one of
    /// `expected` (the session prompt if empty) or `timeout` elapses.
    ///
    /// A timeout is not an error: the partial output is returned with
    /// [`Completion::TimedOut`]. The remote command is not cancelled; send an
    /// interrupt on the same channel to stop it.
    pub fn execute(
        &mut self,
        command: &str,
        expected: &[&str],
        timeout: Duration,
        channel: ChannelId,
    ) -> Result<CommandResult> {
        self.exchange(command, command, true, expected, timeout, channel)
    }

    /// Like [`Session::execute`] but never logs the payload. Used for passwords.
    pub fn send_secret(&mut self, secret: &SecretString, expected: &[&str], timeout: Duration) -> Result<CommandResult> {
        self.exchange(secret.expose_secret(), "<redacted>", false, expected, timeout, ChannelId::PRIMARY)
    }

    fn exchange(
        &mut self,
        payload: &str,
        shown: &str,
        strip_echo: bool,
        expected: &[&str],
        timeout: Duration,
        channel: ChannelId,
    ) -> Result<CommandResult> {
        let span = self.span.clone();
        let _guard = span.enter();
        self.ensure_connected()?;

        let prompt = self.options.prompt_terminator().to_string();
        let expected: Vec<&str> = if expected.is_empty() {
            vec![prompt.as_str()]
        } else {
            expected.to_vec()
        };
        let poll = self.options.poll_interval;
        let host = self.endpoint.address.clone();

        let slot = self.slot_mut(channel)?;
        info!(channel = channel.index(), command = ?shown, "Executing command");
        slot.shell.send(format!("{}\n", payload).as_bytes())?;

        let start = Instant::now();
        let mut raw = Vec::new();
        let completion = loop {
            thread::sleep(poll);
            let received = slot.shell.recv_available(&mut raw)?;
            if received > 0 {
                debug!(bytes = received, "{}", String::from_utf8_lossy(&raw[raw.len() - received..]));
                if ends_with_any(&raw, &expected) {
                    break Completion::Terminated;
                }
            }
            if start.elapsed() >= timeout {
                break Completion::TimedOut;
            }
        };

        let text = String::from_utf8_lossy(&raw);
        let output = if strip_echo {
            strip_echo_prefix(text.trim(), payload)
        } else {
            text.trim().to_string()
        };
        if completion == Completion::TimedOut {
            warn!(
                host = %host,
                "Receive timeout ({:?}) before expected end, returning partial output: {}",
                timeout,
                output
            );
        }

        let exit_code = probe::parse_exit_code(&output);
        Ok(CommandResult {
            output,
            completion,
            exit_code,
        })
    }

    /// Closes one channel. Closing the primary channel leaves the connection up.
    pub fn close_channel(&mut self, channel: ChannelId) -> Result<()> {
        let slot = self.slot_mut(channel)?;
        slot.closed = true;
        slot.shell.close()?;
        Ok(())
    }

    /// Closes every channel and the connection itself.
    pub fn close(&mut self) -> Result<()> {
        if !self.connected {
            return Ok(());
        }
        let span = self.span.clone();
        let _guard = span.enter();
        for slot in self.channels.iter_mut().filter(|s| !s.closed) {
            slot.closed = true;
            slot.shell.close().ok();
        }
        self.fs = None;
        self.connected = false;
        debug!("Session closed");
        self.connection.disconnect()
    }

    /// File-transfer handle, opened on first use.
    pub fn file_transfer(&mut self) -> Result<&dyn RemoteFs> {
        self.ensure_connected()?;
        if self.fs.is_none() {
            self.fs = Some(self.connection.open_fs()?);
        }
        match self.fs.as_deref() {
            Some(fs) => Ok(fs),
            None => Err(FleetError::ChannelClosed {
                host: self.endpoint.address.clone(),
                channel: usize::MAX,
            }),
        }
    }

    pub fn mirror(&mut self) -> Result<RemoteFileMirror<'_>> {
        let span = self.span.clone();
        let chunk_size = self.options.chunk_size;
        let fs = self.file_transfer()?;
        Ok(RemoteFileMirror::new(fs, chunk_size, span))
    }

    pub fn endpoint(&self) -> &HostEndpoint {
        &self.endpoint
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(FleetError::ChannelClosed {
                host: self.endpoint.address.clone(),
                channel: ChannelId::PRIMARY.index(),
            })
        }
    }

    fn slot_mut(&mut self, channel: ChannelId) -> Result<&mut ChannelSlot> {
        let host = &self.endpoint.address;
        match self.channels.get_mut(channel.index()) {
            Some(slot) if !slot.closed => Ok(slot),
            _ => Err(FleetError::ChannelClosed {
                host: host.clone(),
                channel: channel.index(),
            }),
        }
    }
}

/// 等待通道可写，设置 TMOUT 和 PS1，再收取登录欢迎信息
fn prepare_channel(
    shell: &mut dyn ShellChannel,
    host: &str,
    options: &SessionOptions,
    timeout: Duration,
) -> Result<()> {
    let start = Instant::now();
    loop {
        thread::sleep(options.poll_interval);
        if shell.send_ready() {
            break;
        }
        if start.elapsed() >= timeout {
            return Err(FleetError::ChannelNotReady {
                host: host.to_string(),
                waited: timeout,
            });
        }
    }

    shell.send(prompt_setup_line(&options.prompt).as_bytes())?;

    let start = Instant::now();
    let mut raw = Vec::new();
    loop {
        thread::sleep(options.poll_interval);
        if shell.recv_available(&mut raw)? > 0 {
            break;
        }
        if start.elapsed() >= timeout {
            return Err(FleetError::GreetingTimeout {
                host: host.to_string(),
                waited: timeout,
            });
        }
    }

    // 欢迎信息可能分多次到达，直到出现提示符或一次轮询没有新数据
    let terminator = options.prompt_terminator();
    while !ends_with_any(&raw, &[terminator]) && start.elapsed() < timeout {
        thread::sleep(options.poll_interval);
        if shell.recv_available(&mut raw)? == 0 {
            break;
        }
    }

    info!("SSH login init msg\n{}", String::from_utf8_lossy(&raw));
    Ok(())
}

/// 关闭空闲超时并设置提示符的初始化命令
pub(crate) fn prompt_setup_line(prompt: &str) -> String {
    format!("TMOUT=0;PS1='{}'\n", prompt.replace('\'', r"'\''"))
}

/// 只比较去掉尾部空白后的字节后缀，不解码整个缓冲区
fn ends_with_any(raw: &[u8], expected: &[&str]) -> bool {
    let end = raw.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(0, |i| i + 1);
    let tail = &raw[..end];
    expected
        .iter()
        .map(|t| t.trim_end())
        .any(|t| !t.is_empty() && tail.ends_with(t.as_bytes()))
}

fn strip_echo_prefix(text: &str, command: &str) -> String {
    match text.strip_prefix(command) {
        Some(rest) if !command.is_empty() => rest.trim_start_matches(['\r', '\n']).to_string(),
        _ => text.to_string(),
    }
}
