//! Shared fakes for integration tests.
//!
//! `FakeConnector` hands out in-memory connections whose shells are driven by
//! a scripted responder and whose file-transfer channel is an in-memory tree.

// Not every test binary uses every helper
#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ssh_fleet::config::{CliSettings, HostEndpoint, SessionOptions};
use ssh_fleet::ssh::{Connection, Connector, RemoteFs, ShellChannel};
use ssh_fleet::FleetError;

pub use tempfile::{tempdir, TempDir};

pub const PROMPT: &str = "[dfv]# ";
pub const CLI_PROMPT: &str = "admin:/>";
pub const START_CLI: &str = "/opt/cli/start.sh";
pub const SLOW_POLLS: usize = 60;

/// Fast session options so polling tests finish quickly.
pub fn fast_options() -> SessionOptions {
    SessionOptions {
        prompt: PROMPT.to_string(),
        connect_timeout: Duration::from_millis(300),
        secondary_timeout: Duration::from_millis(200),
        command_timeout: Duration::from_secs(2),
        poll_interval: Duration::from_millis(5),
        retry_backoff: Duration::from_millis(20),
        ..SessionOptions::default()
    }
}

pub fn fast_cli_settings() -> CliSettings {
    let mut settings = CliSettings::new(START_CLI, CLI_PROMPT);
    settings.probe_timeout = Duration::from_millis(300);
    settings.recovery_timeout = Duration::from_secs(1);
    settings.login_timeout = Duration::from_secs(1);
    settings
}

pub fn endpoint(address: &str) -> HostEndpoint {
    HostEndpoint::new(address, "root", "secret")
}

// ============================================================================
// In-memory remote filesystem
// ============================================================================

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File(Vec<u8>),
}

/// In-memory directory tree shared by every connection to one host.
#[derive(Clone, Default)]
pub struct FakeFs {
    nodes: Arc<Mutex<BTreeMap<String, Node>>>,
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) => "/".to_string(),
        Some(i) => path[..i].to_string(),
        None => "/".to_string(),
    }
}

fn not_found(path: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("no such file: {}", path))
}

impl FakeFs {
    pub fn new() -> Self {
        let fs = Self::default();
        fs.nodes.lock().unwrap().insert("/".to_string(), Node::Dir);
        fs
    }

    pub fn mkdir_p(&self, path: &str) {
        let path = normalize(path);
        let mut nodes = self.nodes.lock().unwrap();
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current = format!("{}/{}", current, part);
            nodes.entry(current.clone()).or_insert(Node::Dir);
        }
    }

    pub fn write_file(&self, path: &str, content: &[u8]) {
        let path = normalize(path);
        self.mkdir_p(&parent_of(&path));
        self.nodes.lock().unwrap().insert(path, Node::File(content.to_vec()));
    }

    pub fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        match self.nodes.lock().unwrap().get(&normalize(path)) {
            Some(Node::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.nodes.lock().unwrap().contains_key(&normalize(path))
    }

    /// Files below `root`, relative to it.
    pub fn files_under(&self, root: &str) -> BTreeSet<String> {
        let prefix = format!("{}/", normalize(root));
        self.nodes
            .lock()
            .unwrap()
            .iter()
            .filter(|(path, node)| matches!(node, Node::File(_)) && path.starts_with(&prefix))
            .map(|(path, _)| path[prefix.len()..].to_string())
            .collect()
    }
}

impl RemoteFs for FakeFs {
    fn is_dir(&self, path: &str) -> io::Result<bool> {
        match self.nodes.lock().unwrap().get(&normalize(path)) {
            Some(Node::Dir) => Ok(true),
            Some(Node::File(_)) => Ok(false),
            None => Err(not_found(path)),
        }
    }

    fn list_dir(&self, path: &str) -> io::Result<Vec<String>> {
        let path = normalize(path);
        let nodes = self.nodes.lock().unwrap();
        match nodes.get(&path) {
            Some(Node::Dir) => {}
            _ => return Err(not_found(&path)),
        }
        Ok(nodes
            .keys()
            .filter(|p| *p != &path && parent_of(p) == path)
            .map(|p| p.rsplit('/').next().unwrap_or_default().to_string())
            .collect())
    }

    fn remove_file(&self, path: &str) -> io::Result<()> {
        let path = normalize(path);
        let mut nodes = self.nodes.lock().unwrap();
        match nodes.get(&path) {
            Some(Node::File(_)) => {
                nodes.remove(&path);
                Ok(())
            }
            _ => Err(not_found(&path)),
        }
    }

    fn remove_dir(&self, path: &str) -> io::Result<()> {
        let path = normalize(path);
        let mut nodes = self.nodes.lock().unwrap();
        if !matches!(nodes.get(&path), Some(Node::Dir)) {
            return Err(not_found(&path));
        }
        if nodes.keys().any(|p| *p != path && parent_of(p) == path) {
            return Err(io::Error::new(io::ErrorKind::Other, "directory not empty"));
        }
        nodes.remove(&path);
        Ok(())
    }

    fn mkdir(&self, path: &str) -> io::Result<()> {
        let path = normalize(path);
        let mut nodes = self.nodes.lock().unwrap();
        if nodes.contains_key(&path) {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, path));
        }
        if !matches!(nodes.get(&parent_of(&path)), Some(Node::Dir)) {
            return Err(not_found(&parent_of(&path)));
        }
        nodes.insert(path, Node::Dir);
        Ok(())
    }

    fn put(&self, local: &Path, remote: &str, _chunk_size: usize) -> io::Result<u64> {
        let data = std::fs::read(local)?;
        let remote = normalize(remote);
        let mut nodes = self.nodes.lock().unwrap();
        if !matches!(nodes.get(&parent_of(&remote)), Some(Node::Dir)) {
            return Err(not_found(&parent_of(&remote)));
        }
        let len = data.len() as u64;
        nodes.insert(remote, Node::File(data));
        Ok(len)
    }
}

// ============================================================================
// Scripted shell
// ============================================================================

/// What the fake shell prints in answer to one input line.
pub enum Reply {
    /// Text followed by a newline and the current shell prompt.
    Output(String),
    /// Text exactly as given, no prompt appended.
    Raw(String),
    /// Several chunks delivered on consecutive polls, no prompt appended.
    Chunks(Vec<String>),
    /// Nothing at all, as if the command never finishes.
    Silent,
}

/// Per-channel shell state seen by a responder.
pub struct ShellState {
    pub prompt: String,
    pub mode: String,
    pub echo: bool,
    pub fs: FakeFs,
}

pub type Responder = Arc<dyn Fn(&mut ShellState, &str) -> Reply + Send + Sync>;

/// Shell that understands the exit-status probe and `mkdir -p`. `exec`
/// returns the command output and exit code, or `None` to hang.
pub fn probe_shell<F>(exec: F) -> Responder
where
    F: Fn(&str) -> Option<(String, i32)> + Send + Sync + 'static,
{
    Arc::new(move |state: &mut ShellState, line: &str| {
        let Some(command) = line.strip_suffix(";echo ----$?----") else {
            return match exec(line) {
                Some((out, _)) => Reply::Output(out),
                None => Reply::Silent,
            };
        };
        if let Some(path) = command.strip_prefix("mkdir -p ") {
            state.fs.mkdir_p(path.trim());
            return Reply::Output("----0----".to_string());
        }
        match exec(command) {
            Some((out, code)) if out.is_empty() => Reply::Output(format!("----{}----", code)),
            Some((out, code)) => Reply::Output(format!("{}\r\n----{}----", out, code)),
            None => Reply::Silent,
        }
    })
}

/// Shell where every command succeeds with a fixed output.
pub fn ok_shell() -> Responder {
    probe_shell(|command| Some((format!("ran {}", command), 0)))
}

/// Management CLI behind `START_CLI -u <user>`.
///
/// Each unit in `drops` makes one CLI command fall back to the system shell.
/// Commands starting with `slow ` answer only after `SLOW_POLLS` empty polls.
pub fn cli_shell(users: &[(&str, &str)], drops: Arc<AtomicUsize>) -> Responder {
    let users: HashMap<String, String> = users
        .iter()
        .map(|(u, p)| (u.to_string(), p.to_string()))
        .collect();
    let start_prefix = format!("{} -u ", START_CLI);

    Arc::new(move |state: &mut ShellState, line: &str| {
        let mode = state.mode.clone();
        if let Some(user) = mode.strip_prefix("password:") {
            state.echo = true;
            return if users.get(user).map(String::as_str) == Some(line) {
                state.mode = format!("cli:{}", user);
                Reply::Raw(format!("\r\nWelcome {}\r\n{}", user, CLI_PROMPT))
            } else {
                state.mode = "shell".to_string();
                Reply::Output("\r\nAuthentication failed".to_string())
            };
        }

        if mode.starts_with("cli:") {
            return match line {
                "exit" => {
                    state.mode = "shell".to_string();
                    Reply::Output("Bye".to_string())
                }
                "\u{3}" => Reply::Raw(format!("^C\r\n{}", CLI_PROMPT)),
                _ if drops
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok() =>
                {
                    state.mode = "shell".to_string();
                    Reply::Output("Connection to CLI service lost".to_string())
                }
                cmd if cmd.starts_with("delete pool") => {
                    if cmd.ends_with(" 1") {
                        Reply::Raw("High risk operation, continue? (y/n):".to_string())
                    } else {
                        Reply::Raw(format!("Error: pool does not exist\r\n{}", CLI_PROMPT))
                    }
                }
                cmd if cmd.starts_with("slow ") => {
                    let mut chunks = vec![String::new(); SLOW_POLLS];
                    chunks.push(format!("{} done\r\n{}", cmd, CLI_PROMPT));
                    Reply::Chunks(chunks)
                }
                cmd => Reply::Raw(format!("{} done\r\n{}", cmd, CLI_PROMPT)),
            };
        }

        if let Some(user) = line.strip_prefix(&start_prefix) {
            state.mode = format!("password:{}", user.trim());
            state.echo = false;
            return Reply::Raw("Please input password:".to_string());
        }
        Reply::Output(String::new())
    })
}

// ============================================================================
// Fake hosts and connections
// ============================================================================

pub struct FakeHost {
    pub responder: Responder,
    pub fs: FakeFs,
    pub connects: AtomicUsize,
    pub failing_connects: AtomicUsize,
    pub shells_opened: AtomicUsize,
    pub never_ready: AtomicBool,
    pub silent_greeting: AtomicBool,
    pub received: Mutex<Vec<String>>,
}

impl FakeHost {
    pub fn new(responder: Responder) -> Arc<Self> {
        Arc::new(Self {
            responder,
            fs: FakeFs::new(),
            connects: AtomicUsize::new(0),
            failing_connects: AtomicUsize::new(0),
            shells_opened: AtomicUsize::new(0),
            never_ready: AtomicBool::new(false),
            silent_greeting: AtomicBool::new(false),
            received: Mutex::new(Vec::new()),
        })
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }
}

#[derive(Default)]
pub struct FakeConnector {
    hosts: Mutex<HashMap<String, Arc<FakeHost>>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, address: &str, host: Arc<FakeHost>) -> Arc<FakeHost> {
        self.hosts.lock().unwrap().insert(address.to_string(), Arc::clone(&host));
        host
    }
}

impl Connector for FakeConnector {
    fn connect(&self, endpoint: &HostEndpoint, _options: &SessionOptions) -> ssh_fleet::Result<Box<dyn Connection>> {
        let host = self
            .hosts
            .lock()
            .unwrap()
            .get(&endpoint.address)
            .cloned()
            .ok_or_else(|| FleetError::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "unknown host")))?;
        host.connects.fetch_add(1, Ordering::SeqCst);

        let failing = host.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            host.failing_connects.store(failing - 1, Ordering::SeqCst);
            return Err(FleetError::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused")));
        }
        Ok(Box::new(FakeConnection { host }))
    }
}

struct FakeConnection {
    host: Arc<FakeHost>,
}

impl Connection for FakeConnection {
    fn open_shell(&mut self, _options: &SessionOptions) -> ssh_fleet::Result<Box<dyn ShellChannel>> {
        self.host.shells_opened.fetch_add(1, Ordering::SeqCst);
        let mut pending = VecDeque::new();
        if !self.host.silent_greeting.load(Ordering::SeqCst) {
            pending.push_back(b"Welcome to fake host\r\nLast login: never\r\n# ".to_vec());
        }
        Ok(Box::new(FakeShell {
            host: Arc::clone(&self.host),
            state: ShellState {
                prompt: "# ".to_string(),
                mode: "shell".to_string(),
                echo: true,
                fs: self.host.fs.clone(),
            },
            pending,
            closed: false,
        }))
    }

    fn open_fs(&mut self) -> ssh_fleet::Result<Box<dyn RemoteFs>> {
        Ok(Box::new(self.host.fs.clone()))
    }

    fn disconnect(&mut self) -> ssh_fleet::Result<()> {
        Ok(())
    }
}

struct FakeShell {
    host: Arc<FakeHost>,
    state: ShellState,
    pending: VecDeque<Vec<u8>>,
    closed: bool,
}

fn parse_ps1(line: &str) -> Option<String> {
    let rest = line.strip_prefix("TMOUT=0;PS1='")?;
    let quoted = rest.strip_suffix('\'')?;
    Some(quoted.replace(r"'\''", "'"))
}

impl FakeShell {
    fn handle_line(&mut self, line: &str) {
        self.host.received.lock().unwrap().push(line.to_string());
        if self.host.silent_greeting.load(Ordering::SeqCst) {
            return;
        }

        if let Some(prompt) = parse_ps1(line) {
            self.state.prompt = prompt;
            self.pending
                .push_back(format!("{}\r\n{}", line, self.state.prompt).into_bytes());
            return;
        }

        if self.state.echo {
            self.pending.push_back(format!("{}\r\n", line).into_bytes());
        }
        let responder = Arc::clone(&self.host.responder);
        match responder(&mut self.state, line) {
            Reply::Output(text) if text.is_empty() => self.pending.push_back(self.state.prompt.clone().into_bytes()),
            Reply::Output(text) => self
                .pending
                .push_back(format!("{}\r\n{}", text, self.state.prompt).into_bytes()),
            Reply::Raw(text) => self.pending.push_back(text.into_bytes()),
            Reply::Chunks(chunks) => self.pending.extend(chunks.into_iter().map(String::into_bytes)),
            Reply::Silent => {}
        }
    }
}

impl ShellChannel for FakeShell {
    fn send_ready(&mut self) -> bool {
        !self.closed && !self.host.never_ready.load(Ordering::SeqCst)
    }

    fn recv_available(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        match self.pending.pop_front() {
            Some(chunk) => {
                buf.extend_from_slice(&chunk);
                Ok(chunk.len())
            }
            None => Ok(0),
        }
    }

    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"));
        }
        let text = String::from_utf8_lossy(data).to_string();
        for line in text.split('\n').filter(|l| !l.is_empty()) {
            self.handle_line(line.trim_end_matches('\r'));
        }
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        Ok(())
    }
}
