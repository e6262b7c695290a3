use std::time::Duration;
use thiserror::Error;

use crate::dispatch::HostOutcome;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Failed to connect to {host} after {attempts} attempt(s): {message}")]
    Connection {
        host: String,
        attempts: u32,
        message: String,
    },

    #[error("Channel on {host} not ready for input after {waited:?}")]
    ChannelNotReady { host: String, waited: Duration },

    #[error("No greeting received from {host} within {waited:?}")]
    GreetingTimeout { host: String, waited: Duration },

    #[error("Channel {channel} on {host} is closed or was never opened")]
    ChannelClosed { host: String, channel: usize },

    #[error("CLI login as {username} on {host} rejected, output: {output}")]
    LoginRejected {
        host: String,
        username: String,
        output: String,
    },

    #[error("Not a valid directory: {path}")]
    NotADirectory { path: String },

    #[error("Remote {op} failed on {path}: {source}")]
    RemoteFs {
        op: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{} host(s) failed: {}", failures.len(), summarize(failures))]
    Dispatch { failures: Vec<HostOutcome> },

    #[error("Thread join error")]
    ThreadJoinError,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),
}

pub type Result<T, E = FleetError> = std::result::Result<T, E>;

fn summarize(failures: &[HostOutcome]) -> String {
    failures
        .iter()
        .map(|f| format!("[{}] {}", f.host, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl FleetError {
    pub(crate) fn remote_fs(op: &'static str, path: &str, source: std::io::Error) -> Self {
        FleetError::RemoteFs {
            op,
            path: path.to_string(),
            source,
        }
    }
}
