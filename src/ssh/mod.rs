// SSH模块入口
pub mod cli_session;
pub mod client;
pub mod session;
pub mod transport;

pub use cli_session::{CliSession, CliState};
pub use client::{SshClient, SshConnector};
pub use session::{ChannelId, CommandResult, Completion, Session};
pub use transport::{Connection, Connector, RemoteFs, ShellChannel};
