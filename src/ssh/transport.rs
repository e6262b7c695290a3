//! Transport seam between the session logic and the SSH library.
//!
//! `Session`, `RemoteFileMirror` and the dispatcher only talk to these traits;
//! `client.rs` implements them on top of `ssh2`.

use std::io;
use std::path::Path;
use std::sync::Arc;

use crate::config::{HostEndpoint, SessionOptions};
use crate::utils::error::Result;

/// Opens authenticated connections. Shared by every worker thread.
pub trait Connector: Send + Sync {
    fn connect(&self, endpoint: &HostEndpoint, options: &SessionOptions) -> Result<Box<dyn Connection>>;
}

impl<C: Connector + ?Sized> Connector for Arc<C> {
    fn connect(&self, endpoint: &HostEndpoint, options: &SessionOptions) -> Result<Box<dyn Connection>> {
        (**self).connect(endpoint, options)
    }
}

/// One authenticated connection to a host.
pub trait Connection: Send {
    /// Opens a new interactive shell channel with a pseudo terminal.
    fn open_shell(&mut self, options: &SessionOptions) -> Result<Box<dyn ShellChannel>>;

    /// Opens the file-transfer sub-channel.
    fn open_fs(&mut self) -> Result<Box<dyn RemoteFs>>;

    fn disconnect(&mut self) -> Result<()>;
}

/// A bidirectional byte stream over an authenticated connection.
pub trait ShellChannel: Send {
    /// True once the remote side accepts input.
    fn send_ready(&mut self) -> bool;

    /// Appends whatever bytes are available to `buf` without blocking.
    /// Returns the number of bytes appended.
    fn recv_available(&mut self, buf: &mut Vec<u8>) -> io::Result<usize>;

    fn send(&mut self, data: &[u8]) -> io::Result<()>;

    fn close(&mut self) -> io::Result<()>;
}

/// Remote filesystem primitives of the file-transfer sub-channel.
pub trait RemoteFs: Send {
    fn is_dir(&self, path: &str) -> io::Result<bool>;

    /// Entry names (not full paths) of a remote directory, without `.` and `..`.
    fn list_dir(&self, path: &str) -> io::Result<Vec<String>>;

    fn remove_file(&self, path: &str) -> io::Result<()>;

    fn remove_dir(&self, path: &str) -> io::Result<()>;

    fn mkdir(&self, path: &str) -> io::Result<()>;

    /// Copies a local file to `remote`, replacing it if present. Returns bytes written.
    fn put(&self, local: &Path, remote: &str, chunk_size: usize) -> io::Result<u64>;
}
