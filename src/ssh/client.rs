// SSH客户端封装（基于 ssh2）
use crate::config::{HostEndpoint, SessionOptions};
use crate::ssh::transport::{Connection, Connector, RemoteFs, ShellChannel};
use crate::utils::error::{FleetError, Result};
use secrecy::ExposeSecret;
use ssh2::{Channel, Session, Sftp};
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use tracing::debug;

/// 基于 ssh2 的连接器
#[derive(Debug, Clone, Copy, Default)]
pub struct SshConnector;

impl Connector for SshConnector {
    fn connect(&self, endpoint: &HostEndpoint, options: &SessionOptions) -> Result<Box<dyn Connection>> {
        Ok(Box::new(SshClient::connect(endpoint, options)?))
    }
}

pub struct SshClient {
    pub session: Session,
    host: String,
}

impl SshClient {
    pub fn connect(endpoint: &HostEndpoint, options: &SessionOptions) -> Result<Self> {
        let host = endpoint.address.clone();
        let addr = endpoint
            .socket_addr()
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| FleetError::InvalidConfig(format!("Cannot resolve {}", endpoint.socket_addr())))?;

        let tcp = TcpStream::connect_timeout(&addr, options.connect_timeout)?;

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.set_timeout(options.connect_timeout.as_millis() as u32);
        session.handshake()?;

        // 自动接受未知的主机密钥，仅记录类型
        if let Some((_, key_type)) = session.host_key() {
            debug!(host = %host, key_type = ?key_type, "Accepting host key");
        }

        session.userauth_password(&endpoint.username, endpoint.password.expose_secret())?;
        if !session.authenticated() {
            return Err(FleetError::Connection {
                host,
                attempts: 1,
                message: "authentication failed".to_string(),
            });
        }

        session.set_keepalive(true, options.keepalive_secs);
        // 握手完成后取消超时，读写由会话层轮询控制
        session.set_timeout(0);

        Ok(SshClient { session, host })
    }
}

impl Connection for SshClient {
    fn open_shell(&mut self, options: &SessionOptions) -> Result<Box<dyn ShellChannel>> {
        let mut channel = self.session.channel_session()?;
        let (width, height) = options.term_size;
        channel.request_pty(&options.term, None, Some((width, height, 0, 0)))?;
        channel.shell()?;
        Ok(Box::new(SshShell {
            session: self.session.clone(),
            channel,
        }))
    }

    fn open_fs(&mut self) -> Result<Box<dyn RemoteFs>> {
        let sftp = self.session.sftp()?;
        Ok(Box::new(SshFs { sftp }))
    }

    fn disconnect(&mut self) -> Result<()> {
        debug!(host = %self.host, "Disconnecting");
        self.session.disconnect(None, "closed by client", None)?;
        Ok(())
    }
}

pub struct SshShell {
    session: Session,
    channel: Channel,
}

impl ShellChannel for SshShell {
    fn send_ready(&mut self) -> bool {
        !self.channel.eof() && self.channel.write_window().remaining > 0
    }

    fn recv_available(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        // 临时切换为非阻塞，读到 WouldBlock 即视为当前没有更多数据
        self.session.set_blocking(false);
        let mut chunk = vec![0u8; 65535];
        let mut total = 0;
        let result = loop {
            match self.channel.read(&mut chunk) {
                Ok(0) => break Ok(total),
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(total),
                Err(e) => break Err(e),
            }
        };
        self.session.set_blocking(true);
        result
    }

    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.channel.write_all(data)?;
        self.channel.flush()
    }

    fn close(&mut self) -> io::Result<()> {
        self.channel.close().map_err(io::Error::from)
    }
}

pub struct SshFs {
    sftp: Sftp,
}

impl RemoteFs for SshFs {
    fn is_dir(&self, path: &str) -> io::Result<bool> {
        Ok(self.sftp.stat(Path::new(path))?.is_dir())
    }

    fn list_dir(&self, path: &str) -> io::Result<Vec<String>> {
        let entries = self.sftp.readdir(Path::new(path))?;
        Ok(entries
            .into_iter()
            .filter_map(|(p, _)| p.file_name().map(|n| n.to_string_lossy().to_string()))
            .filter(|n| n != "." && n != "..")
            .collect())
    }

    fn remove_file(&self, path: &str) -> io::Result<()> {
        Ok(self.sftp.unlink(Path::new(path))?)
    }

    fn remove_dir(&self, path: &str) -> io::Result<()> {
        Ok(self.sftp.rmdir(Path::new(path))?)
    }

    fn mkdir(&self, path: &str) -> io::Result<()> {
        Ok(self.sftp.mkdir(Path::new(path), 0o755)?)
    }

    fn put(&self, local: &Path, remote: &str, chunk_size: usize) -> io::Result<u64> {
        let mut local_file = File::open(local)?;
        let mut remote_file = self.sftp.create(Path::new(remote))?;

        let mut buffer = vec![0u8; chunk_size.max(8192)];
        let mut total = 0u64;
        loop {
            match local_file.read(&mut buffer)? {
                0 => break, // EOF
                n => {
                    remote_file.write_all(&buffer[..n])?;
                    total += n as u64;
                }
            }
        }

        // 某些服务器不支持 fsync，忽略错误
        remote_file.fsync().ok();
        Ok(total)
    }
}
