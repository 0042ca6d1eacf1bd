use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use russh::client::{AuthResult, Handle};
use russh::keys::PrivateKeyWithHashAlg;
use russh::{ChannelMsg, Disconnect};
use russh_sftp::client::SftpSession;
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::protocol::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use super::RemoteHost;
use super::client::SessionHandler;
use super::command_line;
use super::error::{CommandError, SessionError};

/// Buffer size for SFTP file transfers (32 KB).
const SFTP_CHUNK_SIZE: usize = 32 * 1024;

/// Accumulates the messages of an exec channel.
///
/// Servers send the exit status after EOF, so reading continues until the
/// channel is closed.
#[derive(Debug, Default)]
struct ExecCollector {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: Option<u32>,
}

impl ExecCollector {
    /// Returns `false` once the channel is closed.
    fn accept(&mut self, msg: ChannelMsg) -> bool {
        match msg {
            ChannelMsg::Data { ref data } => self.stdout.extend_from_slice(data),
            ChannelMsg::ExtendedData { ref data, ext: 1 } => self.stderr.extend_from_slice(data),
            ChannelMsg::ExitStatus { exit_status } => self.exit_code = Some(exit_status),
            ChannelMsg::Close => return false,
            _ => {}
        }
        true
    }

    /// A missing exit status counts as failure.
    fn finish(self) -> ExecOutput {
        ExecOutput {
            stdout: String::from_utf8_lossy(&self.stdout).to_string(),
            stderr: String::from_utf8_lossy(&self.stderr).to_string(),
            exit_code: self.exit_code.unwrap_or(1),
        }
    }
}

/// Result of executing a single command on a remote host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: u32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn lines(&self) -> Vec<String> {
        self.stdout.lines().map(str::to_string).collect()
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// An authenticated russh connection, used where a long-lived session beats
/// spawning `ssh` per command.
pub struct SshSession {
    handle: Handle<SessionHandler>,
    target: String,
    user: String,
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("target", &self.target)
            .field("user", &self.user)
            .finish()
    }
}

impl SshSession {
    /// Connect and authenticate with a single private key.
    pub async fn connect(
        host: &str,
        port: u16,
        user: &str,
        key_path: &Path,
        timeout: Duration,
    ) -> Result<Self, SessionError> {
        let target = format!("{host}:{port}");
        let key = load_key(key_path)?;

        let config = russh::client::Config {
            inactivity_timeout: Some(timeout),
            ..<_>::default()
        };
        let connect_future = russh::client::connect(
            Arc::new(config),
            (host, port),
            SessionHandler::new(target.clone()),
        );

        let mut handle = match tokio::time::timeout(timeout, connect_future).await {
            Ok(result) => result.map_err(|source| SessionError::Connect {
                target: target.clone(),
                source,
            })?,
            Err(_) => {
                return Err(SessionError::Timeout {
                    target,
                    secs: timeout.as_secs(),
                });
            }
        };

        match handle.authenticate_publickey(user, key).await {
            Ok(AuthResult::Success) => {}
            Ok(AuthResult::Failure { .. }) => {
                return Err(SessionError::Auth {
                    user: user.to_string(),
                    target,
                });
            }
            Err(source) => return Err(SessionError::Connect { target, source }),
        }

        info!(target_host = %target, user, "SSH session established");
        Ok(Self {
            handle,
            target,
            user: user.to_string(),
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Run `command` through the remote shell and collect its output.
    pub async fn exec(&self, command: &str) -> Result<ExecOutput, SessionError> {
        debug!(host = %self.target, command, "executing remote command");

        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(SessionError::Channel)?;
        channel
            .exec(true, command)
            .await
            .map_err(SessionError::Channel)?;

        let (mut channel_rx, _channel_tx) = channel.split();
        let mut collector = ExecCollector::default();
        while let Some(msg) = channel_rx.wait().await {
            if !collector.accept(msg) {
                break;
            }
        }

        Ok(collector.finish())
    }

    /// Open an SFTP channel rooted at the remote login directory.
    pub async fn sftp(&self) -> Result<FileTransfer, SessionError> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(SessionError::Channel)?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(SessionError::Channel)?;

        let sftp = SftpSession::new(channel.into_stream()).await?;
        let cwd = sftp
            .canonicalize(".")
            .await
            .unwrap_or_else(|_| "/".to_string());

        Ok(FileTransfer { sftp, cwd })
    }

    pub async fn close(self) -> Result<(), SessionError> {
        debug!(host = %self.target, "closing SSH session");
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .map_err(SessionError::Channel)
    }
}

impl RemoteHost for SshSession {
    async fn execute(&self, command: &[String]) -> Result<Vec<String>, CommandError> {
        let line = command_line(command);
        let output = self.exec(&line).await?;
        if !output.success() {
            return Err(CommandError::Failed {
                command: line,
                status: format!("exit status: {}", output.exit_code),
                output: output.stderr,
            });
        }
        Ok(output.lines())
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<(), CommandError> {
        let transfer = self.sftp().await?;
        let result = transfer.put(local, remote).await;
        transfer.close().await;
        result.map_err(CommandError::from)
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.user, self.target)
    }
}

fn load_key(path: &Path) -> Result<PrivateKeyWithHashAlg, SessionError> {
    let key = russh::keys::load_secret_key(path, None).map_err(|source| SessionError::Key {
        path: path.display().to_string(),
        source,
    })?;
    Ok(PrivateKeyWithHashAlg::new(Arc::new(key), None))
}

// ---------------------------------------------------------------------------
// SFTP
// ---------------------------------------------------------------------------

/// SFTP channel with a working directory. Relative paths resolve against it.
pub struct FileTransfer {
    sftp: SftpSession,
    cwd: String,
}

impl FileTransfer {
    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    pub fn resolve(&self, path: &str) -> String {
        resolve_path(&self.cwd, path)
    }

    pub async fn chdir(&mut self, path: &str) -> Result<(), SessionError> {
        let new_path = self.resolve(path);
        self.cwd = self.sftp.canonicalize(&new_path).await?;
        Ok(())
    }

    /// Entry names in `path`, without `.` and `..`.
    pub async fn listdir(&self, path: &str) -> Result<Vec<String>, SessionError> {
        let entries = self.sftp.read_dir(self.resolve(path)).await?;
        Ok(entries
            .into_iter()
            .map(|e| e.file_name().to_string())
            .filter(|name| name != "." && name != "..")
            .collect())
    }

    /// Size of `path` without following links; 0 when it does not exist.
    pub async fn size(&self, path: &str) -> Result<u64, SessionError> {
        match self.sftp.symlink_metadata(self.resolve(path)).await {
            Ok(attrs) => Ok(attrs.size.unwrap_or(0)),
            Err(SftpError::Status(status)) if matches!(status.status_code, StatusCode::NoSuchFile) => {
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn put(&self, local: &Path, remote: &str) -> Result<(), SessionError> {
        let io_error = |source: std::io::Error| SessionError::Io {
            path: local.display().to_string(),
            source,
        };

        let mut local_file = tokio::fs::File::open(local).await.map_err(io_error)?;
        let mut remote_file = self.sftp.create(self.resolve(remote)).await?;

        let mut buf = vec![0u8; SFTP_CHUNK_SIZE];
        loop {
            let n = local_file.read(&mut buf).await.map_err(io_error)?;
            if n == 0 {
                break;
            }
            remote_file
                .write_all(&buf[..n])
                .await
                .map_err(|source| SessionError::Io {
                    path: remote.to_string(),
                    source,
                })?;
        }

        remote_file
            .shutdown()
            .await
            .map_err(|source| SessionError::Io {
                path: remote.to_string(),
                source,
            })?;
        debug!(local = %local.display(), remote, "uploaded file");
        Ok(())
    }

    pub async fn read_to_string(&self, path: &str) -> Result<String, SessionError> {
        let mut remote_file = self.sftp.open(self.resolve(path)).await?;
        let mut contents = String::new();
        remote_file
            .read_to_string(&mut contents)
            .await
            .map_err(|source| SessionError::Io {
                path: path.to_string(),
                source,
            })?;
        Ok(contents)
    }

    pub async fn close(self) {
        if let Err(e) = self.sftp.close().await {
            debug!(error = %e, "failed to close SFTP session");
        }
    }
}

/// Join `path` onto `cwd` unless it is absolute.
pub fn resolve_path(cwd: &str, path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else if path.is_empty() || path == "." {
        cwd.to_string()
    } else {
        format!("{}/{}", cwd.trim_end_matches('/'), path)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
