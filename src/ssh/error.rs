use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while resolving a jump host endpoint.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("missing jump host configuration")]
    MissingHost,

    #[error("invalid jump host: {0}")]
    InvalidHost(String),

    #[error("no such key file: {}", path.display())]
    KeyNotFound { path: PathBuf },

    #[error("no jump key configured and no key source to fetch one from")]
    NoKeySource,

    #[error("failed to fetch jump key from {repository}: {reason}")]
    KeyFetch { repository: String, reason: String },

    #[error(
        "private key {} is accessible by other users (mode {mode:o}), run chmod 600 on it",
        path.display()
    )]
    KeyExposed { path: PathBuf, mode: u32 },

    #[error("failed to restrict permissions of {}: {source}", path.display())]
    KeyPermissions {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Errors from running a command on a remote host.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The local ssh/scp process could not be started.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The command ran but exited unsuccessfully.
    #[error("`{command}` exited with {status}: {output}")]
    Failed {
        command: String,
        status: String,
        output: String,
    },

    #[error("`{command}` did not finish within {secs}s")]
    Timeout { command: String, secs: u64 },

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Errors from the russh-backed session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: russh::Error,
    },

    #[error("connection to {target} timed out after {secs}s")]
    Timeout { target: String, secs: u64 },

    #[error("failed to load SSH key {path}: {source}")]
    Key {
        path: String,
        #[source]
        source: russh::keys::Error,
    },

    #[error("authentication failed for {user}@{target}")]
    Auth { user: String, target: String },

    #[error("SSH channel error: {0}")]
    Channel(#[source] russh::Error),

    #[error("SFTP error: {0}")]
    Sftp(#[from] russh_sftp::client::error::Error),

    #[error("SFTP I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Errors from listing remote processes.
#[derive(Debug, Error)]
pub enum ProcessListError {
    #[error("there seems to be no header in output of '{command}'")]
    HeaderNotFound { command: String },

    #[error(transparent)]
    Command(#[from] CommandError),
}

/// A tunnel command matched the remote tunnel prefix but carries no usable port.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortParseError {
    #[error("process command does not include '-D': {command}")]
    FlagMissing { command: String },

    #[error("did not find port in command '{command}'")]
    InvalidPort { command: String },
}

/// Errors from choosing the remote port of a nested tunnel.
#[derive(Debug, Error)]
pub enum PortDiscoveryError {
    #[error("failed to list jump host processes: {0}")]
    Listing(#[from] ProcessListError),

    #[error(transparent)]
    Unparseable(#[from] PortParseError),

    #[error("no free port on the jump host among {window} ports from {base}")]
    Exhausted { base: u16, window: u16 },
}

/// Errors from opening or closing a tunnel. Each variant names the stage
/// that failed.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("tunnel is already open")]
    AlreadyOpen,

    #[error("tunnel is not open")]
    NotOpen,

    #[error("remote port discovery failed: {0}")]
    PortDiscovery(#[from] PortDiscoveryError),

    #[error("failed to copy key to the jump host: {0}")]
    KeyCopy(#[source] CommandError),

    #[error("failed to spawn tunnel process {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("tunnel process exited before port {port} was ready ({status})")]
    ProcessExited { port: u16, status: String },

    #[error("local port {port} not ready after {attempts} attempts: {source}")]
    Readiness {
        port: u16,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("failed to clean up the remote tunnel process: {0}")]
    RemoteCleanup(#[source] ProcessListError),
}
