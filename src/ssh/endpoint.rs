use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::config::model::{JumpSettings, KeySource, validate_hostname};

use super::error::{CommandError, EndpointError};
use super::{RemoteHost, command_line, tokens};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// `-o` options passed to every ssh/scp invocation. Jump hosts are
/// ephemeral, so host keys are neither checked nor recorded.
pub const AUTH_OPTIONS: [&str; 3] = [
    "UserKnownHostsFile=/dev/null",
    "StrictHostKeyChecking=no",
    "GSSAPIAuthentication=no",
];

/// Number of completion checks for an scp transfer.
pub const SCP_WAIT_CHECKS: u32 = 5;

/// Delay between two scp completion checks.
pub const SCP_WAIT_INTERVAL: Duration = Duration::from_secs(30);

/// Longest command output kept in an error message.
const MAX_OUTPUT_EXCERPT: usize = 50_000;

/// Auth options as separate `-o` tokens.
pub fn auth_options() -> Vec<String> {
    AUTH_OPTIONS
        .iter()
        .flat_map(|option| ["-o", *option])
        .map(String::from)
        .collect()
}

// ---------------------------------------------------------------------------
// TunnelEndpoint
// ---------------------------------------------------------------------------

/// Connection material for one SSH hop, plus the command templates built
/// from it. Token order is stable so the resulting command lines can be
/// matched against a remote process listing later.
pub trait TunnelEndpoint: RemoteHost + Send + Sync {
    fn host(&self) -> &str;

    fn username(&self) -> &str;

    /// Private key file used by both ssh and scp.
    fn key_path(&self) -> &Path;

    /// `ssh [-vvv] -i <key> -o ... <user>@<host>`
    fn ssh_command(&self) -> Vec<String>;

    /// `scp [-v] -r -i <key> -o ...`
    fn scp_command(&self) -> Vec<String>;
}

// ---------------------------------------------------------------------------
// JumpClient
// ---------------------------------------------------------------------------

/// Jump host endpoint driven through the OpenSSH `ssh` and `scp` binaries.
#[derive(Debug)]
pub struct JumpClient {
    host: String,
    username: String,
    key_path: PathBuf,
    verbose: bool,
    ssh_program: String,
    scp_program: String,
    /// Holds a downloaded key until `cleanup`.
    key_dir: Mutex<Option<TempDir>>,
}

impl JumpClient {
    /// Resolve host and key for `username` on the configured jump host.
    ///
    /// A configured key must exist. Without one, the key repository from
    /// `key_source` is cloned into a temporary directory which lives until
    /// [`JumpClient::cleanup`] or drop.
    pub fn new(username: impl Into<String>, settings: &JumpSettings) -> Result<Self, EndpointError> {
        let host = settings
            .host
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or(EndpointError::MissingHost)?;
        validate_hostname(host).map_err(|e| EndpointError::InvalidHost(e.to_string()))?;

        let (key_path, key_dir) = match &settings.key_path {
            Some(configured) => (resolve_configured_key(configured)?, None),
            None => {
                let source = settings
                    .key_source
                    .as_ref()
                    .ok_or(EndpointError::NoKeySource)?;
                let (dir, path) = fetch_key(source)?;
                (path, Some(dir))
            }
        };

        Ok(Self {
            host: host.to_string(),
            username: username.into(),
            key_path,
            verbose: settings.verbose_ssh,
            ssh_program: settings.ssh_program.clone(),
            scp_program: settings.scp_program.clone(),
            key_dir: Mutex::new(key_dir),
        })
    }

    /// `user@host`
    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }

    /// Whether a downloaded key directory is still held.
    pub fn owns_key_dir(&self) -> bool {
        self.key_dir
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Run `remote_command` on the jump host and return its stdout lines.
    pub async fn ssh(&self, remote_command: &[String]) -> Result<Vec<String>, CommandError> {
        let mut command = self.ssh_command();
        command.extend_from_slice(remote_command);
        debug!(command = %command_line(&command), "running ssh");

        let output = tokio::process::Command::new(&command[0])
            .args(&command[1..])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| CommandError::Spawn {
                program: command[0].clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            debug!(stderr = %stderr.trim_end(), "ssh stderr");
        }

        if !output.status.success() {
            return Err(CommandError::Failed {
                command: command_line(&command),
                status: output.status.to_string(),
                output: excerpt(&format!("{stdout}{stderr}")),
            });
        }

        Ok(stdout.lines().map(str::to_string).collect())
    }

    /// Copy a local path to `target` on the jump host.
    pub async fn scp_to_remote(&self, source: &Path, target: &str) -> Result<(), CommandError> {
        let mut command = self.scp_command();
        command.push(source.to_string_lossy().into_owned());
        command.push(format!("{}:{target}", self.destination()));
        run_to_completion(command).await
    }

    /// Copy `source` on the jump host to a local path.
    pub async fn scp_from_remote(&self, source: &str, target: &Path) -> Result<(), CommandError> {
        let mut command = self.scp_command();
        command.push(format!("{}:{source}", self.destination()));
        command.push(target.to_string_lossy().into_owned());
        run_to_completion(command).await
    }

    /// Remove the downloaded key directory, if any. Safe to call repeatedly.
    pub fn cleanup(&self) {
        let dir = self
            .key_dir
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(dir) = dir {
            let path = dir.path().to_path_buf();
            debug!(path = %path.display(), "removing key directory");
            if let Err(e) = dir.close() {
                warn!(path = %path.display(), error = %e, "failed to remove key directory");
            }
        }
    }
}

impl TunnelEndpoint for JumpClient {
    fn host(&self) -> &str {
        &self.host
    }

    fn username(&self) -> &str {
        &self.username
    }

    fn key_path(&self) -> &Path {
        &self.key_path
    }

    fn ssh_command(&self) -> Vec<String> {
        let mut command = vec![self.ssh_program.clone()];
        if self.verbose {
            command.push("-vvv".into());
        }
        command.push("-i".into());
        command.push(self.key_path.to_string_lossy().into_owned());
        command.extend(auth_options());
        command.push(self.destination());
        command
    }

    fn scp_command(&self) -> Vec<String> {
        let mut command = vec![self.scp_program.clone()];
        if self.verbose {
            command.push("-v".into());
        }
        command.extend(tokens(["-r", "-i"]));
        command.push(self.key_path.to_string_lossy().into_owned());
        command.extend(auth_options());
        command
    }
}

impl RemoteHost for JumpClient {
    async fn execute(&self, command: &[String]) -> Result<Vec<String>, CommandError> {
        self.ssh(command).await
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<(), CommandError> {
        self.scp_to_remote(local, remote).await
    }

    fn describe(&self) -> String {
        self.destination()
    }
}

// ---------------------------------------------------------------------------
// Key resolution
// ---------------------------------------------------------------------------

/// Expand `~` and `$VAR` in a configured key path and check it exists with
/// owner-only permissions.
fn resolve_configured_key(configured: &str) -> Result<PathBuf, EndpointError> {
    let expanded = shellexpand::full(configured)
        .map(|p| PathBuf::from(p.as_ref()))
        .map_err(|_| EndpointError::KeyNotFound {
            path: PathBuf::from(configured),
        })?;

    if !expanded.is_file() {
        return Err(EndpointError::KeyNotFound { path: expanded });
    }

    check_key_private(&expanded)?;
    Ok(expanded)
}

/// Clone the key repository into a fresh temporary directory and lock the
/// key down to 0600.
fn fetch_key(source: &KeySource) -> Result<(TempDir, PathBuf), EndpointError> {
    let fetch_error = |reason: String| EndpointError::KeyFetch {
        repository: source.repository.clone(),
        reason,
    };

    let dir = tempfile::Builder::new()
        .prefix("jumptunnel-key-")
        .tempdir()
        .map_err(|e| fetch_error(e.to_string()))?;

    info!(repository = %source.repository, "downloading repository with ssh key");
    let output = std::process::Command::new("git")
        .args(["clone", "--quiet", "--depth", "1", &source.repository])
        .arg(dir.path())
        .stdin(Stdio::null())
        .output()
        .map_err(|e| fetch_error(format!("failed to run git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(fetch_error(format!(
            "git clone exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let key_path = dir.path().join(&source.path);
    if !key_path.is_file() {
        return Err(EndpointError::KeyNotFound { path: key_path });
    }

    restrict_permissions(&key_path)?;
    Ok((dir, key_path))
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), EndpointError> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|source| {
        EndpointError::KeyPermissions {
            path: path.to_path_buf(),
            source,
        }
    })
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), EndpointError> {
    Ok(())
}

/// ssh refuses keys readable by others; fail before any command is built.
#[cfg(unix)]
fn check_key_private(path: &Path) -> Result<(), EndpointError> {
    use std::os::unix::fs::PermissionsExt;

    let mode = fs::metadata(path)
        .map_err(|_| EndpointError::KeyNotFound {
            path: path.to_path_buf(),
        })?
        .permissions()
        .mode()
        & 0o777;
    if mode & 0o077 != 0 {
        return Err(EndpointError::KeyExposed {
            path: path.to_path_buf(),
            mode,
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_key_private(_path: &Path) -> Result<(), EndpointError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Local process helpers
// ---------------------------------------------------------------------------

/// Run a local command, checking for completion `SCP_WAIT_CHECKS` times.
/// The process is killed when it is still running after the last check.
async fn run_to_completion(command: Vec<String>) -> Result<(), CommandError> {
    let line = command_line(&command);
    info!(command = %line, "executing command");

    let mut child = tokio::process::Command::new(&command[0])
        .args(&command[1..])
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| CommandError::Spawn {
            program: command[0].clone(),
            source,
        })?;

    for check in 1..=SCP_WAIT_CHECKS {
        match tokio::time::timeout(SCP_WAIT_INTERVAL, child.wait()).await {
            Ok(Ok(status)) if status.success() => return Ok(()),
            Ok(Ok(status)) => {
                return Err(CommandError::Failed {
                    command: line,
                    status: status.to_string(),
                    output: String::new(),
                });
            }
            Ok(Err(source)) => {
                return Err(CommandError::Spawn {
                    program: command[0].clone(),
                    source,
                });
            }
            Err(_) => {
                info!(command = %line, check, "waiting for command to finish");
            }
        }
    }

    info!(command = %line, "killing command");
    let _ = child.kill().await;
    Err(CommandError::Timeout {
        command: line,
        secs: SCP_WAIT_INTERVAL.as_secs() * u64::from(SCP_WAIT_CHECKS),
    })
}

/// Shorten long output, keeping its start and end.
fn excerpt(output: &str) -> String {
    let total = output.chars().count();
    if total <= MAX_OUTPUT_EXCERPT {
        return output.to_string();
    }
    let half = MAX_OUTPUT_EXCERPT / 2;
    let start: String = output.chars().take(half).collect();
    let end: String = output.chars().skip(total - half).collect();
    format!("{start} [...] {end}")
}
