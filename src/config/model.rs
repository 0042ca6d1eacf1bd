use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Characters that could enable shell injection when a host ends up inside
/// a remote command string.
const SHELL_METACHARACTERS: &[char] = &[
    ';', '|', '&', '$', '`', '(', ')', '{', '}', '<', '>', '\n', '\r',
];

/// Jump host account used when none is configured.
pub const DEFAULT_JUMP_USER: &str = "centos";

/// Local SOCKS proxy port.
pub const DEFAULT_SOCKS_PORT: u16 = 5555;

/// Second-hop host reached from the jump host by nested tunnels.
pub const DEFAULT_MASTER_HOST: &str = "k8s-master.cluster.local";

/// First candidate port for the remote end of a nested tunnel.
pub const DEFAULT_REMOTE_PORT_BASE: u16 = 5555;

/// Number of candidate remote ports scanned from the base port.
pub const DEFAULT_REMOTE_PORT_WINDOW: u16 = 100;

/// Local readiness probe: number of connect attempts.
pub const DEFAULT_READINESS_ATTEMPTS: u32 = 20;

/// Local readiness probe: delay between connect attempts (seconds).
pub const DEFAULT_READINESS_INTERVAL_SECS: u64 = 5;

/// Seconds between two Gatling result checks.
pub const DEFAULT_GATLING_POLL_INTERVAL_SECS: u64 = 300;

/// Result checks tolerated without simulation log growth.
pub const DEFAULT_GATLING_TRIALS_WITHOUT_LOG_CHANGE: u32 = 2;

/// SSH connection timeout for the Gatling host (seconds).
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 15;

/// Top-level application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub jump: JumpSettings,
    #[serde(default)]
    pub gatling: GatlingSettings,
}

/// Jump host and tunnel settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JumpSettings {
    /// Jump host name or IP. Required to open any tunnel.
    pub host: Option<String>,

    /// Account on the jump host.
    #[serde(default = "default_jump_user")]
    pub user: String,

    /// Private key for the jump host. `~` and `$VAR` are expanded.
    /// When unset the key is fetched from `key_source`.
    pub key_path: Option<String>,

    /// Local port of the SOCKS proxy.
    #[serde(default = "default_socks_port")]
    pub socks_port: u16,

    /// Host the nested tunnel hops to from the jump host.
    #[serde(default = "default_master_host")]
    pub master_host: String,

    /// The jump host reaches the private network itself, so a single hop
    /// is enough. Selects the simple tunnel over the nested one.
    #[serde(default)]
    pub direct_access: bool,

    /// Pass `-vvv` to ssh and `-v` to scp.
    #[serde(default)]
    pub verbose_ssh: bool,

    #[serde(default = "default_ssh_program")]
    pub ssh_program: String,

    #[serde(default = "default_scp_program")]
    pub scp_program: String,

    #[serde(default = "default_remote_port_base")]
    pub remote_port_base: u16,

    #[serde(default = "default_remote_port_window")]
    pub remote_port_window: u16,

    #[serde(default = "default_readiness_attempts")]
    pub readiness_attempts: u32,

    #[serde(default = "default_readiness_interval_secs")]
    pub readiness_interval_secs: u64,

    /// Repository holding the jump key, used when `key_path` is unset.
    pub key_source: Option<KeySource>,
}

/// Git repository that carries the jump host private key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeySource {
    /// Anything `git clone` accepts.
    pub repository: String,
    /// Key location relative to the repository root.
    pub path: String,
}

/// Remote Gatling host and package settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatlingSettings {
    pub host: Option<String>,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    pub username: Option<String>,

    pub key_path: Option<String>,

    /// Base URL of the package repository, ending with `/`.
    pub repo_url: Option<String>,

    /// Package name. Also the working directory on the Gatling host.
    #[serde(default = "default_repo_name")]
    pub repo_name: String,

    #[serde(default = "default_repo_version")]
    pub repo_version: String,

    /// Local cache directory for downloaded packages.
    pub download_directory: Option<String>,

    pub proxy: Option<String>,
    pub proxy_http_port: Option<u16>,
    pub proxy_https_port: Option<u16>,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_trials_without_log_change")]
    pub trials_without_log_change: u32,

    /// SSH connection timeout in seconds. Default: 15.
    pub connect_timeout_secs: Option<u64>,
}

fn default_jump_user() -> String {
    DEFAULT_JUMP_USER.into()
}

fn default_socks_port() -> u16 {
    DEFAULT_SOCKS_PORT
}

fn default_master_host() -> String {
    DEFAULT_MASTER_HOST.into()
}

fn default_ssh_program() -> String {
    "ssh".into()
}

fn default_scp_program() -> String {
    "scp".into()
}

fn default_remote_port_base() -> u16 {
    DEFAULT_REMOTE_PORT_BASE
}

fn default_remote_port_window() -> u16 {
    DEFAULT_REMOTE_PORT_WINDOW
}

fn default_readiness_attempts() -> u32 {
    DEFAULT_READINESS_ATTEMPTS
}

fn default_readiness_interval_secs() -> u64 {
    DEFAULT_READINESS_INTERVAL_SECS
}

fn default_ssh_port() -> u16 {
    22
}

fn default_repo_name() -> String {
    "gatling-simulations".into()
}

fn default_repo_version() -> String {
    "latest".into()
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_GATLING_POLL_INTERVAL_SECS
}

fn default_trials_without_log_change() -> u32 {
    DEFAULT_GATLING_TRIALS_WITHOUT_LOG_CHANGE
}

impl Default for JumpSettings {
    fn default() -> Self {
        Self {
            host: None,
            user: default_jump_user(),
            key_path: None,
            socks_port: default_socks_port(),
            master_host: default_master_host(),
            direct_access: false,
            verbose_ssh: false,
            ssh_program: default_ssh_program(),
            scp_program: default_scp_program(),
            remote_port_base: default_remote_port_base(),
            remote_port_window: default_remote_port_window(),
            readiness_attempts: default_readiness_attempts(),
            readiness_interval_secs: default_readiness_interval_secs(),
            key_source: None,
        }
    }
}

impl Default for GatlingSettings {
    fn default() -> Self {
        Self {
            host: None,
            port: default_ssh_port(),
            username: None,
            key_path: None,
            repo_url: None,
            repo_name: default_repo_name(),
            repo_version: default_repo_version(),
            download_directory: None,
            proxy: None,
            proxy_http_port: None,
            proxy_https_port: None,
            poll_interval_secs: default_poll_interval_secs(),
            trials_without_log_change: default_trials_without_log_change(),
            connect_timeout_secs: None,
        }
    }
}

impl JumpSettings {
    pub fn readiness_interval(&self) -> Duration {
        Duration::from_secs(self.readiness_interval_secs)
    }
}

impl GatlingSettings {
    /// Package file name: `<name>-<version>.jar`.
    pub fn package_file_name(&self) -> String {
        format!("{}-{}.jar", self.repo_name, self.repo_version)
    }

    /// Download URL: `<repo_url><name>/<version>/<file>`.
    pub fn package_url(&self) -> Option<String> {
        self.repo_url.as_ref().map(|base| {
            format!(
                "{base}{}/{}/{}",
                self.repo_name,
                self.repo_version,
                self.package_file_name()
            )
        })
    }

    /// Local path of the cached package.
    pub fn package_file_path(&self) -> PathBuf {
        let dir = match &self.download_directory {
            Some(dir) => PathBuf::from(shellexpand::tilde(dir).to_string()),
            None => dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from(".cache"))
                .join("jumptunnel")
                .join("gatling"),
        };
        dir.join(self.package_file_name())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(
            self.connect_timeout_secs
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
        )
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Validate a hostname: must be non-empty and contain no shell metacharacters.
pub fn validate_hostname(host: &str) -> Result<()> {
    if host.is_empty() {
        bail!("Hostname cannot be empty");
    }

    if let Some(bad_char) = host.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
        bail!(
            "Hostname '{}' contains forbidden character '{}'",
            host,
            bad_char
        );
    }

    Ok(())
}
