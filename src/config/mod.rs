pub mod model;
pub mod writer;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::config::model::AppConfig;
use crate::config::writer::atomic_write;

/// Return the XDG-compliant config file path.
///
/// - Linux/macOS: ~/.config/jumptunnel/config.toml
/// - Windows: %APPDATA%\jumptunnel\config.toml
pub fn config_path() -> PathBuf {
    let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from(".config"));
    config_dir.join("jumptunnel").join("config.toml")
}

/// Load config with an optional custom path override, then apply
/// `JUMPTUNNEL_*` environment overrides.
pub fn load_with_override(custom_path: Option<&str>) -> Result<AppConfig> {
    let path = resolve_config_path(custom_path);
    let mut config = load_from(&path)?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    Ok(config)
}

/// Save config with an optional custom path override.
pub fn save_with_override(config: &AppConfig, custom_path: Option<&str>) -> Result<PathBuf> {
    let path = resolve_config_path(custom_path);
    atomic_write(config, &path)?;
    Ok(path)
}

/// Resolve the effective config path from an optional override.
pub fn resolve_config_path(custom_path: Option<&str>) -> PathBuf {
    match custom_path {
        Some(p) => PathBuf::from(shellexpand::tilde(p).to_string()),
        None => config_path(),
    }
}

/// Load config from a specific path. A missing file yields the defaults.
pub fn load_from(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    check_permissions(path);

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Warn if the config file has permissions wider than 0600 on Unix.
#[cfg(unix)]
fn check_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Ok(metadata) = fs::metadata(path) {
        let mode = metadata.permissions().mode() & 0o777;
        if mode != 0o600 {
            warn!(
                path = %path.display(),
                mode = format!("{mode:o}"),
                "config file permissions are wider than 600"
            );
        }
    }
}

#[cfg(not(unix))]
fn check_permissions(_path: &Path) {
    // No permission checking on non-Unix platforms
}

// ---------------------------------------------------------------------------
// Environment overrides
// ---------------------------------------------------------------------------

pub const ENV_JUMP_HOST: &str = "JUMPTUNNEL_JUMP_HOST";
pub const ENV_JUMP_USER: &str = "JUMPTUNNEL_JUMP_USER";
pub const ENV_JUMP_KEY_PATH: &str = "JUMPTUNNEL_JUMP_KEY_PATH";
pub const ENV_SOCKS_PORT: &str = "JUMPTUNNEL_SOCKS_PORT";
pub const ENV_MASTER_HOST: &str = "JUMPTUNNEL_MASTER_HOST";
pub const ENV_DIRECT_ACCESS: &str = "JUMPTUNNEL_DIRECT_ACCESS";
pub const ENV_VERBOSE_SSH: &str = "JUMPTUNNEL_VERBOSE_SSH";
pub const ENV_GATLING_HOST: &str = "JUMPTUNNEL_GATLING_HOST";
pub const ENV_GATLING_PORT: &str = "JUMPTUNNEL_GATLING_PORT";
pub const ENV_GATLING_USER: &str = "JUMPTUNNEL_GATLING_USER";
pub const ENV_GATLING_KEY_PATH: &str = "JUMPTUNNEL_GATLING_KEY_PATH";
pub const ENV_GATLING_PROXY: &str = "JUMPTUNNEL_GATLING_PROXY";

/// Apply environment overrides on top of a loaded config.
///
/// `lookup` returns the value of a variable, if set. Empty values are
/// treated as unset.
pub fn apply_env_overrides(
    config: &mut AppConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

    if let Some(v) = get(ENV_JUMP_HOST) {
        config.jump.host = Some(v);
    }
    if let Some(v) = get(ENV_JUMP_USER) {
        config.jump.user = v;
    }
    if let Some(v) = get(ENV_JUMP_KEY_PATH) {
        config.jump.key_path = Some(v);
    }
    if let Some(v) = get(ENV_SOCKS_PORT) {
        config.jump.socks_port = parse_env(ENV_SOCKS_PORT, &v)?;
    }
    if let Some(v) = get(ENV_MASTER_HOST) {
        config.jump.master_host = v;
    }
    if let Some(v) = get(ENV_DIRECT_ACCESS) {
        config.jump.direct_access = parse_env_bool(ENV_DIRECT_ACCESS, &v)?;
    }
    if let Some(v) = get(ENV_VERBOSE_SSH) {
        config.jump.verbose_ssh = parse_env_bool(ENV_VERBOSE_SSH, &v)?;
    }
    if let Some(v) = get(ENV_GATLING_HOST) {
        config.gatling.host = Some(v);
    }
    if let Some(v) = get(ENV_GATLING_PORT) {
        config.gatling.port = parse_env(ENV_GATLING_PORT, &v)?;
    }
    if let Some(v) = get(ENV_GATLING_USER) {
        config.gatling.username = Some(v);
    }
    if let Some(v) = get(ENV_GATLING_KEY_PATH) {
        config.gatling.key_path = Some(v);
    }
    if let Some(v) = get(ENV_GATLING_PROXY) {
        config.gatling.proxy = Some(v);
    }

    Ok(())
}

fn parse_env<T>(name: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid value '{value}' for {name}"))
}

fn parse_env_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => anyhow::bail!("Invalid boolean '{value}' for {name}"),
    }
}
