use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tempfile::NamedTempFile;

use crate::config::model::AppConfig;

/// Comment block written above a generated config.
const CONFIG_HEADER: &str = "\
# jumptunnel configuration
#
# Every [jump] key can also be set through JUMPTUNNEL_* environment variables,
# e.g. JUMPTUNNEL_JUMP_HOST, JUMPTUNNEL_SOCKS_PORT, JUMPTUNNEL_DIRECT_ACCESS.
# Environment values win over this file.

";

/// Render a config as commented TOML.
pub fn render(config: &AppConfig) -> Result<String> {
    let body = toml::to_string_pretty(config).context("Failed to serialize config to TOML")?;
    Ok(format!("{CONFIG_HEADER}{body}"))
}

/// Atomically write config to disk: temp file in the target directory,
/// 0600 on Unix, then rename into place.
pub fn atomic_write(config: &AppConfig, path: &Path) -> Result<()> {
    let toml_str = render(config)?;

    let parent = path
        .parent()
        .context("Config path has no parent directory")?;
    fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;

    let temp_file =
        NamedTempFile::new_in(parent).context("Failed to create temporary config file")?;

    fs::write(temp_file.path(), &toml_str).context("Failed to write config to temporary file")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o600);
        fs::set_permissions(temp_file.path(), perms)
            .context("Failed to set config file permissions")?;
    }

    temp_file
        .persist(path)
        .context("Failed to atomically replace config file")?;

    Ok(())
}
