//! Config path resolution

use std::path::PathBuf;

use super::{ConfigError, ConfigResult};

/// Environment variable overriding the config path
pub const CONFIG_ENV: &str = "HIJACK_CONFIG";

pub const CONFIG_FILE_NAME: &str = "hijack.toml";

/// Returns the config file path.
///
/// `$HIJACK_CONFIG` if set and non-empty, otherwise `hijack.toml` in the
/// directory of the running executable.
pub fn config_path() -> ConfigResult<PathBuf> {
    resolve(std::env::var_os(CONFIG_ENV).map(PathBuf::from), || {
        std::env::current_exe().map_err(ConfigError::IoError)
    })
}

fn resolve(
    env: Option<PathBuf>,
    exe: impl FnOnce() -> ConfigResult<PathBuf>,
) -> ConfigResult<PathBuf> {
    if let Some(path) = env.filter(|p| !p.as_os_str().is_empty()) {
        return Ok(path);
    }

    exe()?
        .parent()
        .map(|dir| dir.join(CONFIG_FILE_NAME))
        .ok_or(ConfigError::NoConfigPath)
}
