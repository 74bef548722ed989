//! Configuration loading from `~/.objbus/config.toml` with defaults.

use objbus_types::config::BusConfig;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Load the bus configuration from a TOML file, falling back to defaults
/// when the file is missing or unusable.
pub fn load_config(path: Option<&Path>) -> BusConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return BusConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<BusConfig>(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                BusConfig::default()
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            BusConfig::default()
        }
    }
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    objbus_home().join("config.toml")
}

/// Get the objbus home directory.
pub fn objbus_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".objbus")
}

#[cfg(test)]
mod tests {
    use super::*;
    use objbus_types::config::BlockStrategy;
    use std::io::Write;

    #[test]
    fn test_load_config_missing_file() {
        let config = load_config(Some(Path::new("/nonexistent/objbus.toml")));
        assert_eq!(config.log_level, "info");
        assert_eq!(config.call_timeout_ms, 25_000);
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "session_address = \"unix:path=/tmp/objbus-session\"\nblock_strategy = \"transport\"\nlog_level = \"debug\""
        )
        .unwrap();
        let config = load_config(Some(file.path()));
        assert_eq!(
            config.session_address.as_deref(),
            Some("unix:path=/tmp/objbus-session")
        );
        assert_eq!(config.block_strategy, BlockStrategy::Transport);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_load_config_invalid_toml_falls_back() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "call_timeout_ms = \"soon\"").unwrap();
        let config = load_config(Some(file.path()));
        assert_eq!(config.call_timeout_ms, 25_000);
    }

    #[test]
    fn test_default_paths() {
        assert!(default_config_path().ends_with(".objbus/config.toml"));
        assert!(objbus_home().ends_with(".objbus"));
    }
}
