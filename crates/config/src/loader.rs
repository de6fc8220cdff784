use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::schema::BurrowConfig;

const CONFIG_FILENAME: &str = "burrow.toml";

/// Load config from the given path.
pub fn load_config(path: &Path) -> anyhow::Result<BurrowConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    Ok(toml::from_str(&raw)?)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./burrow.toml` (project-local)
/// 2. `~/.config/burrow/burrow.toml` (user-global)
///
/// Returns `BurrowConfig::default()` if no config file is found.
pub fn discover_and_load() -> BurrowConfig {
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            },
        }
    } else {
        debug!("no config file found, using defaults");
    }
    BurrowConfig::default()
}

fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from(CONFIG_FILENAME);
    if local.exists() {
        return Some(local);
    }
    let global = config_dir()?.join(CONFIG_FILENAME);
    global.exists().then_some(global)
}

/// Returns the user-global config directory (`~/.config/burrow/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "burrow").map(|d| d.config_dir().to_path_buf())
}

/// Returns the data directory used for the database and scratch state.
pub fn data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "burrow")
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_missing() {
        let cfg = BurrowConfig::default();
        assert_eq!(cfg.server.port, 7070);
        assert_eq!(cfg.history.buffer_capacity, 64 * 1024);
        assert_eq!(cfg.monitor.silence_threshold_secs, 30);
    }

    #[test]
    fn loads_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("burrow.toml");
        std::fs::write(&path, "[server]\nport = 9999\n\n[docker]\nimage = \"x:y\"\n").unwrap();

        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.server.port, 9999);
        assert_eq!(cfg.docker.image, "x:y");
        // Untouched sections keep their defaults.
        assert_eq!(cfg.terminal.idle_timeout_secs, 30 * 60);
    }

    #[test]
    fn rejects_malformed_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("burrow.toml");
        std::fs::write(&path, "server = [not toml").unwrap();
        assert!(load_config(&path).is_err());
    }
}
