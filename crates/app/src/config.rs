//! Config file discovery

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use tracing::info;

use tourgate_core::{ConfigError, EventConfig};

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "TOURGATE_CONFIG";

/// File name looked up in the per-user config directory
pub const CONFIG_FILE: &str = "event.toml";

/// Pick the config path: explicit argument, then the environment, then the
/// per-user config directory. Empty values are skipped.
pub fn discover(arg: Option<String>, env_value: Option<String>) -> Option<PathBuf> {
    arg.filter(|s| !s.is_empty())
        .or_else(|| env_value.filter(|s| !s.is_empty()))
        .map(PathBuf::from)
        .or_else(default_path)
}

fn default_path() -> Option<PathBuf> {
    ProjectDirs::from("dev", "onyx", "tourgate").map(|dirs| dirs.config_dir().join(CONFIG_FILE))
}

pub fn load(path: &Path) -> Result<EventConfig, ConfigError> {
    let config = EventConfig::load(path)?;
    info!(
        path = %path.display(),
        event = %config.event.name,
        sectors = config.sectors.len(),
        accounts = config.accounts.len(),
        "Loaded event config"
    );
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MINIMAL: &str = r#"
[event]
name = "Open Day"

[[sectors]]
name = "Labs"

[[sectors.rooms]]
name = "Clean Room"
capacity = 2
"#;

    #[test]
    fn test_argument_wins_over_environment() {
        let path = discover(Some("a.toml".into()), Some("b.toml".into())).unwrap();
        assert_eq!(path, PathBuf::from("a.toml"));

        let path = discover(Some(String::new()), Some("b.toml".into())).unwrap();
        assert_eq!(path, PathBuf::from("b.toml"));
    }

    #[test]
    fn test_falls_back_to_config_dir() {
        if let Some(path) = discover(None, None) {
            assert!(path.ends_with(CONFIG_FILE));
        }
    }

    #[test]
    fn test_load_discovered_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, MINIMAL).unwrap();

        let found = discover(None, Some(path.to_string_lossy().into_owned())).unwrap();
        let config = load(&found).unwrap();
        assert_eq!(config.event.name, "Open Day");
        assert_eq!(config.sectors[0].rooms[0].capacity, 2);
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let result = load(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }
}
