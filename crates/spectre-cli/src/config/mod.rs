//! Configuration loading and resolution.

use std::path::{Path, PathBuf};

use anyhow::Context;
use spectre::SpectreConfig;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV_VAR: &str = "SPECTRE_CONFIG_PATH";

/// Environment variable overriding the database location.
pub const DB_ENV_VAR: &str = "SPECTRE_DB_PATH";

/// Configuration file used when nothing else is given.
pub const DEFAULT_CONFIG_NAME: &str = "spectre.yaml";

/// Resolve the configuration file path: flag, then environment, then
/// `./spectre.yaml`.
pub fn resolve_config_path(explicit: Option<&str>) -> PathBuf {
    pick_config_path(explicit, std::env::var(CONFIG_ENV_VAR).ok().as_deref())
}

fn pick_config_path(explicit: Option<&str>, from_env: Option<&str>) -> PathBuf {
    if let Some(path) = explicit {
        return PathBuf::from(path);
    }

    if let Some(env_path) = from_env.filter(|p| !p.trim().is_empty()) {
        let candidate = PathBuf::from(env_path);
        if candidate.exists() {
            return candidate;
        }
        tracing::warn!("Config file from {CONFIG_ENV_VAR} does not exist: {env_path}");
    }

    PathBuf::from(DEFAULT_CONFIG_NAME)
}

/// Load the resolved configuration and apply the database override
/// (`--database`, then `SPECTRE_DB_PATH`).
pub fn load_config(
    explicit: Option<&str>,
    database: Option<&str>,
) -> anyhow::Result<SpectreConfig> {
    let path = resolve_config_path(explicit);
    let env_db = std::env::var(DB_ENV_VAR).ok();
    let database = database.or(env_db.as_deref().filter(|p| !p.trim().is_empty()));
    load_config_from(&path, explicit.is_some(), database)
}

/// Read `path`, falling back to defaults when it is missing and was not asked
/// for explicitly.
pub fn load_config_from(
    path: &Path,
    required: bool,
    database: Option<&str>,
) -> anyhow::Result<SpectreConfig> {
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config = SpectreConfig::from_yaml_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        tracing::debug!("Loaded configuration from {}", path.display());
        config
    } else if required {
        anyhow::bail!("Config file not found: {}", path.display());
    } else {
        tracing::warn!(
            "No configuration file found, using defaults. Create {DEFAULT_CONFIG_NAME} or set {CONFIG_ENV_VAR}."
        );
        SpectreConfig::default()
    };

    if let Some(db) = database {
        config.database_path = PathBuf::from(db);
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_path_wins() {
        let path = pick_config_path(Some("custom.yaml"), Some("/elsewhere.yaml"));
        assert_eq!(path, PathBuf::from("custom.yaml"));
    }

    #[test]
    fn test_env_path_used_when_it_exists() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("env.yaml");
        std::fs::write(&file, "project: env\n").unwrap();
        let path = pick_config_path(None, file.to_str());
        assert_eq!(path, file);
    }

    #[test]
    fn test_missing_env_path_falls_back_to_default() {
        let path = pick_config_path(None, Some("/definitely/not/here.yaml"));
        assert_eq!(path, PathBuf::from(DEFAULT_CONFIG_NAME));
        assert_eq!(pick_config_path(None, None), PathBuf::from(DEFAULT_CONFIG_NAME));
    }
}
