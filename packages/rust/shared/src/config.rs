//! Application configuration for scanmark.
//!
//! User config lives at `~/.scanmark/scanmark.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScanmarkError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "scanmark.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".scanmark";

// ---------------------------------------------------------------------------
// Config structs (matching scanmark.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Bundle ingestion settings.
    #[serde(default)]
    pub scanning: ScanningConfig,

    /// Task leasing policy.
    #[serde(default)]
    pub tasks: TaskPolicyConfig,

    /// Version map generation.
    #[serde(default)]
    pub pqv: PqvConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Path of the libSQL database file.
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

fn default_database_path() -> String {
    "var/scanmark.db".into()
}

/// `[scanning]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanningConfig {
    /// Number of page images hashed concurrently by the background job.
    #[serde(default = "default_classify_concurrency")]
    pub classify_concurrency: u32,
}

impl Default for ScanningConfig {
    fn default() -> Self {
        Self {
            classify_concurrency: default_classify_concurrency(),
        }
    }
}

fn default_classify_concurrency() -> u32 {
    4
}

/// `[tasks]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPolicyConfig {
    /// Leases older than this are released by `expire-leases`.
    #[serde(default = "default_lease_timeout")]
    pub lease_timeout_secs: u64,

    /// Cap on `Out` + `Complete` tasks for users without an explicit quota.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_quota: Option<u32>,

    /// Tag attached to completed tasks whose rubric got a major revision.
    #[serde(default = "default_review_tag")]
    pub review_tag: String,
}

impl Default for TaskPolicyConfig {
    fn default() -> Self {
        Self {
            lease_timeout_secs: default_lease_timeout(),
            default_quota: None,
            review_tag: default_review_tag(),
        }
    }
}

fn default_lease_timeout() -> u64 {
    3600
}
fn default_review_tag() -> String {
    "rubric-revised".into()
}

/// `[pqv]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PqvConfig {
    /// Seed for reproducible version maps. Random when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.scanmark/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| ScanmarkError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.scanmark/scanmark.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| ScanmarkError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        ScanmarkError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    validate_config(&config)?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| ScanmarkError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| ScanmarkError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| ScanmarkError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Reject settings the engine cannot run with.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    if config.defaults.database_path.trim().is_empty() {
        return Err(ScanmarkError::config("defaults.database_path must not be empty"));
    }
    if config.scanning.classify_concurrency == 0 {
        return Err(ScanmarkError::config(
            "scanning.classify_concurrency must be at least 1",
        ));
    }
    if config.tasks.review_tag.starts_with('@') {
        return Err(ScanmarkError::config(
            "tasks.review_tag must not start with '@' (reserved for user flags)",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("database_path"));
        assert!(toml_str.contains("rubric-revised"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.tasks.lease_timeout_secs, 3600);
        assert_eq!(parsed.scanning.classify_concurrency, 4);
        assert!(parsed.pqv.seed.is_none());
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[tasks]
default_quota = 25

[pqv]
seed = 7
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.tasks.default_quota, Some(25));
        assert_eq!(config.tasks.review_tag, "rubric-revised");
        assert_eq!(config.pqv.seed, Some(7));
        assert_eq!(config.defaults.database_path, "var/scanmark.db");
    }

    #[test]
    fn reserved_review_tag_rejected() {
        let mut config = AppConfig::default();
        config.tasks.review_tag = "@lead".into();
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("reserved"));
    }
}
