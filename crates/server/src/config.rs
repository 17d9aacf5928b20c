use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const CONFIG_VERSION: u32 = 2;

pub const DEFAULT_RADIO_DIRECTORY_URL: &str =
    "http://de2.api.radio-browser.info/json/stations/search";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GpodderAccount {
    pub base_url: String,
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserAccount {
    pub id: String,
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpodder: Option<GpodderAccount>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub version: u32,
    pub port: u16,
    pub index_path: String,
    pub users_root: String,
    pub users: Vec<UserAccount>,
    pub scan_interval_secs: u64,
    pub feed_refresh_interval_secs: u64,
    pub external_timeout_secs: u64,
    pub scratch_limit_bytes: u64,
    pub radio_directory_url: String,
    pub job_max_attempts: u32,
    pub job_retry_base_secs: u64,
    pub user_agent: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            port: 3000,
            index_path: "catalog.redb".to_string(),
            users_root: "users".to_string(),
            users: Vec::new(),
            scan_interval_secs: 60 * 60 * 6,
            feed_refresh_interval_secs: 60 * 60,
            external_timeout_secs: 10,
            scratch_limit_bytes: 2 * 1024 * 1024 * 1024,
            radio_directory_url: DEFAULT_RADIO_DIRECTORY_URL.to_string(),
            job_max_attempts: 3,
            job_retry_base_secs: 30,
            user_agent: "medialoft/0.1".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn user_by_token(&self, token: &str) -> Option<&UserAccount> {
        let token = token.trim();
        if token.is_empty() {
            return None;
        }
        self.users.iter().find(|user| user.token == token)
    }

    pub fn user(&self, id: &str) -> Option<&UserAccount> {
        self.users.iter().find(|user| user.id == id)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "io error: {}", err),
            ConfigError::Yaml(err) => write!(f, "yaml error: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Yaml(err)
    }
}

pub fn config_path_from_env() -> PathBuf {
    match env::var("MEDIALOFT_CONFIG") {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
        _ => default_config_path(),
    }
}

fn default_config_path() -> PathBuf {
    match env::current_exe() {
        Ok(exe) => exe
            .parent()
            .map(|dir| dir.join("config.yaml"))
            .unwrap_or_else(|| PathBuf::from("config.yaml")),
        Err(_) => PathBuf::from("config.yaml"),
    }
}

pub fn load_or_create_config(path: &Path) -> Result<(ServerConfig, bool), ConfigError> {
    if path.exists() {
        let contents = fs::read_to_string(path)?;
        let config: ServerConfig = serde_yaml::from_str(&contents)?;
        return Ok((normalize_config(config), false));
    }

    let config = ServerConfig::default();
    save_config(path, &config)?;
    Ok((config, true))
}

fn normalize_config(mut config: ServerConfig) -> ServerConfig {
    let defaults = ServerConfig::default();
    if config.version < CONFIG_VERSION {
        config.version = CONFIG_VERSION;
    }
    if config.port == 0 {
        config.port = defaults.port;
    }
    if config.index_path.trim().is_empty() {
        config.index_path = defaults.index_path;
    }
    if config.users_root.trim().is_empty() {
        config.users_root = defaults.users_root;
    }
    if config.external_timeout_secs == 0 {
        config.external_timeout_secs = defaults.external_timeout_secs;
    }
    if config.scratch_limit_bytes == 0 {
        config.scratch_limit_bytes = defaults.scratch_limit_bytes;
    }
    if config.radio_directory_url.trim().is_empty() {
        config.radio_directory_url = defaults.radio_directory_url;
    }
    if config.job_max_attempts == 0 {
        config.job_max_attempts = 1;
    }
    if config.user_agent.trim().is_empty() {
        config.user_agent = defaults.user_agent;
    }
    config.users.retain(|user| !user.id.trim().is_empty());
    let mut seen = std::collections::HashSet::new();
    config.users.retain(|user| seen.insert(user.id.clone()));
    config
}

pub fn save_config(path: &Path, config: &ServerConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let contents = serde_yaml::to_string(config)?;
    fs::write(path, contents)?;
    Ok(())
}

pub fn resolve_path(config_path: &Path, value: &str) -> PathBuf {
    let raw = PathBuf::from(value);
    if raw.is_absolute() {
        return raw;
    }
    let base = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    base.join(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_default_config_then_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let (config, created) = load_or_create_config(&path).unwrap();
        assert!(created);
        assert_eq!(config.feed_refresh_interval_secs, 3600);

        let (config, created) = load_or_create_config(&path).unwrap();
        assert!(!created);
        assert_eq!(config.port, 3000);
        assert_eq!(config.radio_directory_url, DEFAULT_RADIO_DIRECTORY_URL);
    }

    #[test]
    fn normalizes_partial_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "version: 1\nport: 0\nexternal_timeout_secs: 0\nusers:\n  - id: alice\n    token: secret\n    gpodder:\n      base_url: https://cloud.example.com\n      username: alice\n      password: pw\n  - id: alice\n    token: other\n  - id: ''\n    token: x\n",
        )
        .unwrap();
        let (config, _) = load_or_create_config(&path).unwrap();
        assert_eq!(config.version, CONFIG_VERSION);
        assert_eq!(config.port, 3000);
        assert_eq!(config.external_timeout_secs, 10);
        assert_eq!(config.users.len(), 1);
        assert_eq!(config.user_by_token("secret").map(|u| u.id.as_str()), Some("alice"));
        assert!(config.user_by_token("other").is_none());
        assert!(config.user_by_token("").is_none());
        assert!(config.user("alice").and_then(|u| u.gpodder.as_ref()).is_some());
    }

    #[test]
    fn resolves_relative_paths_against_config_dir() {
        let path = resolve_path(Path::new("/etc/medialoft/config.yaml"), "catalog.redb");
        assert_eq!(path, PathBuf::from("/etc/medialoft/catalog.redb"));
        let path = resolve_path(Path::new("/etc/medialoft/config.yaml"), "/var/lib/c.redb");
        assert_eq!(path, PathBuf::from("/var/lib/c.redb"));
    }
}
