use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use library::{BatchFailurePolicy, ScanOptions, DEFAULT_BATCH_SIZE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::external::Provider;
use crate::retry::RetryPolicy;

pub const CONFIG_VERSION: u32 = 1;
pub const CONFIG_ENV: &str = "MUSIC_CATALOG_CONFIG";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataSourceConfig {
    pub provider: Provider,
    pub enabled: bool,
    pub api_key: String,
    pub user_agent: String,
}

impl Default for MetadataSourceConfig {
    fn default() -> Self {
        Self {
            provider: Provider::TheAudioDb,
            enabled: true,
            api_key: String::new(),
            user_agent: String::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub version: u32,
    pub music_roots: Vec<String>,
    pub index_path: String,
    pub cache_path: String,
    pub port: u16,
    pub watch_music: bool,
    pub watch_debounce_secs: u64,
    pub scan_on_start: bool,
    pub scan_batch_size: usize,
    pub scan_workers: usize,
    pub batch_failure_policy: BatchFailurePolicy,
    /// Left unset on purpose: scans refuse to run until this is configured.
    pub artist_separators: Option<Vec<String>>,
    pub external_metadata_enabled: bool,
    pub external_metadata_sources: Vec<MetadataSourceConfig>,
    pub external_metadata_min_interval_secs: u64,
    pub external_metadata_timeout_secs: u64,
    pub external_metadata_scan_limit: usize,
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    /// Caps every backoff, including provider retry-after hints.
    pub retry_max_delay_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            music_roots: Vec::new(),
            index_path: "catalog.redb".to_string(),
            cache_path: "cache".to_string(),
            port: 3000,
            watch_music: true,
            watch_debounce_secs: 2,
            scan_on_start: true,
            scan_batch_size: DEFAULT_BATCH_SIZE,
            scan_workers: 0,
            batch_failure_policy: BatchFailurePolicy::Continue,
            artist_separators: None,
            external_metadata_enabled: false,
            external_metadata_sources: Vec::new(),
            external_metadata_min_interval_secs: 60 * 60 * 24,
            external_metadata_timeout_secs: 8,
            external_metadata_scan_limit: 50,
            retry_max_attempts: 3,
            retry_base_delay_ms: 2000,
            retry_max_delay_secs: 60,
        }
    }
}

impl ServerConfig {
    pub fn scan_options(&self, config_path: &Path) -> ScanOptions {
        let batch_size = if self.scan_batch_size == 0 {
            DEFAULT_BATCH_SIZE
        } else {
            self.scan_batch_size
        };
        ScanOptions {
            batch_size,
            workers: self.scan_workers,
            artist_separators: self.artist_separators.clone(),
            failure_policy: self.batch_failure_policy,
            cover_cache_dir: Some(self.cache_dir(config_path)),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_max_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
        )
        .with_max_delay(Duration::from_secs(self.retry_max_delay_secs))
    }

    pub fn cache_dir(&self, config_path: &Path) -> PathBuf {
        let value = self.cache_path.trim();
        resolve_path(config_path, if value.is_empty() { "cache" } else { value })
    }

    pub fn index_file(&self, config_path: &Path) -> PathBuf {
        let value = self.index_path.trim();
        resolve_path(
            config_path,
            if value.is_empty() { "catalog.redb" } else { value },
        )
    }

    pub fn roots(&self, config_path: &Path) -> Vec<PathBuf> {
        self.music_roots
            .iter()
            .filter_map(|value| resolve_music_root(config_path, value))
            .collect()
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.external_metadata_min_interval_secs)
    }

    pub fn provider_timeout(&self) -> Duration {
        let secs = if self.external_metadata_timeout_secs == 0 {
            8
        } else {
            self.external_metadata_timeout_secs
        };
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub fn config_path_from_env() -> PathBuf {
    match env::var(CONFIG_ENV) {
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
        let mut config: ServerConfig = serde_yaml::from_str(&contents)?;
        if config.version < CONFIG_VERSION {
            config.version = CONFIG_VERSION;
        }
        if config.port == 0 {
            config.port = 3000;
        }
        if config.retry_max_attempts == 0 {
            config.retry_max_attempts = 1;
        }
        config.music_roots.retain(|root| !root.trim().is_empty());
        return Ok((config, false));
    }

    let config = ServerConfig::default();
    save_config(path, &config)?;
    Ok((config, true))
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

pub fn resolve_music_root(config_path: &Path, value: &str) -> Option<PathBuf> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(resolve_path(config_path, trimmed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("config.yaml");

        let (config, created) = load_or_create_config(&path).unwrap();
        assert!(created);
        assert!(path.exists());
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.artist_separators, None);

        let (again, created) = load_or_create_config(&path).unwrap();
        assert!(!created);
        assert_eq!(again, config);
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "music_roots: [music, '  ']\n\
             artist_separators: [';', ' feat. ']\n\
             batch_failure_policy: halt\n\
             external_metadata_sources:\n  - provider: lrclib\n  - provider: music_brainz\n    user_agent: test/1.0\n",
        )
        .unwrap();

        let (config, _) = load_or_create_config(&path).unwrap();
        assert_eq!(config.music_roots, vec!["music".to_string()]);
        assert_eq!(config.scan_batch_size, 250);
        assert_eq!(config.retry_max_attempts, 3);
        assert_eq!(config.batch_failure_policy, BatchFailurePolicy::Halt);
        assert_eq!(config.external_metadata_sources.len(), 2);
        assert_eq!(config.external_metadata_sources[0].provider, Provider::Lrclib);
        assert!(config.external_metadata_sources[1].enabled);

        let options = config.scan_options(&path);
        assert_eq!(
            options.artist_separators,
            Some(vec![";".to_string(), " feat. ".to_string()])
        );
        assert_eq!(options.cover_cache_dir, Some(dir.path().join("cache")));
        assert_eq!(config.roots(&path), vec![dir.path().join("music")]);
    }

    #[test]
    fn relative_paths_resolve_beside_config() {
        let config_path = Path::new("/etc/catalog/config.yaml");
        assert_eq!(
            resolve_path(config_path, "catalog.redb"),
            PathBuf::from("/etc/catalog/catalog.redb")
        );
        assert_eq!(
            resolve_path(config_path, "/srv/music"),
            PathBuf::from("/srv/music")
        );
        assert_eq!(resolve_music_root(config_path, "   "), None);
    }
}
