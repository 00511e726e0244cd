use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub port: Option<u16>,
    pub db_dir: Option<String>,
    pub database_url: Option<String>,

    // Feature configs
    pub upstream: Option<UpstreamConfig>,
    pub indexer: Option<IndexerConfig>,
    pub storage: Option<StorageConfig>,
    pub worker: Option<WorkerConfig>,
    pub queue: Option<QueueConfig>,
    pub security: Option<SecurityConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: Option<String>,
    pub mirrors: Option<HashMap<String, String>>,
    pub timeout_sec: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct IndexerConfig {
    pub base_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub api_version: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub work_dir: Option<String>,
    pub music_dir: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct WorkerConfig {
    pub max_concurrent: Option<usize>,
    pub download_timeout_sec: Option<u64>,
    pub tag_write_timeout_sec: Option<u64>,
    pub move_timeout_sec: Option<u64>,
    pub scan_timeout_sec: Option<u64>,
    pub poll_interval_sec: Option<u64>,
    pub stale_claim_threshold_sec: Option<u64>,
    pub job_retention_days: Option<u64>,
    pub prune_interval_hours: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct QueueConfig {
    pub redis_url: Option<String>,
    pub redis_db: Option<i64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct SecurityConfig {
    pub api_keys: Vec<ApiKeyConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiKeyConfig {
    pub key: String,
    pub name: String,
}

impl FileConfig {
    /// Load a TOML configuration file from disk.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {:?}", path.as_ref()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {:?}", path.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
port = 9090
db_dir = "/var/lib/embed"

[upstream]
base_url = "https://music-api.example.com"
timeout_sec = 20

[upstream.mirrors]
cn = "https://cn.example.com"
us = "https://us.example.com"

[indexer]
base_url = "http://navidrome:4533"
username = "admin"
password = "secret"

[storage]
work_dir = "/tmp/embed-work"
music_dir = "/music"

[worker]
max_concurrent = 5
download_timeout_sec = 900

[queue]
redis_url = "redis://localhost:6379/1"

[[security.api_keys]]
key = "k1"
name = "orchestrator"

[[security.api_keys]]
key = "k2"
name = "ops"
"#;
        let config: FileConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.port, Some(9090));
        assert_eq!(config.db_dir, Some("/var/lib/embed".to_string()));

        let upstream = config.upstream.unwrap();
        assert_eq!(
            upstream.base_url,
            Some("https://music-api.example.com".to_string())
        );
        assert_eq!(upstream.timeout_sec, Some(20));
        let mirrors = upstream.mirrors.unwrap();
        assert_eq!(mirrors.get("cn"), Some(&"https://cn.example.com".to_string()));

        let worker = config.worker.unwrap();
        assert_eq!(worker.max_concurrent, Some(5));
        assert_eq!(worker.download_timeout_sec, Some(900));

        let keys = config.security.unwrap().api_keys;
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].key, "k1");
        assert_eq!(keys[1].name, "ops");
    }

    #[test]
    fn test_parse_empty_config() {
        let config: FileConfig = toml::from_str("").unwrap();
        assert!(config.port.is_none());
        assert!(config.upstream.is_none());
        assert!(config.security.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port = 8081").unwrap();
        let config = FileConfig::load(file.path()).unwrap();
        assert_eq!(config.port, Some(8081));
    }

    #[test]
    fn test_load_missing_file() {
        let result = FileConfig::load("/nonexistent/config.toml");
        assert!(result.is_err());
    }
}
