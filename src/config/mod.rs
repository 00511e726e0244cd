mod file_config;

pub use file_config::{ApiKeyConfig, FileConfig};

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub port: Option<u16>,
    pub db_dir: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
    pub music_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub db_dir: PathBuf,
    /// Direct override for the jobs database file (DATABASE_URL).
    pub database_url: Option<String>,

    pub upstream: UpstreamSettings,
    pub indexer: IndexerSettings,
    pub storage: StorageSettings,
    pub worker: WorkerSettings,
    pub queue: QueueSettings,
    pub security: SecuritySettings,
}

#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub base_url: String,
    /// Optional named mirrors (cn / hk / us), selected by source tag.
    pub mirrors: HashMap<String, String>,
    pub timeout_secs: u64,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            base_url: "https://music-api.gdstudio.xyz".to_string(),
            mirrors: HashMap::new(),
            timeout_secs: 15,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexerSettings {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub api_version: String,
}

impl Default for IndexerSettings {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            username: String::new(),
            password: String::new(),
            api_version: "1.16.1".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub work_dir: PathBuf,
    pub music_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("./work"),
            music_dir: PathBuf::from("./music"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub max_concurrent: usize,
    pub download_timeout_secs: u64,
    pub tag_write_timeout_secs: u64,
    pub move_timeout_secs: u64,
    pub scan_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub stale_claim_threshold_secs: u64,
    pub job_retention_days: u64,
    pub prune_interval_hours: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            download_timeout_secs: 600,
            tag_write_timeout_secs: 60,
            move_timeout_secs: 120,
            scan_timeout_secs: 300,
            poll_interval_secs: 1,
            stale_claim_threshold_secs: 3600,
            job_retention_days: 30,
            prune_interval_hours: 24,
        }
    }
}

/// Queue broker settings. The queue backend embedded in this build is
/// SQLite; a configured Redis address is parsed and kept for
/// compatibility with deployments that still export REDIS_URL.
#[derive(Debug, Clone, Default)]
pub struct QueueSettings {
    /// Normalized broker address (host:port), if configured.
    pub redis_addr: Option<String>,
    pub redis_db: i64,
}

#[derive(Debug, Clone, Default)]
pub struct SecuritySettings {
    pub api_keys: Vec<ApiKey>,
}

#[derive(Debug, Clone)]
pub struct ApiKey {
    pub key: String,
    pub name: String,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments, optional TOML file config,
    /// and environment overrides. TOML values override CLI values where
    /// present; environment variables override both.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let mut config = Self::merge(cli, file_config)?;
        apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn merge(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let port = file.port.or(cli.port).unwrap_or(8080);
        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .unwrap_or_else(|| PathBuf::from("./data"));

        let up_file = file.upstream.unwrap_or_default();
        let mut upstream = UpstreamSettings::default();
        if let Some(base_url) = up_file.base_url {
            upstream.base_url = base_url;
        }
        if let Some(mirrors) = up_file.mirrors {
            upstream.mirrors = mirrors;
        }
        if let Some(timeout) = up_file.timeout_sec {
            upstream.timeout_secs = timeout;
        }

        let ix_file = file.indexer.unwrap_or_default();
        let mut indexer = IndexerSettings::default();
        if let Some(base_url) = ix_file.base_url {
            indexer.base_url = base_url;
        }
        if let Some(username) = ix_file.username {
            indexer.username = username;
        }
        if let Some(password) = ix_file.password {
            indexer.password = password;
        }
        if let Some(api_version) = ix_file.api_version {
            indexer.api_version = api_version;
        }

        let st_file = file.storage.unwrap_or_default();
        let storage = StorageSettings {
            work_dir: st_file
                .work_dir
                .map(PathBuf::from)
                .or_else(|| cli.work_dir.clone())
                .unwrap_or_else(|| PathBuf::from("./work")),
            music_dir: st_file
                .music_dir
                .map(PathBuf::from)
                .or_else(|| cli.music_dir.clone())
                .unwrap_or_else(|| PathBuf::from("./music")),
        };

        let wk_file = file.worker.unwrap_or_default();
        let defaults = WorkerSettings::default();
        let worker = WorkerSettings {
            max_concurrent: wk_file.max_concurrent.unwrap_or(defaults.max_concurrent),
            download_timeout_secs: wk_file
                .download_timeout_sec
                .unwrap_or(defaults.download_timeout_secs),
            tag_write_timeout_secs: wk_file
                .tag_write_timeout_sec
                .unwrap_or(defaults.tag_write_timeout_secs),
            move_timeout_secs: wk_file.move_timeout_sec.unwrap_or(defaults.move_timeout_secs),
            scan_timeout_secs: wk_file.scan_timeout_sec.unwrap_or(defaults.scan_timeout_secs),
            poll_interval_secs: wk_file
                .poll_interval_sec
                .unwrap_or(defaults.poll_interval_secs),
            stale_claim_threshold_secs: wk_file
                .stale_claim_threshold_sec
                .unwrap_or(defaults.stale_claim_threshold_secs),
            job_retention_days: wk_file
                .job_retention_days
                .unwrap_or(defaults.job_retention_days),
            prune_interval_hours: wk_file
                .prune_interval_hours
                .unwrap_or(defaults.prune_interval_hours),
        };

        let q_file = file.queue.unwrap_or_default();
        let mut queue = QueueSettings {
            redis_addr: None,
            redis_db: q_file.redis_db.unwrap_or(0),
        };
        if let Some(raw) = q_file.redis_url {
            let (addr, db) = normalize_redis_address(&raw)?;
            queue.redis_addr = Some(addr);
            if queue.redis_db == 0 {
                queue.redis_db = db;
            }
        }

        let security = SecuritySettings {
            api_keys: file
                .security
                .map(|s| {
                    s.api_keys
                        .into_iter()
                        .map(|k| ApiKey {
                            key: k.key,
                            name: k.name,
                        })
                        .collect()
                })
                .unwrap_or_default(),
        };

        Ok(Self {
            port,
            db_dir,
            database_url: file.database_url,
            upstream,
            indexer,
            storage,
            worker,
            queue,
            security,
        })
    }

    /// Path of the jobs database. DATABASE_URL overrides the db_dir layout;
    /// a `sqlite://` prefix is accepted and stripped.
    pub fn jobs_db_path(&self) -> PathBuf {
        match &self.database_url {
            Some(url) => {
                let path = url
                    .strip_prefix("sqlite://")
                    .or_else(|| url.strip_prefix("sqlite:"))
                    .unwrap_or(url);
                PathBuf::from(path)
            }
            None => self.db_dir.join("jobs.db"),
        }
    }

    pub fn queue_db_path(&self) -> PathBuf {
        self.db_dir.join("queue.db")
    }
}

/// Apply environment overrides on top of a resolved config. The lookup is
/// injected so tests can run without touching the process environment.
pub fn apply_env_overrides<F>(config: &mut AppConfig, env: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = env("PORT") {
        config.port = raw
            .trim()
            .parse()
            .with_context(|| format!("invalid PORT value {:?}", raw))?;
    }
    if let Some(raw) = env("GD_API_BASE") {
        config.upstream.base_url = raw.trim().to_string();
    }
    if let Some(raw) = env("NAVIDROME_BASE_URL") {
        config.indexer.base_url = raw.trim().to_string();
    }
    if let Some(raw) = env("NAVIDROME_USER") {
        config.indexer.username = raw.trim().to_string();
    }
    if let Some(raw) = env("NAVIDROME_PASSWORD") {
        config.indexer.password = raw;
    }
    if let Some(raw) = env("DATABASE_URL") {
        config.database_url = Some(raw.trim().to_string());
    }
    if let Some(raw) = env("REDIS_URL") {
        let (addr, db) = normalize_redis_address(&raw)?;
        config.queue.redis_addr = Some(addr);
        if config.queue.redis_db == 0 {
            config.queue.redis_db = db;
        }
    }
    if let Some(raw) = env("MAX_CONCURRENT_JOBS") {
        config.worker.max_concurrent = raw
            .trim()
            .parse()
            .with_context(|| format!("invalid MAX_CONCURRENT_JOBS value {:?}", raw))?;
    }
    if let Some(raw) = env("DOWNLOAD_TIMEOUT") {
        config.worker.download_timeout_secs = parse_duration_secs(&raw)
            .with_context(|| format!("invalid DOWNLOAD_TIMEOUT value {:?}", raw))?;
    }
    // LOG_LEVEL is consumed directly by the tracing EnvFilter in main.
    Ok(())
}

/// Parse a duration value into seconds. Bare integers are interpreted as
/// seconds; `s`/`m`/`h` suffixes are accepted.
pub fn parse_duration_secs(raw: &str) -> Result<u64> {
    let raw = raw.trim();
    if raw.is_empty() {
        bail!("empty duration");
    }
    if raw.bytes().all(|b| b.is_ascii_digit()) {
        return raw.parse().context("duration out of range");
    }
    let (idx, multiplier) = match raw.char_indices().last() {
        Some((idx, 's')) => (idx, 1),
        Some((idx, 'm')) => (idx, 60),
        Some((idx, 'h')) => (idx, 3600),
        _ => bail!("invalid duration {:?}", raw),
    };
    let value: u64 = raw[..idx]
        .trim()
        .parse()
        .with_context(|| format!("invalid duration {:?}", raw))?;
    Ok(value * multiplier)
}

/// Normalize a Redis address. Accepts both `host:port` and
/// `redis[s]://host[:port][/db]`; a decimal path segment supplies the DB
/// index. Returns `(addr, db)`.
pub fn normalize_redis_address(raw: &str) -> Result<(String, i64)> {
    let raw = raw.trim();
    if raw.is_empty() {
        bail!("empty redis address");
    }

    if !raw.contains("://") {
        return Ok((raw.to_string(), 0));
    }

    let parsed = url::Url::parse(raw).with_context(|| format!("invalid REDIS_URL {:?}", raw))?;
    if parsed.scheme() != "redis" && parsed.scheme() != "rediss" {
        bail!("unsupported REDIS_URL scheme {:?}", parsed.scheme());
    }
    let host = parsed
        .host_str()
        .with_context(|| format!("invalid REDIS_URL {:?}: missing host", raw))?;
    let addr = match parsed.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };

    let path = parsed.path().trim_matches('/');
    if path.is_empty() {
        return Ok((addr, 0));
    }
    let db: i64 = path
        .parse()
        .ok()
        .filter(|db| *db >= 0)
        .with_context(|| format!("invalid REDIS_URL database index {:?}", path))?;
    Ok((addr, db))
}
