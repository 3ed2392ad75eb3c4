use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::api::{ApiConfig, DEFAULT_MAX_CONNECTIONS};
use crate::dispatch::{DispatchSettings, DEFAULT_BREAK_THRESHOLD};
use crate::record_cache::DEFAULT_RECORD_TTL;
use crate::runtime::cache::{DEFAULT_CACHE_TTL, DEFAULT_MAX_ENTRIES};
use crate::runtime::pool::{PoolConfig, DEFAULT_POOL_SIZE, DEFAULT_TIMEOUT};
use crate::runtime::EngineConfig;

const DEFAULT_DB_PATH: &str = "configd.db";
const DEFAULT_API_ADDR: &str = "127.0.0.1:8080";

#[derive(Debug, Deserialize, Default)]
struct ServiceConfigFile {
    db_path: Option<String>,
    api: Option<ApiConfigFile>,
    engine: Option<EngineConfigFile>,
    records: Option<RecordsConfigFile>,
    test_secret: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    allow_origins: Option<Vec<String>>,
    max_connections: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct EngineConfigFile {
    pool_size: Option<usize>,
    timeout_ms: Option<u64>,
    confine_workers: Option<bool>,
    cache_ttl_secs: Option<u64>,
    cache_max_entries: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct RecordsConfigFile {
    cache_ttl_secs: Option<u64>,
    break_threshold: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub db_path: String,
    pub api_addr: String,
    pub allow_origins: Vec<String>,
    pub max_connections: usize,
    pub engine: EngineSettings,
    pub record_ttl: Duration,
    pub break_threshold: u32,
    pub test_secret: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub pool_size: usize,
    pub timeout: Duration,
    pub confine_workers: bool,
    pub cache_ttl: Duration,
    pub cache_max_entries: usize,
}

impl ServiceConfig {
    /// Load from the file named by `CONFIGD_CONFIG` (JSON, or TOML for a
    /// `.toml` path), then apply `CONFIGD_*` overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CONFIGD_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ServiceConfigFile) -> Self {
        let db_path = file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let api_addr = file
            .api
            .as_ref()
            .and_then(|api| api.addr.clone())
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());
        let max_connections = file
            .api
            .as_ref()
            .and_then(|api| api.max_connections)
            .unwrap_or(DEFAULT_MAX_CONNECTIONS);
        let allow_origins = file
            .api
            .and_then(|api| api.allow_origins)
            .unwrap_or_default();
        let engine_file = file.engine.unwrap_or_default();
        let engine = EngineSettings {
            pool_size: engine_file.pool_size.unwrap_or(DEFAULT_POOL_SIZE),
            timeout: engine_file
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_TIMEOUT),
            confine_workers: engine_file.confine_workers.unwrap_or(false),
            cache_ttl: engine_file
                .cache_ttl_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_CACHE_TTL),
            cache_max_entries: engine_file.cache_max_entries.unwrap_or(DEFAULT_MAX_ENTRIES),
        };
        let record_ttl = file
            .records
            .as_ref()
            .and_then(|records| records.cache_ttl_secs)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RECORD_TTL);
        let break_threshold = file
            .records
            .and_then(|records| records.break_threshold)
            .unwrap_or(DEFAULT_BREAK_THRESHOLD);
        Self {
            db_path,
            api_addr,
            allow_origins,
            max_connections,
            engine,
            record_ttl,
            break_threshold,
            test_secret: file.test_secret.filter(|secret| !secret.is_empty()),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("CONFIGD_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(addr) = std::env::var("CONFIGD_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(origins) = std::env::var("CONFIGD_ALLOW_ORIGINS") {
            let parsed = split_csv(&origins);
            if !parsed.is_empty() {
                self.allow_origins = parsed;
            }
        }
        if let Ok(timeout) = std::env::var("CONFIGD_TIMEOUT_MS") {
            let millis: u64 = timeout
                .parse()
                .map_err(|_| {
                    anyhow!("CONFIGD_TIMEOUT_MS must be an integer number of milliseconds")
                })?;
            self.engine.timeout = Duration::from_millis(millis);
        }
        if let Ok(size) = std::env::var("CONFIGD_POOL_SIZE") {
            self.engine.pool_size = size
                .parse()
                .map_err(|_| anyhow!("CONFIGD_POOL_SIZE must be a positive integer"))?;
        }
        if let Ok(secret) = std::env::var("CONFIGD_TEST_SECRET") {
            if !secret.trim().is_empty() {
                self.test_secret = Some(secret);
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.engine.pool_size == 0 {
            return Err(anyhow!("pool size must be greater than zero"));
        }
        if self.max_connections == 0 {
            return Err(anyhow!("api max connections must be greater than zero"));
        }
        if self.engine.timeout.is_zero() {
            return Err(anyhow!("execution timeout must be greater than zero"));
        }
        if self.engine.cache_max_entries == 0 {
            return Err(anyhow!("compiled program cache must hold at least one entry"));
        }
        if self.engine.cache_ttl.is_zero() {
            return Err(anyhow!("compiled program cache ttl must be greater than zero"));
        }
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            pool: PoolConfig {
                size: self.engine.pool_size,
                timeout: self.engine.timeout,
                confine: self.engine.confine_workers,
            },
            cache_ttl: self.engine.cache_ttl,
            cache_max_entries: self.engine.cache_max_entries,
        }
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            record_ttl: self.record_ttl,
            break_threshold: self.break_threshold,
            test_secret: self.test_secret.clone(),
        }
    }

    pub fn api_config(&self) -> ApiConfig {
        ApiConfig {
            addr: self.api_addr.clone(),
            allow_origins: self.allow_origins.clone(),
            max_connections: self.max_connections,
        }
    }
}

fn read_config_file(path: &Path) -> Result<ServiceConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
