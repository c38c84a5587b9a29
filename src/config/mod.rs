//! Configuration management for crawlnet
//!
//! Configuration comes from a TOML file (or the defaults), then
//! `CRAWLNET_*` environment variables override individual values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use crate::collect::TaskOptions;
use crate::engine::{CrawlerConfig, PoolConfig, DEFAULT_BAN_MARKER};
use crate::master::{identity, MasterConfig};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Coordinate through the store; false crawls the seed tasks directly
    pub cluster: bool,

    pub logging: LoggingConfig,

    pub master: MasterSection,

    pub worker: WorkerSection,

    pub fetcher: FetcherSection,

    /// Link-following tasks known to this process
    pub tasks: Vec<TaskOptions>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

/// Master process settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterSection {
    /// Short master id, also the ID generator node number when numeric
    pub id: String,

    /// Advertised API address, usually `:<port>`
    pub http_address: String,

    /// Period of the authoritative leader check, in seconds
    pub leader_check_interval_secs: u64,

    /// Task names that always get a resource record
    pub seeds: Vec<String>,
}

/// Worker process settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    /// Discovery service name workers register under
    pub service_name: String,

    /// Short worker id; a timestamp is used when empty
    pub id: String,

    /// Address advertised in discovery
    pub address: String,

    pub work_count: usize,

    pub min_body_len: usize,

    pub ban_markers: Vec<String>,

    /// Seconds without results before the sink logs an idle tick
    pub idle_log_secs: u64,
}

/// HTTP fetcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetcherSection {
    pub timeout_ms: u64,

    /// Fixed User-Agent; a built-in pool rotates when unset
    pub user_agent: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

impl Default for MasterSection {
    fn default() -> Self {
        Self {
            id: String::from("1"),
            http_address: String::from(":8081"),
            leader_check_interval_secs: 20,
            seeds: Vec::new(),
        }
    }
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            service_name: String::from("crawlnet.worker"),
            id: String::new(),
            address: String::from(":9090"),
            work_count: 5,
            min_body_len: 6000,
            ban_markers: vec![DEFAULT_BAN_MARKER.to_string()],
            idle_log_secs: 10,
        }
    }
}

impl Default for FetcherSection {
    fn default() -> Self {
        Self {
            timeout_ms: 3000,
            user_agent: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster: true,
            logging: LoggingConfig::default(),
            master: MasterSection::default(),
            worker: WorkerSection::default(),
            fetcher: FetcherSection::default(),
            tasks: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// File (or defaults) plus environment overrides, validated
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `CRAWLNET_*` environment variables
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        fn parsed<T: std::str::FromStr>(key: &str, value: String) -> Result<T>
        where
            T::Err: std::fmt::Display,
        {
            value
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("Invalid value for {key}: {e}"))
        }

        if let Some(v) = lookup("CRAWLNET_CLUSTER") {
            self.cluster = parsed("CRAWLNET_CLUSTER", v)?;
        }
        if let Some(v) = lookup("CRAWLNET_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = lookup("CRAWLNET_LOG_FORMAT") {
            self.logging.format = v;
        }
        if let Some(v) = lookup("CRAWLNET_MASTER_ID") {
            self.master.id = v;
        }
        if let Some(v) = lookup("CRAWLNET_HTTP_ADDRESS") {
            self.master.http_address = v;
        }
        if let Some(v) = lookup("CRAWLNET_SEEDS") {
            self.master.seeds = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = lookup("CRAWLNET_WORKER_ID") {
            self.worker.id = v;
        }
        if let Some(v) = lookup("CRAWLNET_WORK_COUNT") {
            self.worker.work_count = parsed("CRAWLNET_WORK_COUNT", v)?;
        }
        if let Some(v) = lookup("CRAWLNET_FETCH_TIMEOUT_MS") {
            self.fetcher.timeout_ms = parsed("CRAWLNET_FETCH_TIMEOUT_MS", v)?;
        }
        if let Some(v) = lookup("CRAWLNET_USER_AGENT") {
            self.fetcher.user_agent = Some(v);
        }
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.logging.format.as_str(), "text" | "json") {
            anyhow::bail!("logging.format must be text or json, got {:?}", self.logging.format);
        }

        if self.master.id.is_empty() {
            anyhow::bail!("master.id cannot be empty");
        }

        if self.master.http_address.is_empty() {
            anyhow::bail!("master.http_address cannot be empty");
        }

        if self.master.leader_check_interval_secs == 0 {
            anyhow::bail!("master.leader_check_interval_secs must be greater than 0");
        }

        if self.worker.service_name.is_empty() {
            anyhow::bail!("worker.service_name cannot be empty");
        }

        if self.worker.work_count == 0 {
            anyhow::bail!("worker.work_count must be greater than 0");
        }

        if self.fetcher.timeout_ms == 0 {
            anyhow::bail!("fetcher.timeout_ms must be greater than 0");
        }

        let mut names = HashSet::new();
        for task in &self.tasks {
            if task.name.is_empty() {
                anyhow::bail!("task name cannot be empty");
            }
            if !names.insert(task.name.as_str()) {
                anyhow::bail!("duplicate task name: {}", task.name);
            }
            if task.url.is_empty() {
                anyhow::bail!("task {} has no url", task.name);
            }
            for limit in &task.limits {
                if limit.event_count == 0 || limit.event_dur_secs == 0 || limit.bucket == 0 {
                    anyhow::bail!("task {} has a zero-sized rate limit", task.name);
                }
            }
        }

        if !self.cluster {
            if let Some(unknown) = self.seeds().iter().find(|s| !names.contains(s.as_str())) {
                anyhow::bail!("seed {unknown} names no configured task");
            }
        }

        Ok(())
    }

    /// Seed task names; every configured task when none are listed
    pub fn seeds(&self) -> Vec<String> {
        if self.master.seeds.is_empty() {
            self.tasks.iter().map(|t| t.name.clone()).collect()
        } else {
            self.master.seeds.clone()
        }
    }

    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetcher.timeout_ms)
    }

    /// Master settings for a process whose outbound IPv4 is `ipv4`
    pub fn master_config(&self, ipv4: Ipv4Addr) -> MasterConfig {
        MasterConfig {
            id: identity::master_id(&self.master.id, ipv4, &self.master.http_address),
            worker_service: self.worker.service_name.clone(),
            seeds: self.seeds(),
            leader_check_interval: Duration::from_secs(self.master.leader_check_interval_secs),
            id_node: self.master.id.parse().unwrap_or(1),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            work_count: self.worker.work_count,
            min_body_len: self.worker.min_body_len,
            ban_markers: self.worker.ban_markers.clone(),
        }
    }

    pub fn crawler_config(&self) -> CrawlerConfig {
        CrawlerConfig {
            service_name: self.worker.service_name.clone(),
            id: self.worker.id.clone(),
            address: self.worker.address.clone(),
            pool: self.pool_config(),
            idle: Duration::from_secs(self.worker.idle_log_secs.max(1)),
            seeds: self.seeds(),
        }
    }
}
