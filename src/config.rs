//! Configuration loader and validator for the observer and worker roles.
//!
//! Settings come from three layers, later layers winning: built-in defaults,
//! an optional YAML file, then the `--key value` pairs given on the command
//! line.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArgError {
    #[error("argument count must be odd: a role followed by key/value pairs")]
    Parity,
    #[error("empty parameter name at position {0}")]
    EmptyKey(usize),
}

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub ftp: FtpConfig,
    pub amqp: AmqpConfig,
    pub elasticsearch: ElasticsearchConfig,
    pub indexer: IndexerConfig,
    pub observer: ObserverConfig,
    pub worker: WorkerConfig,
}

/// Remote file server settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FtpConfig {
    pub server: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Folder the observer polls and the worker fetches from.
    pub directory: String,
    pub connect_timeout_ms: u64,
    pub fetch_timeout_ms: u64,
}

impl Default for FtpConfig {
    fn default() -> Self {
        Self {
            server: "localhost".into(),
            port: 21,
            username: None,
            password: None,
            directory: String::new(),
            connect_timeout_ms: 10_000,
            fetch_timeout_ms: 120_000,
        }
    }
}

impl FtpConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

/// Broker settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AmqpConfig {
    /// Host name or a full `amqp://` URI.
    pub server: String,
    pub queue: String,
    pub dead_letter_queue: String,
    pub publish_timeout_ms: u64,
    pub idle_timeout_ms: u64,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            server: "localhost".into(),
            queue: "task_queue".into(),
            dead_letter_queue: "task_queue.dead".into(),
            publish_timeout_ms: 10_000,
            idle_timeout_ms: 60_000,
        }
    }
}

impl AmqpConfig {
    pub fn uri(&self) -> String {
        if self.server.contains("://") {
            self.server.clone()
        } else {
            format!("amqp://{}:5672/%2f", self.server)
        }
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// Document store settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ElasticsearchConfig {
    /// Comma-separated `host[:port]` list.
    pub hosts: String,
    pub default_port: u16,
    /// Emit `_type` in bulk action lines.
    pub send_type: bool,
    pub request_timeout_ms: u64,
}

impl Default for ElasticsearchConfig {
    fn default() -> Self {
        Self {
            hosts: "localhost".into(),
            default_port: 9300,
            send_type: true,
            request_timeout_ms: 30_000,
        }
    }
}

impl ElasticsearchConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Bulk indexer flush policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IndexerConfig {
    pub bulk_actions: usize,
    pub bulk_size_bytes: usize,
    pub flush_interval_ms: u64,
    pub concurrent_requests: usize,
    pub backoff_initial_ms: u64,
    pub backoff_retries: u32,
    pub channel_capacity: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            bulk_actions: 100,
            bulk_size_bytes: 1 << 30,
            flush_interval_ms: 5_000,
            concurrent_requests: 1,
            backoff_initial_ms: 100,
            backoff_retries: 3,
            channel_capacity: 1_024,
        }
    }
}

/// Observer polling settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ObserverConfig {
    pub period_ms: u64,
    pub start_timestamp_ms: i64,
    pub page_size: usize,
    pub publish_retries: u32,
    pub grace_ms: i64,
    /// SQLite URL for cursor checkpoints; unset keeps state in memory only.
    pub state_db: Option<String>,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            period_ms: 1_000,
            start_timestamp_ms: 0,
            page_size: 10,
            publish_retries: 10,
            grace_ms: 5 * 60 * 1_000,
            state_db: None,
        }
    }
}

/// Worker settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    pub register_retry_ms: u64,
    /// Permanent failures tolerated per file before it is dead-lettered.
    pub max_deliveries: Option<u32>,
    /// Flush and check the indexer before acknowledging a file.
    pub confirm_writes: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            register_retry_ms: 10_000,
            max_deliveries: None,
            confirm_writes: true,
        }
    }
}

/// Command-line `--key value` pairs with normalised keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params(HashMap<String, String>);

impl Params {
    /// Build from the arguments that follow the role token. They must come in
    /// pairs; keys lose leading dashes and are lowercased.
    pub fn from_pairs<S: AsRef<str>>(args: &[S]) -> Result<Self, ArgError> {
        if args.len() % 2 != 0 {
            return Err(ArgError::Parity);
        }
        let mut map = HashMap::with_capacity(args.len() / 2);
        for (i, pair) in args.chunks(2).enumerate() {
            let key = normalize_key(pair[0].as_ref());
            if key.is_empty() {
                return Err(ArgError::EmptyKey(i * 2 + 1));
            }
            map.insert(key, pair[1].as_ref().to_string());
        }
        Ok(Self(map))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

pub fn normalize_key(raw: &str) -> String {
    raw.trim().trim_start_matches('-').to_lowercase()
}

impl Config {
    /// Overlay command-line parameters onto this configuration.
    pub fn apply_params(&mut self, params: &Params) {
        for (key, value) in &params.0 {
            match key.as_str() {
                "ftpserver" => match value.rsplit_once(':') {
                    Some((host, port)) if port.parse::<u16>().is_ok() => {
                        self.ftp.server = host.to_string();
                        self.ftp.port = port.parse().unwrap_or(self.ftp.port);
                    }
                    _ => self.ftp.server = value.clone(),
                },
                "ftpusername" => self.ftp.username = Some(value.clone()),
                "ftppassword" => self.ftp.password = Some(value.clone()),
                "ftpdirectory" => self.ftp.directory = value.clone(),
                "amqpserver" => self.amqp.server = value.clone(),
                "elasticsearchhost" => self.elasticsearch.hosts = value.clone(),
                "statedb" => self.observer.state_db = Some(value.clone()),
                "config" => {}
                other => warn!(key = other, "ignoring unknown parameter"),
            }
        }
    }
}

/// Build the effective configuration for a run: defaults, then the YAML file
/// named by `--config` (if any), then the remaining parameters.
pub fn resolve(params: &Params) -> Result<Config, ConfigError> {
    let mut cfg = match params.get("config") {
        Some(path) => load(Some(Path::new(path)))?,
        None => Config::default(),
    };
    cfg.apply_params(params);
    validate(&cfg)?;
    Ok(cfg)
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, returns the defaults.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let cfg = match path {
        Some(path) => {
            let content = fs::read_to_string(path)?;
            serde_yaml::from_str(&content)?
        }
        None => Config::default(),
    };
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.ftp.server.trim().is_empty() {
        return Err(ConfigError::Invalid("ftp.server must be non-empty"));
    }
    if cfg.ftp.port == 0 {
        return Err(ConfigError::Invalid("ftp.port must be > 0"));
    }
    if cfg.ftp.connect_timeout_ms == 0 || cfg.ftp.fetch_timeout_ms == 0 {
        return Err(ConfigError::Invalid("ftp timeouts must be > 0"));
    }

    if cfg.amqp.server.trim().is_empty() {
        return Err(ConfigError::Invalid("amqp.server must be non-empty"));
    }
    if cfg.amqp.queue.trim().is_empty() {
        return Err(ConfigError::Invalid("amqp.queue must be non-empty"));
    }
    if cfg.amqp.dead_letter_queue.trim().is_empty() || cfg.amqp.dead_letter_queue == cfg.amqp.queue
    {
        return Err(ConfigError::Invalid(
            "amqp.dead_letter_queue must be non-empty and differ from amqp.queue",
        ));
    }
    if cfg.amqp.publish_timeout_ms == 0 || cfg.amqp.idle_timeout_ms == 0 {
        return Err(ConfigError::Invalid("amqp timeouts must be > 0"));
    }

    if cfg.elasticsearch.hosts.split(',').all(|h| h.trim().is_empty()) {
        return Err(ConfigError::Invalid("elasticsearch.hosts must name at least one host"));
    }
    if cfg.elasticsearch.request_timeout_ms == 0 {
        return Err(ConfigError::Invalid("elasticsearch.request_timeout_ms must be > 0"));
    }

    if cfg.indexer.bulk_actions == 0 {
        return Err(ConfigError::Invalid("indexer.bulk_actions must be > 0"));
    }
    if cfg.indexer.bulk_size_bytes == 0 {
        return Err(ConfigError::Invalid("indexer.bulk_size_bytes must be > 0"));
    }
    if cfg.indexer.flush_interval_ms == 0 {
        return Err(ConfigError::Invalid("indexer.flush_interval_ms must be > 0"));
    }
    if cfg.indexer.concurrent_requests == 0 || cfg.indexer.concurrent_requests > 64 {
        return Err(ConfigError::Invalid("indexer.concurrent_requests must be in 1..=64"));
    }
    if cfg.indexer.channel_capacity == 0 {
        return Err(ConfigError::Invalid("indexer.channel_capacity must be > 0"));
    }

    if cfg.observer.period_ms == 0 {
        return Err(ConfigError::Invalid("observer.period_ms must be > 0"));
    }
    if cfg.observer.page_size == 0 {
        return Err(ConfigError::Invalid("observer.page_size must be > 0"));
    }
    if cfg.observer.publish_retries == 0 {
        return Err(ConfigError::Invalid("observer.publish_retries must be > 0"));
    }
    if cfg.observer.grace_ms < 0 {
        return Err(ConfigError::Invalid("observer.grace_ms must be >= 0"));
    }

    if cfg.worker.register_retry_ms == 0 {
        return Err(ConfigError::Invalid("worker.register_retry_ms must be > 0"));
    }
    if cfg.worker.max_deliveries == Some(0) {
        return Err(ConfigError::Invalid("worker.max_deliveries must be > 0 when set"));
    }

    Ok(())
}

/// Example YAML with every setting at its default.
pub fn example() -> &'static str {
    r#"ftp:
  server: "localhost"
  port: 21
  username: "anonymous"
  password: ""
  directory: ""
  connect_timeout_ms: 10000
  fetch_timeout_ms: 120000

amqp:
  server: "localhost"
  queue: "task_queue"
  dead_letter_queue: "task_queue.dead"
  publish_timeout_ms: 10000
  idle_timeout_ms: 60000

elasticsearch:
  hosts: "localhost"
  default_port: 9300
  send_type: true
  request_timeout_ms: 30000

indexer:
  bulk_actions: 100
  bulk_size_bytes: 1073741824
  flush_interval_ms: 5000
  concurrent_requests: 1
  backoff_initial_ms: 100
  backoff_retries: 3
  channel_capacity: 1024

observer:
  period_ms: 1000
  start_timestamp_ms: 0
  page_size: 10
  publish_retries: 10
  grace_ms: 300000

worker:
  register_retry_ms: 10000
  confirm_writes: true
"#
}
