//! Configuration types for sql-extractor
//!
//! A [`Config`] is decoded once from YAML, validated, and then shared read-only
//! (as `Arc<Config>`) by every component of a run.

use crate::error::{Error, Result};
use crate::types::Connection;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path, path::PathBuf, str::FromStr, time::Duration};

/// Default number of workers (parallel queries)
pub const DEFAULT_WORKERS: usize = 5;

/// Output format requested from the remote agent
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum OutputFormat {
    /// Comma-separated values (default)
    #[default]
    Csv,
    /// A single JSON document
    Json,
    /// Line-delimited JSON
    Ldjson,
}

impl OutputFormat {
    /// MIME type sent in the `Accept` header
    pub fn mime_type(&self) -> &'static str {
        match self {
            OutputFormat::Csv => "text/csv",
            OutputFormat::Json => "application/json",
            OutputFormat::Ldjson => "application/x-ldjson",
        }
    }

    /// File extension used for cache artifacts
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Csv => "csv",
            OutputFormat::Json => "json",
            OutputFormat::Ldjson => "ldjson",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(OutputFormat::Csv),
            "json" => Ok(OutputFormat::Json),
            "ldjson" => Ok(OutputFormat::Ldjson),
            other => Err(Error::config(
                "format",
                format!("unsupported format: {other}"),
            )),
        }
    }
}

impl TryFrom<String> for OutputFormat {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<OutputFormat> for String {
    fn from(format: OutputFormat) -> Self {
        format.extension().to_string()
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

/// Local cache directory settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Root of the local cache; each run gets a subdirectory (default: "/tmp")
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,

    /// Delete local artifacts once they have been handed to storage
    #[serde(default)]
    pub purge: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: default_cache_path(),
            purge: false,
        }
    }
}

/// Remote query-execution agent
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SqlAgentConfig {
    /// URL that accepts query execution requests
    #[serde(default)]
    pub addr: String,
}

/// One entry of the `queries` list
///
/// Either `dir` (every `*.sql` file below it) or `file` (a single query) is used.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Name of the connection these queries run against
    pub connection: String,

    /// Directory containing one or more `.sql` files
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Single file containing a query
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Name of the query; only applies to `file`
    #[serde(default)]
    pub name: Option<String>,
}

/// Durable object storage for finished extracts
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Store URL, e.g. `s3://bucket`, `file:///srv/extracts`, `memory:///`
    #[serde(default)]
    pub url: Option<String>,

    /// S3 bucket name; shorthand for `url: s3://<bucket>`
    #[serde(default)]
    pub bucket: Option<String>,

    /// Key prefix every upload is placed under
    #[serde(default, alias = "basedir")]
    pub base_dir: String,

    /// AWS region
    #[serde(default)]
    pub region: Option<String>,

    /// AWS access key id (falls back to the environment)
    #[serde(default)]
    pub access_key_id: Option<String>,

    /// AWS secret access key (falls back to the environment)
    #[serde(default)]
    pub secret_access_key: Option<String>,
}

impl StorageConfig {
    /// Resolved store URL
    pub fn store_url(&self) -> Result<url::Url> {
        let raw = match (&self.url, &self.bucket) {
            (Some(url), _) => url.clone(),
            (None, Some(bucket)) => format!("s3://{bucket}"),
            (None, None) => {
                return Err(Error::config(
                    "storage.url",
                    "storage requires either `url` or `bucket`",
                ));
            }
        };
        url::Url::parse(&raw)
            .map_err(|e| Error::config("storage.url", format!("invalid storage url {raw}: {e}")))
    }
}

/// Lifecycle event delivery
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Topic every event of a run is published on (default: "sql-extractor")
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Endpoint receiving events as JSON POSTs (events are only logged when unset)
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Timeout for a single webhook delivery in seconds (default: 10)
    #[serde(default = "default_webhook_timeout", with = "duration_serde")]
    pub webhook_timeout: Duration,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            topic: default_topic(),
            webhook_url: None,
            webhook_timeout: default_webhook_timeout(),
        }
    }
}

/// Recurring execution
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Cron expression; a single run is executed when unset
    #[serde(default)]
    pub cron: Option<String>,
}

/// Retry policy for transport failures reaching the remote agent
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Fixed delay between attempts in seconds (default: 1)
    #[serde(default = "default_retry_delay", with = "duration_serde")]
    pub delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay: default_retry_delay(),
        }
    }
}

/// Main configuration for a scheduler run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Number of workers, i.e. parallel queries (default: 5, 0 means default)
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Gzip-compress extracts while they are written
    #[serde(default)]
    pub gzip: bool,

    /// Output format requested from the agent (default: csv)
    #[serde(default)]
    pub format: OutputFormat,

    /// Named database connections
    #[serde(default)]
    pub connections: HashMap<String, Connection>,

    /// Local cache directory
    #[serde(default)]
    pub cache: CacheConfig,

    /// Remote query-execution agent
    #[serde(default)]
    pub sql_agent: SqlAgentConfig,

    /// Query definitions
    #[serde(default)]
    pub queries: Vec<QueryConfig>,

    /// Durable storage; extracts stay local when unset
    #[serde(default, alias = "s3")]
    pub storage: Option<StorageConfig>,

    /// Lifecycle event delivery
    #[serde(default)]
    pub events: EventsConfig,

    /// Recurring execution
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Retry policy for the remote agent
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            gzip: false,
            format: OutputFormat::default(),
            connections: HashMap::new(),
            cache: CacheConfig::default(),
            sql_agent: SqlAgentConfig::default(),
            queries: Vec::new(),
            storage: None,
            events: EventsConfig::default(),
            schedule: ScheduleConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl Config {
    /// Read, decode and validate a YAML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| Error::Config {
            message: format!("error reading config file {}: {e}", path.display()),
            key: None,
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Decode and validate a YAML configuration document
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Worker count with the default applied
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            DEFAULT_WORKERS
        } else {
            self.workers
        }
    }

    /// Check everything that must hold before a batch can be scheduled
    pub fn validate(&self) -> Result<()> {
        let meta = std::fs::metadata(&self.cache.path).map_err(|e| {
            Error::config(
                "cache.path",
                format!("cache directory {}: {e}", self.cache.path.display()),
            )
        })?;
        if !meta.is_dir() {
            return Err(Error::config(
                "cache.path",
                format!("{} is not a directory", self.cache.path.display()),
            ));
        }
        if !is_writable(&self.cache.path) {
            return Err(Error::config(
                "cache.path",
                format!("{} is not writable", self.cache.path.display()),
            ));
        }

        url::Url::parse(&self.sql_agent.addr).map_err(|e| {
            Error::config(
                "sql_agent.addr",
                format!("invalid agent address {:?}: {e}", self.sql_agent.addr),
            )
        })?;

        for query in &self.queries {
            if !self.connections.contains_key(&query.connection) {
                return Err(Error::config(
                    "queries",
                    format!("no connection named {}", query.connection),
                ));
            }
        }

        if let Some(storage) = &self.storage {
            storage.store_url()?;
        }

        Ok(())
    }
}

#[cfg(unix)]
fn is_writable(path: &Path) -> bool {
    use std::os::unix::ffi::OsStrExt;

    let Ok(c_path) = std::ffi::CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    // SAFETY: c_path is a valid NUL-terminated string that outlives the call
    unsafe { libc::access(c_path.as_ptr(), libc::W_OK) == 0 }
}

#[cfg(not(unix))]
fn is_writable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| !m.permissions().readonly())
        .unwrap_or(false)
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_topic() -> String {
    "sql-extractor".to_string()
}

fn default_webhook_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(1)
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
