use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";

const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 30;
const DEFAULT_BATCH_SIZE: usize = 5000;
const DEFAULT_QUEUE_CAPACITY: usize = 1;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 20;
const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_RETRY_INTERVAL_SECS: u64 = 5;
const DEFAULT_RETRY_BUFFER_LIMIT: usize = 50_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("error reading config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to decode config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("must configure at least one of bucket or database/retention policy")]
    MissingWriteDestination,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub influxdb: InfluxConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(alias = "listenaddr")]
    pub listen_addr: String,
    #[serde(default, alias = "queuecapacity")]
    pub queue_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InfluxConfig {
    pub address: String,
    pub username: String,
    pub password: String,
    #[serde(alias = "measurementprefix")]
    pub measurement_prefix: String,
    pub database: String,
    #[serde(alias = "retentionpolicy")]
    pub retention_policy: String,
    pub token: String,
    pub organization: String,
    pub bucket: String,
    #[serde(alias = "skipverifyssl")]
    pub skip_verify_ssl: bool,
    #[serde(alias = "flushinterval")]
    pub flush_interval: u64,
    #[serde(alias = "batchsize")]
    pub batch_size: Option<usize>,
    /// Per-request HTTP timeout in seconds.
    pub timeout: u64,
    #[serde(alias = "maxretries")]
    pub max_retries: Option<u32>,
    /// Base delay in seconds before the first retry; doubles per attempt.
    #[serde(alias = "retryinterval")]
    pub retry_interval: u64,
    /// Lines kept for retry before the oldest failed batches are discarded.
    #[serde(alias = "retrybufferlimit")]
    pub retry_buffer_limit: Option<usize>,
}

/// Credentials sent with every write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Auth {
    None,
    Token(String),
    Basic { username: String, password: String },
}

impl Auth {
    /// Value for the `Authorization: Token ...` header. v1 compatibility
    /// endpoints take `username:password` in place of an API token.
    pub fn token(&self) -> Option<String> {
        match self {
            Auth::None => None,
            Auth::Token(token) => Some(token.clone()),
            Auth::Basic { username, password } => Some(format!("{username}:{password}")),
        }
    }
}

/// Where points are written: a v2 bucket or a v1 database/retention policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteDestination {
    Bucket(String),
    DatabaseRetention {
        database: String,
        retention_policy: String,
    },
}

impl WriteDestination {
    pub fn bucket(&self) -> String {
        match self {
            WriteDestination::Bucket(bucket) => bucket.clone(),
            WriteDestination::DatabaseRetention {
                database,
                retention_policy,
            } => format!("{database}/{retention_policy}"),
        }
    }
}

impl Config {
    /// Reads the YAML file at `path`, then applies `.env` and process
    /// environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_yaml(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.apply_overrides(env_optional);
        Ok(config)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(contents)
    }

    /// Overrides file values with non-empty variables returned by `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let targets: [(&str, &mut String); 7] = [
            ("AIRGRADIENT_LISTEN_ADDR", &mut self.server.listen_addr),
            ("AIRGRADIENT_INFLUXDB_ADDRESS", &mut self.influxdb.address),
            ("AIRGRADIENT_INFLUXDB_TOKEN", &mut self.influxdb.token),
            ("AIRGRADIENT_INFLUXDB_USERNAME", &mut self.influxdb.username),
            ("AIRGRADIENT_INFLUXDB_PASSWORD", &mut self.influxdb.password),
            (
                "AIRGRADIENT_INFLUXDB_ORGANIZATION",
                &mut self.influxdb.organization,
            ),
            ("AIRGRADIENT_INFLUXDB_BUCKET", &mut self.influxdb.bucket),
        ];
        for (key, target) in targets {
            if let Some(value) = lookup(key).filter(|v| !v.is_empty()) {
                *target = value;
            }
        }
    }

    /// Token wins over username/password; both halves of the pair are needed.
    pub fn auth(&self) -> Auth {
        let influx = &self.influxdb;
        if !influx.token.is_empty() {
            Auth::Token(influx.token.clone())
        } else if !influx.username.is_empty() && !influx.password.is_empty() {
            Auth::Basic {
                username: influx.username.clone(),
                password: influx.password.clone(),
            }
        } else {
            Auth::None
        }
    }

    /// Bucket wins over database/retention policy.
    pub fn write_destination(&self) -> Result<WriteDestination, ConfigError> {
        let influx = &self.influxdb;
        if !influx.bucket.is_empty() {
            Ok(WriteDestination::Bucket(influx.bucket.clone()))
        } else if !influx.database.is_empty() && !influx.retention_policy.is_empty() {
            Ok(WriteDestination::DatabaseRetention {
                database: influx.database.clone(),
                retention_policy: influx.retention_policy.clone(),
            })
        } else {
            Err(ConfigError::MissingWriteDestination)
        }
    }

    pub fn flush_interval(&self) -> Duration {
        let secs = match self.influxdb.flush_interval {
            0 => DEFAULT_FLUSH_INTERVAL_SECS,
            secs => secs,
        };
        Duration::from_secs(secs)
    }

    pub fn batch_size(&self) -> usize {
        self.influxdb
            .batch_size
            .filter(|v| *v != 0)
            .unwrap_or(DEFAULT_BATCH_SIZE)
    }

    pub fn request_timeout(&self) -> Duration {
        let secs = match self.influxdb.timeout {
            0 => DEFAULT_REQUEST_TIMEOUT_SECS,
            secs => secs,
        };
        Duration::from_secs(secs)
    }

    pub fn max_retries(&self) -> u32 {
        self.influxdb.max_retries.unwrap_or(DEFAULT_MAX_RETRIES)
    }

    pub fn retry_interval(&self) -> Duration {
        let secs = match self.influxdb.retry_interval {
            0 => DEFAULT_RETRY_INTERVAL_SECS,
            secs => secs,
        };
        Duration::from_secs(secs)
    }

    pub fn retry_buffer_limit(&self) -> usize {
        self.influxdb
            .retry_buffer_limit
            .filter(|v| *v != 0)
            .unwrap_or(DEFAULT_RETRY_BUFFER_LIMIT)
    }

    pub fn queue_capacity(&self) -> usize {
        self.server
            .queue_capacity
            .unwrap_or(DEFAULT_QUEUE_CAPACITY)
            .max(1)
    }

    /// `air_quality`, or `<measurement_prefix>air_quality` when a prefix is set.
    pub fn measurement(&self) -> String {
        format!("{}{}", self.influxdb.measurement_prefix, crate::writer::MEASUREMENT)
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}
