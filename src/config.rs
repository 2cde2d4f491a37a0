use crate::kafka::Endpoint;
use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration: the broker/topic/SASL settings of the config
/// file plus optional producer tuning under `producer`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Bootstrap brokers, either `"host:port,host:port"` or a list.
    #[serde(deserialize_with = "deserialize_brokers")]
    pub brokers: Vec<String>,
    pub topic: String,
    #[serde(default)]
    pub security_protocol: SecurityProtocol,
    #[serde(default)]
    pub sasl_mechanism: Option<SaslMechanism>,
    #[serde(default)]
    pub sasl_username: Option<String>,
    #[serde(default)]
    pub sasl_password: Option<String>,
    #[serde(default)]
    pub producer: ProducerConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecurityProtocol {
    #[default]
    #[serde(alias = "PLAINTEXT")]
    Plaintext,
    #[serde(alias = "SSL")]
    Ssl,
    #[serde(alias = "SASL_PLAINTEXT")]
    SaslPlaintext,
    #[serde(alias = "SASL_SSL")]
    SaslSsl,
}

impl SecurityProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "plaintext",
            SecurityProtocol::Ssl => "ssl",
            SecurityProtocol::SaslPlaintext => "sasl_plaintext",
            SecurityProtocol::SaslSsl => "sasl_ssl",
        }
    }

    pub fn uses_tls(&self) -> bool {
        matches!(self, SecurityProtocol::Ssl | SecurityProtocol::SaslSsl)
    }

    pub fn uses_sasl(&self) -> bool {
        matches!(
            self,
            SecurityProtocol::SaslPlaintext | SecurityProtocol::SaslSsl
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum SaslMechanism {
    #[serde(rename = "PLAIN", alias = "plain")]
    Plain,
    #[serde(rename = "SCRAM-SHA-256", alias = "scram-sha-256")]
    ScramSha256,
    #[serde(rename = "SCRAM-SHA-512", alias = "scram-sha-512")]
    ScramSha512,
}

impl SaslMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::ScramSha256 => "SCRAM-SHA-256",
            SaslMechanism::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

/// Credentials and protocol a transport needs for the handshake.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecuritySettings {
    pub protocol: SecurityProtocol,
    pub mechanism: Option<SaslMechanism>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl fmt::Debug for SecuritySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecuritySettings")
            .field("protocol", &self.protocol)
            .field("mechanism", &self.mechanism)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Producer tuning knobs. Every field has a default, so the section is
/// optional in the config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProducerConfig {
    /// Byte budget of one batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Optional record-count budget of one batch.
    #[serde(default)]
    pub max_batch_records: Option<usize>,
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u64,
    /// Bytes of record data that may be buffered before `send` blocks.
    #[serde(default = "default_buffer_memory")]
    pub buffer_memory: usize,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight_per_partition: usize,
    /// Keep per-partition delivery order. Forces one in-flight batch per
    /// partition.
    #[serde(default = "default_enable_ordering")]
    pub enable_ordering: bool,
    /// Retries per batch for leader changes and throttling.
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_connect_max_retries")]
    pub connect_max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: f64,
    #[serde(default = "default_metadata_ttl_secs")]
    pub metadata_ttl_secs: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_reauth_interval_secs")]
    pub reauth_interval_secs: u64,
    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,
    #[serde(default = "default_io_workers")]
    pub io_workers: usize,
    #[serde(default = "default_acks")]
    pub acks: String,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_batch_records: None,
            linger_ms: default_linger_ms(),
            buffer_memory: default_buffer_memory(),
            max_in_flight_per_partition: default_max_in_flight(),
            enable_ordering: default_enable_ordering(),
            retries: default_retries(),
            connect_max_retries: default_connect_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_jitter: default_backoff_jitter(),
            metadata_ttl_secs: default_metadata_ttl_secs(),
            request_timeout_ms: default_request_timeout_ms(),
            reauth_interval_secs: default_reauth_interval_secs(),
            flush_timeout_ms: default_flush_timeout_ms(),
            io_workers: default_io_workers(),
            acks: default_acks(),
        }
    }
}

impl ProducerConfig {
    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }

    pub fn metadata_ttl(&self) -> Duration {
        Duration::from_secs(self.metadata_ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn reauth_interval(&self) -> Duration {
        Duration::from_secs(self.reauth_interval_secs)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    /// In-flight window per partition actually enforced.
    pub fn effective_max_in_flight(&self) -> usize {
        if self.enable_ordering {
            1
        } else {
            self.max_in_flight_per_partition.max(1)
        }
    }

    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("producer.batch_size must be > 0".to_string()));
        }
        if self.max_batch_records == Some(0) {
            return Err(Error::Config(
                "producer.max_batch_records must be > 0".to_string(),
            ));
        }
        if self.buffer_memory < self.batch_size {
            return Err(Error::Config(format!(
                "producer.buffer_memory ({}) must be at least producer.batch_size ({})",
                self.buffer_memory, self.batch_size
            )));
        }
        if self.io_workers == 0 {
            return Err(Error::Config("producer.io_workers must be > 0".to_string()));
        }
        if self.max_in_flight_per_partition == 0 {
            return Err(Error::Config(
                "producer.max_in_flight_per_partition must be > 0".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.backoff_jitter) {
            return Err(Error::Config(
                "producer.backoff_jitter must be in [0, 1)".to_string(),
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Loads a config file (format picked from the extension, normally
    /// `.json`) with `KAFKA_COURIER_*` environment overrides on top.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("KAFKA_COURIER")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(json, config::FileFormat::Json))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.brokers.is_empty() {
            return Err(Error::Config("at least one broker is required".to_string()));
        }
        if self.topic.trim().is_empty() {
            return Err(Error::Config("topic must not be empty".to_string()));
        }
        self.bootstrap_endpoints()?;

        if self.security_protocol.uses_sasl() {
            if self.sasl_mechanism.is_none() {
                return Err(Error::Config(format!(
                    "security_protocol {} requires sasl_mechanism",
                    self.security_protocol.as_str()
                )));
            }
            if self.sasl_username.is_none() || self.sasl_password.is_none() {
                return Err(Error::Config(format!(
                    "security_protocol {} requires sasl_username and sasl_password",
                    self.security_protocol.as_str()
                )));
            }
        }

        self.producer.validate()
    }

    pub fn bootstrap_endpoints(&self) -> Result<Vec<Endpoint>> {
        self.brokers.iter().map(|b| b.parse()).collect()
    }

    pub fn security(&self) -> SecuritySettings {
        SecuritySettings {
            protocol: self.security_protocol,
            mechanism: self.sasl_mechanism,
            username: self.sasl_username.clone(),
            password: self.sasl_password.clone(),
        }
    }
}

fn deserialize_brokers<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Brokers {
        Joined(String),
        List(Vec<String>),
    }

    let brokers = match Brokers::deserialize(deserializer)? {
        Brokers::Joined(s) => s.split(',').map(str::to_string).collect(),
        Brokers::List(list) => list,
    };

    Ok(brokers
        .into_iter()
        .map(|b| b.trim().to_string())
        .filter(|b| !b.is_empty())
        .collect())
}

fn default_batch_size() -> usize {
    16384
}

fn default_linger_ms() -> u64 {
    100
}

fn default_buffer_memory() -> usize {
    33_554_432 // 32MB
}

fn default_max_in_flight() -> usize {
    5
}

fn default_enable_ordering() -> bool {
    true
}

fn default_retries() -> u32 {
    3
}

fn default_connect_max_retries() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_backoff_jitter() -> f64 {
    0.2
}

fn default_metadata_ttl_secs() -> u64 {
    300
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_reauth_interval_secs() -> u64 {
    3600
}

fn default_flush_timeout_ms() -> u64 {
    10_000
}

fn default_io_workers() -> usize {
    4
}

fn default_acks() -> String {
    "all".to_string()
}
