use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::time::Duration;

/// Main configuration structure that mirrors the config.yaml file
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub service: ServiceConfig,
    #[serde(default = "BrokerConfig::default")]
    pub broker: BrokerConfig,
    #[serde(default = "ProducerConfig::default")]
    pub producer: ProducerConfig,
    #[serde(default = "ConsumersConfig::default")]
    pub consumers: ConsumersConfig,
    /// Declarative listener table
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
    /// Job name -> trigger expression
    #[serde(default)]
    pub jobs: HashMap<String, String>,
    #[serde(default = "HttpConfig::default")]
    pub http: HttpConfig,
    // Optional configs with defaults
    #[serde(default = "LoggingConfig::default")]
    pub logging: LoggingConfig,
    #[serde(default = "ShutdownConfig::default")]
    pub shutdown: ShutdownConfig,
    #[serde(default = "RetryConfig::default")]
    pub retry: RetryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
}

/// Where a group starts reading a partition it has never committed
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    Earliest,
    Latest,
}

/// Settings for the in-process broker
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerConfig {
    #[serde(default = "default_partitions")]
    pub default_partitions: u32,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    #[serde(default = "default_offset_reset")]
    pub auto_offset_reset: OffsetReset,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProducerConfig {
    /// Upper bound for blocking sends and transaction commits
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_topic")]
    pub default_topic: String,
}

/// Who commits the acknowledgment token of a delivered record
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AckMode {
    /// The handler commits explicitly
    Manual,
    /// The container commits after the handler returns normally
    Record,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConsumersConfig {
    #[serde(default = "default_ack_mode")]
    pub ack_mode: AckMode,
    /// Group used by listeners that do not name one
    #[serde(default = "default_group_id")]
    pub group_id: String,
}

/// One declaratively registered listener
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ListenerConfig {
    /// Control identity; generated when omitted
    #[serde(default)]
    pub id: Option<String>,
    pub topics: Vec<String>,
    #[serde(default)]
    pub group_id: Option<String>,
    /// Name of a handler registered in code
    pub handler: String,
    /// Topic that receives the handler's string replies
    #[serde(default)]
    pub forward_to: Option<String>,
    #[serde(default = "default_auto_start")]
    pub auto_start: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_http_key")]
    pub key: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    /// Maximum number of redelivery attempts. -1 means infinite retries.
    pub max_attempts: i32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub output: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ShutdownConfig {
    pub timeout_secs: u32,
    pub grace_period_secs: u32,
}

fn default_partitions() -> u32 {
    1
}

fn default_max_message_bytes() -> usize {
    1024 * 1024
}

fn default_offset_reset() -> OffsetReset {
    OffsetReset::Earliest
}

fn default_send_timeout_ms() -> u64 {
    10_000
}

fn default_topic() -> String {
    "testTopic".to_string()
}

fn default_ack_mode() -> AckMode {
    AckMode::Manual
}

fn default_group_id() -> String {
    "defaultGroup".to_string()
}

fn default_auto_start() -> bool {
    true
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_http_key() -> String {
    "key".to_string()
}

impl RetryConfig {
    /// Calculate the delay for the given retry attempt using exponential backoff
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay_ms =
            (self.initial_delay_ms as f64) * self.backoff_multiplier.powi(attempt as i32);
        let capped_delay_ms = delay_ms.min(self.max_delay_ms as f64) as u64;

        Duration::from_millis(capped_delay_ms)
    }

    /// Check if we should retry based on the current attempt number
    pub fn should_retry(&self, attempt: u32) -> bool {
        if self.max_attempts < 0 {
            true // Infinite retries when negative
        } else {
            attempt < (self.max_attempts as u32)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: -1, // Infinite retries by default
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            default_partitions: default_partitions(),
            max_message_bytes: default_max_message_bytes(),
            auto_offset_reset: default_offset_reset(),
        }
    }
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: default_send_timeout_ms(),
            default_topic: default_topic(),
        }
    }
}

impl Default for ConsumersConfig {
    fn default() -> Self {
        Self {
            ack_mode: default_ack_mode(),
            group_id: default_group_id(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_bind(),
            topic: default_topic(),
            key: default_http_key(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: "stdout".to_string(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            grace_period_secs: 5,
        }
    }
}

impl ProducerConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl ShutdownConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs as u64)
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path))?;

        Ok(config)
    }

    /// Minimal configuration for a named service, everything else defaulted
    pub fn for_service(name: &str) -> Self {
        Self {
            service: ServiceConfig {
                name: name.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                description: String::new(),
            },
            broker: BrokerConfig::default(),
            producer: ProducerConfig::default(),
            consumers: ConsumersConfig::default(),
            listeners: Vec::new(),
            jobs: HashMap::new(),
            http: HttpConfig::default(),
            logging: LoggingConfig::default(),
            shutdown: ShutdownConfig::default(),
            retry: RetryConfig::default(),
        }
    }

    /// Structural checks that do not need the handler catalog
    pub fn validate(&self) -> Result<()> {
        if self.broker.default_partitions == 0 {
            anyhow::bail!("broker.default_partitions must be at least 1");
        }

        let mut seen = HashSet::new();
        for (index, listener) in self.listeners.iter().enumerate() {
            if listener.topics.is_empty() || listener.topics.iter().any(|t| t.trim().is_empty()) {
                anyhow::bail!("listener #{} ('{}') needs at least one non-empty topic", index, listener.handler);
            }
            if let Some(id) = &listener.id {
                if !seen.insert(id.as_str()) {
                    anyhow::bail!("listener id '{}' is declared more than once", id);
                }
            }
        }

        for (job, trigger) in &self.jobs {
            if trigger.trim().is_empty() {
                anyhow::bail!("job '{}' has an empty trigger expression", job);
            }
        }

        Ok(())
    }

    /// Group id a listener actually joins
    pub fn group_for(&self, listener: &ListenerConfig) -> String {
        listener
            .group_id
            .clone()
            .unwrap_or_else(|| self.consumers.group_id.clone())
    }

    /// Identity a listener is registered under
    pub fn identity_for(&self, index: usize, listener: &ListenerConfig) -> String {
        listener
            .id
            .clone()
            .unwrap_or_else(|| format!("{}-listener-{}", listener.handler, index))
    }

    /// Trigger expression configured for a job
    pub fn get_job_trigger(&self, name: &str) -> Option<&String> {
        self.jobs.get(name)
    }

    /// All topics any listener subscribes to
    pub fn get_all_listener_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .listeners
            .iter()
            .flat_map(|l| l.topics.iter().cloned())
            .collect();
        topics.sort();
        topics.dedup();
        topics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_test_config_yaml() -> &'static str {
        r#"
service:
  name: "test-service"
  version: "1.0.0"
  description: "Test service"

broker:
  default_partitions: 3
  max_message_bytes: 2048
  auto_offset_reset: "latest"

producer:
  send_timeout_ms: 500
  default_topic: "orders"

consumers:
  ack_mode: "record"
  group_id: "orders-group"

listeners:
  - id: "forwarder"
    topics: ["testTopic"]
    group_id: "testGroup"
    handler: "forward"
    forward_to: "topic-a"
  - topics: ["test"]
    handler: "late"
    auto_start: false

jobs:
  produce: "*/5 * * * * ?"

http:
  enabled: true
  bind: "0.0.0.0:9090"

logging:
  level: "debug"
  output: "stdout"

shutdown:
  timeout_secs: 10
  grace_period_secs: 2

retry:
  max_attempts: 3
  initial_delay_ms: 500
  max_delay_ms: 5000
  backoff_multiplier: 2.0
        "#
    }

    #[test]
    fn test_config_parsing() {
        let config: Config = serde_yaml::from_str(create_test_config_yaml()).unwrap();
        assert_eq!(config.service.name, "test-service");
        assert_eq!(config.broker.default_partitions, 3);
        assert_eq!(config.broker.max_message_bytes, 2048);
        assert_eq!(config.broker.auto_offset_reset, OffsetReset::Latest);
        assert_eq!(config.producer.send_timeout(), Duration::from_millis(500));
        assert_eq!(config.producer.default_topic, "orders");
        assert_eq!(config.consumers.ack_mode, AckMode::Record);
        assert_eq!(config.listeners.len(), 2);
        assert_eq!(config.listeners[0].forward_to.as_deref(), Some("topic-a"));
        assert!(config.listeners[0].auto_start);
        assert!(!config.listeners[1].auto_start);
        assert_eq!(config.get_job_trigger("produce").unwrap(), "*/5 * * * * ?");
        assert!(config.http.enabled);
        assert_eq!(config.http.bind, "0.0.0.0:9090");
        assert_eq!(config.http.topic, "testTopic");
        assert_eq!(config.shutdown.timeout(), Duration::from_secs(10));

        // Test retry delay calculations
        assert_eq!(config.retry.calculate_delay(0).as_millis(), 500);
        assert_eq!(config.retry.calculate_delay(1).as_millis(), 1000); // 500 * 2^1
        assert_eq!(config.retry.calculate_delay(2).as_millis(), 2000); // 500 * 2^2

        assert!(config.retry.should_retry(2));
        assert!(!config.retry.should_retry(3));
    }

    #[test]
    fn test_config_load_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(create_test_config_yaml().as_bytes()).unwrap();

        let config = Config::load(temp_file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.service.name, "test-service");
        assert_eq!(config.listeners[0].id.as_deref(), Some("forwarder"));
    }

    #[test]
    fn test_shipped_config_routes_every_reply() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config.yaml");
        let config = Config::load(path).unwrap();

        // Handlers that reply need somewhere to send the reply
        for handler in ["forward", "return"] {
            let listener = config
                .listeners
                .iter()
                .find(|l| l.handler == handler)
                .unwrap();
            assert!(listener.forward_to.is_some(), "'{}' listener has no forward topic", handler);
        }
        assert!(config.listeners.iter().any(|l| l.id.as_deref() == Some("listener1") && !l.auto_start));
    }

    #[test]
    fn test_config_load_nonexistent_file() {
        let result = Config::load("nonexistent.yaml");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_config_load_invalid_yaml() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"service: [unclosed").unwrap();

        let result = Config::load(temp_file.path().to_str().unwrap());
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_config_with_defaults() {
        let yaml = r#"
service:
  name: "minimal"
  version: "0.1.0"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.service.description, "");
        assert_eq!(config.broker.default_partitions, 1);
        assert_eq!(config.broker.max_message_bytes, 1024 * 1024);
        assert_eq!(config.broker.auto_offset_reset, OffsetReset::Earliest);
        assert_eq!(config.producer.send_timeout_ms, 10_000);
        assert_eq!(config.consumers.ack_mode, AckMode::Manual);
        assert_eq!(config.consumers.group_id, "defaultGroup");
        assert!(config.listeners.is_empty());
        assert!(config.jobs.is_empty());
        assert!(!config.http.enabled);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.shutdown.timeout_secs, 30);
        assert_eq!(config.retry.max_attempts, -1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duplicate_listener_ids_rejected() {
        let mut config = Config::for_service("dup");
        let listener = ListenerConfig {
            id: Some("same".to_string()),
            topics: vec!["a".to_string()],
            group_id: None,
            handler: "h".to_string(),
            forward_to: None,
            auto_start: true,
        };
        config.listeners = vec![listener.clone(), listener];

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("declared more than once"));
    }

    #[test]
    fn test_listener_without_topics_rejected() {
        let mut config = Config::for_service("empty");
        config.listeners.push(ListenerConfig {
            id: None,
            topics: vec![],
            group_id: None,
            handler: "h".to_string(),
            forward_to: None,
            auto_start: true,
        });

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_partitions_rejected() {
        let mut config = Config::for_service("zero");
        config.broker.default_partitions = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_group_and_identity_resolution() {
        let config: Config = serde_yaml::from_str(create_test_config_yaml()).unwrap();

        assert_eq!(config.group_for(&config.listeners[0]), "testGroup");
        assert_eq!(config.group_for(&config.listeners[1]), "orders-group");
        assert_eq!(config.identity_for(0, &config.listeners[0]), "forwarder");
        assert_eq!(config.identity_for(1, &config.listeners[1]), "late-listener-1");
        assert_eq!(config.get_all_listener_topics(), vec!["test".to_string(), "testTopic".to_string()]);
    }

    #[test]
    fn test_retry_config_default() {
        let retry_config = RetryConfig::default();
        assert_eq!(retry_config.max_attempts, -1);
        assert_eq!(retry_config.initial_delay_ms, 1000);

        // Test delay capping
        let large_delay = retry_config.calculate_delay(10);
        assert_eq!(large_delay.as_millis(), 30000);

        assert!(retry_config.should_retry(0));
        assert!(retry_config.should_retry(1000000));
    }

    #[test]
    fn test_retry_config_edge_cases() {
        let retry_config = RetryConfig {
            max_attempts: 0,
            initial_delay_ms: 1000,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
        };
        assert!(!retry_config.should_retry(0));

        let zero_delay_config = RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 0,
            max_delay_ms: 1000,
            backoff_multiplier: 2.0,
        };
        assert_eq!(zero_delay_config.calculate_delay(0).as_millis(), 0);
        assert_eq!(zero_delay_config.calculate_delay(5).as_millis(), 0);
    }

    proptest::proptest! {
        #[test]
        fn prop_retry_delay_never_exceeds_cap(
            attempt in 0u32..64u32,
            initial in 1u64..5_000u64,
            max in 5_000u64..60_000u64,
            multiplier in 1.0f64..4.0f64
        ) {
            let retry = RetryConfig {
                max_attempts: 5,
                initial_delay_ms: initial,
                max_delay_ms: max,
                backoff_multiplier: multiplier,
            };
            proptest::prop_assert!(retry.calculate_delay(attempt).as_millis() <= max as u128);
        }
    }
}
