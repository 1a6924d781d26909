use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub producer: ProducerConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub captioning: CaptioningConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_url")]
    pub url: String,
    #[serde(default = "default_stream_key")]
    pub stream_key: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
            stream_key: default_stream_key(),
        }
    }
}

fn default_broker_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}
fn default_stream_key() -> String {
    "ingestion_stream_chunks".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProducerConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_tenants")]
    pub tenants: Vec<String>,
    #[serde(default = "default_skip_dir")]
    pub skip_dir: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            tenants: default_tenants(),
            skip_dir: default_skip_dir(),
            poll_interval_secs: default_poll_interval_secs(),
            exclude_globs: Vec::new(),
        }
    }
}

impl ProducerConfig {
    /// Root directory scanned for one tenant.
    pub fn tenant_root(&self, tenant: &str) -> PathBuf {
        self.data_dir.join(tenant)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_tenants() -> Vec<String> {
    ["user_a", "user_b", "user_c", "user_d", "user_e"]
        .iter()
        .map(|t| t.to_string())
        .collect()
}
fn default_skip_dir() -> String {
    "books".to_string()
}
fn default_poll_interval_secs() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConsumerConfig {
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_consumer_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_claim_timeout_ms")]
    pub claim_timeout_ms: u64,
    #[serde(default = "default_block_ms")]
    pub block_ms: u64,
    #[serde(default = "default_reclaim_every")]
    pub reclaim_every: u64,
    #[serde(default)]
    pub dead_letter_stream: Option<String>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group: default_group(),
            name_prefix: default_name_prefix(),
            workers: default_workers(),
            batch_size: default_consumer_batch_size(),
            claim_timeout_ms: default_claim_timeout_ms(),
            block_ms: default_block_ms(),
            reclaim_every: default_reclaim_every(),
            dead_letter_stream: None,
        }
    }
}

impl ConsumerConfig {
    /// Consumer name for one pool member: `{prefix}-{pid}-{ordinal}`.
    ///
    /// A new pid means a new group member on every restart; workers prune
    /// idle predecessors at startup.
    pub fn consumer_name(&self, pid: u32, ordinal: usize) -> String {
        format!("{}-{}-{}", self.name_prefix, pid, ordinal)
    }
}

fn default_group() -> String {
    "ingestion_workers_group".to_string()
}
fn default_name_prefix() -> String {
    "worker".to_string()
}
fn default_workers() -> usize {
    4
}
fn default_consumer_batch_size() -> usize {
    5000
}
fn default_claim_timeout_ms() -> u64 {
    60_000
}
fn default_block_ms() -> u64 {
    1000
}
fn default_reclaim_every() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    Fixed,
    Exponential,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_strategy")]
    pub strategy: BackoffStrategy,
    #[serde(default = "default_backoff_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            strategy: default_backoff_strategy(),
            base_ms: default_backoff_base_ms(),
            max_ms: default_backoff_max_ms(),
        }
    }
}

fn default_backoff_strategy() -> BackoffStrategy {
    BackoffStrategy::Fixed
}
fn default_backoff_base_ms() -> u64 {
    2000
}
fn default_backoff_max_ms() -> u64 {
    30_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_image_chunk_size")]
    pub image_chunk_size: usize,
    #[serde(default = "default_image_chunk_overlap")]
    pub image_chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            image_chunk_size: default_image_chunk_size(),
            image_chunk_overlap: default_image_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    2048
}
fn default_chunk_overlap() -> usize {
    200
}
fn default_image_chunk_size() -> usize {
    256
}
fn default_image_chunk_overlap() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_index_url")]
    pub url: String,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_index_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            url: default_index_url(),
            collection: default_collection(),
            batch_size: default_index_batch_size(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_index_url() -> String {
    "http://127.0.0.1:8000".to_string()
}
fn default_collection() -> String {
    "all_users_docs".to_string()
}
fn default_index_batch_size() -> usize {
    2000
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CaptioningConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Load and validate the configuration file.
///
/// A missing file yields [`Config::default`]; a file that exists but fails to
/// parse or validate is an error.
pub fn load_config(path: &Path) -> Result<Config> {
    let config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content).with_context(|| "Failed to parse config file")?
    } else {
        Config::default()
    };

    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.broker.stream_key.trim().is_empty() {
        anyhow::bail!("broker.stream_key must not be empty");
    }

    if config.producer.tenants.is_empty() {
        anyhow::bail!("producer.tenants must list at least one tenant");
    }

    if config.consumer.group.trim().is_empty() {
        anyhow::bail!("consumer.group must not be empty");
    }
    if config.consumer.workers == 0 {
        anyhow::bail!("consumer.workers must be >= 1");
    }
    if config.consumer.batch_size == 0 {
        anyhow::bail!("consumer.batch_size must be >= 1");
    }
    if config.consumer.reclaim_every == 0 {
        anyhow::bail!("consumer.reclaim_every must be >= 1");
    }

    if config.backoff.base_ms > config.backoff.max_ms {
        anyhow::bail!("backoff.base_ms must be <= backoff.max_ms");
    }

    if config.chunking.chunk_size == 0 || config.chunking.image_chunk_size == 0 {
        anyhow::bail!("chunking sizes must be > 0");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        anyhow::bail!("chunking.chunk_overlap must be < chunking.chunk_size");
    }
    if config.chunking.image_chunk_overlap >= config.chunking.image_chunk_size {
        anyhow::bail!("chunking.image_chunk_overlap must be < chunking.image_chunk_size");
    }

    if config.index.batch_size == 0 {
        anyhow::bail!("index.batch_size must be >= 1");
    }

    Ok(())
}
