//! Per-tenant file discovery and publishing.
//!
//! A [`DiscoveryWorker`] owns one tenant. Each tick it walks the tenant's
//! directory, skips files already in the tenant's published-files set and
//! anything under the excluded subdirectory, chunks each new file, publishes
//! every chunk, and only then adds the file to the published set. A file the
//! chunker rejects is logged and left unmarked so a later pass retries it;
//! broker failures abort the pass.
//!
//! If the process dies after some chunks of a file are appended but before
//! the file is marked, the next run republishes the whole file. Those
//! duplicates carry the same `chunk_id`s as the originals but are not
//! filtered here.

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::backoff::BackoffPolicy;
use crate::broker::{RedisBroker, StreamBroker};
use crate::chunker::{create_captioner, Chunker, ImageChunker, TextChunker};
use crate::config::Config;
use crate::keys;
use crate::models::{Chunk, MediaKind};
use crate::publisher::{stamp_publish_fields, StreamPublisher};

pub struct DiscoveryWorker {
    tenant: String,
    root: PathBuf,
    skip_dir: String,
    excludes: GlobSet,
    broker: Arc<dyn StreamBroker>,
    publisher: StreamPublisher,
    chunkers: Vec<Box<dyn Chunker>>,
    poll_interval: Duration,
    backoff: BackoffPolicy,
}

impl DiscoveryWorker {
    /// Connect to the configured broker and build a worker for `tenant`.
    ///
    /// An unreachable broker is fatal.
    pub async fn connect(config: &Config, tenant: &str) -> Result<Self> {
        let broker = RedisBroker::connect(&config.broker.url).await?;
        info!(tenant = %tenant, "Connected to broker");
        Self::new(config, tenant, Arc::new(broker))
    }

    /// Build a worker with the text and image chunkers selected by
    /// configuration.
    pub fn new(config: &Config, tenant: &str, broker: Arc<dyn StreamBroker>) -> Result<Self> {
        let chunkers: Vec<Box<dyn Chunker>> = vec![
            Box::new(TextChunker::new(tenant, &config.chunking)),
            Box::new(ImageChunker::new(
                tenant,
                &config.chunking,
                create_captioner(&config.captioning)?,
            )),
        ];
        Self::with_chunkers(config, tenant, broker, chunkers)
    }

    /// Build a worker with explicit chunkers. A file whose kind no chunker
    /// handles is skipped as unsupported.
    pub fn with_chunkers(
        config: &Config,
        tenant: &str,
        broker: Arc<dyn StreamBroker>,
        chunkers: Vec<Box<dyn Chunker>>,
    ) -> Result<Self> {
        Ok(Self {
            tenant: tenant.to_string(),
            root: config.producer.tenant_root(tenant),
            skip_dir: config.producer.skip_dir.clone(),
            excludes: build_globset(&config.producer.exclude_globs)?,
            publisher: StreamPublisher::new(broker.clone(), &config.broker.stream_key),
            broker,
            chunkers,
            poll_interval: config.producer.poll_interval(),
            backoff: BackoffPolicy::from_config(&config.backoff),
        })
    }

    /// All candidate files under the tenant root, sorted, with the excluded
    /// subtree pruned. A missing root yields no files.
    pub fn discover_files(&self) -> Result<Vec<PathBuf>> {
        if !self.root.is_dir() {
            debug!(tenant = %self.tenant, root = %self.root.display(), "Tenant root missing");
            return Ok(Vec::new());
        }

        let skip_dir = self.skip_dir.as_str();
        let walker = WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !(e.depth() > 0 && e.file_type().is_dir() && e.file_name() == skip_dir));

        let mut files = Vec::new();
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            if self.excludes.is_match(relative) {
                continue;
            }
            files.push(path.to_path_buf());
        }
        Ok(files)
    }

    /// One discovery pass. Returns the number of chunks published.
    pub async fn run_once(&self) -> Result<u64> {
        let published_key = keys::published_files(&self.tenant);
        let mut total_published = 0u64;

        for path in self.discover_files()? {
            let file_path = path.to_string_lossy().to_string();
            if self.broker.set_is_member(&published_key, &file_path).await? {
                continue;
            }

            let Some(chunker) = MediaKind::from_path(&path).and_then(|k| self.chunker_for(k))
            else {
                warn!(tenant = %self.tenant, file = %file_path, "Skipping unsupported file format");
                continue;
            };

            // A file that cannot be chunked stays unmarked and is retried next
            // pass; it must not hold up the files after it.
            let chunks = match chunker.process_files(&[path.clone()]).await {
                Ok(chunks) => chunks,
                Err(e) => {
                    error!(
                        tenant = %self.tenant,
                        file = %file_path,
                        error = %format!("{:#}", e),
                        "Failed to chunk file, will retry"
                    );
                    continue;
                }
            };

            let published = self.publish_chunks(chunks).await?;
            total_published += published as u64;

            self.broker.set_add(&published_key, &file_path).await?;
            info!(
                tenant = %self.tenant,
                file = %file_path,
                chunks = published,
                "Marked file as published"
            );
        }

        if total_published > 0 {
            info!(
                tenant = %self.tenant,
                chunks = total_published,
                "Finished publishing new files"
            );
        }
        Ok(total_published)
    }

    fn chunker_for(&self, kind: MediaKind) -> Option<&dyn Chunker> {
        self.chunkers
            .iter()
            .find(|c| c.kind() == kind)
            .map(|c| c.as_ref())
    }

    async fn publish_chunks(&self, chunks: Vec<Chunk>) -> Result<usize> {
        let total = chunks.len();
        for (index, mut chunk) in chunks.into_iter().enumerate() {
            stamp_publish_fields(&mut chunk, index, total);
            self.publisher.publish(&chunk).await?;
        }
        Ok(total)
    }

    /// Run discovery forever, one pass per poll interval.
    ///
    /// A failed pass is logged and retried on a later tick; the backoff
    /// policy's delay is added to the interval while failures persist.
    pub async fn run(&self) {
        info!(
            tenant = %self.tenant,
            root = %self.root.display(),
            interval_secs = self.poll_interval.as_secs(),
            "Discovery worker started"
        );
        let mut failures = 0u32;
        loop {
            let mut delay = self.poll_interval;
            match self.run_once().await {
                Ok(_) => failures = 0,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    delay += self.backoff.delay(failures);
                    error!(
                        tenant = %self.tenant,
                        failures,
                        error = %format!("{:#}", e),
                        "Discovery pass failed"
                    );
                }
            }
            tokio::time::sleep(delay).await;
        }
    }
}

/// Create `data_dir/<tenant>` for every configured tenant.
pub fn ensure_tenant_dirs(config: &Config) -> Result<Vec<PathBuf>> {
    let mut created = Vec::with_capacity(config.producer.tenants.len());
    for tenant in &config.producer.tenants {
        let dir = config.producer.tenant_root(tenant);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create tenant directory: {}", dir.display()))?;
        info!(tenant = %tenant, dir = %dir.display(), "Tenant directory ready");
        created.push(dir);
    }
    Ok(created)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
