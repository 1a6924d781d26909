//! Vector-index client abstraction.
//!
//! Embedding and storage happen behind [`IndexClient`]. The consumer submits
//! each batch with one [`add_documents`](IndexClient::add_documents) call and
//! treats the call as all-or-nothing: an error means none of the batch may be
//! acknowledged.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::IndexConfig;
use crate::models::IndexDocument;

#[async_trait]
pub trait IndexClient: Send + Sync {
    /// Insert documents. Fails as a unit; there is no partial-success report.
    async fn add_documents(&self, docs: &[IndexDocument]) -> Result<()>;
}

// ============ HTTP ============

/// Index client that posts documents to an HTTP vector-index service.
///
/// Large inputs are sent in sub-batches of `batch_size` to
/// `POST {url}/collections/{collection}/add` with body
/// `{"documents": [{"page_content": ..., "metadata": {...}}]}`. The first
/// failing sub-batch fails the whole call.
pub struct HttpIndexClient {
    client: reqwest::Client,
    endpoint: String,
    batch_size: usize,
}

impl HttpIndexClient {
    pub fn new(config: &IndexConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: format!(
                "{}/collections/{}/add",
                config.url.trim_end_matches('/'),
                config.collection
            ),
            batch_size: config.batch_size.max(1),
        })
    }
}

#[async_trait]
impl IndexClient for HttpIndexClient {
    async fn add_documents(&self, docs: &[IndexDocument]) -> Result<()> {
        if docs.is_empty() {
            warn!("No documents to add");
            return Ok(());
        }

        let batches = docs.len().div_ceil(self.batch_size);
        info!(
            count = docs.len(),
            batch_size = self.batch_size,
            "Adding documents to index"
        );

        for (i, batch) in docs.chunks(self.batch_size).enumerate() {
            let start = Instant::now();
            let body = serde_json::json!({ "documents": batch });
            let response = self.client.post(&self.endpoint).json(&body).send().await?;

            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                bail!("Index service error {}: {}", status, text);
            }
            info!(
                batch = i + 1,
                of = batches,
                size = batch.len(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Index batch added"
            );
        }

        Ok(())
    }
}

// ============ In-memory ============

/// Recording index for tests and dry runs.
///
/// Keeps every accepted document. [`fail_next`](InMemoryIndex::fail_next)
/// makes the next N calls fail without storing anything.
pub struct InMemoryIndex {
    docs: Mutex<Vec<IndexDocument>>,
    calls: AtomicUsize,
    failures_left: AtomicUsize,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self {
            docs: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(0),
        }
    }

    pub fn fail_next(&self, calls: usize) {
        self.failures_left.store(calls, Ordering::SeqCst);
    }

    pub fn documents(&self) -> Vec<IndexDocument> {
        self.docs.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.docs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `add_documents` calls, failed ones included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IndexClient for InMemoryIndex {
    async fn add_documents(&self, docs: &[IndexDocument]) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            bail!("index unavailable");
        }
        self.docs.lock().unwrap().extend_from_slice(docs);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkMetadata;

    fn doc(text: &str) -> IndexDocument {
        IndexDocument {
            page_content: text.to_string(),
            metadata: ChunkMetadata::new("A", "f.txt", "text"),
        }
    }

    #[tokio::test]
    async fn test_in_memory_index_records_documents() {
        let index = InMemoryIndex::new();
        index.add_documents(&[doc("a"), doc("b")]).await.unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.calls(), 1);
    }

    #[tokio::test]
    async fn test_in_memory_index_fail_next() {
        let index = InMemoryIndex::new();
        index.fail_next(1);
        assert!(index.add_documents(&[doc("a")]).await.is_err());
        assert!(index.is_empty());
        index.add_documents(&[doc("a")]).await.unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.calls(), 2);
    }

    #[test]
    fn test_http_endpoint_is_built_from_config() {
        let config = IndexConfig {
            url: "http://localhost:8000/".to_string(),
            collection: "docs".to_string(),
            ..IndexConfig::default()
        };
        let client = HttpIndexClient::new(&config).unwrap();
        assert_eq!(client.endpoint, "http://localhost:8000/collections/docs/add");
    }

    #[test]
    fn test_document_serializes_with_metadata() {
        let json = serde_json::to_value(doc("hello")).unwrap();
        assert_eq!(json["page_content"], "hello");
        assert_eq!(json["metadata"]["user_id"], "A");
    }
}
