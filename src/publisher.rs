//! Appends chunks to the shared ingestion stream.
//!
//! One message per chunk, with fields `page_content`, `metadata` (JSON) and
//! `timestamp`. No size cap is applied here.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;

use crate::broker::StreamBroker;
use crate::models::{Chunk, FIELD_METADATA, FIELD_PAGE_CONTENT, FIELD_TIMESTAMP};

pub struct StreamPublisher {
    broker: Arc<dyn StreamBroker>,
    stream_key: String,
}

impl StreamPublisher {
    pub fn new(broker: Arc<dyn StreamBroker>, stream_key: &str) -> Self {
        Self {
            broker,
            stream_key: stream_key.to_string(),
        }
    }

    /// Append one chunk; returns the broker-assigned message id.
    pub async fn publish(&self, chunk: &Chunk) -> Result<String> {
        let metadata =
            serde_json::to_string(&chunk.metadata).context("Failed to serialize chunk metadata")?;
        let timestamp = chrono::Local::now()
            .format("%Y-%m-%dT%H:%M:%S%.6f")
            .to_string();

        let id = self
            .broker
            .append(
                &self.stream_key,
                &[
                    (FIELD_PAGE_CONTENT, chunk.content.as_str()),
                    (FIELD_METADATA, metadata.as_str()),
                    (FIELD_TIMESTAMP, timestamp.as_str()),
                ],
            )
            .await
            .with_context(|| {
                format!(
                    "Failed to publish chunk of {} to stream '{}'",
                    chunk.metadata.file_path, self.stream_key
                )
            })?;
        debug!(id = %id, file = %chunk.metadata.file_path, "Chunk published");
        Ok(id)
    }
}

/// Stamp the publish-time fields onto a chunk: `total_chunks`, its position
/// in the file, and a content-derived `chunk_id`.
///
/// `chunk_id` is stable across re-publication of unchanged content, so
/// downstream readers can spot duplicates left by an interrupted run.
pub fn stamp_publish_fields(chunk: &mut Chunk, chunk_index: usize, total_chunks: usize) {
    let mut hasher = Sha256::new();
    hasher.update(chunk.metadata.user_id.as_bytes());
    hasher.update([0]);
    hasher.update(chunk.metadata.file_path.as_bytes());
    hasher.update([0]);
    hasher.update((chunk_index as u64).to_le_bytes());
    hasher.update(chunk.content.as_bytes());

    chunk.metadata.total_chunks = Some(total_chunks as u64);
    chunk.metadata.chunk_index = Some(chunk_index as u64);
    chunk.metadata.chunk_id = Some(format!("{:x}", hasher.finalize()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::models::ChunkMetadata;

    fn chunk(text: &str) -> Chunk {
        Chunk {
            content: text.to_string(),
            metadata: ChunkMetadata::new("A", "data/A/f.txt", "text"),
        }
    }

    #[test]
    fn test_stamp_sets_total_and_stable_id() {
        let mut a = chunk("hello");
        let mut b = chunk("hello");
        stamp_publish_fields(&mut a, 1, 3);
        stamp_publish_fields(&mut b, 1, 3);
        assert_eq!(a.metadata.total_chunks, Some(3));
        assert_eq!(a.metadata.chunk_index, Some(1));
        assert_eq!(a.metadata.chunk_id, b.metadata.chunk_id);

        let mut c = chunk("hello");
        stamp_publish_fields(&mut c, 2, 3);
        assert_ne!(a.metadata.chunk_id, c.metadata.chunk_id);
    }

    #[tokio::test]
    async fn test_publish_writes_all_fields() {
        let broker = Arc::new(InMemoryBroker::new());
        let publisher = StreamPublisher::new(broker.clone(), "stream");
        let mut c = chunk("body text");
        stamp_publish_fields(&mut c, 0, 1);
        publisher.publish(&c).await.unwrap();

        let entries = broker.entries("stream");
        assert_eq!(entries.len(), 1);
        let fields = &entries[0].fields;
        assert_eq!(fields.get(FIELD_PAGE_CONTENT).unwrap(), "body text");
        assert!(fields.contains_key(FIELD_TIMESTAMP));
        let meta: ChunkMetadata =
            serde_json::from_str(fields.get(FIELD_METADATA).unwrap()).unwrap();
        assert_eq!(meta.total_chunks, Some(1));
        assert_eq!(meta.user_id, "A");
    }
}
