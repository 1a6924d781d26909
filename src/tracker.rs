//! Per-file completion accounting.
//!
//! Every successfully indexed chunk bumps its file's counter with one atomic
//! increment. The worker whose increment lands exactly on `total_chunks`
//! records the file as completed and drops the counter. Concurrent workers
//! never read-modify-write the counter, so two increments for the same file
//! cannot both see the final value.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, info};

use crate::broker::StreamBroker;
use crate::keys;
use crate::models::ChunkMetadata;

/// Outcome of recording one indexed chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Metadata lacked a tenant, path or chunk total; nothing was counted.
    Untracked,
    /// Counted; `count` of `total` chunks seen so far.
    Partial { count: i64, total: u64 },
    /// This chunk completed the file.
    Completed,
}

pub struct CompletionTracker {
    broker: Arc<dyn StreamBroker>,
}

impl CompletionTracker {
    pub fn new(broker: Arc<dyn StreamBroker>) -> Self {
        Self { broker }
    }

    pub async fn record_indexed(&self, metadata: &ChunkMetadata) -> Result<Progress> {
        let total = match metadata.total_chunks {
            Some(total) if !metadata.user_id.is_empty() && !metadata.file_path.is_empty() => {
                total
            }
            _ => return Ok(Progress::Untracked),
        };

        let counter = keys::chunk_counter(&metadata.user_id, &metadata.file_path);
        let count = self
            .broker
            .hash_increment(&counter, keys::CHUNK_COUNTER_FIELD, 1)
            .await
            .with_context(|| format!("Failed to increment counter {}", counter))?;

        if count == total as i64 {
            self.broker
                .set_add(&keys::completed_files(&metadata.user_id), &metadata.file_path)
                .await?;
            self.broker.delete(&counter).await?;
            info!(
                tenant = %metadata.user_id,
                file = %metadata.file_path,
                total,
                "File fully indexed"
            );
            return Ok(Progress::Completed);
        }

        debug!(file = %metadata.file_path, count, total, "Chunk counted");
        Ok(Progress::Partial { count, total })
    }
}
