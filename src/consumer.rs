//! Consumer-group worker.
//!
//! Each worker is one member of the shared consumer group. Its loop reads
//! new messages assigned to it, and every `reclaim_every` iterations first
//! claims messages that some consumer has held unacknowledged for longer
//! than the claim timeout. Both paths go through [`ConsumerWorker::process_batch`],
//! which indexes the batch with one bulk call and only then lets its ids be
//! acknowledged.
//!
//! ```text
//! STARTING ──▶ AWAITING_GROUP ──▶ ┌─▶ POLLING_PENDING ─┐
//!                                 │         │          ▼
//!                                 │         └──▶ PROCESSING
//!                                 │                    │
//!                                 └── POLLING_NEW ◀────┘
//! ```
//!
//! A broker connection or group-creation failure at startup is returned to
//! the caller. Anything that fails inside the loop is logged and followed by
//! the backoff delay.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::broker::{GroupCreation, RedisBroker, StreamBroker};
use crate::config::Config;
use crate::index::{HttpIndexClient, IndexClient};
use crate::models::{MessageError, StreamEntry};
use crate::tracker::CompletionTracker;

/// Start id used when claiming stale messages: scan the whole pending list.
const CLAIM_START_ID: &str = "0-0";
/// Position the group is created at, so it sees the stream from its origin.
const GROUP_START_ID: &str = "0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    AwaitingGroup,
    PollingPending,
    PollingNew,
    Processing,
}

pub struct ConsumerWorker {
    name: String,
    stream_key: String,
    group: String,
    batch_size: usize,
    claim_timeout_ms: u64,
    block_ms: u64,
    reclaim_every: u64,
    dead_letter_stream: Option<String>,
    broker: Arc<dyn StreamBroker>,
    index: Arc<dyn IndexClient>,
    tracker: CompletionTracker,
    backoff: BackoffPolicy,
    state: WorkerState,
}

impl ConsumerWorker {
    /// Connect to the broker and index service, then make sure the group
    /// exists. Any failure here is fatal for the worker.
    pub async fn connect(config: &Config, name: &str) -> Result<Self> {
        let broker = RedisBroker::connect(&config.broker.url)
            .await
            .with_context(|| format!("Consumer '{}' could not connect to broker", name))?;
        info!(consumer = %name, "Connected to broker");
        let index = HttpIndexClient::new(&config.index)?;

        let mut worker = Self::new(config, name, Arc::new(broker), Arc::new(index));
        worker.ensure_group().await?;
        if let Err(e) = worker.prune_idle_consumers().await {
            warn!(consumer = %name, error = %format!("{:#}", e), "Could not prune idle consumers");
        }
        Ok(worker)
    }

    pub fn new(
        config: &Config,
        name: &str,
        broker: Arc<dyn StreamBroker>,
        index: Arc<dyn IndexClient>,
    ) -> Self {
        let consumer = &config.consumer;
        Self {
            name: name.to_string(),
            stream_key: config.broker.stream_key.clone(),
            group: consumer.group.clone(),
            batch_size: consumer.batch_size,
            claim_timeout_ms: consumer.claim_timeout_ms,
            block_ms: consumer.block_ms,
            reclaim_every: consumer.reclaim_every.max(1),
            dead_letter_stream: consumer.dead_letter_stream.clone(),
            tracker: CompletionTracker::new(broker.clone()),
            broker,
            index,
            backoff: BackoffPolicy::from_config(&config.backoff),
            state: WorkerState::Starting,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    fn enter(&mut self, next: WorkerState) {
        if self.state != next {
            debug!(consumer = %self.name, from = ?self.state, to = ?next, "State change");
            self.state = next;
        }
    }

    /// Create the consumer group at the stream origin. "Already exists" is
    /// success; any other error is returned.
    pub async fn ensure_group(&mut self) -> Result<GroupCreation> {
        self.enter(WorkerState::AwaitingGroup);
        let outcome = self
            .broker
            .create_group(&self.stream_key, &self.group, GROUP_START_ID)
            .await
            .with_context(|| {
                format!(
                    "Failed to create consumer group '{}' on '{}'",
                    self.group, self.stream_key
                )
            })?;
        match outcome {
            GroupCreation::Created => info!(
                consumer = %self.name,
                group = %self.group,
                stream = %self.stream_key,
                "Created consumer group"
            ),
            GroupCreation::AlreadyExists => info!(
                consumer = %self.name,
                group = %self.group,
                "Consumer group already exists"
            ),
        }
        Ok(outcome)
    }

    /// Remove other group members that hold no pending messages and have
    /// been idle for at least the claim timeout. Consumer names embed the
    /// process id, so every restart would otherwise leave its predecessors
    /// registered in the group. Consumers that still own messages are kept
    /// until the reclaim pass has moved those messages away.
    pub async fn prune_idle_consumers(&self) -> Result<usize> {
        let consumers = self
            .broker
            .list_consumers(&self.stream_key, &self.group)
            .await
            .with_context(|| format!("Failed to list consumers of group '{}'", self.group))?;

        let mut removed = 0;
        for stale in consumers.iter().filter(|c| {
            c.name != self.name && c.pending == 0 && c.idle_ms >= self.claim_timeout_ms
        }) {
            self.broker
                .remove_consumer(&self.stream_key, &self.group, &stale.name)
                .await?;
            debug!(
                consumer = %self.name,
                stale = %stale.name,
                idle_ms = stale.idle_ms,
                "Removed idle consumer"
            );
            removed += 1;
        }
        if removed > 0 {
            info!(consumer = %self.name, count = removed, "Pruned idle consumers from group");
        }
        Ok(removed)
    }

    /// Turn a batch of stream entries into index documents, add them in one
    /// bulk call, and count each indexed chunk toward its file's completion.
    ///
    /// Returns the ids that may be acknowledged. Malformed entries are left
    /// out unless a dead-letter stream is configured and the entry was
    /// written to it. If the bulk add or the counting fails, no indexed id is
    /// returned and the whole batch stays pending.
    pub async fn process_batch(&self, entries: &[StreamEntry]) -> Vec<String> {
        let mut ready = Vec::new();
        let mut docs = Vec::with_capacity(entries.len());
        let mut doc_ids = Vec::with_capacity(entries.len());

        for entry in entries {
            match entry.to_document() {
                Ok(doc) => {
                    docs.push(doc);
                    doc_ids.push(entry.id.clone());
                }
                Err(reason) => {
                    warn!(
                        consumer = %self.name,
                        id = %entry.id,
                        error = %reason,
                        "Invalid message format, skipping"
                    );
                    if let Some(stream) = &self.dead_letter_stream {
                        match self.dead_letter(stream, entry, &reason).await {
                            Ok(()) => ready.push(entry.id.clone()),
                            Err(e) => error!(
                                consumer = %self.name,
                                id = %entry.id,
                                error = %format!("{:#}", e),
                                "Failed to dead-letter message"
                            ),
                        }
                    }
                }
            }
        }

        if docs.is_empty() {
            return ready;
        }

        if let Err(e) = self.index.add_documents(&docs).await {
            error!(
                consumer = %self.name,
                count = docs.len(),
                error = %format!("{:#}", e),
                "Failed to add documents to index"
            );
            return ready;
        }
        info!(consumer = %self.name, count = docs.len(), "Added documents to index");

        for doc in &docs {
            if let Err(e) = self.tracker.record_indexed(&doc.metadata).await {
                error!(
                    consumer = %self.name,
                    file = %doc.metadata.file_path,
                    error = %format!("{:#}", e),
                    "Failed to update chunk counts"
                );
                return ready;
            }
        }

        ready.extend(doc_ids);
        ready
    }

    async fn dead_letter(
        &self,
        stream: &str,
        entry: &StreamEntry,
        reason: &MessageError,
    ) -> Result<()> {
        let raw = serde_json::to_string(&entry.fields)?;
        let reason = reason.to_string();
        self.broker
            .append(
                stream,
                &[
                    ("original_id", entry.id.as_str()),
                    ("reason", reason.as_str()),
                    ("fields", raw.as_str()),
                ],
            )
            .await?;
        info!(consumer = %self.name, id = %entry.id, stream = %stream, "Message dead-lettered");
        Ok(())
    }

    async fn acknowledge(&self, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.broker
            .ack(&self.stream_key, &self.group, ids)
            .await
            .context("Failed to acknowledge messages")
    }

    /// Claim messages idle past the claim timeout, from any consumer, and
    /// process them. Returns the number acknowledged.
    pub async fn reclaim_pending(&mut self) -> Result<usize> {
        self.enter(WorkerState::PollingPending);
        let claimed = self
            .broker
            .claim_stale(
                &self.stream_key,
                &self.group,
                &self.name,
                self.claim_timeout_ms,
                CLAIM_START_ID,
                self.batch_size,
            )
            .await?;
        if claimed.is_empty() {
            debug!(consumer = %self.name, "No pending messages to claim");
            return Ok(0);
        }
        info!(consumer = %self.name, count = claimed.len(), "Claimed pending messages");

        self.enter(WorkerState::Processing);
        let ids = self.process_batch(&claimed).await;
        let acked = self.acknowledge(&ids).await?;
        if acked > 0 {
            info!(consumer = %self.name, count = acked, "Acknowledged claimed messages");
        }
        Ok(acked)
    }

    /// Wait up to the block timeout for new messages and process them.
    /// Returns the number acknowledged.
    pub async fn poll_new(&mut self) -> Result<usize> {
        self.enter(WorkerState::PollingNew);
        let entries = self
            .broker
            .read_group(
                &self.stream_key,
                &self.group,
                &self.name,
                self.batch_size,
                self.block_ms,
            )
            .await?;
        if entries.is_empty() {
            debug!(consumer = %self.name, "No new messages");
            return Ok(0);
        }

        self.enter(WorkerState::Processing);
        let ids = self.process_batch(&entries).await;
        let acked = self.acknowledge(&ids).await?;
        if acked > 0 {
            info!(consumer = %self.name, count = acked, "Acknowledged new messages");
        }
        Ok(acked)
    }

    /// One loop iteration: the reclaim pass when `iteration` is a multiple
    /// of `reclaim_every`, then a read of new messages.
    pub async fn run_iteration(&mut self, iteration: u64) -> Result<usize> {
        let mut acked = 0;
        if iteration % self.reclaim_every == 0 {
            acked += self.reclaim_pending().await?;
        }
        acked += self.poll_new().await?;
        Ok(acked)
    }

    /// Run until the process is terminated.
    pub async fn run(&mut self) {
        info!(consumer = %self.name, group = %self.group, "Consumer worker started");
        let mut iteration = 0u64;
        let mut failures = 0u32;
        loop {
            match self.run_iteration(iteration).await {
                Ok(_) => failures = 0,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = self.backoff.delay(failures);
                    error!(
                        consumer = %self.name,
                        failures,
                        retry_ms = delay.as_millis() as u64,
                        error = %format!("{:#}", e),
                        "Error in consumer loop"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
            iteration = iteration.wrapping_add(1);
        }
    }
}
