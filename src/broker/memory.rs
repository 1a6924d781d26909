//! In-memory [`StreamBroker`] for tests and local dry runs.
//!
//! Reproduces the parts of Redis Streams the pipeline relies on: monotonic
//! ids, consumer groups with a last-delivered cursor, a pending-entries list
//! with per-entry owner and delivery time, idle-based reclaiming,
//! acknowledgement, and group membership with last-seen times. Sets and hash counters live alongside.
//!
//! All state sits behind one `std::sync::Mutex`, so every trait call is
//! atomic with respect to every other, the same guarantee a single Redis
//! server gives.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tokio::sync::Notify;

use super::{ConsumerInfo, GroupCreation, StreamBroker};
use crate::models::StreamEntry;

struct StoredMessage {
    seq: u64,
    id: String,
    fields: HashMap<String, String>,
}

struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

#[derive(Default)]
struct GroupState {
    last_delivered: u64,
    pending: BTreeMap<u64, PendingEntry>,
    /// Consumer name to the last time it read or claimed.
    consumers: HashMap<String, Instant>,
}

#[derive(Default)]
struct StreamState {
    messages: Vec<StoredMessage>,
    groups: HashMap<String, GroupState>,
}

impl StreamState {
    fn entry(&self, seq: u64) -> Option<&StoredMessage> {
        self.messages
            .binary_search_by_key(&seq, |m| m.seq)
            .ok()
            .map(|i| &self.messages[i])
    }
}

#[derive(Default)]
struct State {
    next_seq: u64,
    streams: HashMap<String, StreamState>,
    sets: HashMap<String, BTreeSet<String>>,
    hashes: HashMap<String, HashMap<String, i64>>,
    append_budget: Option<usize>,
}

/// In-memory broker with Redis-Streams semantics.
pub struct InMemoryBroker {
    state: Mutex<State>,
    appended: Notify,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            appended: Notify::new(),
        }
    }

    /// Allow only `budget` further appends; later ones fail. `None` lifts the
    /// limit. Used to simulate a producer dying part-way through a file.
    pub fn set_append_budget(&self, budget: Option<usize>) {
        self.state.lock().unwrap().append_budget = budget;
    }

    /// Every message in a stream, in id order.
    pub fn entries(&self, stream: &str) -> Vec<StreamEntry> {
        let state = self.state.lock().unwrap();
        state
            .streams
            .get(stream)
            .map(|s| {
                s.messages
                    .iter()
                    .map(|m| StreamEntry::new(m.id.clone(), m.fields.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn stream_len(&self, stream: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.streams.get(stream).map_or(0, |s| s.messages.len())
    }

    /// Ids pending for one consumer of a group.
    pub fn pending_for(&self, stream: &str, group: &str, consumer: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let Some(stream_state) = state.streams.get(stream) else {
            return Vec::new();
        };
        let Some(group_state) = stream_state.groups.get(group) else {
            return Vec::new();
        };
        group_state
            .pending
            .iter()
            .filter(|(_, p)| p.consumer == consumer)
            .filter_map(|(seq, _)| stream_state.entry(*seq).map(|m| m.id.clone()))
            .collect()
    }

    /// How many times a pending message has been delivered.
    pub fn delivery_count(&self, stream: &str, group: &str, id: &str) -> Option<u64> {
        let seq = parse_seq(id).ok()?;
        let state = self.state.lock().unwrap();
        state
            .streams
            .get(stream)?
            .groups
            .get(group)?
            .pending
            .get(&seq)
            .map(|p| p.delivery_count)
    }

    pub fn set_members(&self, key: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn hash_get(&self, key: &str, field: &str) -> Option<i64> {
        let state = self.state.lock().unwrap();
        state.hashes.get(key)?.get(field).copied()
    }

    pub fn key_exists(&self, key: &str) -> bool {
        let state = self.state.lock().unwrap();
        state.streams.contains_key(key)
            || state.sets.contains_key(key)
            || state.hashes.contains_key(key)
    }

    fn try_read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut state = self.state.lock().unwrap();
        let stream_state = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| anyhow!("NOGROUP no such key '{}'", stream))?;
        let StreamState { messages, groups } = stream_state;
        let group_state = groups
            .get_mut(group)
            .ok_or_else(|| anyhow!("NOGROUP no consumer group '{}' on '{}'", group, stream))?;

        let now = Instant::now();
        group_state.consumers.insert(consumer.to_string(), now);
        let cursor = group_state.last_delivered;
        let mut delivered = Vec::new();
        for message in messages.iter().filter(|m| m.seq > cursor).take(count) {
            group_state.pending.insert(
                message.seq,
                PendingEntry {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    delivery_count: 1,
                },
            );
            group_state.last_delivered = message.seq;
            delivered.push(StreamEntry::new(message.id.clone(), message.fields.clone()));
        }
        Ok(delivered)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse the sequence part of an id (`"12-0"`, `"12"`, `"0-0"`).
fn parse_seq(id: &str) -> Result<u64> {
    let head = id.split('-').next().unwrap_or(id);
    head.parse::<u64>()
        .map_err(|_| anyhow!("ERR Invalid stream ID specified as stream command argument: {}", id))
}

#[async_trait]
impl StreamBroker for InMemoryBroker {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn append(&self, stream: &str, fields: &[(&str, &str)]) -> Result<String> {
        let id = {
            let mut state = self.state.lock().unwrap();
            if let Some(budget) = state.append_budget.as_mut() {
                if *budget == 0 {
                    bail!("append refused: broker connection lost");
                }
                *budget -= 1;
            }
            state.next_seq += 1;
            let seq = state.next_seq;
            let id = format!("{}-0", seq);
            state
                .streams
                .entry(stream.to_string())
                .or_default()
                .messages
                .push(StoredMessage {
                    seq,
                    id: id.clone(),
                    fields: fields
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                });
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
    ) -> Result<GroupCreation> {
        let mut state = self.state.lock().unwrap();
        let stream_state = state.streams.entry(stream.to_string()).or_default();
        if stream_state.groups.contains_key(group) {
            return Ok(GroupCreation::AlreadyExists);
        }
        let last_delivered = if start_id == "$" {
            stream_state.messages.last().map_or(0, |m| m.seq)
        } else {
            parse_seq(start_id)?
        };
        stream_state.groups.insert(
            group.to_string(),
            GroupState {
                last_delivered,
                ..GroupState::default()
            },
        );
        Ok(GroupCreation::Created)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>> {
        let deadline = Instant::now() + Duration::from_millis(block_ms);
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let delivered = self.try_read_group(stream, group, consumer, count)?;
            if !delivered.is_empty() {
                return Ok(delivered);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        start_id: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let start = parse_seq(start_id)?;
        let min_idle = Duration::from_millis(min_idle_ms);
        let mut state = self.state.lock().unwrap();
        let stream_state = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| anyhow!("NOGROUP no such key '{}'", stream))?;
        let StreamState { messages, groups } = stream_state;
        let group_state = groups
            .get_mut(group)
            .ok_or_else(|| anyhow!("NOGROUP no consumer group '{}' on '{}'", group, stream))?;

        let now = Instant::now();
        group_state.consumers.insert(consumer.to_string(), now);
        let mut claimed = Vec::new();
        for (seq, pending) in group_state.pending.range_mut(start..) {
            if claimed.len() >= count {
                break;
            }
            if now.duration_since(pending.delivered_at) < min_idle {
                continue;
            }
            let Ok(idx) = messages.binary_search_by_key(seq, |m| m.seq) else {
                continue;
            };
            pending.consumer = consumer.to_string();
            pending.delivered_at = now;
            pending.delivery_count += 1;
            let message = &messages[idx];
            claimed.push(StreamEntry::new(message.id.clone(), message.fields.clone()));
        }
        Ok(claimed)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        let Some(group_state) = state
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
        else {
            return Ok(0);
        };
        let mut acked = 0;
        for id in ids {
            if group_state.pending.remove(&parse_seq(id)?).is_some() {
                acked += 1;
            }
        }
        Ok(acked)
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<usize> {
        let state = self.state.lock().unwrap();
        state
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .ok_or_else(|| anyhow!("NOGROUP no consumer group '{}' on '{}'", group, stream))
    }

    async fn list_consumers(&self, stream: &str, group: &str) -> Result<Vec<ConsumerInfo>> {
        let state = self.state.lock().unwrap();
        let group_state = state
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .ok_or_else(|| anyhow!("NOGROUP no consumer group '{}' on '{}'", group, stream))?;

        let now = Instant::now();
        let mut consumers: Vec<ConsumerInfo> = group_state
            .consumers
            .iter()
            .map(|(name, seen)| ConsumerInfo {
                name: name.clone(),
                pending: group_state
                    .pending
                    .values()
                    .filter(|p| &p.consumer == name)
                    .count(),
                idle_ms: now.duration_since(*seen).as_millis() as u64,
            })
            .collect();
        consumers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(consumers)
    }

    async fn remove_consumer(&self, stream: &str, group: &str, consumer: &str) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        let group_state = state
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .ok_or_else(|| anyhow!("NOGROUP no consumer group '{}' on '{}'", group, stream))?;
        if group_state.consumers.remove(consumer).is_none() {
            return Ok(0);
        }
        let before = group_state.pending.len();
        group_state.pending.retain(|_, p| p.consumer != consumer);
        Ok(before - group_state.pending.len())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        Ok(state
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn set_is_member(&self, key: &str, member: &str) -> Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(state.sets.get(key).is_some_and(|s| s.contains(member)))
    }

    async fn set_len(&self, key: &str) -> Result<usize> {
        let state = self.state.lock().unwrap();
        Ok(state.sets.get(key).map_or(0, |s| s.len()))
    }

    async fn hash_increment(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut state = self.state.lock().unwrap();
        let value = state
            .hashes
            .entry(key.to_string())
            .or_default()
            .entry(field.to_string())
            .or_insert(0);
        *value += delta;
        Ok(*value)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.streams.remove(key);
        state.sets.remove(key);
        state.hashes.remove(key);
        Ok(())
    }
}
