//! Stream broker abstraction.
//!
//! The [`StreamBroker`] trait is the only channel between producer and
//! consumer processes. Every mutation of shared state goes through one of its
//! single-operation primitives (`append`, `set_add`, `hash_increment`, ...);
//! callers never read-modify-write broker state in several steps.
//!
//! Two implementations exist:
//! - [`redis_broker::RedisBroker`] talks to a Redis server (Streams + consumer groups).
//! - [`memory::InMemoryBroker`] reproduces the same semantics in-process for
//!   tests and local dry runs.
//!
//! # Operations
//!
//! | Method | Redis command |
//! |--------|---------------|
//! | [`append`](StreamBroker::append) | `XADD key * f v ...` |
//! | [`create_group`](StreamBroker::create_group) | `XGROUP CREATE key group id MKSTREAM` |
//! | [`read_group`](StreamBroker::read_group) | `XREADGROUP GROUP g c COUNT n BLOCK ms STREAMS key >` |
//! | [`claim_stale`](StreamBroker::claim_stale) | `XAUTOCLAIM key g c min_idle start COUNT n` |
//! | [`ack`](StreamBroker::ack) | `XACK key g id ...` |
//! | [`pending_count`](StreamBroker::pending_count) | `XPENDING key g` |
//! | [`list_consumers`](StreamBroker::list_consumers) | `XINFO CONSUMERS key g` |
//! | [`remove_consumer`](StreamBroker::remove_consumer) | `XGROUP DELCONSUMER key g c` |
//! | [`set_add`](StreamBroker::set_add) | `SADD` |
//! | [`set_is_member`](StreamBroker::set_is_member) | `SISMEMBER` |
//! | [`set_len`](StreamBroker::set_len) | `SCARD` |
//! | [`hash_increment`](StreamBroker::hash_increment) | `HINCRBY` |
//! | [`delete`](StreamBroker::delete) | `DEL` |

pub mod memory;
pub mod redis_broker;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::StreamEntry;

pub use self::memory::InMemoryBroker;
pub use self::redis_broker::RedisBroker;

/// Outcome of [`StreamBroker::create_group`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupCreation {
    Created,
    AlreadyExists,
}

/// One member of a consumer group, as reported by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerInfo {
    pub name: String,
    /// Messages delivered to this consumer and not yet acknowledged.
    pub pending: usize,
    /// Milliseconds since the consumer last read or claimed.
    pub idle_ms: u64,
}

/// Redis-Streams-style broker contract.
#[async_trait]
pub trait StreamBroker: Send + Sync {
    /// Check that the broker is reachable.
    async fn ping(&self) -> Result<()>;

    /// Append one message; returns the broker-assigned id.
    async fn append(&self, stream: &str, fields: &[(&str, &str)]) -> Result<String>;

    /// Create a consumer group positioned at `start_id`, creating the stream
    /// if it does not exist.
    async fn create_group(&self, stream: &str, group: &str, start_id: &str)
        -> Result<GroupCreation>;

    /// Read up to `count` messages never delivered to any consumer of the
    /// group, blocking for at most `block_ms`. `0` does not block.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>>;

    /// Reassign to `consumer` up to `count` pending messages idle for at least
    /// `min_idle_ms`, starting the scan at `start_id`.
    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        start_id: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>>;

    /// Acknowledge messages; returns how many were actually pending.
    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<usize>;

    /// Number of entries in the group's pending-entries list.
    async fn pending_count(&self, stream: &str, group: &str) -> Result<usize>;

    /// Every consumer the group knows about.
    async fn list_consumers(&self, stream: &str, group: &str) -> Result<Vec<ConsumerInfo>>;

    /// Remove a consumer from the group. Its pending entries are dropped with
    /// it; returns how many there were.
    async fn remove_consumer(&self, stream: &str, group: &str, consumer: &str) -> Result<usize>;

    async fn set_add(&self, key: &str, member: &str) -> Result<bool>;

    async fn set_is_member(&self, key: &str, member: &str) -> Result<bool>;

    async fn set_len(&self, key: &str) -> Result<usize>;

    /// Atomically add `delta` to a hash field and return the new value.
    async fn hash_increment(&self, key: &str, field: &str, delta: i64) -> Result<i64>;

    async fn delete(&self, key: &str) -> Result<()>;
}
