//! [`StreamBroker`] backed by a Redis server.
//!
//! Uses a single multiplexed async connection. Each call clones the handle,
//! so every method takes `&self`.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamInfoConsumersReply, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Value};
use std::collections::HashMap;

use super::{ConsumerInfo, GroupCreation, StreamBroker};
use crate::models::StreamEntry;

pub struct RedisBroker {
    conn: MultiplexedConnection,
}

impl RedisBroker {
    /// Open a connection and verify it with `PING`.
    ///
    /// Fails if the server is unreachable; callers treat this as fatal.
    pub async fn connect(url: &str) -> Result<Self> {
        let client =
            redis::Client::open(url).with_context(|| format!("Invalid broker URL: {}", url))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .with_context(|| format!("Could not connect to broker at {}", url))?;
        let broker = Self { conn };
        broker.ping().await?;
        Ok(broker)
    }
}

#[async_trait]
impl StreamBroker for RedisBroker {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Broker did not answer PING")?;
        Ok(())
    }

    async fn append(&self, stream: &str, fields: &[(&str, &str)]) -> Result<String> {
        let mut conn = self.conn.clone();
        let id: String = conn.xadd(stream, "*", fields).await?;
        Ok(id)
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
    ) -> Result<GroupCreation> {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> =
            conn.xgroup_create_mkstream(stream, group, start_id).await;
        match result {
            Ok(()) => Ok(GroupCreation::Created),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(GroupCreation::AlreadyExists),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.conn.clone();
        let mut options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count);
        // BLOCK 0 would wait forever.
        if block_ms > 0 {
            options = options.block(block_ms as usize);
        }
        let reply: Option<StreamReadReply> =
            conn.xread_options(&[stream], &[">"], &options).await?;

        let mut entries = Vec::new();
        for key in reply.map(|r| r.keys).unwrap_or_default() {
            for id in key.ids {
                let mut fields = HashMap::with_capacity(id.map.len());
                for (name, value) in &id.map {
                    fields.insert(name.clone(), redis::from_redis_value::<String>(value)?);
                }
                entries.push(StreamEntry::new(id.id, fields));
            }
        }
        Ok(entries)
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
        let mut conn = self.conn.clone();
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle_ms)
            .arg(start_id)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;
        parse_autoclaim_reply(&reply)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let acked: usize = conn.xack(stream, group, ids).await?;
        Ok(acked)
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let reply: Value = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .query_async(&mut conn)
            .await?;
        match reply {
            Value::Array(parts) if !parts.is_empty() => {
                Ok(redis::from_redis_value::<usize>(&parts[0])?)
            }
            other => bail!("Unexpected XPENDING reply: {:?}", other),
        }
    }

    async fn list_consumers(&self, stream: &str, group: &str) -> Result<Vec<ConsumerInfo>> {
        let mut conn = self.conn.clone();
        let reply: StreamInfoConsumersReply = conn.xinfo_consumers(stream, group).await?;
        Ok(reply
            .consumers
            .into_iter()
            .map(|c| ConsumerInfo {
                name: c.name,
                pending: c.pending,
                idle_ms: c.idle as u64,
            })
            .collect())
    }

    async fn remove_consumer(&self, stream: &str, group: &str, consumer: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let dropped: usize = conn.xgroup_delconsumer(stream, group, consumer).await?;
        Ok(dropped)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let added: i64 = conn.sadd(key, member).await?;
        Ok(added > 0)
    }

    async fn set_is_member(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let member: bool = conn.sismember(key, member).await?;
        Ok(member)
    }

    async fn set_len(&self, key: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = conn.scard(key).await?;
        Ok(len)
    }

    async fn hash_increment(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn.clone();
        let value: i64 = conn.hincr(key, field, delta).await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(key).await?;
        Ok(())
    }
}

/// Decode `XAUTOCLAIM` output: `[next_start, [[id, [f, v, ...]], ...], (deleted)]`.
///
/// Entries that were deleted from the stream come back as nil and are dropped.
fn parse_autoclaim_reply(reply: &Value) -> Result<Vec<StreamEntry>> {
    let Value::Array(parts) = reply else {
        bail!("Unexpected XAUTOCLAIM reply: {:?}", reply);
    };
    let Some(Value::Array(raw_entries)) = parts.get(1) else {
        return Ok(Vec::new());
    };

    let mut entries = Vec::with_capacity(raw_entries.len());
    for raw in raw_entries {
        let Value::Array(pair) = raw else {
            continue;
        };
        let (Some(id), Some(fields)) = (pair.first(), pair.get(1)) else {
            continue;
        };
        let id: String = redis::from_redis_value(id)?;
        let fields: HashMap<String, String> = match fields {
            Value::Nil => continue,
            other => redis::from_redis_value(other)?,
        };
        entries.push(StreamEntry::new(id, fields));
    }
    Ok(entries)
}
