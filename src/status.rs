//! Pipeline status overview.
//!
//! Reports, per tenant, how many files discovery has published and how many
//! the consumers have fully indexed, plus the consumer group's backlog of
//! delivered-but-unacknowledged messages and its registered consumers. Used
//! by `chunkflow status`.

use anyhow::Result;

use crate::broker::{RedisBroker, StreamBroker};
use crate::config::Config;
use crate::keys;

/// Published and completed file counts for one tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantStatus {
    pub tenant: String,
    pub published: usize,
    pub completed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineStatus {
    pub tenants: Vec<TenantStatus>,
    /// `None` when the consumer group does not exist yet.
    pub pending: Option<usize>,
    /// Registered group members; `None` when the group does not exist yet.
    pub consumers: Option<usize>,
}

pub async fn collect_status(config: &Config, broker: &dyn StreamBroker) -> Result<PipelineStatus> {
    let mut tenants = Vec::with_capacity(config.producer.tenants.len());
    for tenant in &config.producer.tenants {
        tenants.push(TenantStatus {
            tenant: tenant.clone(),
            published: broker.set_len(&keys::published_files(tenant)).await?,
            completed: broker.set_len(&keys::completed_files(tenant)).await?,
        });
    }

    let pending = broker
        .pending_count(&config.broker.stream_key, &config.consumer.group)
        .await
        .ok();
    let consumers = broker
        .list_consumers(&config.broker.stream_key, &config.consumer.group)
        .await
        .ok()
        .map(|c| c.len());

    Ok(PipelineStatus {
        tenants,
        pending,
        consumers,
    })
}

/// Run the status command: query the broker and print a summary.
pub async fn run_status(config: &Config) -> Result<()> {
    let broker = RedisBroker::connect(&config.broker.url).await?;
    let status = collect_status(config, &broker).await?;

    println!("Chunkflow — Pipeline Status");
    println!("===========================");
    println!();
    println!("  Broker:      {}", config.broker.url);
    println!("  Stream:      {}", config.broker.stream_key);
    println!("  Group:       {}", config.consumer.group);
    match status.pending {
        Some(n) => println!("  Pending:     {}", n),
        None => println!("  Pending:     (group not created)"),
    }
    if let Some(n) = status.consumers {
        println!("  Consumers:   {}", n);
    }

    if !status.tenants.is_empty() {
        println!();
        println!("  {:<24} {:>10} {:>10}", "TENANT", "PUBLISHED", "COMPLETED");
        println!("  {}", "-".repeat(46));
        for t in &status.tenants {
            println!("  {:<24} {:>10} {:>10}", t.tenant, t.published, t.completed);
        }
    }

    println!();
    Ok(())
}
