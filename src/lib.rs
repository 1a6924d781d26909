//! # Chunkflow
//!
//! Multi-tenant document ingestion over a Redis-Streams consumer group.
//!
//! Discovery workers (one per tenant) scan the tenant's directory, chunk new
//! files, and append one stream message per chunk. A pool of consumer
//! workers shares a consumer group on that stream, adds each batch to a
//! vector index in one bulk call, acknowledges what was indexed, and counts
//! chunks per file until every chunk of the file is in.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐  append  ┌──────────────┐  read / claim  ┌──────────────┐
//! │  Discovery    │─────────▶│    Stream     │──────────────▶│  Consumers   │
//! │ (per tenant)  │          │ + group + PEL │◀──────────────│  (pool of N) │
//! └──────┬────────┘          └──────────────┘      ack       └──────┬───────┘
//!        │ published_files:{t}                                      │ bulk add
//!        ▼                                                          ▼
//!  ┌────────────────────────────────────────┐               ┌──────────────┐
//!  │ Broker sets / counters                 │◀──────────────│ Vector index │
//!  │ processed_files:{t}, file_chunks_...   │   completion  └──────────────┘
//!  └────────────────────────────────────────┘
//! ```
//!
//! Workers run as separate OS processes started by [`supervisor`]; all
//! coordination goes through the broker's atomic primitives.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and validation |
//! | [`models`] | Chunks, stream entries, index documents |
//! | [`keys`] | Broker key naming |
//! | [`broker`] | Stream broker trait, Redis and in-memory backends |
//! | [`chunker`] | Text and image chunkers |
//! | [`index`] | Vector-index client |
//! | [`publisher`] | Stream publisher |
//! | [`discovery`] | Per-tenant discovery worker |
//! | [`tracker`] | Per-file completion counting |
//! | [`consumer`] | Consumer-group worker |
//! | [`backoff`] | Loop retry delays |
//! | [`supervisor`] | Child process management |
//! | [`status`] | Status report |

pub mod backoff;
pub mod broker;
pub mod chunker;
pub mod config;
pub mod consumer;
pub mod discovery;
pub mod index;
pub mod keys;
pub mod models;
pub mod publisher;
pub mod status;
pub mod supervisor;
pub mod tracker;
