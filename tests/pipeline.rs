//! End-to-end pipeline tests against the in-memory broker and index.
//!
//! Discovery and consumers are wired exactly as the binary wires them, but
//! share one [`InMemoryBroker`] in place of Redis.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use chunkflow::broker::{InMemoryBroker, StreamBroker};
use chunkflow::config::Config;
use chunkflow::consumer::ConsumerWorker;
use chunkflow::discovery::DiscoveryWorker;
use chunkflow::index::InMemoryIndex;
use chunkflow::keys;
use chunkflow::models::{Chunk, ChunkMetadata, StreamEntry, FIELD_METADATA, FIELD_PAGE_CONTENT};
use chunkflow::publisher::{stamp_publish_fields, StreamPublisher};
use tempfile::TempDir;

const THREE_PARAGRAPHS: &str = "aaaaaaaa\n\nbbbbbbbb\n\ncccccccc";

fn test_config(data_dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.producer.data_dir = data_dir.to_path_buf();
    config.producer.tenants = vec!["A".to_string()];
    config.chunking.chunk_size = 10;
    config.chunking.chunk_overlap = 0;
    config.consumer.block_ms = 10;
    config.consumer.claim_timeout_ms = 0;
    config
}

async fn consumer(
    config: &Config,
    name: &str,
    broker: &Arc<InMemoryBroker>,
    index: &Arc<InMemoryIndex>,
) -> ConsumerWorker {
    let mut worker = ConsumerWorker::new(config, name, broker.clone(), index.clone());
    worker.ensure_group().await.unwrap();
    worker
}

async fn pending(broker: &InMemoryBroker, config: &Config) -> usize {
    broker
        .pending_count(&config.broker.stream_key, &config.consumer.group)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_discovery_does_not_republish_marked_files() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    fs::create_dir_all(tmp.path().join("A")).unwrap();
    fs::write(tmp.path().join("A/f.txt"), THREE_PARAGRAPHS).unwrap();

    let broker = Arc::new(InMemoryBroker::new());
    let discovery = DiscoveryWorker::new(&config, "A", broker.clone()).unwrap();

    assert_eq!(discovery.run_once().await.unwrap(), 3);
    for _ in 0..3 {
        assert_eq!(discovery.run_once().await.unwrap(), 0);
    }
    assert_eq!(broker.stream_len(&config.broker.stream_key), 3);

    // A new file is still picked up.
    fs::write(tmp.path().join("A/g.txt"), "short").unwrap();
    assert_eq!(discovery.run_once().await.unwrap(), 1);
}

#[tokio::test]
async fn test_unreadable_file_does_not_block_tenant() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    fs::create_dir_all(tmp.path().join("A")).unwrap();
    // Sorted before the good file; not valid UTF-8.
    fs::write(tmp.path().join("A/a_bad.txt"), [0xffu8, 0xfe, 0x00, 0x80]).unwrap();
    fs::write(tmp.path().join("A/b_good.txt"), "hello").unwrap();

    let broker = Arc::new(InMemoryBroker::new());
    let discovery = DiscoveryWorker::new(&config, "A", broker.clone()).unwrap();

    for _ in 0..3 {
        discovery.run_once().await.unwrap();
    }

    let good = tmp.path().join("A/b_good.txt").to_string_lossy().to_string();
    assert_eq!(broker.set_members(&keys::published_files("A")), vec![good]);
    assert_eq!(broker.stream_len(&config.broker.stream_key), 1);

    // Once fixed, the bad file is picked up on the next pass.
    fs::write(tmp.path().join("A/a_bad.txt"), "repaired").unwrap();
    assert_eq!(discovery.run_once().await.unwrap(), 1);
    assert_eq!(broker.set_members(&keys::published_files("A")).len(), 2);
}

#[tokio::test]
async fn test_discovery_to_completion() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    fs::create_dir_all(tmp.path().join("A/books")).unwrap();
    fs::write(tmp.path().join("A/f.txt"), THREE_PARAGRAPHS).unwrap();
    fs::write(tmp.path().join("A/books/skipped.txt"), "never published").unwrap();

    let broker = Arc::new(InMemoryBroker::new());
    let index = Arc::new(InMemoryIndex::new());
    let discovery = DiscoveryWorker::new(&config, "A", broker.clone()).unwrap();
    let mut worker = consumer(&config, "worker-1-0", &broker, &index).await;

    assert_eq!(discovery.run_once().await.unwrap(), 3);
    assert_eq!(worker.poll_new().await.unwrap(), 3);

    let file_path = tmp.path().join("A/f.txt").to_string_lossy().to_string();
    assert_eq!(broker.set_members(&keys::completed_files("A")), vec![file_path.clone()]);
    assert!(!broker.key_exists(&keys::chunk_counter("A", &file_path)));
    assert_eq!(pending(&broker, &config).await, 0);

    let docs = index.documents();
    assert_eq!(docs.len(), 3);
    assert!(docs.iter().all(|d| d.metadata.total_chunks == Some(3)));
    let indexes: Vec<_> = docs.iter().map(|d| d.metadata.chunk_index).collect();
    assert_eq!(indexes, vec![Some(0), Some(1), Some(2)]);
}

#[tokio::test]
async fn test_stale_message_is_claimed_by_another_consumer() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(tmp.path());
    config.consumer.claim_timeout_ms = 50;

    let broker = Arc::new(InMemoryBroker::new());
    let index = Arc::new(InMemoryIndex::new());
    let mut survivor = consumer(&config, "worker-2-0", &broker, &index).await;

    let publisher = StreamPublisher::new(broker.clone(), &config.broker.stream_key);
    let mut chunk = Chunk {
        content: "only chunk".to_string(),
        metadata: ChunkMetadata::new("A", "data/A/one.txt", "text"),
    };
    stamp_publish_fields(&mut chunk, 0, 1);
    let id = publisher.publish(&chunk).await.unwrap();

    // A consumer takes the message and dies without acknowledging it.
    let taken = broker
        .read_group(&config.broker.stream_key, &config.consumer.group, "worker-1-0", 10, 0)
        .await
        .unwrap();
    assert_eq!(taken.len(), 1);

    // Not yet idle long enough.
    assert_eq!(survivor.reclaim_pending().await.unwrap(), 0);
    assert!(index.is_empty());

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(survivor.reclaim_pending().await.unwrap(), 1);
    assert_eq!(index.len(), 1);
    assert_eq!(pending(&broker, &config).await, 0);
    assert_eq!(
        broker.set_members(&keys::completed_files("A")),
        vec!["data/A/one.txt".to_string()]
    );
    assert!(broker
        .pending_for(&config.broker.stream_key, &config.consumer.group, "worker-1-0")
        .iter()
        .all(|p| p != &id));
}

#[tokio::test]
async fn test_completion_requires_every_chunk_across_workers() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(tmp.path());
    config.consumer.batch_size = 2;

    let broker = Arc::new(InMemoryBroker::new());
    let index = Arc::new(InMemoryIndex::new());
    let mut first = consumer(&config, "worker-1-0", &broker, &index).await;
    let mut second = consumer(&config, "worker-1-1", &broker, &index).await;

    let publisher = StreamPublisher::new(broker.clone(), &config.broker.stream_key);
    for i in 0..3 {
        let mut chunk = Chunk {
            content: format!("piece {}", i),
            metadata: ChunkMetadata::new("A", "data/A/f.txt", "text"),
        };
        stamp_publish_fields(&mut chunk, i, 3);
        publisher.publish(&chunk).await.unwrap();
    }

    assert_eq!(first.poll_new().await.unwrap(), 2);
    assert!(broker.set_members(&keys::completed_files("A")).is_empty());
    assert_eq!(
        broker.hash_get(&keys::chunk_counter("A", "data/A/f.txt"), keys::CHUNK_COUNTER_FIELD),
        Some(2)
    );

    assert_eq!(second.poll_new().await.unwrap(), 1);
    assert_eq!(
        broker.set_members(&keys::completed_files("A")),
        vec!["data/A/f.txt".to_string()]
    );
    assert!(!broker.key_exists(&keys::chunk_counter("A", "data/A/f.txt")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_consumers_complete_file_once() {
    const CHUNKS: usize = 40;
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(tmp.path());
    config.consumer.batch_size = 3;

    let broker = Arc::new(InMemoryBroker::new());
    let index = Arc::new(InMemoryIndex::new());
    let publisher = StreamPublisher::new(broker.clone(), &config.broker.stream_key);
    for i in 0..CHUNKS {
        let mut chunk = Chunk {
            content: format!("piece {}", i),
            metadata: ChunkMetadata::new("A", "data/A/big.txt", "text"),
        };
        stamp_publish_fields(&mut chunk, i, CHUNKS);
        publisher.publish(&chunk).await.unwrap();
    }

    let mut handles = Vec::new();
    for n in 0..4 {
        let mut worker = consumer(&config, &format!("worker-1-{}", n), &broker, &index).await;
        handles.push(tokio::spawn(async move {
            let mut acked = 0;
            loop {
                let got = worker.poll_new().await.unwrap();
                if got == 0 {
                    return acked;
                }
                acked += got;
            }
        }));
    }

    let mut total_acked = 0;
    for handle in handles {
        total_acked += handle.await.unwrap();
    }
    assert_eq!(total_acked, CHUNKS);
    assert_eq!(index.len(), CHUNKS);
    assert_eq!(
        broker.set_members(&keys::completed_files("A")),
        vec!["data/A/big.txt".to_string()]
    );
    assert!(!broker.key_exists(&keys::chunk_counter("A", "data/A/big.txt")));
    assert_eq!(pending(&broker, &config).await, 0);
}

#[tokio::test]
async fn test_index_failure_leaves_batch_pending_and_uncounted() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    fs::create_dir_all(tmp.path().join("A")).unwrap();
    fs::write(tmp.path().join("A/f.txt"), THREE_PARAGRAPHS).unwrap();

    let broker = Arc::new(InMemoryBroker::new());
    let index = Arc::new(InMemoryIndex::new());
    let discovery = DiscoveryWorker::new(&config, "A", broker.clone()).unwrap();
    let worker = consumer(&config, "worker-1-0", &broker, &index).await;
    discovery.run_once().await.unwrap();

    let entries = broker
        .read_group(&config.broker.stream_key, &config.consumer.group, "worker-1-0", 10, 0)
        .await
        .unwrap();
    index.fail_next(1);
    assert!(worker.process_batch(&entries).await.is_empty());

    let file_path = tmp.path().join("A/f.txt").to_string_lossy().to_string();
    assert!(!broker.key_exists(&keys::chunk_counter("A", &file_path)));
    assert!(broker.set_members(&keys::completed_files("A")).is_empty());
    assert_eq!(pending(&broker, &config).await, 3);
}

#[tokio::test]
async fn test_malformed_message_is_isolated_from_batch() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let broker = Arc::new(InMemoryBroker::new());
    let index = Arc::new(InMemoryIndex::new());
    let worker = consumer(&config, "worker-1-0", &broker, &index).await;

    let mut good_ids = Vec::new();
    let publisher = StreamPublisher::new(broker.clone(), &config.broker.stream_key);
    for i in 0..3 {
        let mut chunk = Chunk {
            content: format!("good {}", i),
            metadata: ChunkMetadata::new("A", "data/A/g.txt", "text"),
        };
        stamp_publish_fields(&mut chunk, i, 3);
        good_ids.push(publisher.publish(&chunk).await.unwrap());
    }
    let bad_id = broker
        .append(&config.broker.stream_key, &[(FIELD_PAGE_CONTENT, "no metadata")])
        .await
        .unwrap();

    let entries = broker
        .read_group(&config.broker.stream_key, &config.consumer.group, "worker-1-0", 10, 0)
        .await
        .unwrap();
    let acked = worker.process_batch(&entries).await;
    assert_eq!(acked, good_ids);
    assert!(!acked.contains(&bad_id));
}

#[tokio::test]
async fn test_missing_metadata_is_redelivered_after_timeout() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(tmp.path());
    config.consumer.claim_timeout_ms = 30;
    let broker = Arc::new(InMemoryBroker::new());
    let index = Arc::new(InMemoryIndex::new());
    let mut worker = consumer(&config, "worker-1-0", &broker, &index).await;

    let id = broker
        .append(&config.broker.stream_key, &[(FIELD_PAGE_CONTENT, "text only")])
        .await
        .unwrap();

    assert_eq!(worker.poll_new().await.unwrap(), 0);
    assert_eq!(index.calls(), 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let reclaimed = broker
        .claim_stale(
            &config.broker.stream_key,
            &config.consumer.group,
            "worker-9-0",
            config.consumer.claim_timeout_ms,
            "0-0",
            10,
        )
        .await
        .unwrap();
    let ids: Vec<_> = reclaimed.iter().map(|e: &StreamEntry| e.id.clone()).collect();
    assert_eq!(ids, vec![id]);
}

#[tokio::test]
async fn test_metadata_without_total_is_indexed_but_not_tracked() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let broker = Arc::new(InMemoryBroker::new());
    let index = Arc::new(InMemoryIndex::new());
    let mut worker = consumer(&config, "worker-1-0", &broker, &index).await;

    let metadata = serde_json::to_string(&ChunkMetadata::new("A", "data/A/x.txt", "text")).unwrap();
    broker
        .append(
            &config.broker.stream_key,
            &[(FIELD_PAGE_CONTENT, "body"), (FIELD_METADATA, metadata.as_str())],
        )
        .await
        .unwrap();

    assert_eq!(worker.poll_new().await.unwrap(), 1);
    assert_eq!(index.len(), 1);
    assert!(!broker.key_exists(&keys::chunk_counter("A", "data/A/x.txt")));
    assert!(broker.set_members(&keys::completed_files("A")).is_empty());
}

#[tokio::test]
async fn test_interrupted_publish_republishes_whole_file() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    fs::create_dir_all(tmp.path().join("A")).unwrap();
    fs::write(tmp.path().join("A/f.txt"), THREE_PARAGRAPHS).unwrap();

    let broker = Arc::new(InMemoryBroker::new());
    let discovery = DiscoveryWorker::new(&config, "A", broker.clone()).unwrap();

    // Connection drops after the first chunk is appended.
    broker.set_append_budget(Some(1));
    assert!(discovery.run_once().await.is_err());
    assert!(broker.set_members(&keys::published_files("A")).is_empty());
    assert_eq!(broker.stream_len(&config.broker.stream_key), 1);

    broker.set_append_budget(None);
    assert_eq!(discovery.run_once().await.unwrap(), 3);

    let entries = broker.entries(&config.broker.stream_key);
    assert_eq!(entries.len(), 4);
    let chunk_id = |e: &StreamEntry| e.to_document().unwrap().metadata.chunk_id;
    // The orphaned first chunk and its republished copy share an identity.
    assert_eq!(chunk_id(&entries[0]), chunk_id(&entries[1]));
    assert_ne!(chunk_id(&entries[1]), chunk_id(&entries[2]));
}
