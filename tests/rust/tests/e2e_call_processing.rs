//! End-to-end simulation of workers sharing a conversation blob
//!
//! Events arrive on a queue; each worker updates a shared counter blob under
//! a lease, then deletes the event.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use futures::StreamExt;
use persistence::testing::MemoryStorage;
use persistence::{BlobStore, Error, Lifecycle, QueueStore, StoreConfig, StoreOptions};
use tracing::info;

const COUNTER: &str = "calls/7/turns";

struct Worker {
    id: usize,
    blobs: BlobStore,
    queue: QueueStore,
}

impl Worker {
    async fn new(id: usize, storage: &MemoryStorage) -> Result<Self> {
        let options = StoreOptions::default().with_transport(Arc::new(storage.clone()));
        let blobs = BlobStore::open_with(
            StoreConfig::new(storage.connection_string(), "conversations"),
            options.clone(),
        )
        .await?;
        let queue = QueueStore::open_with(
            StoreConfig::new(storage.connection_string(), "turns"),
            options,
        )
        .await?;
        Ok(Self { id, blobs, queue })
    }

    async fn increment(&self) -> Result<()> {
        loop {
            let lease = match self.blobs.lease_blob(COUNTER, 15).await {
                Ok(lease) => lease,
                Err(Error::LeaseAlreadyExists { .. }) => {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let current = self.blobs.download_blob(COUNTER).await?;
            let value: u64 = std::str::from_utf8(&current)?.parse()?;
            let next = Bytes::from((value + 1).to_string());
            self.blobs
                .upload_blob(COUNTER, next.clone(), next.len() as u64, true, Some(lease.id()))
                .await?;
            lease.release().await?;
            return Ok(());
        }
    }

    /// Process events until the queue looks empty; returns how many were handled
    async fn run(self) -> Result<usize> {
        let mut handled = 0;
        loop {
            let mut events = self.queue.receive_messages(4, 30).await?.peekable();
            if std::pin::Pin::new(&mut events).peek().await.is_none() {
                break;
            }
            while let Some(event) = events.next().await {
                self.increment().await?;
                self.queue.delete_message(&event).await?;
                handled += 1;
            }
        }
        info!(worker = self.id, handled, "Worker drained queue");
        self.blobs.close().await;
        self.queue.close().await;
        Ok(handled)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_workers_serialize_through_lease() -> Result<()> {
    persistence::init_tracing();
    let storage = MemoryStorage::new();

    let producer = Worker::new(0, &storage).await?;
    producer
        .blobs
        .upload_blob(COUNTER, Bytes::from_static(b"0"), 1, true, None)
        .await?;
    for turn in 0..20 {
        producer.queue.send_message(&format!("turn-{}", turn)).await?;
    }

    let mut handles = Vec::new();
    for id in 1..=3 {
        let worker = Worker::new(id, &storage).await?;
        handles.push(tokio::spawn(worker.run()));
    }

    let mut total = 0;
    for handle in handles {
        total += handle.await??;
    }
    assert_eq!(total, 20);

    let counter = producer.blobs.download_blob(COUNTER).await?;
    assert_eq!(counter, Bytes::from_static(b"20"));
    assert!(!storage.is_leased("conversations", COUNTER));
    Ok(())
}

#[tokio::test]
async fn test_closing_one_store_leaves_others_open() -> Result<()> {
    let storage = MemoryStorage::new();
    let first = Worker::new(1, &storage).await?;
    let second = Worker::new(2, &storage).await?;

    first.blobs.close().await;
    assert!(matches!(
        first.blobs.download_blob(COUNTER).await,
        Err(Error::Closed { .. })
    ));

    // Each opened store owns its own client
    second
        .blobs
        .upload_blob(COUNTER, Bytes::from_static(b"1"), 1, true, None)
        .await?;
    first.queue.send_message("still open").await?;
    let received: Vec<_> = second.queue.receive_messages(1, 30).await?.collect().await;
    assert_eq!(received.len(), 1);
    Ok(())
}
