use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use futures::StreamExt;
use persistence::testing::MemoryStorage;
use persistence::{
    scoped, BlobStore, Error, Lifecycle, QueueStore, RetryPolicy, StoreConfig, StoreOptions,
};

// Helper to open both stores against one shared emulator
async fn open_stores(storage: &MemoryStorage) -> Result<(BlobStore, QueueStore)> {
    let options = StoreOptions::default().with_transport(Arc::new(storage.clone()));
    let blobs = BlobStore::open_with(
        StoreConfig::new(storage.connection_string(), "conversations"),
        options.clone(),
    )
    .await?;
    let queue = QueueStore::open_with(
        StoreConfig::new(storage.connection_string(), "call-events"),
        options,
    )
    .await?;
    Ok((blobs, queue))
}

#[tokio::test]
async fn test_full_flow() -> Result<()> {
    persistence::init_tracing();
    let storage = MemoryStorage::new();
    let (blobs, queue) = open_stores(&storage).await?;

    assert!(storage.has_container("conversations"));
    assert!(storage.has_queue("call-events"));

    // 1. Write the state blob
    let state = Bytes::from_static(b"{\"turn\":1}");
    blobs
        .upload_blob("calls/42/state.json", state.clone(), state.len() as u64, true, None)
        .await?;

    // 2. Announce it on the queue
    queue.send_message("calls/42/state.json").await?;

    // 3. A consumer picks the event up and updates the blob under a lease
    let mut events = queue.receive_messages(1, 30).await?;
    let event = events.next().await.expect("one message");
    assert!(events.next().await.is_none());
    assert_eq!(event.dequeue_count, 1);

    let updated = Bytes::from_static(b"{\"turn\":2}");
    let writer = blobs.clone();
    let blob = event.content.clone();
    blobs
        .with_lease(&event.content, 15, |lease_id| async move {
            let current = writer.download_blob(&blob).await?;
            assert_eq!(current, Bytes::from_static(b"{\"turn\":1}"));
            writer
                .upload_blob(&blob, updated.clone(), updated.len() as u64, true, Some(&lease_id))
                .await
        })
        .await?;

    queue.delete_message(&event).await?;
    assert_eq!(
        blobs.download_blob("calls/42/state.json").await?,
        Bytes::from_static(b"{\"turn\":2}")
    );
    assert!(!storage.is_leased("conversations", "calls/42/state.json"));

    blobs.close().await;
    queue.close().await;
    Ok(())
}

#[tokio::test]
async fn test_lease_excludes_other_writers() -> Result<()> {
    let storage = MemoryStorage::new();
    let (blobs, _queue) = open_stores(&storage).await?;
    blobs
        .upload_blob("shared", Bytes::from_static(b"v1"), 2, true, None)
        .await?;

    let lease = blobs.lease_blob("shared", 30).await?;

    let competing = blobs.lease_blob("shared", 30).await;
    assert!(matches!(competing, Err(Error::LeaseAlreadyExists { .. })));

    let unleased_write = blobs
        .upload_blob("shared", Bytes::from_static(b"v2"), 2, true, None)
        .await;
    assert!(matches!(unleased_write, Err(Error::LeaseAlreadyExists { .. })));

    blobs
        .upload_blob("shared", Bytes::from_static(b"v3"), 2, true, Some(lease.id()))
        .await?;
    lease.release().await?;

    // Writable without a lease once released
    blobs
        .upload_blob("shared", Bytes::from_static(b"v4"), 2, true, None)
        .await?;
    assert_eq!(blobs.download_blob("shared").await?, Bytes::from_static(b"v4"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_lease_expires_without_release() -> Result<()> {
    let storage = MemoryStorage::new();
    let (blobs, _queue) = open_stores(&storage).await?;
    blobs
        .upload_blob("state", Bytes::from_static(b"v1"), 2, true, None)
        .await?;

    let lease = blobs.lease_blob("state", 15).await?;
    let stale_id = lease.id().clone();
    std::mem::forget(lease);

    tokio::time::advance(Duration::from_secs(16)).await;
    assert!(!storage.is_leased("conversations", "state"));

    let late_write = blobs
        .upload_blob("state", Bytes::from_static(b"v2"), 2, true, Some(&stale_id))
        .await;
    assert!(matches!(late_write, Err(Error::LeaseNotFound { .. })));

    // Another client can take over
    let takeover = blobs.lease_blob("state", 15).await?;
    takeover.release().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_at_least_once_delivery() -> Result<()> {
    let storage = MemoryStorage::new();
    let (_blobs, queue) = open_stores(&storage).await?;
    queue.send_message("work-item").await?;

    // First consumer crashes before deleting
    let first: Vec<_> = queue.receive_messages(1, 30).await?.collect().await;
    assert_eq!(first.len(), 1);
    assert!(queue.receive_messages(1, 30).await?.next().await.is_none());

    tokio::time::advance(Duration::from_secs(31)).await;

    let second: Vec<_> = queue.receive_messages(1, 30).await?.collect().await;
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].message_id, first[0].message_id);
    assert_eq!(second[0].dequeue_count, 2);

    // The crashed consumer's token is stale
    let stale = queue.delete_message(&first[0]).await;
    assert!(matches!(stale, Err(Error::MessageNotFound { .. })));

    queue.delete_message(&second[0]).await?;
    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(queue.receive_messages(32, 30).await?.next().await.is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_absorbed() -> Result<()> {
    let storage = MemoryStorage::new();
    storage.fail_next_requests(2);

    // Provisioning retries through the failures
    let (blobs, queue) = open_stores(&storage).await?;
    assert!(storage.has_container("conversations"));

    storage.fail_next_requests(3);
    blobs
        .upload_blob("a", Bytes::from_static(b"data"), 4, true, None)
        .await?;

    storage.fail_next_requests(1);
    queue.send_message("m").await?;
    let received: Vec<_> = queue.receive_messages(1, 30).await?.collect().await;
    assert_eq!(received.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_no_retry_policy_surfaces_first_failure() -> Result<()> {
    let storage = MemoryStorage::new();
    let options = StoreOptions::default()
        .with_transport(Arc::new(storage.clone()))
        .with_retry_policy(RetryPolicy::no_retry());
    let blobs = BlobStore::open_with(
        StoreConfig::new(storage.connection_string(), "conversations"),
        options,
    )
    .await?;

    storage.fail_next_requests(1);
    let before = storage.request_count();
    let result = blobs.download_blob("a").await;
    assert!(matches!(result, Err(Error::Transport { .. })));
    assert_eq!(storage.request_count() - before, 1);
    Ok(())
}

#[tokio::test]
async fn test_scoped_stores_are_closed() -> Result<()> {
    let storage = MemoryStorage::new();
    let (blobs, queue) = open_stores(&storage).await?;

    let delivered = scoped(queue.clone(), |q| async move {
        q.send_message("scoped").await?;
        let messages: Vec<_> = q.receive_messages(1, 30).await?.collect().await;
        Ok::<_, Error>(messages.len())
    })
    .await?;
    assert_eq!(delivered, 1);

    let after_close = queue.send_message("late").await;
    assert!(matches!(after_close, Err(Error::Closed { .. })));

    // Scope failures still close the store
    let failed: persistence::Result<()> = scoped(blobs.clone(), |b| async move {
        b.download_blob("missing").await.map(|_| ())
    })
    .await;
    assert!(matches!(failed, Err(Error::BlobNotFound { .. })));
    assert!(matches!(
        blobs.download_blob("missing").await,
        Err(Error::Closed { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn test_invalid_config_is_rejected_before_connecting() -> Result<()> {
    let storage = MemoryStorage::new();
    let options = StoreOptions::default().with_transport(Arc::new(storage.clone()));

    let result = BlobStore::open_with(
        StoreConfig::new(storage.connection_string(), "Bad_Name"),
        options.clone(),
    )
    .await;
    assert!(matches!(result, Err(Error::InvalidConfig { .. })));

    let result = QueueStore::open_with(StoreConfig::new("", "calls"), options).await;
    assert!(matches!(result, Err(Error::InvalidConfig { .. })));

    assert_eq!(storage.request_count(), 0);
    Ok(())
}
