//! Persistence - Lease-aware blob and queue stores over Azure Storage
//!
//! Provides:
//! - [`BlobStore`]: container-scoped blobs with exclusive, time-bounded leases
//! - [`QueueStore`]: at-least-once queue messages with visibility timeouts
//! - Retry of transient failures with capped, jittered exponential backoff
//! - Translation of service errors into a small, stable error taxonomy
//!
//! ```no_run
//! use bytes::Bytes;
//! use persistence::{BlobStore, Lifecycle, StoreConfig};
//!
//! # async fn example() -> persistence::Result<()> {
//! let store = BlobStore::open(StoreConfig::new("UseDevelopmentStorage=true", "conversations")).await?;
//! store.upload_blob("call/1.json", Bytes::from_static(b"{}"), 2, true, None).await?;
//! store.close().await;
//! # Ok(())
//! # }
//! ```

pub mod blob;
pub mod connection;
pub mod credential;
pub mod lifecycle;
pub mod queue;
pub mod translate;
pub mod transport;
pub mod xml;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use blob::{BlobLease, BlobStore, INFINITE_LEASE, MAX_LEASE_SECS, MIN_LEASE_SECS};
pub use connection::{ConnectionString, ServiceKind};
pub use credential::{
    shared_credential, AccessToken, BearerTokenProvider, Credential, SharedKeyCredential,
    StaticTokenProvider, TokenProvider, STORAGE_SCOPE,
};
pub use lifecycle::{scoped, Lifecycle, StoreOptions, API_VERSION};
pub use queue::{
    MessageStream, QueueStore, MAX_MESSAGES_PER_RECEIVE, MAX_VISIBILITY_TIMEOUT_SECS,
    MIN_VISIBILITY_TIMEOUT_SECS,
};
pub use translate::{translate, Operation};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};

pub use persistence_core::{init_tracing, Error, LeaseId, Message, Result, RetryPolicy, StoreConfig};
