//! Blob store with time-bounded exclusive leases
//!
//! Provides:
//! - Race-tolerant container provisioning on open
//! - Upload/download of named binary objects with retry on transient errors
//! - Lease acquisition returning a guard that releases on every exit path

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use persistence_core::{Error, LeaseId, Result, RetryPolicy, StoreConfig};
use reqwest::Method;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::connection::ServiceKind;
use crate::lifecycle::{is_already_exists, Lifecycle, ServiceClient, StoreOptions};
use crate::translate::{translate, Operation};

/// Shortest finite lease the service grants, in seconds
pub const MIN_LEASE_SECS: i32 = 15;

/// Longest finite lease the service grants, in seconds
pub const MAX_LEASE_SECS: i32 = 60;

/// Lease duration meaning "until released"
pub const INFINITE_LEASE: i32 = -1;

/// Blob store scoped to one container
///
/// Cloning is cheap; clones share the same service client.
#[derive(Clone)]
pub struct BlobStore {
    client: Arc<ServiceClient>,
    retry: RetryPolicy,
}

impl BlobStore {
    /// Open the store with the default transport and ensure the container exists
    pub async fn open(config: StoreConfig) -> Result<Self> {
        Self::open_with(config, StoreOptions::default()).await
    }

    /// Open the store with injected collaborators and ensure the container exists
    pub async fn open_with(config: StoreConfig, options: StoreOptions) -> Result<Self> {
        config.validate()?;
        let client = ServiceClient::connect(&config, &options, ServiceKind::Blob)?;
        info!(container = %config.name, "Blob storage is configured");

        let store = Self {
            client,
            retry: options.retry,
        };

        if let Err(e) = store.create_container_if_absent().await {
            store.client.close().await;
            return Err(e);
        }
        Ok(store)
    }

    /// Container name
    pub fn container(&self) -> &str {
        self.client.name()
    }

    async fn create_container_if_absent(&self) -> Result<()> {
        let created = self
            .retry
            .run("create_container", || async {
                let request =
                    self.client
                        .request(Method::PUT, &[], &[("restype", "container")])?;
                match self.client.execute(request).await {
                    Ok(_) => Ok(true),
                    Err(e) if is_already_exists(&e, "ContainerAlreadyExists") => Ok(false),
                    Err(e) => Err(e),
                }
            })
            .await?;

        if created {
            info!(container = %self.container(), "Created blob container");
        } else {
            debug!(container = %self.container(), "Blob container already exists");
        }
        Ok(())
    }

    /// Acquire an exclusive lease on a blob
    ///
    /// `duration_secs` is 15 to 60 seconds, or [`INFINITE_LEASE`]. Fails with
    /// `LeaseAlreadyExists` if another lease is active and `BlobNotFound` if
    /// the blob does not exist. The returned guard releases the lease when
    /// dropped; prefer [`BlobLease::release`] to observe release errors.
    #[instrument(skip(self), fields(backend = "azure", container = %self.container()))]
    pub async fn lease_blob(&self, blob: &str, duration_secs: i32) -> Result<BlobLease> {
        validate_lease_duration(duration_secs)?;

        // Retries reuse the proposed ID, so an acquire whose response was
        // lost renews our own lease instead of conflicting with it
        let proposed = Uuid::new_v4().to_string();
        let duration = duration_secs.to_string();

        let id = self
            .retry
            .run("lease_blob", || async {
                let request = self
                    .client
                    .request(Method::PUT, &[blob], &[("comp", "lease")])?
                    .with_header("x-ms-lease-action", "acquire")?
                    .with_header("x-ms-lease-duration", &duration)?
                    .with_header("x-ms-proposed-lease-id", &proposed)?;

                let response = self
                    .client
                    .execute(request)
                    .await
                    .map_err(|e| translate(e, Operation::AcquireLease, blob))?;

                Ok(response
                    .header_str("x-ms-lease-id")
                    .unwrap_or(proposed.as_str())
                    .to_string())
            })
            .await?;

        debug!(blob, lease_id = %id, duration_secs, "Acquired blob lease");
        Ok(BlobLease {
            client: self.client.clone(),
            blob: blob.to_string(),
            id: LeaseId::new(id),
            released: false,
        })
    }

    /// Hold a lease on `blob` while `body` runs
    ///
    /// The lease is released after `body` completes, whatever its outcome.
    /// An error from `body` takes precedence over a release error.
    pub async fn with_lease<F, Fut, T>(&self, blob: &str, duration_secs: i32, body: F) -> Result<T>
    where
        F: FnOnce(LeaseId) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lease = self.lease_blob(blob, duration_secs).await?;
        let result = body(lease.id().clone()).await;

        match (result, lease.release().await) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(release_error)) => Err(release_error),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release_error)) => {
                warn!(blob, error = %release_error, "Failed to release lease after error");
                Err(e)
            }
        }
    }

    /// Create or overwrite a blob
    ///
    /// `length` must equal `data.len()`. With `overwrite = false` an existing
    /// blob fails with `BlobAlreadyExists`. Writing a leased blob requires
    /// the matching `lease_id`: a missing or wrong ID fails with
    /// `LeaseAlreadyExists`, an ID for an absent or expired lease fails with
    /// `LeaseNotFound`.
    #[instrument(skip(self, data, lease_id), fields(backend = "azure", container = %self.container(), size = data.len()))]
    pub async fn upload_blob(
        &self,
        blob: &str,
        data: Bytes,
        length: u64,
        overwrite: bool,
        lease_id: Option<&LeaseId>,
    ) -> Result<()> {
        if data.len() as u64 != length {
            return Err(Error::InvalidArgument {
                message: format!(
                    "length {} does not match data size {} for blob {}",
                    length,
                    data.len(),
                    blob
                ),
            });
        }
        debug!(blob, overwrite, leased = lease_id.is_some(), "Uploading blob");

        self.retry
            .run("upload_blob", || {
                let data = data.clone();
                async move {
                    let mut request = self
                        .client
                        .request(Method::PUT, &[blob], &[])?
                        .with_header("x-ms-blob-type", "BlockBlob")?
                        .with_header("content-type", "application/octet-stream")?
                        .with_body(data);
                    if !overwrite {
                        request.set_header("if-none-match", "*")?;
                    }
                    if let Some(lease_id) = lease_id {
                        request.set_header("x-ms-lease-id", lease_id.as_str())?;
                    }

                    self.client
                        .execute(request)
                        .await
                        .map_err(|e| translate(e, Operation::UploadBlob, blob))?;
                    Ok(())
                }
            })
            .await
    }

    /// Download a blob's content; fails with `BlobNotFound` if absent
    #[instrument(skip(self), fields(backend = "azure", container = %self.container()))]
    pub async fn download_blob(&self, blob: &str) -> Result<Bytes> {
        let content = self
            .retry
            .run("download_blob", || async {
                let request = self.client.request(Method::GET, &[blob], &[])?;
                let response = self
                    .client
                    .execute(request)
                    .await
                    .map_err(|e| translate(e, Operation::DownloadBlob, blob))?;
                Ok(response.body)
            })
            .await?;

        debug!(blob, size = content.len(), "Downloaded blob");
        Ok(content)
    }

    /// Delete the whole container and every blob in it
    #[instrument(skip(self), fields(backend = "azure", container = %self.container()))]
    pub async fn delete_container(&self) -> Result<()> {
        self.retry
            .run("delete_container", || async {
                let request =
                    self.client
                        .request(Method::DELETE, &[], &[("restype", "container")])?;
                self.client.execute(request).await?;
                Ok(())
            })
            .await?;

        info!(container = %self.container(), "Deleted blob container");
        Ok(())
    }
}

#[async_trait]
impl Lifecycle for BlobStore {
    async fn close(&self) {
        self.client.close().await;
    }
}

impl fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobStore")
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

/// An active lease on one blob
///
/// Dropping the guard without calling [`release`](Self::release) spawns a
/// best-effort release on the current Tokio runtime, so cancelled tasks do
/// not leave the blob locked until the lease expires. Closing the store
/// waits for such releases.
pub struct BlobLease {
    client: Arc<ServiceClient>,
    blob: String,
    id: LeaseId,
    released: bool,
}

impl BlobLease {
    pub fn id(&self) -> &LeaseId {
        &self.id
    }

    pub fn blob(&self) -> &str {
        &self.blob
    }

    /// Release the lease now
    ///
    /// If this future is dropped before the request completes, the guard's
    /// `Drop` sends the release again.
    pub async fn release(mut self) -> Result<()> {
        let result = release_lease(&self.client, &self.blob, &self.id).await;
        self.released = true;
        result
    }
}

impl fmt::Debug for BlobLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobLease")
            .field("blob", &self.blob)
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for BlobLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let blob = std::mem::take(&mut self.blob);
        let id = self.id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let client = self.client.clone();
                let task = handle.spawn(async move {
                    if let Err(e) = release_lease(&client, &blob, &id).await {
                        warn!(%blob, lease_id = %id, error = %e, "Failed to release dropped lease");
                    }
                });
                self.client.track_release(task);
            }
            Err(_) => {
                warn!(%blob, lease_id = %id, "No runtime to release dropped lease; it will expire");
            }
        }
    }
}

async fn release_lease(client: &ServiceClient, blob: &str, id: &LeaseId) -> Result<()> {
    let request = client
        .request(Method::PUT, &[blob], &[("comp", "lease")])?
        .with_header("x-ms-lease-action", "release")?
        .with_header("x-ms-lease-id", id.as_str())?;

    client
        .execute_release(request)
        .await
        .map_err(|e| translate(e, Operation::ReleaseLease, blob))?;

    debug!(blob, lease_id = %id, "Released blob lease");
    Ok(())
}

fn validate_lease_duration(duration_secs: i32) -> Result<()> {
    if duration_secs == INFINITE_LEASE
        || (MIN_LEASE_SECS..=MAX_LEASE_SECS).contains(&duration_secs)
    {
        Ok(())
    } else {
        Err(Error::InvalidArgument {
            message: format!(
                "lease duration must be between {} and {} seconds, or {} for infinite; got {}",
                MIN_LEASE_SECS, MAX_LEASE_SECS, INFINITE_LEASE, duration_secs
            ),
        })
    }
}
