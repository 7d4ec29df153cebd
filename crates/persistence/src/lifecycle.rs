//! Connection lifecycle shared by the blob and queue stores
//!
//! A [`ServiceClient`] is created when a store is opened and closed when the
//! store is closed. All operations of one store share the same client; once
//! closed, every request fails with [`Error::Closed`] instead of reaching the
//! transport, and the transport itself is dropped so pooled connections go
//! with it. Lease releases spawned by dropped guards are awaited by `close`
//! before the transport is let go.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use persistence_core::{Error, Result, RetryPolicy, StoreConfig};
use reqwest::Method;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::connection::{ConnectionString, ServiceKind};
use crate::credential::{BearerTokenProvider, Credential, TokenProvider, STORAGE_SCOPE};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
use crate::xml;

/// REST API version sent with every request
pub const API_VERSION: &str = "2021-12-02";

/// Collaborators injected into a store when it is opened
#[derive(Clone, Default)]
pub struct StoreOptions {
    /// Transport to use instead of the default `reqwest` client
    pub transport: Option<Arc<dyn HttpTransport>>,

    /// Bearer token source, used when the connection string has no key or SAS
    pub token_provider: Option<Arc<dyn TokenProvider>>,

    /// Retry policy for backend calls
    pub retry: RetryPolicy,
}

impl StoreOptions {
    pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

impl fmt::Debug for StoreOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreOptions")
            .field("custom_transport", &self.transport.is_some())
            .field("token_provider", &self.token_provider.is_some())
            .field("retry", &self.retry)
            .finish()
    }
}

/// Handle to one storage service, scoped to a container or queue
pub struct ServiceClient {
    kind: ServiceKind,
    name: String,
    endpoint: Url,
    credential: Credential,
    transport: Mutex<Option<Arc<dyn HttpTransport>>>,
    closed: AtomicBool,
    pending_releases: Mutex<Vec<JoinHandle<()>>>,
}

impl ServiceClient {
    /// Build the client from configuration; no request is sent yet
    pub(crate) fn connect(
        config: &StoreConfig,
        options: &StoreOptions,
        kind: ServiceKind,
    ) -> Result<Arc<Self>> {
        let connection = ConnectionString::parse(&config.connection_string)?;
        let endpoint = connection.endpoint(kind)?.clone();

        // An explicit token provider takes precedence over anonymous access,
        // never over a key or SAS embedded in the connection string
        let credential = match (connection.credential(), &options.token_provider) {
            (Some(credential), _) => credential.clone(),
            (None, Some(provider)) => Credential::Bearer(Arc::new(BearerTokenProvider::new(
                provider.clone(),
                STORAGE_SCOPE,
            ))),
            (None, None) => Credential::Anonymous,
        };

        let transport: Arc<dyn HttpTransport> = match &options.transport {
            Some(transport) => transport.clone(),
            None => Arc::new(ReqwestTransport::new()?),
        };

        debug!(?kind, name = %config.name, host = ?endpoint.host_str(), ?credential, "Connected service client");

        Ok(Arc::new(Self {
            kind,
            name: config.name.clone(),
            endpoint,
            credential,
            transport: Mutex::new(Some(transport)),
            closed: AtomicBool::new(false),
            pending_releases: Mutex::new(Vec::new()),
        }))
    }

    /// Container or queue name this client is scoped to
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// URL of the scoped resource, followed by the given path segments
    ///
    /// Segments containing `/` are split, so blob names keep their virtual
    /// directory structure.
    pub(crate) fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.endpoint.clone();
        {
            let mut path = url.path_segments_mut().map_err(|_| Error::InvalidConfig {
                message: format!("endpoint {} cannot carry a path", self.endpoint),
            })?;
            path.pop_if_empty().push(&self.name);
            for segment in segments {
                path.extend(segment.split('/'));
            }
        }
        Ok(url)
    }

    /// Start a request against the scoped resource
    pub(crate) fn request(
        &self,
        method: Method,
        segments: &[&str],
        query: &[(&str, &str)],
    ) -> Result<HttpRequest> {
        let mut url = self.url(segments)?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(HttpRequest::new(method, url))
    }

    fn closed_error(&self) -> Error {
        Error::Closed {
            name: self.name.clone(),
        }
    }

    /// Authorize and send a request, turning error statuses into errors
    pub(crate) async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        self.send(request).await
    }

    /// Like [`execute`](Self::execute), but still allowed while `close` is
    /// waiting for outstanding lease releases
    pub(crate) async fn execute_release(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.send(request).await
    }

    async fn send(&self, mut request: HttpRequest) -> Result<HttpResponse> {
        let transport = self
            .transport
            .lock()
            .clone()
            .ok_or_else(|| self.closed_error())?;

        request.set_header("x-ms-version", API_VERSION)?;
        request.set_header("x-ms-date", &xml::format_http_date(Utc::now()))?;
        request.set_header("x-ms-client-request-id", &Uuid::new_v4().to_string())?;
        self.credential.authorize(&mut request).await?;

        let method = request.method.clone();
        let path = request.url.path().to_string();
        let response = transport.send(request).await?;
        debug!(%method, %path, status = response.status.as_u16(), "Storage request completed");

        if response.status.is_success() {
            Ok(response)
        } else {
            Err(xml::service_error(&response))
        }
    }

    /// Track a release spawned by a dropped lease guard
    pub(crate) fn track_release(&self, handle: JoinHandle<()>) {
        let mut pending = self.pending_releases.lock();
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    /// Close the underlying service handle; later requests fail
    ///
    /// Waits for releases of dropped lease guards, then drops the transport.
    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let pending = std::mem::take(&mut *self.pending_releases.lock());
        if !pending.is_empty() {
            debug!(count = pending.len(), "Waiting for lease releases before close");
        }
        for handle in pending {
            if let Err(e) = handle.await {
                warn!(error = %e, "Lease release task failed");
            }
        }

        let transport = self.transport.lock().take();
        if let Some(transport) = transport {
            transport.close().await;
        }
        info!(kind = ?self.kind, name = %self.name, "Closed storage client");
    }
}

impl fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceClient")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("endpoint", &self.endpoint.as_str())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for ServiceClient {
    fn drop(&mut self) {
        if !self.is_closed() {
            debug!(kind = ?self.kind, name = %self.name, "Storage client dropped without close");
        }
    }
}

/// A store with an explicit exit step
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Close the store's service handle; idempotent
    async fn close(&self);
}

/// Run `body` with a store and close the store afterwards
///
/// The store is closed whether `body` succeeds or fails. If the returned
/// future is dropped before completion, the client is released when its
/// last handle is dropped.
pub async fn scoped<S, F, Fut, T>(store: S, body: F) -> Result<T>
where
    S: Lifecycle + Clone,
    F: FnOnce(S) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let result = body(store.clone()).await;
    if let Err(e) = &result {
        warn!(error = %e, "Store scope exited with error");
    }
    store.close().await;
    result
}

/// Whether a provisioning error only says the resource is already there
///
/// Other conflicts, such as a container still being deleted, surface.
pub(crate) fn is_already_exists(error: &Error, expected_code: &str) -> bool {
    match error {
        Error::Service { status: 409, code, .. } => {
            code.as_deref().map_or(true, |c| c == expected_code)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStorage;

    fn client(connection_string: &str, kind: ServiceKind) -> Arc<ServiceClient> {
        let storage = MemoryStorage::new();
        let options = StoreOptions::default().with_transport(Arc::new(storage));
        ServiceClient::connect(&StoreConfig::new(connection_string, "calls"), &options, kind)
            .unwrap()
    }

    #[test]
    fn test_url_keeps_account_path_and_splits_blob_names() {
        let client = client("UseDevelopmentStorage=true", ServiceKind::Blob);
        let url = client.url(&["2024/05/state file.json"]).unwrap();
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:10000/devstoreaccount1/calls/2024/05/state%20file.json"
        );
    }

    #[test]
    fn test_request_query() {
        let client = client(
            "AccountName=acct;AccountKey=c2VjcmV0",
            ServiceKind::Queue,
        );
        let request = client
            .request(Method::GET, &["messages"], &[("numofmessages", "4")])
            .unwrap();
        assert_eq!(
            request.url.as_str(),
            "https://acct.queue.core.windows.net/calls/messages?numofmessages=4"
        );
    }

    #[tokio::test]
    async fn test_closed_client_rejects_requests() {
        let client = client(&MemoryStorage::new().connection_string(), ServiceKind::Blob);
        client.close().await;
        client.close().await;
        assert!(client.is_closed());

        let request = client.request(Method::GET, &["blob"], &[]).unwrap();
        let result = client.execute(request).await;
        assert!(matches!(result, Err(Error::Closed { name }) if name == "calls"));
    }

    #[test]
    fn test_bearer_credential_when_no_key() {
        let options = StoreOptions::default()
            .with_transport(Arc::new(MemoryStorage::new()))
            .with_token_provider(Arc::new(crate::credential::StaticTokenProvider::new("t")));
        let client = ServiceClient::connect(
            &StoreConfig::new("AccountName=acct", "calls"),
            &options,
            ServiceKind::Blob,
        )
        .unwrap();
        assert!(matches!(client.credential, Credential::Bearer(_)));
    }

    #[test]
    fn test_is_already_exists() {
        let conflict = |code: Option<&str>| Error::Service {
            status: 409,
            code: code.map(str::to_string),
            message: String::new(),
        };
        assert!(is_already_exists(&conflict(Some("ContainerAlreadyExists")), "ContainerAlreadyExists"));
        assert!(is_already_exists(&conflict(None), "ContainerAlreadyExists"));
        assert!(is_already_exists(&conflict(Some("QueueAlreadyExists")), "QueueAlreadyExists"));
        assert!(!is_already_exists(&conflict(Some("QueueBeingDeleted")), "QueueAlreadyExists"));
        assert!(!is_already_exists(&conflict(Some("ContainerBeingDeleted")), "ContainerAlreadyExists"));
    }
}
