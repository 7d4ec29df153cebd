//! In-memory storage emulator for tests
//!
//! [`MemoryStorage`] is an [`HttpTransport`] that answers blob and queue REST
//! requests from memory, with the status codes, error codes and messages the
//! real service uses for containers, block blobs, leases and queues. Lease
//! expiry and message visibility follow the Tokio clock, so tests can use
//! `tokio::time::pause` and `advance` to expire them.
//!
//! Blob names are stored in their URL-encoded form.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use persistence_core::{Error, Result};
use quick_xml::escape::escape;
use reqwest::header::HeaderValue;
use reqwest::StatusCode;
use tokio::time::Instant;
use uuid::Uuid;

use crate::transport::{HttpRequest, HttpResponse, HttpTransport};
use crate::xml::{format_http_date, parse_message_body};

/// Host answering blob requests
pub const BLOB_HOST: &str = "blob.memory.test";

/// Host answering queue requests
pub const QUEUE_HOST: &str = "queue.memory.test";

const DEFAULT_VISIBILITY_TIMEOUT_SECS: u64 = 30;
const MAX_VISIBILITY_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;
const MESSAGE_TTL_DAYS: i64 = 7;

#[derive(Clone)]
struct StoredLease {
    id: String,
    expires_at: Option<Instant>,
}

impl StoredLease {
    fn is_active(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

struct StoredBlob {
    data: Bytes,
    lease: Option<StoredLease>,
}

struct StoredMessage {
    id: String,
    text: String,
    pop_receipt: Option<String>,
    dequeue_count: u32,
    visible_at: Instant,
    inserted_on: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    containers: HashMap<String, HashMap<String, StoredBlob>>,
    queues: HashMap<String, Vec<StoredMessage>>,
    queue_creations: HashMap<String, u32>,
    requests: u64,
    fail_next: u32,
}

/// In-memory emulator of the blob and queue services
///
/// Clones share state, so a test can keep one handle for inspection while
/// the store owns another as its transport.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<State>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connection string pointing both services at this emulator
    pub fn connection_string(&self) -> String {
        format!(
            "BlobEndpoint=http://{}/;QueueEndpoint=http://{}/;SharedAccessSignature=sv=2021-12-02&ss=bq&sig=memory",
            BLOB_HOST, QUEUE_HOST
        )
    }

    /// Number of requests received, including simulated failures
    pub fn request_count(&self) -> u64 {
        self.state.lock().requests
    }

    /// Fail the next `n` requests with a transport error
    pub fn fail_next_requests(&self, n: u32) {
        self.state.lock().fail_next = n;
    }

    pub fn has_container(&self, container: &str) -> bool {
        self.state.lock().containers.contains_key(container)
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.state.lock().queues.contains_key(queue)
    }

    /// How many times the queue was actually created
    pub fn queue_creations(&self, queue: &str) -> u32 {
        self.state
            .lock()
            .queue_creations
            .get(queue)
            .copied()
            .unwrap_or(0)
    }

    /// Whether a blob currently holds an unexpired lease
    pub fn is_leased(&self, container: &str, blob: &str) -> bool {
        let now = Instant::now();
        self.state
            .lock()
            .containers
            .get(container)
            .and_then(|blobs| blobs.get(blob))
            .and_then(|b| b.lease.as_ref())
            .is_some_and(|lease| lease.is_active(now))
    }
}

#[async_trait]
impl HttpTransport for MemoryStorage {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut state = self.state.lock();
        state.requests += 1;

        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(Error::Transport {
                message: "simulated connection reset".to_string(),
            });
        }

        if request.header_str("x-ms-version").is_empty() {
            return Ok(error(
                StatusCode::BAD_REQUEST,
                "MissingRequiredHeader",
                "An HTTP header that's mandatory for this request is not specified.",
            ));
        }

        let now = Instant::now();
        let segments: Vec<String> = request
            .url
            .path_segments()
            .map(|s| s.filter(|p| !p.is_empty()).map(str::to_string).collect())
            .unwrap_or_default();

        let response = match request.url.host_str() {
            Some(BLOB_HOST) => state.blob(&request, &segments, now),
            Some(QUEUE_HOST) => state.queue(&request, &segments, now),
            _ => invalid_uri(),
        };
        Ok(response)
    }
}

impl State {
    fn blob(&mut self, request: &HttpRequest, segments: &[String], now: Instant) -> HttpResponse {
        let Some((container, rest)) = segments.split_first() else {
            return invalid_uri();
        };
        let blob = rest.join("/");
        let restype = request.query_param("restype");
        let comp = request.query_param("comp");

        match (
            request.method.as_str(),
            blob.is_empty(),
            restype.as_deref(),
            comp.as_deref(),
        ) {
            ("PUT", true, Some("container"), _) => self.create_container(container),
            ("DELETE", true, Some("container"), _) => self.delete_container(container),
            ("PUT", false, _, Some("lease")) => self.lease(container, &blob, request, now),
            ("PUT", false, _, None) => self.put_blob(container, &blob, request, now),
            ("GET", false, _, None) => self.get_blob(container, &blob),
            _ => unsupported(),
        }
    }

    fn create_container(&mut self, container: &str) -> HttpResponse {
        if self.containers.contains_key(container) {
            return error(
                StatusCode::CONFLICT,
                "ContainerAlreadyExists",
                "The specified container already exists.",
            );
        }
        self.containers.insert(container.to_string(), HashMap::new());
        HttpResponse::new(StatusCode::CREATED)
    }

    fn delete_container(&mut self, container: &str) -> HttpResponse {
        match self.containers.remove(container) {
            Some(_) => HttpResponse::new(StatusCode::ACCEPTED),
            None => container_not_found(),
        }
    }

    fn lease(
        &mut self,
        container: &str,
        blob: &str,
        request: &HttpRequest,
        now: Instant,
    ) -> HttpResponse {
        let Some(blobs) = self.containers.get_mut(container) else {
            return container_not_found();
        };
        let Some(stored) = blobs.get_mut(blob) else {
            return blob_not_found();
        };

        match request.header_str("x-ms-lease-action") {
            "acquire" => {
                let duration = match request.header_str("x-ms-lease-duration").parse::<i64>() {
                    Ok(d) if d == -1 || (15..=60).contains(&d) => d,
                    _ => return invalid_header(),
                };
                let proposed = request.header_str("x-ms-proposed-lease-id");

                if let Some(active) = stored.lease.as_ref().filter(|l| l.is_active(now)) {
                    if proposed.is_empty() || proposed != active.id {
                        return error(
                            StatusCode::CONFLICT,
                            "LeaseAlreadyPresent",
                            "There is already a lease present.",
                        );
                    }
                }

                let id = if proposed.is_empty() {
                    Uuid::new_v4().to_string()
                } else {
                    proposed.to_string()
                };
                stored.lease = Some(StoredLease {
                    id: id.clone(),
                    expires_at: u64::try_from(duration)
                        .ok()
                        .map(|secs| now + Duration::from_secs(secs)),
                });

                let mut response = HttpResponse::new(StatusCode::CREATED);
                if let Ok(value) = HeaderValue::from_str(&id) {
                    response.headers.insert("x-ms-lease-id", value);
                }
                response
            }
            "release" => {
                let id = request.header_str("x-ms-lease-id");
                match stored.lease.as_ref().map(|lease| lease.id == id) {
                    None => error(
                        StatusCode::CONFLICT,
                        "LeaseNotPresentWithLeaseOperation",
                        "There is currently no lease on the blob.",
                    ),
                    Some(false) => error(
                        StatusCode::CONFLICT,
                        "LeaseIdMismatchWithLeaseOperation",
                        "The lease ID specified did not match the lease ID for the blob.",
                    ),
                    Some(true) => {
                        stored.lease = None;
                        HttpResponse::new(StatusCode::OK)
                    }
                }
            }
            _ => invalid_header(),
        }
    }

    fn put_blob(
        &mut self,
        container: &str,
        blob: &str,
        request: &HttpRequest,
        now: Instant,
    ) -> HttpResponse {
        let Some(blobs) = self.containers.get_mut(container) else {
            return container_not_found();
        };
        let lease_id = request.header_str("x-ms-lease-id");

        let lease = match blobs.get(blob) {
            Some(existing) => {
                if let Some(rejection) = check_write_lease(existing.lease.as_ref(), lease_id, now) {
                    return rejection;
                }
                if request.header_str("if-none-match") == "*" {
                    return error(
                        StatusCode::CONFLICT,
                        "BlobAlreadyExists",
                        "The specified blob already exists.",
                    );
                }
                existing.lease.clone().filter(|l| l.is_active(now))
            }
            None if !lease_id.is_empty() => return lease_not_present(),
            None => None,
        };

        blobs.insert(
            blob.to_string(),
            StoredBlob {
                data: request.body.clone(),
                lease,
            },
        );
        HttpResponse::new(StatusCode::CREATED)
    }

    fn get_blob(&self, container: &str, blob: &str) -> HttpResponse {
        let Some(blobs) = self.containers.get(container) else {
            return container_not_found();
        };
        match blobs.get(blob) {
            Some(stored) => {
                let mut response = HttpResponse::new(StatusCode::OK);
                response.body = stored.data.clone();
                response
            }
            None => blob_not_found(),
        }
    }

    fn queue(&mut self, request: &HttpRequest, segments: &[String], now: Instant) -> HttpResponse {
        let parts: Vec<&str> = segments.iter().map(String::as_str).collect();

        match (request.method.as_str(), parts.as_slice()) {
            ("PUT", [queue]) => self.create_queue(queue),
            ("DELETE", [queue]) => match self.queues.remove(*queue) {
                Some(_) => HttpResponse::new(StatusCode::NO_CONTENT),
                None => queue_not_found(),
            },
            ("POST", [queue, "messages"]) => self.put_message(queue, request, now),
            ("GET", [queue, "messages"]) => self.get_messages(queue, request, now),
            ("DELETE", [queue, "messages", id]) => self.delete_message(queue, id, request, now),
            _ => unsupported(),
        }
    }

    fn create_queue(&mut self, queue: &str) -> HttpResponse {
        if self.queues.contains_key(queue) {
            return HttpResponse::new(StatusCode::NO_CONTENT);
        }
        self.queues.insert(queue.to_string(), Vec::new());
        *self.queue_creations.entry(queue.to_string()).or_default() += 1;
        HttpResponse::new(StatusCode::CREATED)
    }

    fn put_message(&mut self, queue: &str, request: &HttpRequest, now: Instant) -> HttpResponse {
        let Some(messages) = self.queues.get_mut(queue) else {
            return queue_not_found();
        };
        let Ok(text) = parse_message_body(&request.body) else {
            return error(
                StatusCode::BAD_REQUEST,
                "InvalidXmlDocument",
                "XML specified is not syntactically valid.",
            );
        };
        let delay = request
            .query_param("visibilitytimeout")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        messages.push(StoredMessage {
            id: Uuid::new_v4().to_string(),
            text,
            pop_receipt: None,
            dequeue_count: 0,
            visible_at: now + Duration::from_secs(delay),
            inserted_on: Utc::now(),
        });
        HttpResponse::new(StatusCode::CREATED)
    }

    fn get_messages(&mut self, queue: &str, request: &HttpRequest, now: Instant) -> HttpResponse {
        let Some(messages) = self.queues.get_mut(queue) else {
            return queue_not_found();
        };
        let count = match request.query_param("numofmessages").map(|v| v.parse::<usize>()) {
            None => 1,
            Some(Ok(n)) if (1..=32).contains(&n) => n,
            Some(_) => return out_of_range(),
        };
        let timeout = match request.query_param("visibilitytimeout").map(|v| v.parse::<u64>()) {
            None => DEFAULT_VISIBILITY_TIMEOUT_SECS,
            Some(Ok(secs)) if (1..=MAX_VISIBILITY_TIMEOUT_SECS).contains(&secs) => secs,
            Some(_) => return out_of_range(),
        };
        let next_visible = format_http_date(Utc::now() + chrono::Duration::seconds(timeout as i64));

        let mut body =
            String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?><QueueMessagesList>");
        for message in messages
            .iter_mut()
            .filter(|m| m.visible_at <= now)
            .take(count)
        {
            let receipt = Uuid::new_v4().to_string();
            message.dequeue_count += 1;
            message.pop_receipt = Some(receipt.clone());
            message.visible_at = now + Duration::from_secs(timeout);

            body.push_str(&format!(
                "<QueueMessage><MessageId>{}</MessageId><InsertionTime>{}</InsertionTime>\
                 <ExpirationTime>{}</ExpirationTime><PopReceipt>{}</PopReceipt>\
                 <TimeNextVisible>{}</TimeNextVisible><DequeueCount>{}</DequeueCount>\
                 <MessageText>{}</MessageText></QueueMessage>",
                message.id,
                format_http_date(message.inserted_on),
                format_http_date(message.inserted_on + chrono::Duration::days(MESSAGE_TTL_DAYS)),
                receipt,
                next_visible,
                message.dequeue_count,
                escape(message.text.as_str()),
            ));
        }
        body.push_str("</QueueMessagesList>");

        let mut response = HttpResponse::new(StatusCode::OK);
        response.body = body.into();
        response
    }

    fn delete_message(
        &mut self,
        queue: &str,
        id: &str,
        request: &HttpRequest,
        now: Instant,
    ) -> HttpResponse {
        let Some(messages) = self.queues.get_mut(queue) else {
            return queue_not_found();
        };
        let Some(index) = messages.iter().position(|m| m.id == id) else {
            return message_not_found();
        };

        let message = &messages[index];
        // A message that became visible again no longer honours old receipts
        if message.visible_at <= now || message.pop_receipt.is_none() {
            return message_not_found();
        }
        let receipt = request.query_param("popreceipt").unwrap_or_default();
        if message.pop_receipt.as_deref() != Some(receipt.as_str()) {
            return error(
                StatusCode::BAD_REQUEST,
                "PopReceiptMismatch",
                "The specified pop receipt did not match the pop receipt for a dequeued message.",
            );
        }

        messages.remove(index);
        HttpResponse::new(StatusCode::NO_CONTENT)
    }
}

fn check_write_lease(
    lease: Option<&StoredLease>,
    lease_id: &str,
    now: Instant,
) -> Option<HttpResponse> {
    match lease {
        Some(active) if active.is_active(now) => {
            if lease_id.is_empty() {
                Some(error(
                    StatusCode::PRECONDITION_FAILED,
                    "LeaseIdMissing",
                    "There is currently a lease on the blob and no lease ID was specified in the request.",
                ))
            } else if lease_id != active.id {
                Some(error(
                    StatusCode::PRECONDITION_FAILED,
                    "LeaseIdMismatchWithBlobOperation",
                    "The lease ID specified did not match the lease ID for the blob.",
                ))
            } else {
                None
            }
        }
        Some(expired) if !lease_id.is_empty() && expired.id == lease_id => Some(error(
            StatusCode::PRECONDITION_FAILED,
            "LeaseLost",
            "A lease ID was specified, but the lease for the blob has expired.",
        )),
        _ if !lease_id.is_empty() => Some(lease_not_present()),
        _ => None,
    }
}

fn error(status: StatusCode, code: &'static str, message: &str) -> HttpResponse {
    let mut response = HttpResponse::new(status);
    response
        .headers
        .insert("x-ms-error-code", HeaderValue::from_static(code));
    response.body = format!(
        "\u{feff}<?xml version=\"1.0\" encoding=\"utf-8\"?><Error><Code>{}</Code><Message>{}\nRequestId:{}\nTime:{}</Message></Error>",
        code,
        escape(message),
        Uuid::new_v4(),
        Utc::now().to_rfc3339(),
    )
    .into();
    response
}

fn invalid_uri() -> HttpResponse {
    error(
        StatusCode::BAD_REQUEST,
        "InvalidUri",
        "The requested URI does not represent any resource on the server.",
    )
}

fn unsupported() -> HttpResponse {
    error(
        StatusCode::BAD_REQUEST,
        "UnsupportedHttpVerb",
        "The resource doesn't support the specified HTTP verb.",
    )
}

fn invalid_header() -> HttpResponse {
    error(
        StatusCode::BAD_REQUEST,
        "InvalidHeaderValue",
        "The value for one of the HTTP headers is not in the correct format.",
    )
}

fn out_of_range() -> HttpResponse {
    error(
        StatusCode::BAD_REQUEST,
        "OutOfRangeQueryParameterValue",
        "One of the query parameters specified in the request URI is outside the permissible range.",
    )
}

fn container_not_found() -> HttpResponse {
    error(
        StatusCode::NOT_FOUND,
        "ContainerNotFound",
        "The specified container does not exist.",
    )
}

fn blob_not_found() -> HttpResponse {
    error(
        StatusCode::NOT_FOUND,
        "BlobNotFound",
        "The specified blob does not exist.",
    )
}

fn lease_not_present() -> HttpResponse {
    error(
        StatusCode::PRECONDITION_FAILED,
        "LeaseNotPresentWithBlobOperation",
        "There is currently no lease on the blob.",
    )
}

fn queue_not_found() -> HttpResponse {
    error(
        StatusCode::NOT_FOUND,
        "QueueNotFound",
        "The specified queue does not exist.",
    )
}

fn message_not_found() -> HttpResponse {
    error(
        StatusCode::NOT_FOUND,
        "MessageNotFound",
        "The specified message does not exist.",
    )
}
