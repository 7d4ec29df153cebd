//! Queue store with visibility-timeout based delivery
//!
//! Messages are delivered at least once: a received message stays hidden for
//! the visibility timeout and reappears unless deleted with its current
//! delete token.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, Iter};
use persistence_core::{Error, Message, Result, RetryPolicy, StoreConfig};
use reqwest::Method;
use tracing::{debug, info, instrument};

use crate::connection::ServiceKind;
use crate::lifecycle::{is_already_exists, Lifecycle, ServiceClient, StoreOptions};
use crate::translate::{translate, Operation};
use crate::xml;

/// Most messages a single receive may return
pub const MAX_MESSAGES_PER_RECEIVE: u32 = 32;

/// Shortest visibility timeout Get Messages accepts
pub const MIN_VISIBILITY_TIMEOUT_SECS: u32 = 1;

/// Longest visibility timeout the service accepts (7 days)
pub const MAX_VISIBILITY_TIMEOUT_SECS: u32 = 7 * 24 * 60 * 60;

/// Messages from one receive call, in delivery order
///
/// Produced from a single page fetch; it is finite and cannot be restarted.
pub type MessageStream = Iter<std::vec::IntoIter<Message>>;

/// Queue store scoped to one queue
///
/// Cloning is cheap; clones share the same service client.
#[derive(Clone)]
pub struct QueueStore {
    client: Arc<ServiceClient>,
    retry: RetryPolicy,
}

impl QueueStore {
    /// Open the store with the default transport and ensure the queue exists
    pub async fn open(config: StoreConfig) -> Result<Self> {
        Self::open_with(config, StoreOptions::default()).await
    }

    /// Open the store with injected collaborators and ensure the queue exists
    pub async fn open_with(config: StoreConfig, options: StoreOptions) -> Result<Self> {
        config.validate()?;
        let client = ServiceClient::connect(&config, &options, ServiceKind::Queue)?;
        info!(queue = %config.name, "Queue storage is configured");

        let store = Self {
            client,
            retry: options.retry,
        };

        if let Err(e) = store.create_queue_if_absent().await {
            store.client.close().await;
            return Err(e);
        }
        Ok(store)
    }

    /// Queue name
    pub fn queue(&self) -> &str {
        self.client.name()
    }

    async fn create_queue_if_absent(&self) -> Result<()> {
        // 201 when created, 204 when an identical queue already exists
        let created = self
            .retry
            .run("create_queue", || async {
                let request = self.client.request(Method::PUT, &[], &[])?;
                match self.client.execute(request).await {
                    Ok(response) => Ok(response.status.as_u16() == 201),
                    Err(e) if is_already_exists(&e, "QueueAlreadyExists") => Ok(false),
                    Err(e) => Err(e),
                }
            })
            .await?;

        if created {
            info!(queue = %self.queue(), "Created queue");
        } else {
            debug!(queue = %self.queue(), "Queue already exists");
        }
        Ok(())
    }

    /// Enqueue a message
    ///
    /// Retried on transient errors, so a message may be enqueued twice when a
    /// response is lost.
    #[instrument(skip(self, content), fields(backend = "azure", queue = %self.queue(), size = content.len()))]
    pub async fn send_message(&self, content: &str) -> Result<()> {
        let body = xml::message_body(content);

        self.retry
            .run("send_message", || {
                let body = body.clone();
                async move {
                    let request = self
                        .client
                        .request(Method::POST, &["messages"], &[])?
                        .with_header("content-type", "application/xml")?
                        .with_body(body);
                    self.client.execute(request).await?;
                    Ok(())
                }
            })
            .await?;

        debug!("Sent message");
        Ok(())
    }

    /// Receive up to `max_messages` visible messages
    ///
    /// Each returned message is hidden from other consumers for
    /// `visibility_timeout_secs` seconds. The page fetch is retried on
    /// transient errors.
    #[instrument(skip(self), fields(backend = "azure", queue = %self.queue()))]
    pub async fn receive_messages(
        &self,
        max_messages: u32,
        visibility_timeout_secs: u32,
    ) -> Result<MessageStream> {
        if max_messages == 0 || max_messages > MAX_MESSAGES_PER_RECEIVE {
            return Err(Error::InvalidArgument {
                message: format!(
                    "max_messages must be between 1 and {}; got {}",
                    MAX_MESSAGES_PER_RECEIVE, max_messages
                ),
            });
        }
        if !(MIN_VISIBILITY_TIMEOUT_SECS..=MAX_VISIBILITY_TIMEOUT_SECS)
            .contains(&visibility_timeout_secs)
        {
            return Err(Error::InvalidArgument {
                message: format!(
                    "visibility timeout must be between {} and {} seconds; got {}",
                    MIN_VISIBILITY_TIMEOUT_SECS, MAX_VISIBILITY_TIMEOUT_SECS, visibility_timeout_secs
                ),
            });
        }

        let count = max_messages.to_string();
        let timeout = visibility_timeout_secs.to_string();

        let messages = self
            .retry
            .run("receive_messages", || async {
                let request = self.client.request(
                    Method::GET,
                    &["messages"],
                    &[
                        ("numofmessages", count.as_str()),
                        ("visibilitytimeout", timeout.as_str()),
                    ],
                )?;
                let response = self.client.execute(request).await?;
                xml::parse_messages(&response.body)
            })
            .await?;

        debug!(count = messages.len(), "Received messages");
        Ok(stream::iter(messages))
    }

    /// Delete a received message by its ID and delete token
    ///
    /// Fails with `MessageNotFound` when the token is stale: the message was
    /// already deleted, or became visible again and may be redelivered. Not
    /// retried, since a retry would present the same token.
    #[instrument(skip(self, message), fields(backend = "azure", queue = %self.queue(), message_id = %message.message_id))]
    pub async fn delete_message(&self, message: &Message) -> Result<()> {
        let request = self.client.request(
            Method::DELETE,
            &["messages", message.message_id.as_str()],
            &[("popreceipt", message.delete_token.as_str())],
        )?;

        self.client
            .execute(request)
            .await
            .map_err(|e| translate(e, Operation::DeleteMessage, &message.message_id))?;

        debug!("Deleted message");
        Ok(())
    }

    /// Delete the queue and all its messages
    #[instrument(skip(self), fields(backend = "azure", queue = %self.queue()))]
    pub async fn delete_queue(&self) -> Result<()> {
        self.retry
            .run("delete_queue", || async {
                let request = self.client.request(Method::DELETE, &[], &[])?;
                self.client.execute(request).await?;
                Ok(())
            })
            .await?;

        info!(queue = %self.queue(), "Deleted queue");
        Ok(())
    }
}

#[async_trait]
impl Lifecycle for QueueStore {
    async fn close(&self) {
        self.client.close().await;
    }
}

impl fmt::Debug for QueueStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueStore")
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}
