//! Value types shared by the blob and queue stores

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identifier of a lease held on one blob
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseId(String);

impl LeaseId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for LeaseId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A message received from a queue
///
/// The `delete_token` (pop receipt) changes on every dequeue and is required
/// to delete the message. Once the visibility timeout elapses the message is
/// delivered again with a new token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Message payload
    pub content: String,

    /// Single-use token proving the consumer holds the message
    pub delete_token: String,

    /// Number of times the message has been dequeued
    pub dequeue_count: u32,

    /// Backend message identifier
    pub message_id: String,

    /// Time until which the message is hidden from other consumers
    pub visibility_timeout: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_message_wire_shape() {
        let message = Message {
            content: "hello".to_string(),
            delete_token: "AgAAAAMAAAAAAAAA".to_string(),
            dequeue_count: 1,
            message_id: "b1b5c9a8".to_string(),
            visibility_timeout: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 30).unwrap(),
        };

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["content"], "hello");
        assert_eq!(json["deleteToken"], "AgAAAAMAAAAAAAAA");
        assert_eq!(json["dequeueCount"], 1);
        assert_eq!(json["messageId"], "b1b5c9a8");
        assert_eq!(json["visibilityTimeout"], "2024-05-01T12:00:30Z");

        let parsed: Message = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn test_lease_id_is_transparent() {
        let id = LeaseId::new("9a8b7c");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"9a8b7c\"");
        assert_eq!(id.to_string(), "9a8b7c");
    }
}
