//! XML payloads of the storage REST API

use chrono::{DateTime, Utc};
use persistence_core::{Error, Message, Result};
use quick_xml::escape::escape;
use serde::Deserialize;

use crate::transport::HttpResponse;

/// `<Error>` body returned with failed requests
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ErrorBody {
    code: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueueMessagesList {
    #[serde(rename = "QueueMessage", default)]
    messages: Vec<QueueMessageXml>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct QueueMessageXml {
    message_id: String,
    pop_receipt: String,
    time_next_visible: String,
    dequeue_count: u32,
    #[serde(default)]
    message_text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct QueueMessageBody {
    #[serde(default)]
    message_text: String,
}

fn text(body: &[u8]) -> Result<&str> {
    let text = std::str::from_utf8(body)
        .map_err(|e| Error::Serialization(format!("response is not UTF-8: {}", e)))?;
    Ok(text.trim_start_matches('\u{feff}'))
}

/// Convert a non-success response into an unrecognized service error
///
/// The error code comes from the `x-ms-error-code` header when present, else
/// from the body. HEAD responses carry no body, so the message falls back to
/// the status reason.
pub(crate) fn service_error(response: &HttpResponse) -> Error {
    let body = text(&response.body)
        .ok()
        .filter(|t| !t.trim().is_empty())
        .and_then(|t| quick_xml::de::from_str::<ErrorBody>(t).ok())
        .unwrap_or_default();

    let code = response
        .header_str("x-ms-error-code")
        .map(str::to_string)
        .or(body.code);
    let message = body.message.unwrap_or_else(|| {
        response
            .status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    });

    Error::Service {
        status: response.status.as_u16(),
        code,
        message,
    }
}

/// Request body for Put Message
pub(crate) fn message_body(content: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?><QueueMessage><MessageText>{}</MessageText></QueueMessage>",
        escape(content)
    )
}

/// Extract the text of a Put Message request body
pub fn parse_message_body(body: &[u8]) -> Result<String> {
    let parsed: QueueMessageBody = quick_xml::de::from_str(text(body)?)
        .map_err(|e| Error::Serialization(format!("invalid queue message body: {}", e)))?;
    Ok(parsed.message_text)
}

/// Parse the `QueueMessagesList` returned by Get Messages
pub(crate) fn parse_messages(body: &[u8]) -> Result<Vec<Message>> {
    let list: QueueMessagesList = quick_xml::de::from_str(text(body)?)
        .map_err(|e| Error::Serialization(format!("invalid message list: {}", e)))?;

    list.messages
        .into_iter()
        .map(|m| {
            Ok(Message {
                content: m.message_text,
                delete_token: m.pop_receipt,
                dequeue_count: m.dequeue_count,
                message_id: m.message_id,
                visibility_timeout: parse_http_date(&m.time_next_visible)?,
            })
        })
        .collect()
}

/// Parse an RFC 1123 date as used throughout the REST API
pub(crate) fn parse_http_date(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| Error::Serialization(format!("invalid date {:?}: {}", value, e)))
}

/// Format a timestamp as an RFC 1123 date
pub fn format_http_date(value: DateTime<Utc>) -> String {
    value.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
