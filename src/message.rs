//! Message types flowing through table queues.
//!
//! A message is stored as a single row: a unique id, optional correlation id and reply-to
//! address, an optional expiry timestamp, the headers serialized as one JSON object and the
//! body as a blob. Messages are removed from the table when they are received, so a row is
//! only ever seen by one consumer unless the receiving transaction is rolled back.

use std::collections::HashMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reserved header names.
pub mod headers {
    /// Final destination of a message that was parked in the delayed-message table.
    pub const FORWARD_DESTINATION: &str = "TableMq.ForwardDestination";
    pub const MESSAGE_ID: &str = "TableMq.MessageId";
    pub const CORRELATION_ID: &str = "TableMq.CorrelationId";
    pub const REPLY_TO_ADDRESS: &str = "TableMq.ReplyToAddress";
    pub const ENCLOSED_MESSAGE_TYPES: &str = "TableMq.EnclosedMessageTypes";
    pub const EXCEPTION_MESSAGE: &str = "TableMq.ExceptionInfo.Message";
    pub const FAILED_QUEUE: &str = "TableMq.FailedQ";
    pub const PROCESSING_ATTEMPTS: &str = "TableMq.ProcessingAttempts";
}

pub type Headers = HashMap<String, String>;

/// A message about to be written to a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub message_id: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl OutgoingMessage {
    /// Creates a message with a freshly generated id.
    pub fn new(headers: Headers, body: impl Into<Bytes>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), headers, body)
    }

    pub fn with_id(
        message_id: impl Into<String>,
        mut headers: Headers,
        body: impl Into<Bytes>,
    ) -> Self {
        let message_id = message_id.into();
        headers
            .entry(headers::MESSAGE_ID.to_owned())
            .or_insert_with(|| message_id.clone());

        Self {
            message_id,
            headers,
            body: body.into(),
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.headers.get(headers::CORRELATION_ID).map(String::as_str)
    }

    pub fn reply_to_address(&self) -> Option<&str> {
        self.headers
            .get(headers::REPLY_TO_ADDRESS)
            .map(String::as_str)
    }
}

/// A message read from a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    transport_id: String,
    correlation_id: Option<String>,
    reply_to_address: Option<String>,
    recoverable: bool,
    expired: bool,
    headers: Headers,
    body: Bytes,
}

impl IncomingMessage {
    pub(crate) fn from_row(row: &MessageRow, headers: Headers, now: DateTime<Utc>) -> Self {
        Self {
            transport_id: row.id.clone(),
            correlation_id: row.correlation_id.clone(),
            reply_to_address: row.reply_to_address.clone(),
            recoverable: row.recoverable,
            expired: row
                .expires
                .map(|expires| expires <= now.timestamp_millis())
                .unwrap_or(false),
            headers,
            body: Bytes::from(row.body.clone()),
        }
    }

    pub fn transport_id(&self) -> &str {
        &self.transport_id
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn reply_to_address(&self) -> Option<&str> {
        self.reply_to_address.as_deref()
    }

    pub fn recoverable(&self) -> bool {
        self.recoverable
    }

    /// Whether the time-to-be-received had elapsed when the message was dequeued.
    pub fn is_expired(&self) -> bool {
        self.expired
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn enclosed_message_types(&self) -> Option<&str> {
        self.headers
            .get(headers::ENCLOSED_MESSAGE_TYPES)
            .map(String::as_str)
    }

    pub(crate) fn forward_destination(&self) -> Option<&str> {
        self.headers
            .get(headers::FORWARD_DESTINATION)
            .map(String::as_str)
    }

    /// Copy of the message as the business handler sees it.
    pub(crate) fn without_forward_destination(&self) -> Self {
        let mut message = self.clone();
        message.headers.remove(headers::FORWARD_DESTINATION);
        message
    }

    /// Converts the message back into an outgoing message with the same id, headers and body.
    pub fn to_outgoing(&self) -> OutgoingMessage {
        OutgoingMessage {
            message_id: self.transport_id.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }
}

/// A queue row exactly as stored.
///
/// Headers are kept as raw bytes so that a row whose headers cannot be deserialized can
/// still be moved to the error queue unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRow {
    pub id: String,
    pub correlation_id: Option<String>,
    pub reply_to_address: Option<String>,
    pub recoverable: bool,
    /// Expiry as unix milliseconds
    pub expires: Option<i64>,
    pub headers: Vec<u8>,
    pub body: Vec<u8>,
}

impl MessageRow {
    pub fn parse_headers(&self) -> Result<Headers, serde_json::Error> {
        serde_json::from_slice(&self.headers)
    }
}
