//! Queue, message and delivery types shared by the producer and consumer.

use chrono::{DateTime, Utc};

/// Queue name used by the producer when `RMQ_QUEUE_NAME` is not set.
pub const DEFAULT_QUEUE: &str = "hello";

/// Content type stamped on every published message.
pub const CONTENT_TYPE: &str = "text/plain";

/// AMQP delivery mode 1: the broker keeps the message in memory only.
pub const TRANSIENT_DELIVERY_MODE: u8 = 1;

/// Properties fixed at a queue's first declaration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueProperties {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
}

impl QueueProperties {
    /// Non-durable, non-exclusive, kept when unused. Both executables use this.
    pub const TRANSIENT: QueueProperties = QueueProperties {
        durable: false,
        auto_delete: false,
        exclusive: false,
    };
}

/// Handle to a declared queue. Identity is the name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Queue {
    name: String,
    properties: QueueProperties,
}

impl Queue {
    pub(crate) fn new(name: impl Into<String>, properties: QueueProperties) -> Self {
        Self {
            name: name.into(),
            properties,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn properties(&self) -> QueueProperties {
        self.properties
    }
}

/// A text message as submitted by the producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    body: String,
    submitted_at: DateTime<Utc>,
}

impl Message {
    /// Create a message stamped with the current time.
    pub fn new(body: impl Into<String>) -> Self {
        Self::with_timestamp(body, Utc::now())
    }

    pub fn with_timestamp(body: impl Into<String>, submitted_at: DateTime<Utc>) -> Self {
        Self {
            body: body.into(),
            submitted_at,
        }
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }
}

/// A message as observed by the consumer.
///
/// The broker has already forgotten the message by the time a `Delivery`
/// exists: consumption is auto-acknowledged, so a crash after this point
/// loses it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Message body, lossily decoded as UTF-8
    pub body: String,
    /// Producer timestamp, when the publisher set one
    pub submitted_at: Option<DateTime<Utc>>,
    /// When the consumer received the delivery
    pub received_at: DateTime<Utc>,
    /// Broker delivery tag, unique per channel
    pub delivery_tag: u64,
    /// Whether the broker flagged this as a redelivery
    pub redelivered: bool,
}

impl Delivery {
    pub fn from_bytes(
        data: &[u8],
        submitted_at: Option<DateTime<Utc>>,
        delivery_tag: u64,
        redelivered: bool,
    ) -> Self {
        Self {
            body: String::from_utf8_lossy(data).into_owned(),
            submitted_at,
            received_at: Utc::now(),
            delivery_tag,
            redelivered,
        }
    }
}
