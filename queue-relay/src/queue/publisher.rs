//! Bulk publisher for the relay queue.
//!
//! A single channel backs every publish in the producer process. The
//! publisher holds an async mutex for the whole of a burst, so concurrent
//! HTTP requests never write to the channel at the same time and each
//! request's copies land contiguously and in order.

use std::num::NonZeroU32;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::types::{Message, Queue};
use crate::broker::BrokerChannel;
use crate::error::{InvalidQuantity, PublishError};

/// Number of copies to publish. Always at least one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quantity(NonZeroU32);

impl Quantity {
    pub fn new(count: i64) -> Result<Self, InvalidQuantity> {
        if count < 1 {
            return Err(InvalidQuantity::NotPositive(count));
        }
        u32::try_from(count)
            .ok()
            .and_then(NonZeroU32::new)
            .map(Quantity)
            .ok_or(InvalidQuantity::TooLarge(count))
    }

    /// Parse caller input such as a form field. Surrounding whitespace is
    /// ignored; anything else that is not a positive integer is rejected.
    pub fn parse(input: &str) -> Result<Self, InvalidQuantity> {
        let count: i64 = input
            .trim()
            .parse()
            .map_err(|_| InvalidQuantity::NotANumber(input.to_string()))?;
        Self::new(count)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }
}

/// Outcome of a burst.
///
/// Only `succeeded == requested` means every copy was enqueued.
#[derive(Debug)]
pub struct PublishReport {
    pub requested: u32,
    pub succeeded: u32,
    /// The send that stopped the burst, if any
    pub failure: Option<PublishError>,
}

impl PublishReport {
    pub fn failed(&self) -> bool {
        self.failure.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.failure.is_none() && self.succeeded == self.requested
    }
}

/// Serialized publisher over a shared channel.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

struct PublisherInner {
    channel: Arc<dyn BrokerChannel>,
    queue: Queue,
    writer: Mutex<()>,
}

impl Publisher {
    pub fn new(channel: Arc<dyn BrokerChannel>, queue: Queue) -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                channel,
                queue,
                writer: Mutex::new(()),
            }),
        }
    }

    pub fn queue(&self) -> &Queue {
        &self.inner.queue
    }

    /// Publish `count` copies of `message`, one after another.
    ///
    /// Stops at the first failed send; the report says how many went out.
    pub async fn publish(&self, message: &Message, count: Quantity) -> PublishReport {
        let requested = count.get();
        let queue = &self.inner.queue;
        let mut report = PublishReport {
            requested,
            succeeded: 0,
            failure: None,
        };

        let _writer = self.inner.writer.lock().await;

        for copy in 0..requested {
            match self.inner.channel.publish(queue, message).await {
                Ok(()) => {
                    report.succeeded += 1;
                    debug!(queue = %queue.name(), copy = copy, "message_sent");
                }
                Err(e) => {
                    warn!(
                        queue = %queue.name(),
                        copy = copy,
                        succeeded = report.succeeded,
                        requested = requested,
                        error = %e,
                        "message_publish_failed"
                    );
                    report.failure = Some(e);
                    return report;
                }
            }
        }

        info!(
            queue = %queue.name(),
            count = requested,
            body_length = message.body().len(),
            "messages_published"
        );

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerConnection, Connector, MemoryBroker};
    use crate::config::DialTarget;
    use crate::queue::QueueProperties;

    async fn publisher(broker: &MemoryBroker) -> (Box<dyn BrokerConnection>, Publisher) {
        let target = DialTarget::new("guest", "guest", "localhost", 5672).unwrap();
        let conn = broker.connect(&target).await.unwrap();
        let channel = conn.open_channel().await.unwrap();
        let queue = channel
            .declare_queue("hello", QueueProperties::TRANSIENT)
            .await
            .unwrap();
        (conn, Publisher::new(channel, queue))
    }

    #[test]
    fn test_quantity_parse_accepts_positive_integers() {
        assert_eq!(Quantity::parse("3").unwrap().get(), 3);
        assert_eq!(Quantity::parse(" 12 ").unwrap().get(), 12);
    }

    #[test]
    fn test_quantity_parse_rejects_bad_input() {
        assert_eq!(Quantity::parse("0"), Err(InvalidQuantity::NotPositive(0)));
        assert_eq!(Quantity::parse("-4"), Err(InvalidQuantity::NotPositive(-4)));
        assert_eq!(
            Quantity::parse("three"),
            Err(InvalidQuantity::NotANumber("three".to_string()))
        );
        assert!(matches!(Quantity::parse("2.5"), Err(InvalidQuantity::NotANumber(_))));
        assert!(matches!(Quantity::parse(""), Err(InvalidQuantity::NotANumber(_))));
        assert_eq!(
            Quantity::parse("5000000000"),
            Err(InvalidQuantity::TooLarge(5_000_000_000))
        );
    }

    #[tokio::test]
    async fn test_publish_enqueues_every_copy() {
        let broker = MemoryBroker::new();
        let (_conn, publisher) = publisher(&broker).await;

        let report = publisher
            .publish(&Message::new("hello"), Quantity::new(3).unwrap())
            .await;

        assert!(report.is_complete());
        assert_eq!(report.succeeded, 3);
        assert_eq!(broker.queue_depth("hello").await, Some(3));
    }

    #[tokio::test]
    async fn test_publish_stops_at_first_failure() {
        let broker = MemoryBroker::new();
        let (_conn, publisher) = publisher(&broker).await;
        broker.fail_publishes_after(2);

        let report = publisher
            .publish(&Message::new("hello"), Quantity::new(5).unwrap())
            .await;

        assert!(report.failed());
        assert!(!report.is_complete());
        assert_eq!(report.requested, 5);
        assert_eq!(report.succeeded, 2);
        assert!(matches!(report.failure, Some(PublishError::Transport(_))));
        assert_eq!(broker.queue_depth("hello").await, Some(2));
    }

    #[tokio::test]
    async fn test_publish_on_closed_channel_sends_nothing() {
        let broker = MemoryBroker::new();
        let (conn, publisher) = publisher(&broker).await;
        conn.close().await.unwrap();

        let report = publisher
            .publish(&Message::new("hello"), Quantity::new(2).unwrap())
            .await;

        assert_eq!(report.succeeded, 0);
        assert!(matches!(report.failure, Some(PublishError::ChannelClosed)));
    }
}
