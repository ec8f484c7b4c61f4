//! Consumer loop.
//!
//! Subscribes to the relay queue and hands every delivery to a
//! [`DeliverySink`] until the shared shutdown token fires.
//!
//! Deliveries are auto-acknowledged: the broker removes a message when it is
//! handed to this loop, not when the sink is done with it. A crash in between
//! loses the message (at-most-once). Acknowledging after the sink succeeds
//! would give at-least-once delivery instead; that policy is not implemented
//! here.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broker::{BrokerChannel, DeliveryStream};
use crate::error::ConsumeError;
use crate::queue::{Delivery, Queue};

/// Consumer tag announced to the broker.
pub const CONSUMER_TAG: &str = "queue-relay-consumer";

/// Receives deliveries from the consumer loop.
pub trait DeliverySink: Send + Sync {
    fn accept(&self, queue: &Queue, delivery: Delivery);
}

/// Default sink: one structured log event per delivery.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl DeliverySink for LogSink {
    fn accept(&self, queue: &Queue, delivery: Delivery) {
        info!(
            queue = %queue.name(),
            body = %delivery.body,
            delivery_tag = delivery.delivery_tag,
            redelivered = delivery.redelivered,
            submitted_at = ?delivery.submitted_at,
            received_at = %delivery.received_at,
            "message_received"
        );
    }
}

/// How hard the loop tries to get a subscription back after the delivery
/// stream ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResubscribePolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for ResubscribePolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(1000),
        }
    }
}

/// Open an auto-acknowledged delivery stream on `queue`.
pub async fn subscribe(
    channel: &dyn BrokerChannel,
    queue: &Queue,
) -> Result<DeliveryStream, ConsumeError> {
    channel.subscribe(queue, CONSUMER_TAG).await
}

/// Run the consumer loop until `shutdown` fires.
///
/// Returns the number of deliveries forwarded. Fails when the initial
/// subscription cannot be opened, or when the stream ends and every
/// resubscribe attempt fails.
pub async fn run(
    channel: Arc<dyn BrokerChannel>,
    queue: Queue,
    sink: Arc<dyn DeliverySink>,
    policy: ResubscribePolicy,
    shutdown: CancellationToken,
) -> Result<u64, ConsumeError> {
    let mut stream = subscribe(channel.as_ref(), &queue).await?;
    let mut received: u64 = 0;

    info!(queue = %queue.name(), pid = std::process::id(), "consumer_ready");

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!(queue = %queue.name(), received = received, "consumer_stopping");
                return Ok(received);
            }
            next = stream.next() => match next {
                Some(Ok(delivery)) => {
                    received += 1;
                    sink.accept(&queue, delivery);
                }
                Some(Err(e)) => {
                    error!(queue = %queue.name(), error = %e, "consumer_delivery_error");
                }
                None => {
                    warn!(queue = %queue.name(), received = received, "consumer_stream_ended");
                    // Release the channel's subscription before asking for a new one.
                    drop(stream);
                    match resubscribe(channel.as_ref(), &queue, policy, &shutdown).await? {
                        Some(fresh) => stream = fresh,
                        None => {
                            info!(queue = %queue.name(), received = received, "consumer_stopping");
                            return Ok(received);
                        }
                    }
                }
            }
        }
    }
}

/// Try to subscribe again. `Ok(None)` means shutdown fired while waiting.
async fn resubscribe(
    channel: &dyn BrokerChannel,
    queue: &Queue,
    policy: ResubscribePolicy,
    shutdown: &CancellationToken,
) -> Result<Option<DeliveryStream>, ConsumeError> {
    for attempt in 1..=policy.attempts {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(None),
            _ = tokio::time::sleep(policy.delay) => {}
        }

        match subscribe(channel, queue).await {
            Ok(stream) => {
                info!(queue = %queue.name(), attempt = attempt, "consumer_resubscribed");
                return Ok(Some(stream));
            }
            Err(e) => {
                warn!(
                    queue = %queue.name(),
                    attempt = attempt,
                    max_attempts = policy.attempts,
                    error = %e,
                    "consumer_resubscribe_failed"
                );
            }
        }
    }

    error!(queue = %queue.name(), attempts = policy.attempts, "consumer_stream_lost");
    Err(ConsumeError::StreamLost {
        attempts: policy.attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerConnection, Connector, MemoryBroker};
    use crate::config::DialTarget;
    use crate::queue::{Message, QueueProperties};
    use tokio::sync::mpsc;

    struct ChannelSink(mpsc::UnboundedSender<String>);

    impl DeliverySink for ChannelSink {
        fn accept(&self, _queue: &Queue, delivery: Delivery) {
            let _ = self.0.send(delivery.body);
        }
    }

    async fn setup(
        broker: &MemoryBroker,
    ) -> (Box<dyn BrokerConnection>, Arc<dyn BrokerChannel>, Queue) {
        let target = DialTarget::new("guest", "guest", "localhost", 5672).unwrap();
        let conn = broker.connect(&target).await.unwrap();
        let channel = conn.open_channel().await.unwrap();
        let queue = channel
            .declare_queue("hello", QueueProperties::TRANSIENT)
            .await
            .unwrap();
        (conn, channel, queue)
    }

    fn fast_policy(attempts: u32) -> ResubscribePolicy {
        ResubscribePolicy {
            attempts,
            delay: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_forwards_deliveries_in_order() {
        let broker = MemoryBroker::new();
        let (_conn, channel, queue) = setup(&broker).await;
        for body in ["a", "b", "c"] {
            channel.publish(&queue, &Message::new(body)).await.unwrap();
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run(
            Arc::clone(&channel),
            queue,
            Arc::new(ChannelSink(tx)),
            fast_policy(1),
            shutdown.clone(),
        ));

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(rx.recv().await.unwrap());
        }
        assert_eq!(seen, vec!["a", "b", "c"]);

        shutdown.cancel();
        assert_eq!(task.await.unwrap().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_idle_wait() {
        let broker = MemoryBroker::new();
        let (_conn, channel, queue) = setup(&broker).await;
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(run(
            channel,
            queue,
            Arc::new(LogSink),
            fast_policy(1),
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("consumer should stop promptly")
            .unwrap();
        assert_eq!(result.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_resubscribes_after_broker_cancel() {
        let broker = MemoryBroker::new();
        let (_conn, channel, queue) = setup(&broker).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(run(
            Arc::clone(&channel),
            queue.clone(),
            Arc::new(ChannelSink(tx)),
            fast_policy(3),
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.cancel_subscriptions().await;
        channel.publish(&queue, &Message::new("after")).await.unwrap();

        let body = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("delivery after resubscribe")
            .unwrap();
        assert_eq!(body, "after");

        shutdown.cancel();
        assert_eq!(task.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_gives_up_when_channel_is_gone() {
        let broker = MemoryBroker::new();
        let (conn, channel, queue) = setup(&broker).await;
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(run(
            channel,
            queue,
            Arc::new(LogSink),
            fast_policy(2),
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.close().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("consumer should give up")
            .unwrap();
        assert!(matches!(result, Err(ConsumeError::StreamLost { attempts: 2 })));
        assert!(!shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_subscribe_to_undeclared_queue_fails() {
        let broker = MemoryBroker::new();
        let (_conn, channel, _queue) = setup(&broker).await;
        let missing = Queue::new("missing", QueueProperties::TRANSIENT);

        let err = subscribe(channel.as_ref(), &missing).await.err().unwrap();
        assert!(matches!(err, ConsumeError::Subscribe { .. }));
    }
}
