//! Broker transport seam.
//!
//! A [`Connector`] dials a broker and yields a [`BrokerConnection`], which in
//! turn opens [`BrokerChannel`]s. All queue operations go through a channel.
//!
//! Two transports implement these traits:
//! - [`amqp`]: RabbitMQ over AMQP 0-9-1, used by the executables
//! - [`memory`]: an in-process broker with the same contracts, used by tests
//!
//! Neither transport retries; that is left to the supervisor.

pub mod amqp;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::config::DialTarget;
use crate::error::{ChannelError, ConnectionError, ConsumeError, PublishError, QueueDeclareError};
use crate::queue::{Delivery, Message, Queue, QueueProperties};

pub use amqp::AmqpConnector;
pub use memory::MemoryBroker;

/// Ordered stream of deliveries. Ends when the channel closes or the broker
/// cancels the subscription.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, ConsumeError>>;

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &DialTarget)
        -> Result<Box<dyn BrokerConnection>, ConnectionError>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, ChannelError>;

    /// Close the connection. Closing twice is a no-op.
    async fn close(&self) -> Result<(), ConnectionError>;

    fn is_open(&self) -> bool;
}

/// A session on a connection.
///
/// Implementations do not serialize concurrent publishes; callers sharing a
/// channel between writers go through [`crate::Publisher`].
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare `name` with `properties`. Redeclaring with identical
    /// properties returns the same logical queue; different properties fail
    /// with [`QueueDeclareError::ParameterMismatch`].
    async fn declare_queue(
        &self,
        name: &str,
        properties: QueueProperties,
    ) -> Result<Queue, QueueDeclareError>;

    /// Send one message to `queue` through the default exchange.
    async fn publish(&self, queue: &Queue, message: &Message) -> Result<(), PublishError>;

    /// Start an auto-acknowledged subscription. At most one subscription may
    /// be active on a channel at a time.
    async fn subscribe(
        &self,
        queue: &Queue,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, ConsumeError>;

    /// Close the channel. Closing twice is a no-op.
    async fn close(&self) -> Result<(), ChannelError>;

    fn is_open(&self) -> bool;
}

/// Clears a channel's subscription flag when the delivery stream holding it
/// is dropped.
pub(crate) struct SubscriptionGuard(Arc<std::sync::atomic::AtomicBool>);

impl SubscriptionGuard {
    /// Claim the flag, or return `None` when a subscription is already active.
    pub(crate) fn acquire(flag: &Arc<std::sync::atomic::AtomicBool>) -> Option<Self> {
        use std::sync::atomic::Ordering;

        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(Arc::clone(flag)))
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.0.store(false, std::sync::atomic::Ordering::Release);
    }
}
