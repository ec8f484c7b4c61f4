//! RabbitMQ transport using lapin.
//!
//! Publishing channels run in confirm mode, so a publish only counts as sent
//! once the broker has acknowledged it. Subscriptions are opened with
//! `no_ack`: the broker drops each message as soon as it is delivered.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use lapin::{
    options::{BasicConsumeOptions, BasicPublishOptions, ConfirmSelectOptions, QueueDeclareOptions},
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::{debug, info, warn};

use super::{BrokerChannel, BrokerConnection, Connector, DeliveryStream, SubscriptionGuard};
use crate::config::DialTarget;
use crate::error::{ChannelError, ConnectionError, ConsumeError, PublishError, QueueDeclareError};
use crate::queue::{Delivery, Message, Queue, QueueProperties, CONTENT_TYPE, TRANSIENT_DELIVERY_MODE};

/// Reply code sent with a normal channel or connection close.
const REPLY_SUCCESS: u16 = 200;

/// Dials RabbitMQ with lapin.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    connection_name: String,
}

impl AmqpConnector {
    /// `connection_name` shows up in the RabbitMQ management UI.
    pub fn new(connection_name: impl Into<String>) -> Self {
        Self {
            connection_name: connection_name.into(),
        }
    }
}

impl Default for AmqpConnector {
    fn default() -> Self {
        Self::new("queue-relay")
    }
}

fn soft_error(err: &lapin::Error) -> Option<&AMQPSoftError> {
    match err {
        lapin::Error::ProtocolError(e) => match e.kind() {
            AMQPErrorKind::Soft(soft) => Some(soft),
            _ => None,
        },
        _ => None,
    }
}

/// ACCESS_REFUSED during the handshake means the credentials were refused.
fn connect_error(target: &DialTarget, err: lapin::Error) -> ConnectionError {
    match soft_error(&err) {
        Some(AMQPSoftError::ACCESSREFUSED) => ConnectionError::Rejected {
            target: target.to_string(),
        },
        _ => ConnectionError::Unreachable {
            target: target.to_string(),
            reason: err.to_string(),
        },
    }
}

fn declare_error(name: &str, requested: QueueProperties, err: lapin::Error) -> QueueDeclareError {
    match soft_error(&err) {
        // 406: the queue exists with other arguments. The broker closes the
        // channel after sending this.
        Some(AMQPSoftError::PRECONDITIONFAILED) => QueueDeclareError::ParameterMismatch {
            name: name.to_string(),
            existing: None,
            requested,
        },
        _ => QueueDeclareError::Broker {
            name: name.to_string(),
            reason: err.to_string(),
        },
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(
        &self,
        target: &DialTarget,
    ) -> Result<Box<dyn BrokerConnection>, ConnectionError> {
        info!(host = %target.host(), port = target.port(), "rabbitmq_connecting");

        let properties =
            ConnectionProperties::default().with_connection_name(self.connection_name.clone().into());

        let conn = Connection::connect(target.as_str(), properties)
            .await
            .map_err(|e| connect_error(target, e))?;

        info!("rabbitmq_connected");

        Ok(Box::new(AmqpConnection {
            inner: conn,
            closed: AtomicBool::new(false),
        }))
    }
}

struct AmqpConnection {
    inner: Connection,
    closed: AtomicBool,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::ConnectionClosed);
        }

        let channel = self
            .inner
            .create_channel()
            .await
            .map_err(|e| ChannelError::Refused(e.to_string()))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| ChannelError::Refused(e.to_string()))?;

        info!(channel_id = channel.id(), "rabbitmq_channel_created");

        Ok(Arc::new(AmqpChannel {
            inner: channel,
            closed: AtomicBool::new(false),
            subscribed: Arc::new(AtomicBool::new(false)),
        }))
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.inner.status().connected() {
            debug!("rabbitmq_connection_already_down");
            return Ok(());
        }

        self.inner
            .close(REPLY_SUCCESS, "Normal shutdown")
            .await
            .map_err(|e| ConnectionError::Close(e.to_string()))?;

        info!("rabbitmq_connection_closed");
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.inner.status().connected()
    }
}

struct AmqpChannel {
    inner: Channel,
    closed: AtomicBool,
    subscribed: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_queue(
        &self,
        name: &str,
        properties: QueueProperties,
    ) -> Result<Queue, QueueDeclareError> {
        if !self.is_open() {
            return Err(QueueDeclareError::ChannelClosed);
        }

        let options = QueueDeclareOptions {
            durable: properties.durable,
            auto_delete: properties.auto_delete,
            exclusive: properties.exclusive,
            ..Default::default()
        };

        let declared = self
            .inner
            .queue_declare(name, options, FieldTable::default())
            .await
            .map_err(|e| declare_error(name, properties, e))?;

        info!(
            queue = declared.name().as_str(),
            message_count = declared.message_count(),
            consumer_count = declared.consumer_count(),
            "rabbitmq_queue_declared"
        );

        Ok(Queue::new(declared.name().as_str(), properties))
    }

    async fn publish(&self, queue: &Queue, message: &Message) -> Result<(), PublishError> {
        if !self.is_open() {
            return Err(PublishError::ChannelClosed);
        }

        let timestamp = u64::try_from(message.submitted_at().timestamp()).unwrap_or_default();

        let confirmation = self
            .inner
            .basic_publish(
                "",
                queue.name(),
                BasicPublishOptions::default(),
                message.body().as_bytes(),
                BasicProperties::default()
                    .with_delivery_mode(TRANSIENT_DELIVERY_MODE)
                    .with_content_type(CONTENT_TYPE.into())
                    .with_timestamp(timestamp),
            )
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;

        if confirmation.is_nack() {
            return Err(PublishError::Nacked);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &Queue,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, ConsumeError> {
        if !self.is_open() {
            return Err(ConsumeError::ChannelClosed);
        }

        let guard = SubscriptionGuard::acquire(&self.subscribed)
            .ok_or(ConsumeError::AlreadySubscribed)?;

        let consumer = self
            .inner
            .basic_consume(
                queue.name(),
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| ConsumeError::Subscribe {
                queue: queue.name().to_string(),
                reason: e.to_string(),
            })?;

        info!(queue = %queue.name(), consumer_tag = %consumer_tag, "rabbitmq_consumer_started");

        Ok(consumer
            .map(move |item| {
                let _held = &guard;
                item.map(|delivery| {
                    let submitted_at = (*delivery.properties.timestamp())
                        .and_then(|secs| i64::try_from(secs).ok())
                        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));
                    Delivery::from_bytes(
                        &delivery.data,
                        submitted_at,
                        delivery.delivery_tag,
                        delivery.redelivered,
                    )
                })
                .map_err(|e| ConsumeError::Delivery(e.to_string()))
            })
            .boxed())
    }

    async fn close(&self) -> Result<(), ChannelError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.inner.status().connected() {
            warn!(channel_id = self.inner.id(), "rabbitmq_channel_already_down");
            return Ok(());
        }

        self.inner
            .close(REPLY_SUCCESS, "Normal shutdown")
            .await
            .map_err(|e| ChannelError::Close(e.to_string()))?;

        info!(channel_id = self.inner.id(), "rabbitmq_channel_closed");
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.inner.status().connected()
    }
}
