//! In-process broker.
//!
//! Implements the transport traits without a network so the relay can be
//! exercised end to end in tests. It enforces the same contracts the AMQP
//! transport relies on the broker for: declaration mismatches are rejected,
//! consumption is FIFO per queue and auto-acknowledged, and closing a
//! connection ends every subscription on its channels.
//!
//! Fault injection hooks (`set_reachable`, `fail_publishes_after`,
//! `cancel_subscriptions`) let tests drive the error paths.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{BrokerChannel, BrokerConnection, Connector, DeliveryStream, SubscriptionGuard};
use crate::config::DialTarget;
use crate::error::{ChannelError, ConnectionError, ConsumeError, PublishError, QueueDeclareError};
use crate::queue::{Delivery, Message, Queue, QueueProperties};

/// Cloneable handle to a shared in-process broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerState>,
}

struct BrokerState {
    queues: Mutex<HashMap<String, Arc<QueueState>>>,
    credentials: Option<(String, String)>,
    reachable: AtomicBool,
    publish_budget: AtomicUsize,
    subscriptions: Mutex<CancellationToken>,
}

struct QueueState {
    properties: QueueProperties,
    messages: Mutex<VecDeque<Message>>,
    arrived: Notify,
}

impl QueueState {
    async fn push(&self, message: Message) {
        self.messages.lock().await.push_back(message);
        self.arrived.notify_one();
    }

    /// Wait for and remove the oldest message.
    async fn pop(&self) -> Message {
        loop {
            if let Some(message) = self.messages.lock().await.pop_front() {
                return message;
            }
            self.arrived.notified().await;
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// A broker that accepts any credentials.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A broker that only accepts `user`/`password`.
    pub fn with_credentials(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self::build(Some((user.into(), password.into())))
    }

    fn build(credentials: Option<(String, String)>) -> Self {
        Self {
            inner: Arc::new(BrokerState {
                queues: Mutex::new(HashMap::new()),
                credentials,
                reachable: AtomicBool::new(true),
                publish_budget: AtomicUsize::new(usize::MAX),
                subscriptions: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// Make new connection attempts fail as if the host were down.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Let `n` more publishes succeed, then fail every publish after that.
    pub fn fail_publishes_after(&self, n: usize) {
        self.inner.publish_budget.store(n, Ordering::SeqCst);
    }

    /// End every active subscription as a broker-side consumer cancel would.
    pub async fn cancel_subscriptions(&self) {
        let mut token = self.inner.subscriptions.lock().await;
        token.cancel();
        *token = CancellationToken::new();
    }

    /// Number of messages waiting in `queue`, or `None` if it was never declared.
    pub async fn queue_depth(&self, queue: &str) -> Option<usize> {
        let state = self.inner.queues.lock().await.get(queue).cloned()?;
        let depth = state.messages.lock().await.len();
        Some(depth)
    }

    fn take_publish_permit(&self) -> bool {
        self.inner
            .publish_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                usize::MAX => Some(usize::MAX),
                0 => None,
                n => Some(n - 1),
            })
            .is_ok()
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(
        &self,
        target: &DialTarget,
    ) -> Result<Box<dyn BrokerConnection>, ConnectionError> {
        if !self.inner.reachable.load(Ordering::SeqCst) {
            return Err(ConnectionError::Unreachable {
                target: target.to_string(),
                reason: "connection refused".to_string(),
            });
        }

        if let Some((user, password)) = &self.inner.credentials {
            if target.user() != user || target.password() != password {
                return Err(ConnectionError::Rejected {
                    target: target.to_string(),
                });
            }
        }

        debug!(broker = %target, "memory_broker_connected");

        Ok(Box::new(MemoryConnection {
            broker: self.clone(),
            closed: CancellationToken::new(),
        }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    closed: CancellationToken,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, ChannelError> {
        if self.closed.is_cancelled() {
            return Err(ChannelError::ConnectionClosed);
        }

        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            closed: self.closed.child_token(),
            subscribed: Arc::new(AtomicBool::new(false)),
            next_tag: Arc::new(AtomicU64::new(1)),
        }))
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        self.closed.cancel();
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.closed.is_cancelled()
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    closed: CancellationToken,
    subscribed: Arc<AtomicBool>,
    next_tag: Arc<AtomicU64>,
}

impl MemoryChannel {
    async fn queue_state(&self, name: &str) -> Option<Arc<QueueState>> {
        self.broker.inner.queues.lock().await.get(name).cloned()
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(
        &self,
        name: &str,
        properties: QueueProperties,
    ) -> Result<Queue, QueueDeclareError> {
        if self.closed.is_cancelled() {
            return Err(QueueDeclareError::ChannelClosed);
        }

        let mut queues = self.broker.inner.queues.lock().await;
        let state = queues.entry(name.to_string()).or_insert_with(|| {
            Arc::new(QueueState {
                properties,
                messages: Mutex::new(VecDeque::new()),
                arrived: Notify::new(),
            })
        });

        if state.properties != properties {
            return Err(QueueDeclareError::ParameterMismatch {
                name: name.to_string(),
                existing: Some(state.properties),
                requested: properties,
            });
        }

        Ok(Queue::new(name, properties))
    }

    async fn publish(&self, queue: &Queue, message: &Message) -> Result<(), PublishError> {
        if self.closed.is_cancelled() {
            return Err(PublishError::ChannelClosed);
        }
        if !self.broker.take_publish_permit() {
            return Err(PublishError::Transport("injected publish failure".to_string()));
        }

        // The default exchange silently drops messages for unknown queues.
        if let Some(state) = self.queue_state(queue.name()).await {
            state.push(message.clone()).await;
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &Queue,
        _consumer_tag: &str,
    ) -> Result<DeliveryStream, ConsumeError> {
        if self.closed.is_cancelled() {
            return Err(ConsumeError::ChannelClosed);
        }

        let state = self
            .queue_state(queue.name())
            .await
            .ok_or_else(|| ConsumeError::Subscribe {
                queue: queue.name().to_string(),
                reason: "no such queue".to_string(),
            })?;

        let guard = SubscriptionGuard::acquire(&self.subscribed)
            .ok_or(ConsumeError::AlreadySubscribed)?;

        let cancelled = self.broker.inner.subscriptions.lock().await.clone();
        let closed = self.closed.clone();
        let next_tag = Arc::clone(&self.next_tag);

        let stream = futures::stream::unfold((), move |()| {
            let state = Arc::clone(&state);
            let cancelled = cancelled.clone();
            let closed = closed.clone();
            let next_tag = Arc::clone(&next_tag);
            async move {
                tokio::select! {
                    biased;
                    _ = closed.cancelled() => None,
                    _ = cancelled.cancelled() => None,
                    message = state.pop() => {
                        let delivery = Delivery::from_bytes(
                            message.body().as_bytes(),
                            Some(message.submitted_at()),
                            next_tag.fetch_add(1, Ordering::SeqCst),
                            false,
                        );
                        Some((Ok(delivery), ()))
                    }
                }
            }
        });

        Ok(stream
            .map(move |item| {
                let _held = &guard;
                item
            })
            .boxed())
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.closed.cancel();
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.closed.is_cancelled()
    }
}
