//! Error taxonomy for the relay.
//!
//! Startup errors (`ConfigError`, `ConnectionError`, `ChannelError`,
//! `QueueDeclareError`) are fatal and travel up to the binary's `main`.
//! `InvalidQuantity` and `PublishError` are answered on the HTTP request that
//! caused them. `ConsumeError` ends the consumer loop once resubscribing has
//! been given up on.

use thiserror::Error;

use crate::queue::QueueProperties;

/// A required configuration value is missing or malformed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required configuration key {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// The broker could not be reached or refused the session.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("broker at {target} is unreachable: {reason}")]
    Unreachable { target: String, reason: String },

    #[error("broker at {target} rejected the credentials")]
    Rejected { target: String },

    #[error("failed to close broker connection: {0}")]
    Close(String),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("connection is already closed")]
    ConnectionClosed,

    #[error("broker refused to open a channel: {0}")]
    Refused(String),

    #[error("failed to close channel: {0}")]
    Close(String),
}

#[derive(Debug, Error)]
pub enum QueueDeclareError {
    /// The queue exists with properties other than the requested ones.
    /// `existing` is `None` when the broker does not report them.
    #[error("queue {name} already exists with different properties (requested {requested:?})")]
    ParameterMismatch {
        name: String,
        existing: Option<QueueProperties>,
        requested: QueueProperties,
    },

    #[error("channel is closed")]
    ChannelClosed,

    #[error("declaring queue {name} failed: {reason}")]
    Broker { name: String, reason: String },
}

/// Caller supplied a message quantity that is not a positive integer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvalidQuantity {
    #[error("quantity {0:?} is not a whole number")]
    NotANumber(String),

    #[error("quantity must be at least 1, got {0}")]
    NotPositive(i64),

    #[error("quantity {0} is too large")]
    TooLarge(i64),
}

/// A single send failed. Sends after it in the same burst are not attempted.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("channel is closed")]
    ChannelClosed,

    #[error("broker did not confirm the message")]
    Nacked,

    #[error("publish failed: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error("channel is closed")]
    ChannelClosed,

    #[error("channel already has an active subscription")]
    AlreadySubscribed,

    #[error("failed to subscribe to {queue}: {reason}")]
    Subscribe { queue: String, reason: String },

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("delivery stream ended and {attempts} resubscribe attempts failed")]
    StreamLost { attempts: u32 },
}

/// Anything that stops the supervisor before it reaches `Running`.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    QueueDeclare(#[from] QueueDeclareError),
}

/// Failure observed while the supervisor was running its tasks.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("consumer stopped: {0}")]
    Consume(#[from] ConsumeError),

    #[error("http server failed: {0}")]
    Server(#[from] std::io::Error),

    #[error("task {task} panicked or was aborted: {reason}")]
    Task { task: &'static str, reason: String },
}
