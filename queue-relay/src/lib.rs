//! Queue Relay - text messages from an HTTP form to a queue consumer.
//!
//! This library provides shared modules for the two binaries:
//! - `relay-producer`: web server that publishes submitted messages
//! - `relay-consumer`: long-running consumer that logs every delivery
//!
//! ## Architecture
//!
//! ```text
//! POST /post → Publisher → RabbitMQ queue → Consumer → log
//! ```
//!
//! The two processes share nothing but the broker.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod queue;
pub mod supervisor;
pub mod web;

// Re-export commonly used types
pub use broker::{AmqpConnector, MemoryBroker};
pub use config::{Config, DialTarget, Role};
pub use consumer::{DeliverySink, LogSink, ResubscribePolicy};
pub use queue::{Delivery, Message, PublishReport, Publisher, Quantity, Queue, QueueProperties};
pub use supervisor::{ConsumerService, HttpService, Services, Supervisor, SupervisorState};
