//! Queue module for the relay.
//!
//! This module provides:
//! - Queue, message and delivery types
//! - The serialized bulk publisher used by the producer
//!
//! ## Architecture
//!
//! ```text
//! POST /post → Publisher → relay queue → Consumer → log sink
//! ```

pub mod publisher;
pub mod types;

pub use publisher::{PublishReport, Publisher, Quantity};
pub use types::{
    Delivery, Message, Queue, QueueProperties, CONTENT_TYPE, DEFAULT_QUEUE,
    TRANSIENT_DELIVERY_MODE,
};
