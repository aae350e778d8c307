//! Broker transport contract (mechanics only).
//!
//! ## Delivery Guarantees
//!
//! Transports must provide:
//!
//! - **At-least-once delivery**: a message is redelivered until it is acked
//! - **Single in-flight per message**: once delivered, a message is not handed
//!   to another consumer until it is acked or nacked
//! - **No ordering guarantee** across messages of the same queue
//!
//! The task queue builds visibility timeouts, retry budgets and dead-lettering
//! on top of these guarantees; it does not re-implement them.
//!
//! ## Thread Safety
//!
//! `BrokerTransport` requires `Send + Sync`: one transport handle is shared by
//! every worker. A `Subscription` is owned by a single worker thread.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Transport-assigned message identifier (opaque to the queue).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for MessageId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub message_id: MessageId,
    pub queue: String,
    pub payload: JsonValue,
    /// How many times the transport has delivered this message (1 on first delivery).
    pub delivery_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command error: {0}")]
    Command(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("message {message_id} is not in flight on queue '{queue}'")]
    NotInFlight { queue: String, message_id: MessageId },

    #[error("broker is closed")]
    Closed,
}

/// A consumer's view of one queue.
pub trait Subscription: Send {
    /// Queue this subscription consumes.
    fn queue(&self) -> &str;

    /// Block for up to `timeout` waiting for the next delivery.
    ///
    /// Returns `Ok(None)` when nothing became available in time.
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Delivery>, BrokerError>;
}

/// Work-dispatch broker (point-to-point, competing consumers).
pub trait BrokerTransport: Send + Sync {
    /// Append a message to `queue`.
    fn publish(&self, queue: &str, payload: JsonValue) -> Result<MessageId, BrokerError>;

    /// Open a consumer on `queue`. Multiple subscriptions on one queue compete
    /// for messages; each message goes to one of them.
    fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>, BrokerError>;

    /// Mark a delivered message as processed; it will not be delivered again.
    fn ack(&self, queue: &str, message_id: &MessageId) -> Result<(), BrokerError>;

    /// Return a delivered message to the queue, visible again after `requeue_delay`.
    fn nack(
        &self,
        queue: &str,
        message_id: &MessageId,
        requeue_delay: Duration,
    ) -> Result<(), BrokerError>;
}

impl<B> BrokerTransport for Arc<B>
where
    B: BrokerTransport + ?Sized,
{
    fn publish(&self, queue: &str, payload: JsonValue) -> Result<MessageId, BrokerError> {
        (**self).publish(queue, payload)
    }

    fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>, BrokerError> {
        (**self).subscribe(queue)
    }

    fn ack(&self, queue: &str, message_id: &MessageId) -> Result<(), BrokerError> {
        (**self).ack(queue, message_id)
    }

    fn nack(
        &self,
        queue: &str,
        message_id: &MessageId,
        requeue_delay: Duration,
    ) -> Result<(), BrokerError> {
        (**self).nack(queue, message_id, requeue_delay)
    }
}
