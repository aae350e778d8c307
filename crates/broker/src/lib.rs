//! Broker transport boundary for the task queue.
//!
//! The task queue is a *client* of a broker: it publishes task envelopes,
//! receives deliveries, and acks or nacks them. This crate defines that
//! contract and ships two transports:
//!
//! - `InMemoryBroker`: process-local, for tests/dev and single-node setups
//! - `RedisStreamsBroker` (feature `redis`): Redis Streams consumer groups

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_streams;
pub mod transport;

pub use in_memory::{InMemoryBroker, QueueDepth};
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsBroker;
pub use transport::{BrokerError, BrokerTransport, Delivery, MessageId, Subscription};
