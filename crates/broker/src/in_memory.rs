//! In-memory broker for tests/dev.
//!
//! - No IO
//! - Competing consumers per queue
//! - Single in-flight per message, delayed requeue on nack

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value as JsonValue;
use tracing::debug;

use crate::transport::{BrokerError, BrokerTransport, Delivery, MessageId, Subscription};

#[derive(Debug)]
struct StoredMessage {
    payload: JsonValue,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    next_seq: u64,
    messages: HashMap<MessageId, StoredMessage>,
    ready: VecDeque<MessageId>,
    delayed: Vec<(Instant, MessageId)>,
    in_flight: HashSet<MessageId>,
}

impl QueueState {
    /// Move every delayed message whose time has come to the ready list.
    fn promote_due(&mut self, now: Instant) {
        if self.delayed.is_empty() {
            return;
        }
        self.delayed.sort_by_key(|(due, _)| *due);
        let due_count = self.delayed.iter().take_while(|(due, _)| *due <= now).count();
        for (_, id) in self.delayed.drain(..due_count) {
            self.ready.push_back(id);
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|(due, _)| *due).min()
    }
}

/// Counts of messages per state for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueDepth {
    pub ready: usize,
    pub delayed: usize,
    pub in_flight: usize,
}

#[derive(Debug, Default)]
struct Shared {
    queues: Mutex<HashMap<String, QueueState>>,
    available: Condvar,
    closed: AtomicBool,
}

/// Process-local broker. Cheap to clone; clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop the broker; blocked and future receives return `BrokerError::Closed`.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.available.notify_all();
    }

    pub fn stats(&self, queue: &str) -> QueueDepth {
        let queues = self.shared.queues.lock().unwrap();
        queues
            .get(queue)
            .map(|state| QueueDepth {
                ready: state.ready.len(),
                delayed: state.delayed.len(),
                in_flight: state.in_flight.len(),
            })
            .unwrap_or_default()
    }

    fn take(&self, queue: &str, timeout: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + timeout;
        let mut queues = self.shared.queues.lock().unwrap();

        loop {
            if self.shared.closed.load(Ordering::SeqCst) {
                return Err(BrokerError::Closed);
            }

            let now = Instant::now();
            let wait = {
                let state = queues.entry(queue.to_string()).or_default();
                state.promote_due(now);

                while let Some(id) = state.ready.pop_front() {
                    // Skip ids whose message was acked while queued.
                    let Some(message) = state.messages.get_mut(&id) else {
                        continue;
                    };
                    message.delivery_count += 1;
                    let delivery = Delivery {
                        message_id: id.clone(),
                        queue: queue.to_string(),
                        payload: message.payload.clone(),
                        delivery_count: message.delivery_count,
                    };
                    state.in_flight.insert(id);
                    return Ok(Some(delivery));
                }

                if now >= deadline {
                    return Ok(None);
                }

                let until_deadline = deadline - now;
                match state.next_due() {
                    Some(due) => until_deadline.min(due.saturating_duration_since(now)),
                    None => until_deadline,
                }
            };

            let (guard, _) = self
                .shared
                .available
                .wait_timeout(queues, wait.max(Duration::from_millis(1)))
                .unwrap();
            queues = guard;
        }
    }
}

impl BrokerTransport for InMemoryBroker {
    fn publish(&self, queue: &str, payload: JsonValue) -> Result<MessageId, BrokerError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }

        let id = {
            let mut queues = self.shared.queues.lock().unwrap();
            let state = queues.entry(queue.to_string()).or_default();
            state.next_seq += 1;
            let id = MessageId::new(format!("{}-{}", queue, state.next_seq));
            state.messages.insert(
                id.clone(),
                StoredMessage {
                    payload,
                    delivery_count: 0,
                },
            );
            state.ready.push_back(id.clone());
            id
        };

        self.shared.available.notify_all();
        Ok(id)
    }

    fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>, BrokerError> {
        Ok(Box::new(InMemorySubscription {
            broker: self.clone(),
            queue: queue.to_string(),
        }))
    }

    fn ack(&self, queue: &str, message_id: &MessageId) -> Result<(), BrokerError> {
        let mut queues = self.shared.queues.lock().unwrap();
        let state = queues.get_mut(queue).ok_or_else(|| not_in_flight(queue, message_id))?;

        if !state.in_flight.remove(message_id) {
            return Err(not_in_flight(queue, message_id));
        }
        state.messages.remove(message_id);
        Ok(())
    }

    fn nack(
        &self,
        queue: &str,
        message_id: &MessageId,
        requeue_delay: Duration,
    ) -> Result<(), BrokerError> {
        {
            let mut queues = self.shared.queues.lock().unwrap();
            let state = queues.get_mut(queue).ok_or_else(|| not_in_flight(queue, message_id))?;

            if !state.in_flight.remove(message_id) {
                return Err(not_in_flight(queue, message_id));
            }

            if requeue_delay.is_zero() {
                state.ready.push_back(message_id.clone());
            } else {
                state.delayed.push((Instant::now() + requeue_delay, message_id.clone()));
            }
        }

        debug!(
            queue,
            message_id = %message_id,
            delay_ms = requeue_delay.as_millis() as u64,
            "message requeued"
        );
        self.shared.available.notify_all();
        Ok(())
    }
}

fn not_in_flight(queue: &str, message_id: &MessageId) -> BrokerError {
    BrokerError::NotInFlight {
        queue: queue.to_string(),
        message_id: message_id.clone(),
    }
}

#[derive(Debug)]
struct InMemorySubscription {
    broker: InMemoryBroker,
    queue: String,
}

impl Subscription for InMemorySubscription {
    fn queue(&self) -> &str {
        &self.queue
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Delivery>, BrokerError> {
        self.broker.take(&self.queue, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::thread;

    const TICK: Duration = Duration::from_millis(50);

    #[test]
    fn publish_and_receive() {
        let broker = InMemoryBroker::new();
        let id = broker.publish("emails", json!({"to": "a@example.com"})).unwrap();

        let mut sub = broker.subscribe("emails").unwrap();
        let delivery = sub.recv_timeout(TICK).unwrap().unwrap();

        assert_eq!(delivery.message_id, id);
        assert_eq!(delivery.delivery_count, 1);
        assert_eq!(delivery.payload["to"], "a@example.com");
        assert_eq!(broker.stats("emails").in_flight, 1);
    }

    #[test]
    fn in_flight_message_is_not_redelivered() {
        let broker = InMemoryBroker::new();
        broker.publish("q", json!(1)).unwrap();

        let mut first = broker.subscribe("q").unwrap();
        let mut second = broker.subscribe("q").unwrap();

        assert!(first.recv_timeout(TICK).unwrap().is_some());
        assert!(second.recv_timeout(TICK).unwrap().is_none());
    }

    #[test]
    fn ack_removes_message() {
        let broker = InMemoryBroker::new();
        broker.publish("q", json!(1)).unwrap();
        let mut sub = broker.subscribe("q").unwrap();
        let delivery = sub.recv_timeout(TICK).unwrap().unwrap();

        broker.ack("q", &delivery.message_id).unwrap();

        assert_eq!(broker.stats("q"), QueueDepth::default());
        assert!(matches!(
            broker.ack("q", &delivery.message_id),
            Err(BrokerError::NotInFlight { .. })
        ));
    }

    #[test]
    fn nack_redelivers_after_delay() {
        let broker = InMemoryBroker::new();
        broker.publish("q", json!(1)).unwrap();
        let mut sub = broker.subscribe("q").unwrap();
        let delivery = sub.recv_timeout(TICK).unwrap().unwrap();

        broker
            .nack("q", &delivery.message_id, Duration::from_millis(30))
            .unwrap();
        assert_eq!(broker.stats("q").delayed, 1);
        assert!(sub.recv_timeout(Duration::from_millis(5)).unwrap().is_none());

        let again = sub.recv_timeout(Duration::from_millis(500)).unwrap().unwrap();
        assert_eq!(again.message_id, delivery.message_id);
        assert_eq!(again.delivery_count, 2);
    }

    #[test]
    fn blocked_receiver_wakes_on_publish() {
        let broker = InMemoryBroker::new();
        let mut sub = broker.subscribe("q").unwrap();

        let publisher = broker.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            publisher.publish("q", json!("late")).unwrap();
        });

        let delivery = sub.recv_timeout(Duration::from_secs(2)).unwrap();
        handle.join().unwrap();
        assert_eq!(delivery.unwrap().payload, json!("late"));
    }

    #[test]
    fn close_fails_receivers() {
        let broker = InMemoryBroker::new();
        let mut sub = broker.subscribe("q").unwrap();
        broker.close();

        assert_eq!(sub.recv_timeout(TICK), Err(BrokerError::Closed));
        assert_eq!(broker.publish("q", json!(1)), Err(BrokerError::Closed));
    }
}
