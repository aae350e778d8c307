//! Redis Streams-backed broker (durable, at-least-once delivery).
//!
//! ## Layout
//!
//! - **Stream per queue**: `{prefix}:{queue}` holds ready messages
//! - **Consumer group**: one group shared by every worker, so each message
//!   goes to exactly one consumer
//! - **Delayed set**: `{prefix}:{queue}:delayed` is a sorted set scored by the
//!   unix-millis time a nacked message becomes visible again
//!
//! A nack removes the entry from the stream (XACK + XDEL) and either re-adds it
//! immediately or parks it in the delayed set. Receivers promote due entries
//! back into the stream before reading. The message id therefore changes on
//! every requeue; the delivery count travels with the entry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, instrument, warn};

use crate::transport::{BrokerError, BrokerTransport, Delivery, MessageId, Subscription};

/// Default key prefix for queue streams.
const DEFAULT_KEY_PREFIX: &str = "forgeflow:queue";

/// Default consumer group name.
const DEFAULT_GROUP: &str = "forgeflow.workers";

/// Max delayed entries promoted per receive.
const PROMOTE_BATCH: usize = 32;

#[derive(Debug, Clone)]
pub struct RedisStreamsBroker {
    client: Arc<redis::Client>,
    key_prefix: String,
    group: String,
}

/// Entry parked in the delayed set.
#[derive(Debug, Serialize, Deserialize)]
struct DelayedEntry {
    payload: String,
    delivery_count: u32,
}

impl RedisStreamsBroker {
    /// Create a broker.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `key_prefix` - Stream key prefix (default: "forgeflow:queue")
    /// * `group` - Consumer group name (default: "forgeflow.workers")
    pub fn new(
        redis_url: impl AsRef<str>,
        key_prefix: Option<String>,
        group: Option<String>,
    ) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            key_prefix: key_prefix.unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string()),
            group: group.unwrap_or_else(|| DEFAULT_GROUP.to_string()),
        })
    }

    fn stream_key(&self, queue: &str) -> String {
        format!("{}:{}", self.key_prefix, queue)
    }

    fn delayed_key(&self, queue: &str) -> String {
        format!("{}:{}:delayed", self.key_prefix, queue)
    }

    fn connection(&self) -> Result<redis::Connection, BrokerError> {
        self.client
            .get_connection()
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }

    /// Ensure the consumer group exists on the queue's stream (idempotent).
    pub fn ensure_consumer_group(&self, queue: &str) -> Result<(), BrokerError> {
        let mut conn = self.connection()?;

        // MKSTREAM creates the stream; "0" starts the group at the beginning.
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(self.stream_key(queue))
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query(&mut conn);

        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(BrokerError::Command(format!("XGROUP CREATE failed: {}", e))),
        }
    }

    fn add_entry(
        &self,
        conn: &mut redis::Connection,
        queue: &str,
        payload: &str,
        delivery_count: u32,
    ) -> Result<MessageId, BrokerError> {
        let id: String = redis::cmd("XADD")
            .arg(self.stream_key(queue))
            .arg("*")
            .arg("delivery_count")
            .arg(delivery_count.to_string())
            .arg("payload")
            .arg(payload)
            .query(conn)
            .map_err(|e| BrokerError::Command(format!("XADD failed: {}", e)))?;
        Ok(MessageId::new(id))
    }

    /// Acknowledge and delete a stream entry. Returns false if it was not pending.
    fn remove_pending(
        &self,
        conn: &mut redis::Connection,
        queue: &str,
        message_id: &MessageId,
    ) -> Result<bool, BrokerError> {
        let stream = self.stream_key(queue);
        let acked: u64 = redis::cmd("XACK")
            .arg(&stream)
            .arg(&self.group)
            .arg(message_id.as_str())
            .query(conn)
            .map_err(|e| BrokerError::Command(format!("XACK failed: {}", e)))?;

        if acked == 0 {
            return Ok(false);
        }

        let _: u64 = redis::cmd("XDEL")
            .arg(&stream)
            .arg(message_id.as_str())
            .query(conn)
            .map_err(|e| BrokerError::Command(format!("XDEL failed: {}", e)))?;
        Ok(true)
    }

    /// Read a single entry's fields by id.
    fn read_entry(
        &self,
        conn: &mut redis::Connection,
        queue: &str,
        message_id: &MessageId,
    ) -> Result<Option<StreamEntry>, BrokerError> {
        let reply: redis::Value = redis::cmd("XRANGE")
            .arg(self.stream_key(queue))
            .arg(message_id.as_str())
            .arg(message_id.as_str())
            .query(conn)
            .map_err(|e| BrokerError::Command(format!("XRANGE failed: {}", e)))?;

        match reply {
            redis::Value::Bulk(entries) => match entries.into_iter().next() {
                Some(entry) => parse_stream_entry(entry).map(Some),
                None => Ok(None),
            },
            redis::Value::Nil => Ok(None),
            _ => Err(BrokerError::Deserialization(
                "unexpected XRANGE reply".to_string(),
            )),
        }
    }

    /// Move delayed entries whose visibility time has passed back into the stream.
    fn promote_due(&self, conn: &mut redis::Connection, queue: &str) -> Result<(), BrokerError> {
        let delayed_key = self.delayed_key(queue);
        let now_ms = chrono::Utc::now().timestamp_millis();

        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&delayed_key)
            .arg("-inf")
            .arg(now_ms)
            .arg("LIMIT")
            .arg(0)
            .arg(PROMOTE_BATCH)
            .query(conn)
            .map_err(|e| BrokerError::Command(format!("ZRANGEBYSCORE failed: {}", e)))?;

        for member in due {
            // Another receiver may have promoted it first.
            let removed: u64 = redis::cmd("ZREM")
                .arg(&delayed_key)
                .arg(&member)
                .query(conn)
                .map_err(|e| BrokerError::Command(format!("ZREM failed: {}", e)))?;
            if removed == 0 {
                continue;
            }

            let entry: DelayedEntry = serde_json::from_str(&member)
                .map_err(|e| BrokerError::Deserialization(e.to_string()))?;
            self.add_entry(conn, queue, &entry.payload, entry.delivery_count)?;
        }

        Ok(())
    }

    fn read_next(
        &self,
        queue: &str,
        consumer: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, BrokerError> {
        let mut conn = self.connection()?;
        self.promote_due(&mut conn, queue)?;

        // BLOCK 0 would wait forever.
        let block_ms = timeout.as_millis().max(1) as u64;
        let reply: redis::Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(self.stream_key(queue))
            .arg(">")
            .query(&mut conn)
            .map_err(|e| BrokerError::Command(format!("XREADGROUP failed: {}", e)))?;

        // Reply shape: [[stream_key, [[id, [field, value, ...]], ...]]]
        let streams = match reply {
            redis::Value::Nil => return Ok(None),
            redis::Value::Bulk(streams) => streams,
            _ => {
                return Err(BrokerError::Deserialization(
                    "unexpected XREADGROUP reply".to_string(),
                ));
            }
        };

        let entry = streams.into_iter().find_map(|stream| match stream {
            redis::Value::Bulk(mut parts) if parts.len() == 2 => match parts.remove(1) {
                redis::Value::Bulk(entries) => entries.into_iter().next(),
                _ => None,
            },
            _ => None,
        });

        let Some(entry) = entry else {
            return Ok(None);
        };

        let entry = parse_stream_entry(entry)?;
        let payload: JsonValue = serde_json::from_str(&entry.payload)
            .map_err(|e| BrokerError::Deserialization(e.to_string()))?;

        Ok(Some(Delivery {
            message_id: entry.id,
            queue: queue.to_string(),
            payload,
            delivery_count: entry.delivery_count + 1,
        }))
    }
}

impl BrokerTransport for RedisStreamsBroker {
    #[instrument(skip(self, payload), fields(queue = %queue), err)]
    fn publish(&self, queue: &str, payload: JsonValue) -> Result<MessageId, BrokerError> {
        let payload = serde_json::to_string(&payload)
            .map_err(|e| BrokerError::Serialization(e.to_string()))?;
        let mut conn = self.connection()?;
        self.add_entry(&mut conn, queue, &payload, 0)
    }

    fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>, BrokerError> {
        self.ensure_consumer_group(queue)?;
        Ok(Box::new(RedisStreamsSubscription {
            broker: self.clone(),
            queue: queue.to_string(),
            consumer: format!("consumer-{}", uuid::Uuid::now_v7()),
        }))
    }

    fn ack(&self, queue: &str, message_id: &MessageId) -> Result<(), BrokerError> {
        let mut conn = self.connection()?;
        if !self.remove_pending(&mut conn, queue, message_id)? {
            return Err(BrokerError::NotInFlight {
                queue: queue.to_string(),
                message_id: message_id.clone(),
            });
        }
        Ok(())
    }

    fn nack(
        &self,
        queue: &str,
        message_id: &MessageId,
        requeue_delay: Duration,
    ) -> Result<(), BrokerError> {
        let mut conn = self.connection()?;

        let Some(entry) = self.read_entry(&mut conn, queue, message_id)? else {
            return Err(BrokerError::NotInFlight {
                queue: queue.to_string(),
                message_id: message_id.clone(),
            });
        };

        // Requeue before XACK so a failed write leaves the original pending.
        let delivery_count = entry.delivery_count + 1;
        if requeue_delay.is_zero() {
            self.add_entry(&mut conn, queue, &entry.payload, delivery_count)?;
        } else {
            let due_ms = chrono::Utc::now().timestamp_millis() + requeue_delay.as_millis() as i64;
            let member = serde_json::to_string(&DelayedEntry {
                payload: entry.payload,
                delivery_count,
            })
            .map_err(|e| BrokerError::Serialization(e.to_string()))?;

            let _: u64 = redis::cmd("ZADD")
                .arg(self.delayed_key(queue))
                .arg(due_ms)
                .arg(member)
                .query(&mut conn)
                .map_err(|e| {
                    warn!(queue, message_id = %message_id, "requeue failed, entry left pending");
                    BrokerError::Command(format!("ZADD failed: {}", e))
                })?;
        }

        if !self.remove_pending(&mut conn, queue, message_id)? {
            warn!(queue, message_id = %message_id, "requeued entry was no longer pending");
            return Err(BrokerError::NotInFlight {
                queue: queue.to_string(),
                message_id: message_id.clone(),
            });
        }

        debug!(
            queue,
            message_id = %message_id,
            delay_ms = requeue_delay.as_millis() as u64,
            "message requeued"
        );
        Ok(())
    }
}

/// Consumer within the shared group.
struct RedisStreamsSubscription {
    broker: RedisStreamsBroker,
    queue: String,
    consumer: String,
}

impl Subscription for RedisStreamsSubscription {
    fn queue(&self) -> &str {
        &self.queue
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Delivery>, BrokerError> {
        self.broker.read_next(&self.queue, &self.consumer, timeout)
    }
}

#[derive(Debug)]
struct StreamEntry {
    id: MessageId,
    payload: String,
    delivery_count: u32,
}

/// Parse `[id, [field, value, ...]]`.
fn parse_stream_entry(entry: redis::Value) -> Result<StreamEntry, BrokerError> {
    let parts = match entry {
        redis::Value::Bulk(parts) if parts.len() >= 2 => parts,
        _ => return Err(BrokerError::Deserialization("invalid entry format".to_string())),
    };

    let id = value_to_string(&parts[0])
        .ok_or_else(|| BrokerError::Deserialization("invalid message id".to_string()))?;

    let raw_fields = match &parts[1] {
        redis::Value::Bulk(fields) => fields,
        _ => return Err(BrokerError::Deserialization("invalid fields format".to_string())),
    };

    let fields: HashMap<String, String> = raw_fields
        .chunks(2)
        .filter_map(|pair| match pair {
            [key, value] => Some((value_to_string(key)?, value_to_string(value)?)),
            _ => None,
        })
        .collect();

    let payload = fields
        .get("payload")
        .cloned()
        .ok_or_else(|| BrokerError::Deserialization("missing payload field".to_string()))?;
    let delivery_count = fields
        .get("delivery_count")
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(0);

    Ok(StreamEntry {
        id: MessageId::new(id),
        payload,
        delivery_count,
    })
}

fn value_to_string(value: &redis::Value) -> Option<String> {
    match value {
        redis::Value::Data(data) => Some(String::from_utf8_lossy(data).into_owned()),
        redis::Value::Status(s) => Some(s.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(s: &str) -> redis::Value {
        redis::Value::Data(s.as_bytes().to_vec())
    }

    #[test]
    fn parses_entry_fields() {
        let entry = redis::Value::Bulk(vec![
            data("1700000000000-0"),
            redis::Value::Bulk(vec![
                data("delivery_count"),
                data("2"),
                data("payload"),
                data("{\"task_id\":\"t\"}"),
            ]),
        ]);

        let parsed = parse_stream_entry(entry).unwrap();
        assert_eq!(parsed.id.as_str(), "1700000000000-0");
        assert_eq!(parsed.delivery_count, 2);
        assert_eq!(parsed.payload, "{\"task_id\":\"t\"}");
    }

    #[test]
    fn rejects_entry_without_payload() {
        let entry = redis::Value::Bulk(vec![
            data("1-0"),
            redis::Value::Bulk(vec![data("delivery_count"), data("0")]),
        ]);
        assert!(matches!(
            parse_stream_entry(entry),
            Err(BrokerError::Deserialization(_))
        ));
    }

    #[test]
    fn keys_are_namespaced_per_queue() {
        let broker = RedisStreamsBroker::new("redis://127.0.0.1:6379", None, None).unwrap();
        assert_eq!(broker.stream_key("emails"), "forgeflow:queue:emails");
        assert_eq!(broker.delayed_key("emails"), "forgeflow:queue:emails:delayed");
    }
}
