// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Queue and binding descriptions consumed by the topology declarer. A queue
//! can carry a retry queue and a Dead Letter Queue (DLQ): failed deliveries are
//! dead-lettered into `<name>-retry`, wait there for the retry TTL and flow back
//! to the main queue; once the retry budget is spent they end up in
//! `<name>-dlq`.

use lapin::types::{AMQPValue, LongInt, LongString, ShortString};
use std::collections::BTreeMap;

/// Header field naming the dead letter exchange of a queue
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Header field naming the dead letter routing key of a queue
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Header field for the per-queue message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Header field for the maximum number of messages in a queue
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Header field for the maximum size of a queue in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Definition of a RabbitMQ queue with its configuration parameters.
///
/// Built with chained calls, the same way exchanges are:
///
/// ```ignore
/// let orders = QueueDefinition::new("orders").durable().with_retry(5_000, 3).with_dlq();
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) no_wait: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) max_length_bytes: Option<i32>,
    pub(crate) dlq_name: Option<String>,
    pub(crate) retry_name: Option<String>,
    pub(crate) retry_ttl: Option<i32>,
    pub(crate) retries: Option<i32>,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
}

impl QueueDefinition {
    /// Creates a non-durable, non-exclusive queue definition.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..QueueDefinition::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Makes the queue survive broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Deletes the queue once its last consumer goes away.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Restricts the queue to the declaring connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Only checks that the queue exists instead of creating it.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Message TTL in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Adds an extra queue argument.
    pub fn param(mut self, key: &str, value: AMQPValue) -> Self {
        self.params.insert(ShortString::from(key), value);
        self
    }

    /// Adds a `<name>-dlq` Dead Letter Queue.
    pub fn with_dlq(mut self) -> Self {
        self.dlq_name = Some(format!("{}-dlq", self.name));
        self
    }

    /// Adds a `<name>-retry` queue holding failed messages for `ttl`
    /// milliseconds, at most `retries` times.
    pub fn with_retry(mut self, ttl: i32, retries: i32) -> Self {
        self.retry_name = Some(format!("{}-retry", self.name));
        self.retries = Some(retries);
        self.retry_ttl = Some(ttl);
        self
    }

    pub fn dlq_name(&self) -> Option<&str> {
        self.dlq_name.as_deref()
    }

    pub fn retry_name(&self) -> Option<&str> {
        self.retry_name.as_deref()
    }

    pub fn retries(&self) -> Option<i32> {
        self.retries
    }

    /// The queue holding failed messages until they are redelivered.
    ///
    /// It dead-letters back into this queue once the retry TTL expires.
    pub fn retry_queue(&self) -> Option<QueueDefinition> {
        let retry_name = self.retry_name.as_ref()?;

        let mut retry = self.sibling(retry_name);
        retry.params.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from("")),
        );
        retry.params.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(self.name.clone())),
        );
        if let Some(ttl) = self.retry_ttl {
            retry.params.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongInt(LongInt::from(ttl)),
            );
        }

        Some(retry)
    }

    pub fn dead_letter_queue(&self) -> Option<QueueDefinition> {
        self.dlq_name.as_ref().map(|dlq_name| self.sibling(dlq_name))
    }

    /// The arguments sent with `queue.declare`.
    ///
    /// Rejected messages are dead-lettered to the retry queue when there is one,
    /// otherwise straight to the DLQ.
    pub fn arguments(&self) -> BTreeMap<ShortString, AMQPValue> {
        let mut args = self.params.clone();

        let dead_letter_target = self.retry_name.as_ref().or(self.dlq_name.as_ref());
        if let Some(target) = dead_letter_target {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from("")),
            );
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(target.clone())),
            );
        }

        if let Some(ttl) = self.ttl {
            args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongInt(LongInt::from(ttl)),
            );
        }

        if let Some(max) = self.max_length {
            args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH),
                AMQPValue::LongInt(LongInt::from(max)),
            );
        }

        if let Some(max_bytes) = self.max_length_bytes {
            args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH_BYTES),
                AMQPValue::LongInt(LongInt::from(max_bytes)),
            );
        }

        args
    }

    fn sibling(&self, name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: self.durable,
            delete: self.delete,
            exclusive: self.exclusive,
            passive: self.passive,
            no_wait: self.no_wait,
            ..QueueDefinition::default()
        }
    }
}

/// Binds a queue to an exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a binding for `queue`; exchange and routing key start empty.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            ..QueueBinding::default()
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_string(args: &BTreeMap<ShortString, AMQPValue>, key: &str) -> Option<String> {
        match args.get(&ShortString::from(key)) {
            Some(AMQPValue::LongString(value)) => {
                Some(String::from_utf8_lossy(value.as_bytes()).into_owned())
            }
            _ => None,
        }
    }

    fn long_int(args: &BTreeMap<ShortString, AMQPValue>, key: &str) -> Option<i32> {
        match args.get(&ShortString::from(key)) {
            Some(AMQPValue::LongInt(value)) => Some(*value),
            _ => None,
        }
    }

    #[test]
    fn plain_queue_has_no_arguments() {
        assert!(QueueDefinition::new("orders").arguments().is_empty());
    }

    #[test]
    fn retry_queue_routes_back_to_main_queue() {
        let def = QueueDefinition::new("orders").durable().with_retry(5_000, 3);

        let retry = def.retry_queue().unwrap();
        assert_eq!(retry.name(), "orders-retry");
        assert!(retry.durable);
        assert_eq!(
            long_string(&retry.arguments(), AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY).as_deref(),
            Some("orders")
        );
        assert_eq!(long_int(&retry.arguments(), AMQP_HEADERS_MESSAGE_TTL), Some(5_000));

        assert_eq!(
            long_string(&def.arguments(), AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY).as_deref(),
            Some("orders-retry")
        );
    }

    #[test]
    fn dlq_without_retry_dead_letters_to_dlq() {
        let def = QueueDefinition::new("orders").with_dlq();

        assert_eq!(def.dead_letter_queue().unwrap().name(), "orders-dlq");
        assert!(def.retry_queue().is_none());
        assert_eq!(
            long_string(&def.arguments(), AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY).as_deref(),
            Some("orders-dlq")
        );
    }

    #[test]
    fn limits_are_rendered_as_arguments() {
        let args = QueueDefinition::new("q")
            .ttl(1_000)
            .max_length(10)
            .max_length_bytes(2_048)
            .arguments();

        assert_eq!(long_int(&args, AMQP_HEADERS_MESSAGE_TTL), Some(1_000));
        assert_eq!(long_int(&args, AMQP_HEADERS_MAX_LENGTH), Some(10));
        assert_eq!(long_int(&args, AMQP_HEADERS_MAX_LENGTH_BYTES), Some(2_048));
    }
}
