//! # Queue Definitions
//!
//! Types for defining the queues the retry topology creates: the builder for
//! queue declarations, the classic/quorum type split, and queue-to-exchange
//! bindings. The declare-argument mapping lives here so every queue the crate
//! creates carries the same argument vocabulary.

use lapin::types::{AMQPValue, LongInt, LongString, ShortString};
use std::collections::BTreeMap;

/// Queue argument naming the exchange rejected or expired messages are routed to.
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Queue argument for the per-message TTL in milliseconds.
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Queue argument selecting the queue implementation (classic or quorum).
pub const AMQP_HEADERS_QUEUE_TYPE: &str = "x-queue-type";
/// Binding argument selecting the headers-exchange match mode.
pub const AMQP_HEADERS_MATCH: &str = "x-match";

/// The broker-side queue implementations the crate drives.
///
/// Quorum queues are Raft-replicated: always durable, never auto-delete. The
/// definition builder enforces that invariant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueueType {
    #[default]
    Classic,
    Quorum,
}

impl QueueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueType::Classic => "classic",
            QueueType::Quorum => "quorum",
        }
    }

    /// Parses a management-API type string; anything unrecognised (streams
    /// included) is treated as classic.
    pub fn parse(value: &str) -> QueueType {
        match value {
            "quorum" => QueueType::Quorum,
            _ => QueueType::Classic,
        }
    }
}

/// Definition of a queue with its declaration parameters.
///
/// This struct implements the builder pattern. The queue type is always
/// materialised as an `x-queue-type` argument so repeated declarations stay
/// passively compatible.
#[derive(Debug, Clone, Default)]
pub struct QueueDefinition {
    name: String,
    queue_type: QueueType,
    durable: bool,
    auto_delete: bool,
    exclusive: bool,
    ttl_ms: Option<i32>,
    dead_letter_exchange: Option<String>,
    extra_args: BTreeMap<ShortString, AMQPValue>,
}

impl QueueDefinition {
    /// Creates a new definition: a non-durable classic queue by default.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..QueueDefinition::default()
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used. Ignored for quorum
    /// queues, which never auto-delete.
    pub fn auto_delete(mut self) -> Self {
        if self.queue_type != QueueType::Quorum {
            self.auto_delete = true;
        }
        self
    }

    /// Makes the queue exclusive to the declaring connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the queue type. Quorum forces durability and clears auto-delete,
    /// whatever was requested before.
    pub fn queue_type(mut self, queue_type: QueueType) -> Self {
        self.queue_type = queue_type;
        if queue_type == QueueType::Quorum {
            self.durable = true;
            self.auto_delete = false;
        }
        self
    }

    /// Sets the message TTL in milliseconds.
    pub fn ttl(mut self, ttl_ms: i32) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }

    /// Routes rejected and expired messages to the given exchange.
    pub fn dead_letter_exchange(mut self, exchange: &str) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self
    }

    /// Adds a free-form declaration argument.
    pub fn arg(mut self, key: &str, value: AMQPValue) -> Self {
        self.extra_args.insert(ShortString::from(key), value);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_queue_type(&self) -> QueueType {
        self.queue_type
    }

    pub(crate) fn is_durable(&self) -> bool {
        self.durable
    }

    pub(crate) fn is_auto_delete(&self) -> bool {
        self.auto_delete
    }

    pub(crate) fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// The declaration argument table: `x-queue-type` always, `x-message-ttl`
    /// and `x-dead-letter-exchange` only when configured, then any free-form
    /// arguments.
    pub(crate) fn declare_arguments(&self) -> BTreeMap<ShortString, AMQPValue> {
        let mut args = BTreeMap::new();

        args.insert(
            ShortString::from(AMQP_HEADERS_QUEUE_TYPE),
            AMQPValue::LongString(LongString::from(self.queue_type.as_str())),
        );

        if let Some(ttl) = self.ttl_ms {
            args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongInt(LongInt::from(ttl)),
            );
        }

        if let Some(exchange) = &self.dead_letter_exchange {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from(exchange.clone())),
            );
        }

        for (key, value) in &self.extra_args {
            args.insert(key.clone(), value.clone());
        }

        args
    }
}

/// Configuration for binding a queue to an exchange.
pub struct QueueBinding<'qeb> {
    pub(crate) queue_name: &'qeb str,
    pub(crate) exchange_name: &'qeb str,
    pub(crate) routing_key: &'qeb str,
    pub(crate) arguments: BTreeMap<ShortString, AMQPValue>,
}

impl<'qeb> QueueBinding<'qeb> {
    /// Creates a new binding for the given queue, with an empty exchange name
    /// and routing key to be filled by the builder methods.
    pub fn new(queue: &'qeb str) -> QueueBinding<'qeb> {
        QueueBinding {
            queue_name: queue,
            exchange_name: "",
            routing_key: "",
            arguments: BTreeMap::new(),
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &'qeb str) -> Self {
        self.exchange_name = exchange;
        self
    }

    /// Sets the routing key for the binding.
    pub fn routing_key(mut self, key: &'qeb str) -> Self {
        self.routing_key = key;
        self
    }

    /// Adds a binding argument (headers exchanges route on these).
    pub fn arg(mut self, key: &str, value: AMQPValue) -> Self {
        self.arguments.insert(ShortString::from(key), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_is_always_durable_and_never_auto_delete() {
        let def = QueueDefinition::new("orders")
            .auto_delete()
            .queue_type(QueueType::Quorum);
        assert!(def.is_durable());
        assert!(!def.is_auto_delete());

        // same outcome with the calls in the opposite order
        let def = QueueDefinition::new("orders")
            .queue_type(QueueType::Quorum)
            .auto_delete();
        assert!(def.is_durable());
        assert!(!def.is_auto_delete());
    }

    #[test]
    fn declare_arguments_always_carry_the_queue_type() {
        let args = QueueDefinition::new("orders").declare_arguments();
        assert_eq!(
            args.get(AMQP_HEADERS_QUEUE_TYPE),
            Some(&AMQPValue::LongString(LongString::from("classic")))
        );

        let args = QueueDefinition::new("orders")
            .queue_type(QueueType::Quorum)
            .declare_arguments();
        assert_eq!(
            args.get(AMQP_HEADERS_QUEUE_TYPE),
            Some(&AMQPValue::LongString(LongString::from("quorum")))
        );
    }

    #[test]
    fn ttl_and_dead_letter_exchange_are_only_present_when_set() {
        let args = QueueDefinition::new("orders").declare_arguments();
        assert!(args.get(AMQP_HEADERS_MESSAGE_TTL).is_none());
        assert!(args.get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE).is_none());

        let args = QueueDefinition::new("orders.wait")
            .ttl(5000)
            .dead_letter_exchange("orders.retry")
            .declare_arguments();
        assert_eq!(
            args.get(AMQP_HEADERS_MESSAGE_TTL),
            Some(&AMQPValue::LongInt(5000))
        );
        assert_eq!(
            args.get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            Some(&AMQPValue::LongString(LongString::from("orders.retry")))
        );
    }

    #[test]
    fn queue_type_parsing_defaults_to_classic() {
        assert_eq!(QueueType::parse("quorum"), QueueType::Quorum);
        assert_eq!(QueueType::parse("classic"), QueueType::Classic);
        assert_eq!(QueueType::parse("stream"), QueueType::Classic);
        assert_eq!(QueueType::parse(""), QueueType::Classic);
    }

    #[test]
    fn binding_collects_header_match_arguments() {
        let binding = QueueBinding::new("orders.dlq")
            .exchange("orders.retry")
            .arg(AMQP_HEADERS_MATCH, AMQPValue::LongString(LongString::from("any")));

        assert_eq!(binding.queue_name, "orders.dlq");
        assert_eq!(binding.exchange_name, "orders.retry");
        assert_eq!(binding.routing_key, "");
        assert_eq!(
            binding.arguments.get(AMQP_HEADERS_MATCH),
            Some(&AMQPValue::LongString(LongString::from("any")))
        );
    }
}
