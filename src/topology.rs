//! # Retry Topology
//!
//! This module defines and installs the five-entity retry pipeline around a
//! main queue `Q`:
//!
//! 1. `Q.wait.exchange`: fanout exchange receiving rejected messages.
//! 2. `Q.wait`: classic queue where a message ages for the retry delay.
//! 3. `Q.retry`: headers exchange fed by expired wait-queue messages.
//! 4. `Q.dlq`: final destination, bound to `Q.retry` with `x-match: any`.
//! 5. `Q` itself, dead-lettering into `Q.wait.exchange`.
//!
//! The topology is deliberately dumb: the retry exchange always routes into
//! the DLQ, and a consumer that wants another attempt republishes to `Q` after
//! checking [`death_count`]. That keeps the pipeline portable across broker
//! versions with no plugins.
//!
//! The main queue is declared separately from the ancillary entities: during a
//! reshape it must be recreated only after its old instance is gone and its
//! dead-letter target provably exists.

use crate::{
    channel::Session,
    config::RetryConfig,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    management::ManagementClient,
    queue::{QueueBinding, QueueDefinition, QueueType, AMQP_HEADERS_MATCH},
};
use async_trait::async_trait;
use lapin::{
    types::{AMQPValue, LongString},
    BasicProperties,
};
use tracing::debug;

/// Header appended by the broker each time a message is dead-lettered.
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Count field inside an `x-death` entry.
pub const AMQP_HEADERS_COUNT: &str = "count";

/// Names of the ancillary entities, derived from the main queue name.
///
/// These strings are wire-observable contract: operators and other tools
/// find the retry pipeline by these exact names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyNames {
    pub wait_queue: String,
    pub wait_exchange: String,
    pub retry_exchange: String,
    pub dlq: String,
}

impl TopologyNames {
    /// Derives the four ancillary names for a main queue.
    pub fn for_queue(queue: &str) -> TopologyNames {
        TopologyNames {
            wait_queue: format!("{}.wait", queue),
            wait_exchange: format!("{}.wait.exchange", queue),
            retry_exchange: format!("{}.retry", queue),
            dlq: format!("{}.dlq", queue),
        }
    }
}

/// Interface for installing a topology onto an open session.
#[async_trait]
pub trait Topology {
    /// Declares every entity and binding, in a fixed replayable order.
    async fn install(&self, session: &Session) -> Result<(), AmqpError>;
}

/// The retry pipeline for one main queue.
///
/// Installing it creates the ancillary entities only; the main queue is
/// declared by [`declare_main_with_dlx`].
pub struct RetryTopology {
    queue: String,
    names: TopologyNames,
    config: RetryConfig,
}

impl RetryTopology {
    pub fn new(queue: &str, config: RetryConfig) -> RetryTopology {
        RetryTopology {
            queue: queue.to_owned(),
            names: TopologyNames::for_queue(queue),
            config,
        }
    }

    pub fn names(&self) -> &TopologyNames {
        &self.names
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Fanout exchange that spreads rejected messages into the wait queue.
    pub fn wait_exchange_definition(&self) -> ExchangeDefinition<'_> {
        ExchangeDefinition::new(&self.names.wait_exchange)
            .fanout()
            .durable()
    }

    /// Classic queue where a rejected message ages for the retry delay, then
    /// dead-letters into the retry exchange.
    pub fn wait_queue_definition(&self) -> QueueDefinition {
        QueueDefinition::new(&self.names.wait_queue)
            .durable()
            .ttl(self.config.wait_ttl_ms())
            .dead_letter_exchange(&self.names.retry_exchange)
    }

    /// Headers exchange between the wait queue and the DLQ.
    pub fn retry_exchange_definition(&self) -> ExchangeDefinition<'_> {
        ExchangeDefinition::new(&self.names.retry_exchange)
            .headers()
            .durable()
    }

    /// Classic queue terminating exhausted messages. A zero TTL keeps dead
    /// letters forever, expressed by leaving the argument out entirely.
    pub fn dlq_definition(&self) -> QueueDefinition {
        let def = QueueDefinition::new(&self.names.dlq).durable();
        if self.config.dlq_ttl_ms > 0 {
            def.ttl(self.config.dlq_ttl_ms as i32)
        } else {
            def
        }
    }

    fn wait_binding(&self) -> QueueBinding<'_> {
        QueueBinding::new(&self.names.wait_queue).exchange(&self.names.wait_exchange)
    }

    fn dlq_binding(&self) -> QueueBinding<'_> {
        QueueBinding::new(&self.names.dlq)
            .exchange(&self.names.retry_exchange)
            .arg(AMQP_HEADERS_MATCH, AMQPValue::LongString(LongString::from("any")))
    }
}

#[async_trait]
impl Topology for RetryTopology {
    /// Installs the ancillary entities in the fixed order: wait exchange,
    /// wait queue, wait binding, retry exchange, DLQ, DLQ binding.
    async fn install(&self, session: &Session) -> Result<(), AmqpError> {
        debug!(queue = self.queue.as_str(), "installing retry topology");

        session.declare_exchange(&self.wait_exchange_definition()).await?;
        session.declare_queue(&self.wait_queue_definition()).await?;
        session.bind_queue(&self.wait_binding()).await?;
        session.declare_exchange(&self.retry_exchange_definition()).await?;
        session.declare_queue(&self.dlq_definition()).await?;
        session.bind_queue(&self.dlq_binding()).await?;

        debug!(queue = self.queue.as_str(), "retry topology installed");
        Ok(())
    }
}

/// Declares the main queue with its dead-letter exchange pointed at the wait
/// exchange. Call only once the wait exchange exists: the broker accepts a
/// dangling DLX name silently and rejected messages would vanish.
pub async fn declare_main_with_dlx(
    session: &Session,
    queue: &str,
    queue_type: QueueType,
) -> Result<(), AmqpError> {
    let names = TopologyNames::for_queue(queue);
    let def = QueueDefinition::new(queue)
        .durable()
        .queue_type(queue_type)
        .dead_letter_exchange(&names.wait_exchange);

    session.declare_queue(&def).await
}

/// Reads the accumulated dead-letter count from a message's `x-death` header,
/// the way a consumer decides between another retry and giving the message up
/// to the DLQ. Returns 0 when the header is missing or malformed.
pub fn death_count(properties: &BasicProperties) -> i64 {
    let headers = match properties.headers() {
        Some(headers) => headers.clone(),
        None => return 0,
    };

    headers
        .inner()
        .get(AMQP_HEADERS_X_DEATH)
        .and_then(|value| value.as_array())
        .and_then(|entries| entries.as_slice().first())
        .and_then(|entry| entry.as_field_table())
        .and_then(|table| table.inner().get(AMQP_HEADERS_COUNT))
        .and_then(|count| count.as_long_long_int())
        .unwrap_or(0)
}

/// Snapshot of a queue's retry pipeline as seen through the management
/// gateway.
///
/// Exchange presence is inferred from the queues: a wait queue cannot deliver
/// without its exchanges, and the management queue listing is the cheap,
/// always-available introspection path. The `max_retries`, `retry_delay_secs`
/// and `dlq_ttl_ms` fields echo the crate defaults: the broker never
/// materialises them, so they are assumed, not read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySystemInfo {
    pub queue_name: String,
    pub main_queue: bool,
    pub wait_queue: bool,
    pub wait_exchange: bool,
    pub retry_exchange: bool,
    pub dlq: bool,
    pub main_queue_msgs: u64,
    pub wait_queue_msgs: u64,
    pub dlq_msgs: u64,
    pub max_retries: u32,
    pub retry_delay_secs: u32,
    pub dlq_ttl_ms: u32,
}

impl RetrySystemInfo {
    /// Whether every component of the pipeline is present.
    pub fn is_complete(&self) -> bool {
        self.main_queue && self.wait_queue && self.wait_exchange && self.retry_exchange && self.dlq
    }
}

/// Inspects the retry pipeline around `queue`. Missing components are
/// reported as absent; transport and authentication failures propagate.
pub async fn inspect_retry_system(
    mgmt: &ManagementClient,
    vhost: &str,
    queue: &str,
) -> Result<RetrySystemInfo, AmqpError> {
    let names = TopologyNames::for_queue(queue);
    let defaults = RetryConfig::default();

    let mut info = RetrySystemInfo {
        queue_name: queue.to_owned(),
        main_queue: false,
        wait_queue: false,
        wait_exchange: false,
        retry_exchange: false,
        dlq: false,
        main_queue_msgs: 0,
        wait_queue_msgs: 0,
        dlq_msgs: 0,
        max_retries: defaults.max_retries,
        retry_delay_secs: defaults.retry_delay_secs,
        dlq_ttl_ms: defaults.dlq_ttl_ms,
    };

    match mgmt.get_queue(vhost, queue).await {
        Ok(record) => {
            info.main_queue = true;
            info.main_queue_msgs = record.messages_ready;
        }
        Err(AmqpError::QueueNotFound(_)) => {}
        Err(err) => return Err(err),
    }

    match mgmt.get_queue(vhost, &names.wait_queue).await {
        Ok(record) => {
            info.wait_queue = true;
            info.wait_queue_msgs = record.messages_ready;
        }
        Err(AmqpError::QueueNotFound(_)) => {}
        Err(err) => return Err(err),
    }

    match mgmt.get_queue(vhost, &names.dlq).await {
        Ok(record) => {
            info.dlq = true;
            info.dlq_msgs = record.messages_ready;
        }
        Err(AmqpError::QueueNotFound(_)) => {}
        Err(err) => return Err(err),
    }

    info.wait_exchange = info.wait_queue;
    info.retry_exchange = info.wait_queue || info.dlq;

    Ok(info)
}
