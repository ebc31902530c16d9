//! # Broker Session
//!
//! This module handles the creation and management of AMQP connections and
//! channels. A `Session` is one open connection paired with one channel, and
//! that pair is the unit of work: declarations, probes, single-message pulls
//! and confirmed publishes all ride the same channel, which keeps
//! publisher-confirm bookkeeping deterministic.
//!
//! Any channel error leaves the session unusable; callers detect that through
//! `is_open` and decide whether to retry on a fresh session.

use crate::{
    config::AmqpConfig,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use lapin::{
    message::BasicGetMessage,
    options::{
        BasicAckOptions, BasicGetOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions, QueuePurgeOptions,
    },
    types::{FieldTable, LongString},
    Channel, Connection, ConnectionProperties,
};
use tracing::{debug, error};

/// Metadata returned by a passive declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueProbe {
    pub messages_ready: u32,
    pub consumers: u32,
}

/// One AMQP connection with one channel, owned exclusively.
pub struct Session {
    conn: Connection,
    channel: Channel,
}

impl Session {
    /// Opens a connection and a channel using the given configuration.
    ///
    /// The configuration is validated first, so a broken configuration is
    /// reported before any broker contact. Heartbeats are negotiated through
    /// the session URI.
    pub async fn open(cfg: &AmqpConfig) -> Result<Session, AmqpError> {
        cfg.validate()?;

        debug!(
            host = cfg.host.as_str(),
            vhost = cfg.vhost.as_str(),
            "creating amqp connection..."
        );
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(env!("CARGO_PKG_NAME")));

        let conn = match Connection::connect(&cfg.amqp_uri(), options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::BrokerUnreachable(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        match conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Session { conn, channel })
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }

    /// Whether both the connection and the channel are still usable. A broker
    /// that closed the channel after a conflicting declare shows up here.
    pub fn is_open(&self) -> bool {
        self.conn.status().connected() && self.channel.status().connected()
    }

    /// The underlying channel, for publish paths that need raw access.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Closes the channel and the connection, logging (not surfacing) errors:
    /// a session being dropped after a broker-side close has nothing to clean.
    pub async fn close(self) {
        if let Err(err) = self.channel.close(200, "bye").await {
            debug!(error = err.to_string(), "channel already closed");
        }
        if let Err(err) = self.conn.close(200, "bye").await {
            debug!(error = err.to_string(), "connection already closed");
        }
    }

    /// Declares a queue from its definition.
    ///
    /// A broker refusal caused by incompatible arguments on an existing queue
    /// is surfaced as `DeclarationConflict`; other refusals as
    /// `DeclareQueueError`.
    pub async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name());

        match self
            .channel
            .queue_declare(
                def.name(),
                QueueDeclareOptions {
                    passive: false,
                    durable: def.is_durable(),
                    exclusive: def.is_exclusive(),
                    auto_delete: def.is_auto_delete(),
                    nowait: false,
                },
                FieldTable::from(def.declare_arguments()),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = def.name(), "error to declare the queue");
                Err(declare_queue_error(def.name(), &err))
            }
            _ => {
                debug!("queue: {} was created", def.name());
                Ok(())
            }
        }
    }

    /// Asserts that a queue exists and returns its ready-message and consumer
    /// counters. The probe never creates anything; a refusal is reported as
    /// `QueueNotFound`.
    pub async fn passive_declare_queue(&self, name: &str) -> Result<QueueProbe, AmqpError> {
        match self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(queue) => Ok(QueueProbe {
                messages_ready: queue.message_count(),
                consumers: queue.consumer_count(),
            }),
            Err(err) => {
                debug!(error = err.to_string(), name, "passive declare refused");
                Err(AmqpError::QueueNotFound(name.to_owned()))
            }
        }
    }

    /// Declares an exchange from its definition.
    pub async fn declare_exchange(&self, def: &ExchangeDefinition<'_>) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name());

        match self
            .channel
            .exchange_declare(
                def.name(),
                def.get_kind().into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.is_durable(),
                    auto_delete: def.is_auto_delete(),
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = def.name(), "error to declare the exchange");
                Err(AmqpError::DeclareExchangeError(def.name().to_owned()))
            }
            _ => {
                debug!("exchange: {} was created", def.name());
                Ok(())
            }
        }
    }

    /// Binds a queue to an exchange.
    pub async fn bind_queue(&self, binding: &QueueBinding<'_>) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        match self
            .channel
            .queue_bind(
                binding.queue_name,
                binding.exchange_name,
                binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::from(binding.arguments.clone()),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.to_owned(),
                    binding.queue_name.to_owned(),
                ))
            }
            _ => Ok(()),
        }
    }

    /// Deletes a queue over AMQP, returning the number of messages removed.
    /// The broker may refuse when the existing arguments conflict with
    /// `if_unused`/`if_empty`; forceful removal then goes through the
    /// management gateway.
    pub async fn delete_queue(
        &self,
        name: &str,
        if_unused: bool,
        if_empty: bool,
    ) -> Result<u32, AmqpError> {
        match self
            .channel
            .queue_delete(
                name,
                QueueDeleteOptions {
                    if_unused,
                    if_empty,
                    nowait: false,
                },
            )
            .await
        {
            Ok(count) => Ok(count),
            Err(err) => {
                error!(error = err.to_string(), name, "error to delete the queue");
                Err(AmqpError::DeleteQueueError(name.to_owned()))
            }
        }
    }

    /// Removes every ready message from a queue, returning how many were
    /// dropped.
    pub async fn purge_queue(&self, name: &str) -> Result<u32, AmqpError> {
        match self
            .channel
            .queue_purge(name, QueuePurgeOptions { nowait: false })
            .await
        {
            Ok(count) => Ok(count),
            Err(err) => {
                error!(error = err.to_string(), name, "error to purge the queue");
                Err(AmqpError::PurgeQueueError(name.to_owned()))
            }
        }
    }

    /// Pulls a single message without auto-ack (`basic.get`). `None` means the
    /// queue answered empty.
    pub async fn pull_one(&self, queue: &str) -> Result<Option<BasicGetMessage>, AmqpError> {
        match self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
        {
            Ok(message) => Ok(message),
            Err(err) => {
                error!(error = err.to_string(), queue, "error to get message");
                Err(AmqpError::GetMessageError(queue.to_owned()))
            }
        }
    }

    /// Acknowledges a single delivery by tag.
    pub async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to ack message");
                Err(AmqpError::AckMessageError)
            }
            _ => Ok(()),
        }
    }

    /// Switches the channel into publisher-confirm mode.
    pub async fn enable_confirms(&self) -> Result<(), AmqpError> {
        match self
            .channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to enable publisher confirms");
                Err(AmqpError::ConfirmSelectError)
            }
            _ => Ok(()),
        }
    }
}

/// Maps a queue-declare refusal onto the crate error surface. RabbitMQ
/// answers an inequivalent-argument declare with a 406 PRECONDITION_FAILED
/// channel error.
fn declare_queue_error(name: &str, err: &lapin::Error) -> AmqpError {
    let msg = err.to_string();
    if msg.contains("PRECONDITION_FAILED") || msg.contains("PRECONDITION-FAILED") {
        AmqpError::DeclarationConflict(name.to_owned())
    } else {
        AmqpError::DeclareQueueError(name.to_owned())
    }
}
