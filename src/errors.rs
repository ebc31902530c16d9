//! # Error Types
//!
//! This module provides the error surface for every broker-facing operation.
//! The `AmqpError` enum covers connection and channel failures, declarations,
//! bindings, message handling, the management HTTP surface, and the terminal
//! reshape failure that leaves messages held in memory.

use thiserror::Error;

/// Represents errors that can occur while driving the broker.
///
/// Most variants name the operation that failed, following the shape of the
/// underlying AMQP classes. `CriticalHold` is special: it is terminal, and its
/// message carries everything a human operator needs to rescue the in-memory
/// batch (the queue name and the number of messages still held).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Connection parameters are missing or unusable; raised before any broker contact
    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),

    /// Connection or TLS handshake to the broker failed
    #[error("broker unreachable: {0}")]
    BrokerUnreachable(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// A passive probe or management lookup found no queue with this name
    #[error("queue `{0}` not found")]
    QueueNotFound(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// A declaration carried arguments incompatible with the existing entity
    #[error("declaration conflict on `{0}`: arguments differ from the existing entity")]
    DeclarationConflict(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`")]
    BindingExchangeToQueueError(String, String),

    /// Error deleting a queue over AMQP
    #[error("failure to delete queue `{0}`")]
    DeleteQueueError(String),

    /// Error purging a queue
    #[error("failure to purge queue `{0}`")]
    PurgeQueueError(String),

    /// Error pulling a single message from a queue
    #[error("failure to get a message from `{0}`")]
    GetMessageError(String),

    /// Error acknowledging a delivery
    #[error("failure to ack message")]
    AckMessageError,

    /// Error switching the channel into publisher-confirm mode
    #[error("failure to enable publisher confirms")]
    ConfirmSelectError,

    /// Error publishing a message
    #[error("failure to publish message {index}")]
    PublishingError { index: usize },

    /// The broker negatively acknowledged a publish
    #[error("message {index} was not confirmed by the broker (nack)")]
    BrokerNack { index: usize },

    /// No confirm arrived for a publish within the per-message window
    #[error("timeout waiting for broker confirm of message {index}")]
    ConfirmTimeout { index: usize },

    /// The management API answered with a non-success status
    #[error("management api error: status {status}, body: {body}")]
    ManagementApi { status: u16, body: String },

    /// A management API response could not be decoded
    #[error("failure to parse management api response: {0}")]
    ParseResponseError(String),

    /// The caller cancelled before any message was captured
    #[error("operation cancelled")]
    Cancelled,

    /// Terminal reshape failure with unrestored messages still in memory.
    /// Recovery is manual; the caller must surface this message verbatim.
    #[error("reshape of `{queue}` halted with {held} messages still held in memory: {cause}")]
    CriticalHold {
        queue: String,
        held: usize,
        cause: String,
    },
}
