//! # requeue
//!
//! Control plane for RabbitMQ delayed-retry and dead-letter topologies.
//!
//! Given a main queue `Q`, the crate installs the five-entity pipeline
//!
//! ```text
//! Q --(reject)--> Q.wait.exchange --(fanout)--> Q.wait --(TTL)--> Q.retry --> Q.dlq
//! ```
//!
//! and, for queues that already carry traffic, reshapes them into that
//! pipeline without losing a message: every message is drained into memory,
//! the queue is recreated with its dead-letter exchange, and the batch is
//! republished under publisher confirms.
//!
//! The retry-or-dead decision itself belongs to consumers, which inspect the
//! `x-death` header (see [`topology::death_count`]); the crate only guarantees
//! the broker-side topology.

pub mod channel;
pub mod config;
pub mod drain;
pub mod errors;
pub mod exchange;
pub mod management;
pub mod publisher;
pub mod queue;
pub mod reprocess;
pub mod reshape;
pub mod topology;
