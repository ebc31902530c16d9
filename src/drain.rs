//! # Queue Drainer
//!
//! Pull-consumes every message currently in a queue into an ordered in-memory
//! batch. The drainer uses `basic.get`, never a subscription: a subscription
//! would bring competing-consumer semantics, and a drain wants exactly one
//! reader observing broker delivery order.
//!
//! Each delivery is captured first and acknowledged after, so the batch holds
//! a copy before the broker forgets the original. On a mid-drain failure the
//! messages collected so far are returned along with the error, letting the
//! caller still restore what was captured.

use crate::{channel::Session, errors::AmqpError};
use lapin::{
    message::Delivery,
    types::{AMQPValue, ShortString},
    BasicProperties,
};
use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicBool, Ordering},
};
use tracing::{debug, error, warn};

/// A message captured from a queue, held in memory only.
///
/// Everything a republish needs is copied out of the delivery: body, content
/// type, a field-wise deep copy of the headers, priority, message id and the
/// broker timestamp. Between a drain and a restore this copy is the sole
/// surviving instance of the message.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedMessage {
    pub body: Vec<u8>,
    pub content_type: String,
    pub headers: BTreeMap<ShortString, AMQPValue>,
    pub priority: u8,
    pub message_id: String,
    pub timestamp: Option<u64>,
}

impl SavedMessage {
    /// Copies a delivery's payload and properties.
    pub fn from_delivery(delivery: &Delivery) -> SavedMessage {
        SavedMessage::from_parts(&delivery.properties, &delivery.data)
    }

    pub(crate) fn from_parts(properties: &BasicProperties, data: &[u8]) -> SavedMessage {
        let headers = properties
            .headers()
            .clone()
            .unwrap_or_default()
            .inner()
            .clone();

        SavedMessage {
            body: data.to_vec(),
            content_type: properties
                .content_type()
                .as_ref()
                .map(|value| value.to_string())
                .unwrap_or_default(),
            headers,
            priority: properties.priority().unwrap_or_default(),
            message_id: properties
                .message_id()
                .as_ref()
                .map(|value| value.to_string())
                .unwrap_or_default(),
            timestamp: *properties.timestamp(),
        }
    }
}

/// Result of draining a queue: the ordered batch, plus the error that stopped
/// the drain early, if any. A report with a failure still owns every message
/// captured before the failure.
pub struct DrainReport {
    pub messages: Vec<SavedMessage>,
    pub failure: Option<AmqpError>,
}

impl DrainReport {
    pub fn is_partial(&self) -> bool {
        self.failure.is_some()
    }
}

/// Drains every ready message from `queue`.
///
/// The ready-count from a passive probe seeds the progress estimate; when
/// publishers are still writing, the reported total grows to match the
/// current count. The optional `cancel` flag is honoured only until the first
/// message is captured; after that the batch must reach the caller, so
/// cancellation is declined.
///
/// Probe failures (including cancellation) are hard errors; failures after
/// the first pull come back inside the report.
pub async fn drain<F>(
    session: &Session,
    queue: &str,
    cancel: Option<&AtomicBool>,
    mut on_progress: F,
) -> Result<DrainReport, AmqpError>
where
    F: FnMut(usize, usize),
{
    let probe = session.passive_declare_queue(queue).await?;
    let estimated = probe.messages_ready as usize;
    debug!(queue, estimated, "draining queue");

    let mut messages: Vec<SavedMessage> = Vec::with_capacity(estimated);

    loop {
        if messages.is_empty() {
            if let Some(flag) = cancel {
                if flag.load(Ordering::Relaxed) {
                    debug!(queue, "drain cancelled before any message was captured");
                    return Err(AmqpError::Cancelled);
                }
            }
        }

        let pulled = match session.pull_one(queue).await {
            Ok(pulled) => pulled,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue,
                    captured = messages.len(),
                    "drain stopped early"
                );
                return Ok(DrainReport {
                    messages,
                    failure: Some(err),
                });
            }
        };

        let Some(message) = pulled else {
            break;
        };

        // capture before ack: once acked the broker copy is gone
        messages.push(SavedMessage::from_delivery(&message.delivery));

        if let Err(err) = session.ack(message.delivery.delivery_tag).await {
            warn!(
                error = err.to_string(),
                queue,
                captured = messages.len(),
                "ack failed mid-drain; the unacked message may be redelivered"
            );
            return Ok(DrainReport {
                messages,
                failure: Some(err),
            });
        }

        on_progress(messages.len(), estimated.max(messages.len()));
    }

    debug!(queue, drained = messages.len(), "queue drained");
    Ok(DrainReport {
        messages,
        failure: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::{FieldTable, LongString};

    #[test]
    fn saved_message_copies_every_property() {
        let mut headers = BTreeMap::<ShortString, AMQPValue>::new();
        headers.insert(
            ShortString::from("x-tenant"),
            AMQPValue::LongString(LongString::from("acme")),
        );
        headers.insert(ShortString::from("x-attempt"), AMQPValue::LongInt(2));

        let props = BasicProperties::default()
            .with_content_type(ShortString::from("application/json"))
            .with_headers(FieldTable::from(headers.clone()))
            .with_priority(7)
            .with_message_id(ShortString::from("msg-17"))
            .with_timestamp(1_700_000_000);

        let saved = SavedMessage::from_parts(&props, b"{\"id\":17}");

        assert_eq!(saved.body, b"{\"id\":17}");
        assert_eq!(saved.content_type, "application/json");
        assert_eq!(saved.headers, headers);
        assert_eq!(saved.priority, 7);
        assert_eq!(saved.message_id, "msg-17");
        assert_eq!(saved.timestamp, Some(1_700_000_000));
    }

    #[test]
    fn saved_message_defaults_missing_properties() {
        let saved = SavedMessage::from_parts(&BasicProperties::default(), b"payload");

        assert_eq!(saved.body, b"payload");
        assert_eq!(saved.content_type, "");
        assert!(saved.headers.is_empty());
        assert_eq!(saved.priority, 0);
        assert_eq!(saved.message_id, "");
        assert_eq!(saved.timestamp, None);
    }

    #[test]
    fn report_is_partial_only_with_a_failure() {
        let report = DrainReport {
            messages: vec![],
            failure: None,
        };
        assert!(!report.is_partial());

        let report = DrainReport {
            messages: vec![],
            failure: Some(AmqpError::AckMessageError),
        };
        assert!(report.is_partial());
    }
}
