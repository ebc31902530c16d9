//! # Confirmed Publisher
//!
//! Republishes a drained batch into a queue under publisher confirms. One
//! message at a time: publish, wait synchronously for that message's confirm,
//! then move on. Pipelining would be faster, but per-message confirms are
//! what lets a failure name the exact message that was lost, and the batch
//! being restored here is usually the only copy left.

use crate::{channel::Session, drain::SavedMessage, errors::AmqpError};
use lapin::{
    options::BasicPublishOptions,
    publisher_confirm::Confirmation,
    types::{FieldTable, ShortString},
    BasicProperties,
};
use std::time::Duration;
use tracing::{debug, error};

/// How long to wait for the broker to confirm each publish.
pub const PUBLISH_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// Content type applied when a saved message carries none.
pub const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Persistent delivery mode; restored messages must survive a broker restart.
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Publishes a batch into `queue` through the default exchange, confirming
/// each message before the next is sent.
///
/// The queue state afterwards preserves the batch order. On a negative
/// confirm or a confirm timeout the error names the 1-based index of the
/// failing message, so the caller can report exactly how much of the batch
/// made it.
pub async fn publish_all<F>(
    session: &Session,
    queue: &str,
    messages: &[SavedMessage],
    mut on_progress: F,
) -> Result<(), AmqpError>
where
    F: FnMut(usize, usize),
{
    if messages.is_empty() {
        return Ok(());
    }

    session.enable_confirms().await?;

    let total = messages.len();
    debug!(queue, total, "republishing saved messages");

    for (idx, message) in messages.iter().enumerate() {
        let seq = idx + 1;
        publish_one(session, queue, message, seq).await?;
        on_progress(seq, total);
    }

    debug!(queue, total, "all messages confirmed");
    Ok(())
}

/// Publishes one saved message and waits for its confirm. `seq` is the
/// 1-based position reported on failure. The channel must already be in
/// confirm mode.
pub(crate) async fn publish_one(
    session: &Session,
    queue: &str,
    message: &SavedMessage,
    seq: usize,
) -> Result<(), AmqpError> {
    let confirm = match session
        .channel()
        .basic_publish(
            "",
            queue,
            BasicPublishOptions::default(),
            &message.body,
            restore_properties(message),
        )
        .await
    {
        Ok(confirm) => confirm,
        Err(err) => {
            error!(error = err.to_string(), queue, seq, "error publishing message");
            return Err(AmqpError::PublishingError { index: seq });
        }
    };

    match tokio::time::timeout(PUBLISH_CONFIRM_TIMEOUT, confirm).await {
        Err(_) => {
            error!(queue, seq, "no confirm within the timeout");
            Err(AmqpError::ConfirmTimeout { index: seq })
        }
        Ok(Err(err)) => {
            error!(error = err.to_string(), queue, seq, "confirm wait failed");
            Err(AmqpError::PublishingError { index: seq })
        }
        Ok(Ok(Confirmation::Nack(_))) => {
            error!(queue, seq, "broker nacked the publish");
            Err(AmqpError::BrokerNack { index: seq })
        }
        Ok(Ok(_)) => Ok(()),
    }
}

/// Rebuilds the AMQP properties of a saved message: persistent delivery, the
/// captured headers with their original key set, and the optional fields only
/// when they were present at capture time.
pub(crate) fn restore_properties(message: &SavedMessage) -> BasicProperties {
    let content_type = if message.content_type.is_empty() {
        FALLBACK_CONTENT_TYPE
    } else {
        &message.content_type
    };

    let mut props = BasicProperties::default()
        .with_content_type(ShortString::from(content_type))
        .with_delivery_mode(DELIVERY_MODE_PERSISTENT)
        .with_priority(message.priority)
        .with_headers(FieldTable::from(message.headers.clone()));

    if !message.message_id.is_empty() {
        props = props.with_message_id(ShortString::from(message.message_id.clone()));
    }
    if let Some(timestamp) = message.timestamp {
        props = props.with_timestamp(timestamp);
    }

    props
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::{AMQPValue, LongString};
    use std::collections::BTreeMap;

    fn saved(content_type: &str) -> SavedMessage {
        let mut headers = BTreeMap::<ShortString, AMQPValue>::new();
        headers.insert(
            ShortString::from("x-origin"),
            AMQPValue::LongString(LongString::from("billing")),
        );
        headers.insert(ShortString::from("x-shard"), AMQPValue::LongInt(4));

        SavedMessage {
            body: b"payload".to_vec(),
            content_type: content_type.to_owned(),
            headers,
            priority: 3,
            message_id: "msg-9".to_owned(),
            timestamp: Some(1_700_000_000),
        }
    }

    #[test]
    fn properties_keep_the_captured_values() {
        let message = saved("text/plain");
        let props = restore_properties(&message);

        assert_eq!(
            props.content_type().as_ref().map(|value| value.as_str()),
            Some("text/plain")
        );
        assert_eq!(*props.delivery_mode(), Some(2));
        assert_eq!(*props.priority(), Some(3));
        assert_eq!(
            props.message_id().as_ref().map(|value| value.as_str()),
            Some("msg-9")
        );
        assert_eq!(*props.timestamp(), Some(1_700_000_000));
    }

    #[test]
    fn empty_content_type_falls_back_to_octet_stream() {
        let props = restore_properties(&saved(""));
        assert_eq!(
            props.content_type().as_ref().map(|value| value.as_str()),
            Some("application/octet-stream")
        );
    }

    #[test]
    fn headers_are_reconstituted_with_the_same_key_set() {
        let message = saved("text/plain");
        let props = restore_properties(&message);

        let restored = props.headers().clone().unwrap_or_default().inner().clone();
        assert_eq!(restored, message.headers);
    }

    #[test]
    fn absent_optional_fields_stay_absent() {
        let message = SavedMessage {
            body: vec![],
            content_type: String::new(),
            headers: BTreeMap::new(),
            priority: 0,
            message_id: String::new(),
            timestamp: None,
        };
        let props = restore_properties(&message);

        assert_eq!(*props.message_id(), None);
        assert_eq!(*props.timestamp(), None);
    }
}
