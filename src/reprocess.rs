//! # Dead-Letter Reprocessing
//!
//! Moves messages out of a queue's DLQ and back into the main queue for
//! another round of processing. The `x-death` header is stripped before
//! republishing so the broker counts retries from zero again; every other
//! header and property is preserved. Each DLQ delivery is acknowledged only
//! after its republish is confirmed, so a failure mid-move leaves the
//! remaining messages (and the one in flight) on the DLQ.

use crate::{
    channel::Session,
    drain::SavedMessage,
    errors::AmqpError,
    publisher::publish_one,
    topology::{TopologyNames, AMQP_HEADERS_X_DEATH},
};
use tracing::{debug, info};

/// Moves up to `limit` messages (all of them when `None`) from `queue`'s DLQ
/// back onto `queue`. Returns how many messages were moved.
pub async fn reprocess_dlq(
    session: &Session,
    queue: &str,
    limit: Option<usize>,
) -> Result<usize, AmqpError> {
    let names = TopologyNames::for_queue(queue);
    debug!(queue, dlq = names.dlq.as_str(), "reprocessing dead letters");

    session.enable_confirms().await?;

    let mut moved = 0;
    loop {
        if let Some(limit) = limit {
            if moved >= limit {
                break;
            }
        }

        let Some(message) = session.pull_one(&names.dlq).await? else {
            break;
        };

        let mut saved = SavedMessage::from_delivery(&message.delivery);
        // reset the broker's retry bookkeeping; everything else survives
        saved.headers.remove(AMQP_HEADERS_X_DEATH);

        publish_one(session, queue, &saved, moved + 1).await?;
        session.ack(message.delivery.delivery_tag).await?;

        moved += 1;
    }

    info!(queue, moved, "dead letters reprocessed");
    Ok(moved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::{
        types::{AMQPValue, FieldTable, LongString, ShortString},
        BasicProperties,
    };
    use std::collections::BTreeMap;

    #[test]
    fn stripping_x_death_preserves_the_other_headers() {
        let mut headers = BTreeMap::<ShortString, AMQPValue>::new();
        headers.insert(
            ShortString::from(AMQP_HEADERS_X_DEATH),
            AMQPValue::FieldArray(Default::default()),
        );
        headers.insert(
            ShortString::from("x-tenant"),
            AMQPValue::LongString(LongString::from("acme")),
        );

        let props = BasicProperties::default().with_headers(FieldTable::from(headers));
        let mut saved = SavedMessage::from_parts(&props, b"body");
        saved.headers.remove(AMQP_HEADERS_X_DEATH);

        assert!(saved.headers.get(AMQP_HEADERS_X_DEATH).is_none());
        assert_eq!(
            saved.headers.get("x-tenant"),
            Some(&AMQPValue::LongString(LongString::from("acme")))
        );
    }
}
