//! # Management Gateway
//!
//! Authenticated client for the broker's HTTP management surface. The AMQP
//! session cannot list queues, report queue types, or delete a queue whose
//! arguments conflict with a pending redeclaration; those operations go
//! through here. No retry happens at this layer: retrying is an orchestrator
//! decision.

use crate::{config::AmqpConfig, errors::AmqpError};
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

/// Queue record as reported by `GET /api/queues`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueRecord {
    pub name: String,
    #[serde(default)]
    pub vhost: String,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub exclusive: bool,
    /// classic, quorum or stream
    #[serde(rename = "type", default)]
    pub queue_type: String,
    #[serde(default)]
    pub messages: u64,
    #[serde(default)]
    pub messages_ready: u64,
    #[serde(default)]
    pub messages_unacked: u64,
    #[serde(default)]
    pub consumers: u32,
    #[serde(default)]
    pub arguments: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub message_stats: MessageStats,
}

/// Rate counters nested inside a queue record.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct MessageStats {
    #[serde(default)]
    pub publish: u64,
    #[serde(default)]
    pub deliver: u64,
    #[serde(default)]
    pub deliver_get: u64,
    #[serde(default)]
    pub get: u64,
    #[serde(default)]
    pub ack: u64,
}

/// Client for the management API, authenticated with the AMQP credentials
/// over plain HTTP or TLS mirroring the session transport.
pub struct ManagementClient {
    base_url: String,
    username: String,
    password: String,
    client: reqwest::Client,
}

impl ManagementClient {
    /// Creates a new client for the management API.
    pub fn new(cfg: &AmqpConfig) -> ManagementClient {
        ManagementClient {
            base_url: cfg.management_base_url(),
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            client: reqwest::Client::new(),
        }
    }

    /// Lists every queue visible to the configured credentials.
    pub async fn list_queues(&self) -> Result<Vec<QueueRecord>, AmqpError> {
        let endpoint = format!("{}/queues", self.base_url);

        let response = self
            .client
            .get(&endpoint)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|err| AmqpError::BrokerUnreachable(err.to_string()))?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(AmqpError::ManagementApi {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<Vec<QueueRecord>>()
            .await
            .map_err(|err| AmqpError::ParseResponseError(err.to_string()))
    }

    /// Fetches a single queue record. A 404 becomes `QueueNotFound`.
    pub async fn get_queue(&self, vhost: &str, queue: &str) -> Result<QueueRecord, AmqpError> {
        let endpoint = self.queue_url(vhost, queue);

        let response = self
            .client
            .get(&endpoint)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|err| AmqpError::BrokerUnreachable(err.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(AmqpError::QueueNotFound(queue.to_owned()));
        }
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(AmqpError::ManagementApi {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<QueueRecord>()
            .await
            .map_err(|err| AmqpError::ParseResponseError(err.to_string()))
    }

    /// Deletes a queue unconditionally, regardless of its arguments or
    /// whether it holds messages. Succeeds on 200 or 204; a 404 becomes
    /// `QueueNotFound` so callers can treat "already gone" as done.
    pub async fn delete_queue(&self, vhost: &str, queue: &str) -> Result<(), AmqpError> {
        let endpoint = self.queue_url(vhost, queue);
        debug!(queue, "deleting queue via management api");

        let response = self
            .client
            .delete(&endpoint)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|err| AmqpError::BrokerUnreachable(err.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(AmqpError::QueueNotFound(queue.to_owned()));
        }
        if status != StatusCode::OK && status != StatusCode::NO_CONTENT {
            let body = response.text().await.unwrap_or_default();
            return Err(AmqpError::ManagementApi {
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }

    fn queue_url(&self, vhost: &str, queue: &str) -> String {
        format!(
            "{}/queues/{}/{}",
            self.base_url,
            vhost_segment(vhost),
            urlencoding::encode(queue)
        )
    }
}

/// Encodes a virtual host as a URL path segment. The default vhost `/` is
/// transmitted as `%2F`; any other vhost loses its leading slash and is
/// path-escaped.
pub(crate) fn vhost_segment(vhost: &str) -> String {
    let trimmed = vhost.strip_prefix('/').unwrap_or(vhost);
    if trimmed.is_empty() {
        "%2F".to_owned()
    } else {
        urlencoding::encode(trimmed).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ManagementClient {
        ManagementClient::new(&AmqpConfig::default())
    }

    #[test]
    fn vhost_segment_follows_the_management_rules() {
        assert_eq!(vhost_segment("/"), "%2F");
        assert_eq!(vhost_segment(""), "%2F");
        assert_eq!(vhost_segment("/foo"), "foo");
        assert_eq!(vhost_segment("foo"), "foo");
        assert_eq!(vhost_segment("/a b"), "a%20b");
    }

    #[test]
    fn queue_urls_escape_vhost_and_name() {
        let client = client();
        assert_eq!(
            client.queue_url("/", "orders"),
            "http://localhost:15672/api/queues/%2F/orders"
        );
        assert_eq!(
            client.queue_url("/a b", "orders.dlq"),
            "http://localhost:15672/api/queues/a%20b/orders.dlq"
        );
        assert_eq!(
            client.queue_url("/", "spaced queue"),
            "http://localhost:15672/api/queues/%2F/spaced%20queue"
        );
    }

    #[test]
    fn base_url_mirrors_tls() {
        let mut cfg = AmqpConfig::default();
        cfg.use_tls = true;
        cfg.management_port = 15671;
        let client = ManagementClient::new(&cfg);
        assert_eq!(
            client.queue_url("/", "q"),
            "https://localhost:15671/api/queues/%2F/q"
        );
    }

    #[test]
    fn queue_record_deserializes_a_management_payload() {
        let payload = r#"{
            "name": "orders",
            "vhost": "/",
            "durable": true,
            "auto_delete": false,
            "exclusive": false,
            "type": "quorum",
            "messages": 120,
            "messages_ready": 100,
            "messages_unacked": 20,
            "consumers": 3,
            "memory": 34512,
            "arguments": {
                "x-queue-type": "quorum",
                "x-dead-letter-exchange": "orders.wait.exchange"
            },
            "message_stats": {
                "publish": 1500,
                "deliver_get": 1400,
                "ack": 1380
            }
        }"#;

        let record: QueueRecord = serde_json::from_str(payload).unwrap();
        assert_eq!(record.name, "orders");
        assert_eq!(record.vhost, "/");
        assert_eq!(record.queue_type, "quorum");
        assert_eq!(record.messages_ready, 100);
        assert_eq!(record.messages_unacked, 20);
        assert_eq!(record.consumers, 3);
        assert_eq!(
            record.arguments.get("x-dead-letter-exchange"),
            Some(&serde_json::Value::String("orders.wait.exchange".to_owned()))
        );
        assert_eq!(record.message_stats.publish, 1500);
    }

    #[test]
    fn queue_record_tolerates_sparse_payloads() {
        let record: QueueRecord = serde_json::from_str(r#"{"name": "bare"}"#).unwrap();
        assert_eq!(record.name, "bare");
        assert_eq!(record.messages_ready, 0);
        assert!(record.arguments.is_empty());
        assert_eq!(record.queue_type, "");
    }
}
