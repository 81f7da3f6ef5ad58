//! NATS client implementation.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use common::bus::{BusClient, BusError, BusMessage};
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::info;

/// Default deadline for backend requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Wrapper around the core NATS client.
///
/// Uses core NATS only: request/reply for get, access and query
/// requests, and push subscriptions for resource events.
#[derive(Clone)]
pub struct NatsClient {
    client: async_nats::Client,
    request_timeout: Duration,
}

impl NatsClient {
    /// Connect to a NATS server.
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", url);
        let client = async_nats::connect(url).await?;

        Ok(Self {
            client,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Set the per-request deadline.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[async_trait]
impl BusClient for NatsClient {
    async fn request(&self, subject: &str, payload: Bytes) -> Result<Bytes, BusError> {
        let fut = self.client.request(subject.to_string(), payload);
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(Ok(msg)) => Ok(msg.payload),
            Ok(Err(e)) => Err(BusError::Other(e.to_string())),
            Err(_) => Err(BusError::Timeout),
        }
    }

    async fn subscribe(&self, pattern: &str) -> Result<BoxStream<'static, BusMessage>, BusError> {
        info!("Subscribing to subject pattern: {}", pattern);
        let subscriber = self
            .client
            .subscribe(pattern.to_string())
            .await
            .map_err(|e| BusError::Other(e.to_string()))?;

        Ok(subscriber
            .map(|msg| BusMessage {
                subject: msg.subject.to_string(),
                payload: msg.payload,
            })
            .boxed())
    }
}
