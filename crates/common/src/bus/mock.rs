//! In-process bus for tests.
//!
//! `MockBus` lets a test act as the backend services: it captures every
//! outgoing request so the test can inspect and answer it, and lets the
//! test inject events onto subscribed subjects.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tokio::sync::{mpsc, oneshot};

use super::{matches_subject, BusClient, BusError, BusMessage};

/// A captured request awaiting a scripted reply.
#[derive(Debug)]
pub struct MockRequest {
    pub subject: String,
    pub payload: Bytes,
    reply: oneshot::Sender<Result<Bytes, BusError>>,
}

impl MockRequest {
    /// The request payload parsed as JSON. An empty payload parses as
    /// `null`.
    pub fn json(&self) -> serde_json::Value {
        if self.payload.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&self.payload).expect("request payload is not valid JSON")
        }
    }

    /// Reply with a `{"result": ...}` envelope.
    pub fn respond_result(self, result: serde_json::Value) {
        self.respond_raw(serde_json::json!({ "result": result }));
    }

    /// Reply with an `{"error": {code, message}}` envelope.
    pub fn respond_error(self, code: &str, message: &str) {
        self.respond_raw(serde_json::json!({
            "error": { "code": code, "message": message }
        }));
    }

    /// Reply with an arbitrary JSON body.
    pub fn respond_raw(self, body: serde_json::Value) {
        let bytes = Bytes::from(serde_json::to_vec(&body).expect("serialize reply"));
        let _ = self.reply.send(Ok(bytes));
    }

    /// Let the request time out.
    pub fn respond_timeout(self) {
        let _ = self.reply.send(Err(BusError::Timeout));
    }
}

/// An in-process [`BusClient`] with scripted replies.
pub struct MockBus {
    request_tx: mpsc::UnboundedSender<MockRequest>,
    request_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MockRequest>>,
    subs: Mutex<Vec<(String, mpsc::UnboundedSender<BusMessage>)>>,
}

impl MockBus {
    pub fn new() -> MockBus {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        MockBus {
            request_tx,
            request_rx: tokio::sync::Mutex::new(request_rx),
            subs: Mutex::new(Vec::new()),
        }
    }

    /// Publish an event to every matching subscription.
    pub fn emit(&self, subject: &str, payload: Bytes) {
        let mut subs = self.subs.lock().unwrap();
        subs.retain(|(pattern, tx)| {
            if matches_subject(pattern, subject) {
                tx.send(BusMessage {
                    subject: subject.to_string(),
                    payload: payload.clone(),
                })
                .is_ok()
            } else {
                !tx.is_closed()
            }
        });
    }

    /// Publish a JSON event to every matching subscription.
    pub fn emit_json(&self, subject: &str, payload: serde_json::Value) {
        self.emit(subject, Bytes::from(serde_json::to_vec(&payload).expect("serialize event")));
    }

    /// Await the next captured request. Panics if none arrives within a
    /// second.
    pub async fn next_request(&self) -> MockRequest {
        let mut rx = self.request_rx.lock().await;
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for a bus request")
            .expect("mock bus closed")
    }

    /// Return the next captured request if one arrives within the given
    /// window.
    pub async fn try_next_request(&self, window: Duration) -> Option<MockRequest> {
        let mut rx = self.request_rx.lock().await;
        tokio::time::timeout(window, rx.recv()).await.ok().flatten()
    }

    /// Assert that no request is captured within a short window.
    pub async fn assert_no_request(&self) {
        if let Some(req) = self.try_next_request(Duration::from_millis(50)).await {
            panic!("unexpected bus request to {}", req.subject);
        }
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        let mut subs = self.subs.lock().unwrap();
        subs.retain(|(_, tx)| !tx.is_closed());
        subs.len()
    }
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BusClient for MockBus {
    async fn request(&self, subject: &str, payload: Bytes) -> Result<Bytes, BusError> {
        let (reply, rx) = oneshot::channel();
        self.request_tx
            .send(MockRequest {
                subject: subject.to_string(),
                payload,
                reply,
            })
            .map_err(|_| BusError::Closed)?;
        rx.await.map_err(|_| BusError::Closed)?
    }

    async fn subscribe(&self, pattern: &str) -> Result<BoxStream<'static, BusMessage>, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subs.lock().unwrap().push((pattern.to_string(), tx));
        Ok(Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        })))
    }
}
