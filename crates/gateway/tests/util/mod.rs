//! Shared harness: a scripted bus on one side, a captured client
//! transport on the other, with the cache and a connection in between.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use common::bus::{MockBus, MockRequest};
use common::RError;
use gateway::{ClientEvent, ClientTransport, Conn, ConnConfig, Resources};
use resource_cache::Cache;
use serde_json::json;
use tokio::sync::mpsc;

pub struct Harness {
    pub bus: Arc<MockBus>,
    pub cache: Cache,
}

impl Harness {
    pub fn new() -> Harness {
        let bus = Arc::new(MockBus::new());
        let cache = Cache::start(bus.clone());
        Harness { bus, cache }
    }

    pub fn connect(&self) -> TestClient {
        self.connect_with_config(ConnConfig::default())
    }

    pub fn connect_with_config(&self, config: ConnConfig) -> TestClient {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Conn::start(self.cache.clone(), Arc::new(CaptureTransport { tx }), config);
        TestClient {
            conn,
            events: tokio::sync::Mutex::new(rx),
        }
    }

    /// Serve the next `count` bus requests, answering gets with the
    /// given resource result and access requests with full access.
    pub async fn serve_subscribe(&self, count: usize, get_result: serde_json::Value) {
        for _ in 0..count {
            let req = self.bus.next_request().await;
            if req.subject.starts_with("get.") {
                req.respond_result(get_result.clone());
            } else if req.subject.starts_with("access.") {
                req.respond_result(json!({"get": true}));
            } else {
                panic!("unexpected bus request to {}", req.subject);
            }
        }
    }

    /// Collect the next `count` requests without answering them.
    pub async fn collect_requests(&self, count: usize) -> Vec<MockRequest> {
        let mut requests = Vec::with_capacity(count);
        for _ in 0..count {
            requests.push(self.bus.next_request().await);
        }
        requests
    }
}

struct CaptureTransport {
    tx: mpsc::UnboundedSender<ClientEvent>,
}

impl ClientTransport for CaptureTransport {
    fn send(&self, event: ClientEvent) {
        let _ = self.tx.send(event);
    }
}

pub struct TestClient {
    pub conn: Conn,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<ClientEvent>>,
}

impl TestClient {
    pub async fn event(&self) -> ClientEvent {
        let mut rx = self.events.lock().await;
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for a client event")
            .expect("transport closed")
    }

    pub async fn assert_event(&self, event: &str, data: serde_json::Value) {
        let got = self.event().await;
        assert_eq!(got.event, event);
        assert_eq!(got.data, data);
    }

    /// Collect `count` events whose relative order is not guaranteed
    /// and assert each expected (event, data) pair arrived.
    pub async fn assert_events_unordered(&self, expected: Vec<(String, serde_json::Value)>) {
        let mut got = Vec::new();
        for _ in 0..expected.len() {
            let ev = self.event().await;
            got.push((ev.event, ev.data));
        }
        for pair in expected {
            assert!(got.contains(&pair), "missing event {:?}; got {:?}", pair, got);
        }
    }

    pub async fn assert_no_event(&self) {
        let mut rx = self.events.lock().await;
        if let Ok(Some(ev)) = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await {
            panic!("unexpected client event {}", ev.event);
        }
    }
}

pub fn model_data() -> serde_json::Value {
    json!({"string": "foo", "int": 42, "bool": true, "null": null})
}

pub fn collection_data() -> serde_json::Value {
    json!(["foo", 42, true, null])
}

/// Subscribe to a plain (query-less) resource, serving the get and
/// access requests, and return the snapshot.
pub async fn subscribe(
    h: &Harness,
    client: &TestClient,
    rid: &str,
    get_result: serde_json::Value,
) -> Resources {
    let conn = client.conn.clone();
    let rid_owned = rid.to_string();
    let fut = tokio::spawn(async move { conn.subscribe(&rid_owned).await });
    h.serve_subscribe(2, get_result).await;
    fut.await.expect("subscribe task").expect("subscribe failed")
}

/// Subscribe to a resource whose view is already cached: only an
/// access request may be outstanding, and none when the decision is
/// cached too.
pub async fn subscribe_cached(h: &Harness, client: &TestClient, rid: &str) -> Resources {
    let conn = client.conn.clone();
    let rid_owned = rid.to_string();
    let fut = tokio::spawn(async move { conn.subscribe(&rid_owned).await });
    if let Some(req) = h.bus.try_next_request(Duration::from_millis(50)).await {
        assert!(req.subject.starts_with("access."), "unexpected request to {}", req.subject);
        req.respond_result(json!({"get": true}));
    }
    fut.await.expect("subscribe task").expect("subscribe failed")
}

/// Subscribe to `test.model?<raw_query>`, answering the get request
/// with a model whose normalised query is `normalized`.
pub async fn subscribe_query_model(
    h: &Harness,
    client: &TestClient,
    raw_query: &str,
    normalized: &str,
) -> Resources {
    let rid = format!("test.model?{}", raw_query);
    let conn = client.conn.clone();
    let fut = tokio::spawn(async move { conn.subscribe(&rid).await });
    for _ in 0..2 {
        let req = h.bus.next_request().await;
        if req.subject.starts_with("get.") {
            assert_eq!(req.json(), json!({"query": raw_query}));
            req.respond_result(json!({"model": model_data(), "query": normalized}));
        } else {
            req.respond_result(json!({"get": true}));
        }
    }
    fut.await.expect("subscribe task").expect("subscribe failed")
}

/// Like [`subscribe_query_model`] for `test.collection?<raw_query>`.
pub async fn subscribe_query_collection(
    h: &Harness,
    client: &TestClient,
    raw_query: &str,
    normalized: &str,
) -> Resources {
    let rid = format!("test.collection?{}", raw_query);
    let conn = client.conn.clone();
    let fut = tokio::spawn(async move { conn.subscribe(&rid).await });
    for _ in 0..2 {
        let req = h.bus.next_request().await;
        if req.subject.starts_with("get.") {
            assert_eq!(req.json(), json!({"query": raw_query}));
            req.respond_result(json!({"collection": collection_data(), "query": normalized}));
        } else {
            req.respond_result(json!({"get": true}));
        }
    }
    fut.await.expect("subscribe task").expect("subscribe failed")
}

/// Subscribe expecting an error result.
pub async fn subscribe_expect_error(
    h: &Harness,
    client: &TestClient,
    rid: &str,
    get_response: impl FnOnce(MockRequest),
    access_response: impl FnOnce(MockRequest),
) -> RError {
    let conn = client.conn.clone();
    let rid_owned = rid.to_string();
    let fut = tokio::spawn(async move { conn.subscribe(&rid_owned).await });
    let mut get_response = Some(get_response);
    let mut access_response = Some(access_response);
    for _ in 0..2 {
        let req = h.bus.next_request().await;
        if req.subject.starts_with("get.") {
            (get_response.take().expect("one get request"))(req);
        } else {
            (access_response.take().expect("one access request"))(req);
        }
    }
    fut.await
        .expect("subscribe task")
        .expect_err("subscribe unexpectedly succeeded")
}

pub fn resources_json(resources: &Resources) -> serde_json::Value {
    serde_json::to_value(resources).expect("serialize resources")
}
