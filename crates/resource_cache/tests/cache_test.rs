//! Cache behaviour against a scripted bus.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::bus::MockBus;
use common::{RError, Resource, Rid};
use resource_cache::{Cache, LoadedResource, ResourceEvent, Subscriber};
use serde_json::json;
use tokio::sync::mpsc;

enum SubEvent {
    Loaded(Result<LoadedResource, RError>),
    Event(Arc<ResourceEvent>),
}

struct TestSubscriber {
    cid: String,
    tx: mpsc::UnboundedSender<SubEvent>,
}

impl Subscriber for TestSubscriber {
    fn cid(&self) -> &str {
        &self.cid
    }

    fn loaded(&self, result: Result<LoadedResource, RError>) -> bool {
        self.tx.send(SubEvent::Loaded(result)).is_ok()
    }

    fn event(&self, event: Arc<ResourceEvent>) {
        let _ = self.tx.send(SubEvent::Event(event));
    }
}

struct SubProbe {
    rx: mpsc::UnboundedReceiver<SubEvent>,
}

impl SubProbe {
    async fn next(&mut self) -> SubEvent {
        tokio::time::timeout(Duration::from_secs(1), self.rx.recv())
            .await
            .expect("timed out waiting for a subscriber callback")
            .expect("subscriber channel closed")
    }

    async fn expect_loaded(&mut self) -> LoadedResource {
        match self.next().await {
            SubEvent::Loaded(Ok(loaded)) => loaded,
            SubEvent::Loaded(Err(err)) => panic!("load failed: {}", err),
            SubEvent::Event(ev) => panic!("expected loaded, got event {:?}", ev),
        }
    }

    async fn expect_load_error(&mut self) -> RError {
        match self.next().await {
            SubEvent::Loaded(Err(err)) => err,
            SubEvent::Loaded(Ok(_)) => panic!("expected a load error, got a resource"),
            SubEvent::Event(ev) => panic!("expected loaded, got event {:?}", ev),
        }
    }

    async fn expect_event(&mut self) -> Arc<ResourceEvent> {
        match self.next().await {
            SubEvent::Event(ev) => ev,
            SubEvent::Loaded(_) => panic!("expected an event, got a load result"),
        }
    }

    async fn assert_quiet(&mut self) {
        if let Ok(Some(_)) = tokio::time::timeout(Duration::from_millis(50), self.rx.recv()).await {
            panic!("unexpected subscriber callback");
        }
    }
}

fn probe() -> (Arc<TestSubscriber>, SubProbe) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Arc::new(TestSubscriber {
            cid: "test-conn".to_string(),
            tx,
        }),
        SubProbe { rx },
    )
}

fn model_data() -> serde_json::Value {
    json!({"string": "foo", "int": 42, "bool": true, "null": null})
}

async fn serve_get(bus: &MockBus, name: &str, result: serde_json::Value) {
    let req = bus.next_request().await;
    assert_eq!(req.subject, format!("get.{}", name));
    req.respond_result(result);
}

#[tokio::test]
async fn loads_a_model_once_and_reuses_the_entry() {
    let bus = Arc::new(MockBus::new());
    let cache = Cache::start(bus.clone());
    let rid = Rid::parse("test.model").unwrap();

    let (sub1, mut probe1) = probe();
    cache.subscribe(&rid, sub1);
    let req = bus.next_request().await;
    assert_eq!(req.subject, "get.test.model");
    assert!(req.payload.is_empty());
    req.respond_result(json!({"model": model_data()}));

    let loaded = probe1.expect_loaded().await;
    assert_eq!(loaded.handle.rid().as_str(), "test.model");
    match &loaded.resource {
        Resource::Model(m) => assert_eq!(m.values.len(), 4),
        _ => panic!("expected a model"),
    }

    // A second subscriber is served from the cache.
    let (sub2, mut probe2) = probe();
    cache.subscribe(&rid, sub2);
    probe2.expect_loaded().await;
    bus.assert_no_request().await;

    cache.stop();
}

#[tokio::test]
async fn concurrent_loads_coalesce_into_one_request() {
    let bus = Arc::new(MockBus::new());
    let cache = Cache::start(bus.clone());
    let rid = Rid::parse("test.model").unwrap();

    let (sub1, mut probe1) = probe();
    let (sub2, mut probe2) = probe();
    cache.subscribe(&rid, sub1);
    cache.subscribe(&rid, sub2);

    serve_get(&bus, "test.model", json!({"model": model_data()})).await;
    probe1.expect_loaded().await;
    probe2.expect_loaded().await;
    bus.assert_no_request().await;

    cache.stop();
}

#[tokio::test]
async fn change_events_mutate_and_fan_out_the_actual_delta() {
    let bus = Arc::new(MockBus::new());
    let cache = Cache::start(bus.clone());
    let rid = Rid::parse("test.model").unwrap();

    let (sub, mut probe1) = probe();
    cache.subscribe(&rid, sub);
    serve_get(&bus, "test.model", json!({"model": model_data()})).await;
    probe1.expect_loaded().await;

    // "bool" is unchanged and must be omitted from the delta.
    bus.emit_json(
        "event.test.model.change",
        json!({"values": {"string": "bar", "bool": true}}),
    );
    match &*probe1.expect_event().await {
        ResourceEvent::Change { values, old_values } => {
            assert_eq!(values.len(), 1);
            assert_eq!(serde_json::to_value(values).unwrap(), json!({"string": "bar"}));
            assert_eq!(serde_json::to_value(old_values).unwrap(), json!({"string": "foo"}));
        }
        other => panic!("unexpected event: {:?}", other),
    }

    // A change that is entirely a no-op fans out nothing.
    bus.emit_json("event.test.model.change", json!({"values": {"string": "bar"}}));
    probe1.assert_quiet().await;

    // A new subscriber sees the mutated state.
    let (sub2, mut probe2) = probe();
    cache.subscribe(&rid, sub2);
    let loaded = probe2.expect_loaded().await;
    match &loaded.resource {
        Resource::Model(m) => {
            assert_eq!(serde_json::to_value(&m.values["string"]).unwrap(), json!("bar"))
        }
        _ => panic!("expected a model"),
    }

    cache.stop();
}

#[tokio::test]
async fn malformed_events_are_dropped_without_poisoning_the_cache() {
    let bus = Arc::new(MockBus::new());
    let cache = Cache::start(bus.clone());
    let rid = Rid::parse("test.collection").unwrap();

    let (sub, mut probe) = probe();
    cache.subscribe(&rid, sub);
    serve_get(&bus, "test.collection", json!({"collection": ["a", "b"]})).await;
    probe.expect_loaded().await;

    bus.emit_json("event.test.collection.add", json!({"idx": 9, "value": "x"}));
    bus.emit("event.test.collection.add", Bytes::from_static(b"not json"));
    probe.assert_quiet().await;

    // The cache still works afterwards.
    bus.emit_json("event.test.collection.add", json!({"idx": 0, "value": "x"}));
    match &*probe.expect_event().await {
        ResourceEvent::Add { idx: 0, .. } => {}
        other => panic!("unexpected event: {:?}", other),
    }

    cache.stop();
}

#[tokio::test]
async fn events_arriving_during_load_apply_on_top_of_the_snapshot() {
    let bus = Arc::new(MockBus::new());
    let cache = Cache::start(bus.clone());
    let rid = Rid::parse("test.model").unwrap();

    let (sub, mut probe) = probe();
    cache.subscribe(&rid, sub);
    let get = bus.next_request().await;

    // The event races the get reply.
    bus.emit_json("event.test.model.change", json!({"values": {"string": "raced"}}));
    tokio::time::sleep(Duration::from_millis(20)).await;
    get.respond_result(json!({"model": model_data()}));

    let loaded = probe.expect_loaded().await;
    match &loaded.resource {
        Resource::Model(m) => {
            // The snapshot predates the buffered event.
            assert_eq!(serde_json::to_value(&m.values["string"]).unwrap(), json!("foo"))
        }
        _ => panic!("expected a model"),
    }
    match &*probe.expect_event().await {
        ResourceEvent::Change { values, .. } => {
            assert_eq!(serde_json::to_value(values).unwrap(), json!({"string": "raced"}))
        }
        other => panic!("unexpected event: {:?}", other),
    }

    cache.stop();
}

#[tokio::test]
async fn delete_event_disposes_every_subscriber_and_the_entry() {
    let bus = Arc::new(MockBus::new());
    let cache = Cache::start(bus.clone());
    let rid = Rid::parse("test.model").unwrap();

    let (sub, mut probe1) = probe();
    cache.subscribe(&rid, sub);
    serve_get(&bus, "test.model", json!({"model": model_data()})).await;
    probe1.expect_loaded().await;

    bus.emit_json("event.test.model.delete", json!(null));
    assert!(matches!(&*probe1.expect_event().await, ResourceEvent::Delete));

    // The entry is gone: a fresh subscribe loads from the backend.
    let (sub2, mut probe2) = probe();
    cache.subscribe(&rid, sub2);
    serve_get(&bus, "test.model", json!({"model": model_data()})).await;
    probe2.expect_loaded().await;

    cache.stop();
}

#[tokio::test]
async fn unsubscribing_the_last_handle_drops_the_entry() {
    let bus = Arc::new(MockBus::new());
    let cache = Cache::start(bus.clone());
    let rid = Rid::parse("test.model").unwrap();

    let (sub, mut probe1) = probe();
    cache.subscribe(&rid, sub);
    serve_get(&bus, "test.model", json!({"model": model_data()})).await;
    let loaded = probe1.expect_loaded().await;

    loaded.handle.unsubscribe();
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Resubscribing hits the backend again.
    let (sub2, mut probe2) = probe();
    cache.subscribe(&rid, sub2);
    serve_get(&bus, "test.model", json!({"model": model_data()})).await;
    probe2.expect_loaded().await;

    cache.stop();
}

#[tokio::test]
async fn load_errors_and_timeouts_reach_the_subscriber() {
    let bus = Arc::new(MockBus::new());
    let cache = Cache::start(bus.clone());

    let (sub, mut probe1) = probe();
    cache.subscribe(&Rid::parse("test.missing").unwrap(), sub);
    let req = bus.next_request().await;
    req.respond_error("system.notFound", "Not found");
    assert!(probe1.expect_load_error().await.is_not_found());

    let (sub, mut probe2) = probe();
    cache.subscribe(&Rid::parse("test.slow").unwrap(), sub);
    let req = bus.next_request().await;
    req.respond_timeout();
    assert_eq!(probe2.expect_load_error().await.code, "system.timeout");

    cache.stop();
}

#[tokio::test]
async fn query_normalisation_merges_views() {
    let bus = Arc::new(MockBus::new());
    let cache = Cache::start(bus.clone());

    let (sub1, mut probe1) = probe();
    cache.subscribe(&Rid::parse("test.model?q=foo&f=bar").unwrap(), sub1);
    let req = bus.next_request().await;
    assert_eq!(req.json(), json!({"query": "q=foo&f=bar"}));
    req.respond_result(json!({"model": model_data(), "query": "f=bar&q=foo"}));
    let loaded = probe1.expect_loaded().await;
    assert_eq!(loaded.handle.query(), "f=bar&q=foo");

    // A raw query that normalises onto the same view merges with it.
    let (sub2, mut probe2) = probe();
    cache.subscribe(&Rid::parse("test.model?f=bar&q=foo&fake=1").unwrap(), sub2);
    let req = bus.next_request().await;
    req.respond_result(json!({"model": model_data(), "query": "f=bar&q=foo"}));
    let loaded = probe2.expect_loaded().await;
    assert_eq!(loaded.handle.query(), "f=bar&q=foo");

    // Both raw forms are now links; neither triggers another get.
    let (sub3, mut probe3) = probe();
    cache.subscribe(&Rid::parse("test.model?q=foo&f=bar").unwrap(), sub3);
    probe3.expect_loaded().await;
    bus.assert_no_request().await;

    cache.stop();
}

#[tokio::test]
async fn access_decisions_are_cached_per_resource_and_token() {
    let bus = Arc::new(MockBus::new());
    let cache = Cache::start(bus.clone());
    let rid = Rid::parse("test.model").unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let tx1 = tx.clone();
    cache.access(&rid, None, "cid1", Box::new(move |result| {
        let _ = tx1.send(result);
    }));
    let req = bus.next_request().await;
    assert_eq!(req.subject, "access.test.model");
    assert_eq!(req.json(), json!({"cid": "cid1", "token": null}));
    req.respond_result(json!({"get": true, "call": "*"}));
    let access = rx.recv().await.unwrap().unwrap();
    assert!(access.can_get().is_ok());
    assert!(access.can_call("anything").is_ok());

    // Same key: served from the cache.
    let tx2 = tx.clone();
    cache.access(&rid, None, "cid1", Box::new(move |result| {
        let _ = tx2.send(result);
    }));
    assert!(rx.recv().await.unwrap().is_ok());
    bus.assert_no_request().await;

    // A different token is a different decision.
    let tx3 = tx.clone();
    cache.access(
        &rid,
        Some(json!({"user": "a"})),
        "cid1",
        Box::new(move |result| {
            let _ = tx3.send(result);
        }),
    );
    let req = bus.next_request().await;
    req.respond_result(json!({"get": false}));
    assert!(rx.recv().await.unwrap().unwrap().can_get().is_err());

    cache.stop();
}

#[tokio::test]
async fn reaccess_invalidates_access_and_notifies_subscribers() {
    let bus = Arc::new(MockBus::new());
    let cache = Cache::start(bus.clone());
    let rid = Rid::parse("test.model").unwrap();

    let (sub, mut probe) = probe();
    cache.subscribe(&rid, sub);
    serve_get(&bus, "test.model", json!({"model": model_data()})).await;
    probe.expect_loaded().await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let tx1 = tx.clone();
    cache.access(&rid, None, "cid1", Box::new(move |result| {
        let _ = tx1.send(result);
    }));
    bus.next_request().await.respond_result(json!({"get": true}));
    assert!(rx.recv().await.unwrap().is_ok());

    bus.emit_json("event.test.model.reaccess", json!(null));
    assert!(matches!(&*probe.expect_event().await, ResourceEvent::Reaccess));

    // The cached decision is gone; the next check hits the backend.
    let tx2 = tx.clone();
    cache.access(&rid, None, "cid1", Box::new(move |result| {
        let _ = tx2.send(result);
    }));
    bus.next_request().await.respond_result(json!({"get": true}));
    assert!(rx.recv().await.unwrap().is_ok());

    cache.stop();
}

#[tokio::test]
async fn uncached_access_errors_retry() {
    let bus = Arc::new(MockBus::new());
    let cache = Cache::start(bus.clone());
    let rid = Rid::parse("test.model").unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let tx1 = tx.clone();
    cache.access(&rid, None, "cid1", Box::new(move |result| {
        let _ = tx1.send(result);
    }));
    bus.next_request().await.respond_error("system.internalError", "boom");
    assert_eq!(rx.recv().await.unwrap().unwrap_err().code, "system.internalError");

    // The error was not cached: the next check issues a new request.
    let tx2 = tx.clone();
    cache.access(&rid, None, "cid1", Box::new(move |result| {
        let _ = tx2.send(result);
    }));
    bus.next_request().await.respond_error("system.accessDenied", "Access denied");
    assert!(rx.recv().await.unwrap().unwrap_err().is_access_denied());

    // The denial is cached.
    let tx3 = tx.clone();
    cache.access(&rid, None, "cid1", Box::new(move |result| {
        let _ = tx3.send(result);
    }));
    assert!(rx.recv().await.unwrap().unwrap_err().is_access_denied());
    bus.assert_no_request().await;

    cache.stop();
}
