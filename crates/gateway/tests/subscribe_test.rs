//! Subscribe flow: snapshots, reference expansion, error surfacing.

mod util;

use gateway::ConnConfig;
use serde_json::json;
use util::*;

#[tokio::test]
async fn subscribe_returns_the_model_snapshot() {
    let h = Harness::new();
    let client = h.connect();

    let resources = subscribe(&h, &client, "test.model", json!({"model": model_data()})).await;
    assert_eq!(
        resources_json(&resources),
        json!({"models": {"test.model": model_data()}})
    );
    client.assert_no_event().await;
}

#[tokio::test]
async fn subscribe_returns_the_collection_snapshot() {
    let h = Harness::new();
    let client = h.connect();

    let resources = subscribe(
        &h,
        &client,
        "test.collection",
        json!({"collection": collection_data()}),
    )
    .await;
    assert_eq!(
        resources_json(&resources),
        json!({"collections": {"test.collection": collection_data()}})
    );
}

#[tokio::test]
async fn second_connection_is_served_from_the_cache() {
    let h = Harness::new();
    let c1 = h.connect();
    subscribe(&h, &c1, "test.model", json!({"model": model_data()})).await;

    let c2 = h.connect();
    let resources = subscribe_cached(&h, &c2, "test.model").await;
    assert_eq!(
        resources_json(&resources),
        json!({"models": {"test.model": model_data()}})
    );
    h.bus.assert_no_request().await;
}

#[tokio::test]
async fn invalid_rids_are_rejected_without_backend_work() {
    let h = Harness::new();
    let client = h.connect();

    for rid in ["", "test..model", ".model", "test.*", "test.mo del"] {
        let err = client.conn.subscribe(rid).await.unwrap_err();
        assert_eq!(err.code, "system.invalidRequest", "rid {:?}", rid);
    }
    h.bus.assert_no_request().await;
}

#[tokio::test]
async fn access_denial_fails_the_subscribe() {
    let h = Harness::new();
    let client = h.connect();

    let err = subscribe_expect_error(
        &h,
        &client,
        "test.model",
        |get| get.respond_result(json!({"model": model_data()})),
        |access| access.respond_result(json!({"get": false})),
    )
    .await;
    assert!(err.is_access_denied());

    // The denied subscription did not stick.
    let err = client.conn.unsubscribe("test.model").await.unwrap_err();
    assert_eq!(err.code, "system.noSubscription");
}

#[tokio::test]
async fn load_errors_surface_as_the_subscribe_response() {
    let h = Harness::new();
    let client = h.connect();

    let err = subscribe_expect_error(
        &h,
        &client,
        "test.model",
        |get| get.respond_error("system.notFound", "Not found"),
        |access| access.respond_result(json!({"get": true})),
    )
    .await;
    assert!(err.is_not_found());
}

#[tokio::test]
async fn request_timeouts_are_indistinguishable_from_service_errors() {
    let h = Harness::new();
    let client = h.connect();

    let err = subscribe_expect_error(
        &h,
        &client,
        "test.model",
        |get| get.respond_timeout(),
        |access| access.respond_result(json!({"get": true})),
    )
    .await;
    assert_eq!(err.code, "system.timeout");
}

#[tokio::test]
async fn subscription_limit_is_enforced() {
    let h = Harness::new();
    let client = h.connect_with_config(ConnConfig {
        subscription_limit: 1,
    });

    subscribe(&h, &client, "test.model", json!({"model": model_data()})).await;
    let err = client.conn.subscribe("test.other").await.unwrap_err();
    assert_eq!(err.code, "system.subscriptionLimitExceeded");
    h.bus.assert_no_request().await;
}

#[tokio::test]
async fn references_expand_into_embedded_children() {
    let h = Harness::new();
    let client = h.connect();

    let conn = client.conn.clone();
    let fut = tokio::spawn(async move { conn.subscribe("test.parent").await });
    for _ in 0..2 {
        let req = h.bus.next_request().await;
        match req.subject.as_str() {
            "get.test.parent" => req.respond_result(
                json!({"model": {"name": "parent", "child": {"rid": "test.child"}}}),
            ),
            "access.test.parent" => req.respond_result(json!({"get": true})),
            other => panic!("unexpected request to {}", other),
        }
    }
    // The child is an indirect subscription: a get, no access check.
    let req = h.bus.next_request().await;
    assert_eq!(req.subject, "get.test.child");
    req.respond_result(json!({"model": {"name": "child"}}));

    let resources = fut.await.unwrap().unwrap();
    assert_eq!(
        resources_json(&resources),
        json!({"models": {
            "test.parent": {"name": "parent", "child": {"rid": "test.child"}},
            "test.child": {"name": "child"},
        }})
    );
    h.bus.assert_no_request().await;
}

#[tokio::test]
async fn failed_children_degrade_into_the_errors_map() {
    let h = Harness::new();
    let client = h.connect();

    let conn = client.conn.clone();
    let fut = tokio::spawn(async move { conn.subscribe("test.parent").await });
    for _ in 0..2 {
        let req = h.bus.next_request().await;
        match req.subject.as_str() {
            "get.test.parent" => req.respond_result(json!({"model": {
                "good": {"rid": "test.good"},
                "bad": {"rid": "test.bad"},
            }})),
            "access.test.parent" => req.respond_result(json!({"get": true})),
            other => panic!("unexpected request to {}", other),
        }
    }
    for _ in 0..2 {
        let req = h.bus.next_request().await;
        match req.subject.as_str() {
            "get.test.good" => req.respond_result(json!({"model": {"name": "good"}})),
            "get.test.bad" => req.respond_error("system.internalError", "boom"),
            other => panic!("unexpected request to {}", other),
        }
    }

    let resources = fut.await.unwrap().unwrap();
    let json = resources_json(&resources);
    assert_eq!(json["models"]["test.parent"]["good"], json!({"rid": "test.good"}));
    assert_eq!(json["models"]["test.good"], json!({"name": "good"}));
    assert_eq!(json["errors"]["test.bad"]["code"], json!("system.internalError"));
}

#[tokio::test]
async fn cyclic_references_resolve() {
    let h = Harness::new();
    let client = h.connect();

    let conn = client.conn.clone();
    let fut = tokio::spawn(async move { conn.subscribe("test.a").await });
    for _ in 0..2 {
        let req = h.bus.next_request().await;
        match req.subject.as_str() {
            "get.test.a" => req.respond_result(json!({"model": {"next": {"rid": "test.b"}}})),
            "access.test.a" => req.respond_result(json!({"get": true})),
            other => panic!("unexpected request to {}", other),
        }
    }
    let req = h.bus.next_request().await;
    assert_eq!(req.subject, "get.test.b");
    req.respond_result(json!({"model": {"next": {"rid": "test.a"}}}));

    let resources = fut.await.unwrap().unwrap();
    assert_eq!(
        resources_json(&resources),
        json!({"models": {
            "test.a": {"next": {"rid": "test.b"}},
            "test.b": {"next": {"rid": "test.a"}},
        }})
    );
}

#[tokio::test]
async fn unsubscribe_releases_the_backend_subscription() {
    let h = Harness::new();
    let client = h.connect();

    subscribe(&h, &client, "test.model", json!({"model": model_data()})).await;
    client.conn.unsubscribe("test.model").await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    // The entry is gone; a new subscribe loads again. Access is still
    // cached, so only the get request goes out.
    let conn = client.conn.clone();
    let fut = tokio::spawn(async move { conn.subscribe("test.model").await });
    let req = h.bus.next_request().await;
    assert_eq!(req.subject, "get.test.model");
    req.respond_result(json!({"model": model_data()}));
    fut.await.unwrap().unwrap();
}

#[tokio::test]
async fn unsubscribing_an_unknown_rid_fails() {
    let h = Harness::new();
    let client = h.connect();
    let err = client.conn.unsubscribe("test.model").await.unwrap_err();
    assert_eq!(err.code, "system.noSubscription");
}

#[tokio::test]
async fn disposed_connections_reject_operations() {
    let h = Harness::new();
    let client = h.connect();
    client.conn.dispose();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let err = client.conn.subscribe("test.model").await.unwrap_err();
    assert_eq!(err.code, "system.disposedSubscription");
}

#[tokio::test]
async fn cid_placeholders_expand_in_backend_subjects() {
    let h = Harness::new();
    let client = h.connect();
    let cid = client.conn.cid().to_string();

    let conn = client.conn.clone();
    let fut = tokio::spawn(async move { conn.subscribe("service.{cid}.prefs").await });
    for _ in 0..2 {
        let req = h.bus.next_request().await;
        if req.subject.starts_with("get.") {
            assert_eq!(req.subject, format!("get.service.{}.prefs", cid));
            req.respond_result(json!({"model": {"theme": "dark"}}));
        } else {
            assert_eq!(req.subject, format!("access.service.{}.prefs", cid));
            req.respond_result(json!({"get": true}));
        }
    }

    // The snapshot stays keyed by the RID as the client requested it.
    let resources = fut.await.unwrap().unwrap();
    assert_eq!(
        resources_json(&resources),
        json!({"models": {"service.{cid}.prefs": {"theme": "dark"}}})
    );
}

#[tokio::test]
async fn can_call_uses_the_cached_access_decision() {
    let h = Harness::new();
    let client = h.connect();

    let conn = client.conn.clone();
    let fut = tokio::spawn(async move { conn.subscribe("test.model").await });
    for _ in 0..2 {
        let req = h.bus.next_request().await;
        if req.subject.starts_with("get.") {
            req.respond_result(json!({"model": model_data()}));
        } else {
            req.respond_result(json!({"get": true, "call": "set,reset"}));
        }
    }
    fut.await.unwrap().unwrap();

    assert!(client.conn.can_call("test.model", "set").await.is_ok());
    assert!(client.conn.can_call("test.model", "rename").await.unwrap_err().is_access_denied());
    h.bus.assert_no_request().await;

    let err = client.conn.can_call("test.unknown", "set").await.unwrap_err();
    assert_eq!(err.code, "system.noSubscription");
}
