//! Query-event coordination.
//!
//! A service publishes a `query` event with a reply subject to say
//! "some query-views of this resource may have changed", without
//! knowing which views exist. The coordinator materialises the set of
//! distinct normalised queries currently held, issues one backend
//! request per distinct query, and turns each reply into client-facing
//! events for that view's subscribers.
//!
//! While the requests are in flight the entry is locked: later bus
//! events queue behind the synthetic ones, so every subscription
//! observes the synthetic events first, then the queued real events,
//! in bus order.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use common::bus::BusError;
use common::{RError, Resource, Value};
use metrics::counter;
use tracing::{debug, error};

use crate::cache::{rerror_from_bus, CacheState};
use crate::codec::{self, QueryResult, SyntheticEvent};
use crate::diff::{self, CollectionOp};
use crate::entry::ViewState;
use crate::subscriber::ResourceEvent;

pub(crate) fn handle_query_event(state: &mut CacheState, name: &str, payload: Bytes) {
    let subject = match codec::parse_query_event(&payload) {
        Ok(subject) => subject,
        Err(err) => {
            error!("Invalid query event for {}: {}", name, err);
            counter!("cache_invalid_query_events_total").increment(1);
            return;
        }
    };

    let queries: Vec<String> = {
        let entry = match state.entries.get_mut(name) {
            Some(entry) => entry,
            None => return,
        };
        // Only loaded query views take part. Views still loading are
        // skipped: their pending get reply already reflects the latest
        // state. A resource with no query views produces no requests.
        entry
            .views
            .iter()
            .filter(|(query, view)| !query.is_empty() && view.state == ViewState::Loaded)
            .map(|(query, _)| query.clone())
            .collect()
    };
    if queries.is_empty() {
        return;
    }

    if let Some(entry) = state.entries.get_mut(name) {
        entry.lock_count += queries.len();
    }

    for query in queries {
        let bus = state.bus.clone();
        let cache = state.cache.clone();
        let subject = subject.clone();
        let name = name.to_string();
        let payload = codec::to_bytes(&serde_json::json!({ "query": query }));

        counter!("cache_query_requests_total").increment(1);
        tokio::spawn(async move {
            let result = bus.request(&subject, payload).await;
            cache.enqueue(Box::new(move |state| {
                handle_query_response(state, &name, &query, result);
            }));
        });
    }
}

fn handle_query_response(
    state: &mut CacheState,
    name: &str,
    query: &str,
    result: Result<Bytes, BusError>,
) {
    apply_query_response(state, name, query, result);

    // Release this request's share of the lock; when the last one
    // resolves, drain the events that queued behind it.
    let entry = match state.entries.get_mut(name) {
        Some(entry) => entry,
        None => return,
    };
    entry.lock_count = entry.lock_count.saturating_sub(1);
    if entry.lock_count > 0 {
        return;
    }
    loop {
        let entry = match state.entries.get_mut(name) {
            Some(entry) => entry,
            None => return,
        };
        if entry.lock_count > 0 {
            // Draining surfaced another query event which re-locked.
            return;
        }
        let (event, payload) = match entry.queued.pop_front() {
            Some(queued) => queued,
            None => return,
        };
        state.process_event(name, &event, payload);
    }
}

fn apply_query_response(
    state: &mut CacheState,
    name: &str,
    query: &str,
    result: Result<Bytes, BusError>,
) {
    let parsed = result
        .map_err(rerror_from_bus)
        .and_then(|payload| codec::parse_query_response(&payload));

    match parsed {
        Ok(QueryResult::Events(events)) => apply_synthetic_events(state, name, query, events),
        Ok(QueryResult::Model(model)) => {
            apply_model_snapshot(state, name, query, model.values);
        }
        Ok(QueryResult::Collection(collection)) => {
            apply_collection_snapshot(state, name, query, collection.values);
        }
        Ok(QueryResult::None) => {}
        Err(err) if err.is_not_found() => {
            // The view is gone; subscribers observe a delete.
            debug!("Query view {}?{} no longer exists", name, query);
            dispose_view(state, name, query);
        }
        Err(err) => {
            // Transient: later query events are still served.
            error!("Query request for {}?{} failed: {}", name, query, err);
            counter!("cache_query_errors_total").increment(1);
        }
    }
}

fn apply_synthetic_events(
    state: &mut CacheState,
    name: &str,
    query: &str,
    events: Vec<SyntheticEvent>,
) {
    for synthetic in events {
        if synthetic.event == "delete" {
            dispose_view(state, name, query);
            return;
        }
        let applied = apply_synthetic_event(state, name, query, &synthetic);
        if let Err(err) = applied {
            error!(
                "Discarding {} event from query reply for {}?{}: {}",
                synthetic.event, name, query, err
            );
            counter!("cache_query_errors_total").increment(1);
            return;
        }
    }
}

fn apply_synthetic_event(
    state: &mut CacheState,
    name: &str,
    query: &str,
    synthetic: &SyntheticEvent,
) -> Result<(), RError> {
    let data = synthetic.data.clone().unwrap_or(serde_json::Value::Null);
    let view = match state.entries.get_mut(name).and_then(|e| e.views.get_mut(query)) {
        Some(view) => view,
        None => return Ok(()),
    };
    let event = match synthetic.event.as_str() {
        "change" => {
            let change = codec::parse_change_data(data)?;
            view.apply_change(change.values)?
        }
        "add" => {
            let add = codec::parse_add_data(data)?;
            Some(view.apply_add(add.idx, add.value)?)
        }
        "remove" => {
            let remove = codec::parse_remove_data(data)?;
            Some(view.apply_remove(remove.idx)?)
        }
        other => {
            return Err(RError::internal_error(format!(
                "unsupported event {} in query reply",
                other
            )))
        }
    };
    if let Some(event) = event {
        view.fan_out(Arc::new(event));
    }
    Ok(())
}

/// Diff a full model reply against the cached view and emit a single
/// minimal change event.
fn apply_model_snapshot(
    state: &mut CacheState,
    name: &str,
    query: &str,
    new_values: HashMap<String, Value>,
) {
    let view = match state.entries.get_mut(name).and_then(|e| e.views.get_mut(query)) {
        Some(view) => view,
        None => return,
    };
    let model = match &mut view.resource {
        Some(Resource::Model(model)) => model,
        _ => {
            error!("Query reply for {}?{} carries a model for a non-model view", name, query);
            counter!("cache_query_errors_total").increment(1);
            return;
        }
    };
    let (changed, old_values) = diff::model_diff(&model.values, &new_values);
    if changed.is_empty() {
        return;
    }
    model.values = new_values;
    view.fan_out(Arc::new(ResourceEvent::Change {
        values: changed,
        old_values,
    }));
}

/// Diff a full collection reply against the cached view and emit the
/// remove/add sequence that transforms the old into the new.
fn apply_collection_snapshot(
    state: &mut CacheState,
    name: &str,
    query: &str,
    new_values: Vec<Value>,
) {
    let view = match state.entries.get_mut(name).and_then(|e| e.views.get_mut(query)) {
        Some(view) => view,
        None => return,
    };
    let ops = match &view.resource {
        Some(Resource::Collection(collection)) => {
            diff::collection_diff(&collection.values, &new_values)
        }
        _ => {
            error!(
                "Query reply for {}?{} carries a collection for a non-collection view",
                name, query
            );
            counter!("cache_query_errors_total").increment(1);
            return;
        }
    };
    for op in ops {
        let event = match op {
            CollectionOp::Remove { idx } => view.apply_remove(idx),
            CollectionOp::Add { idx, value } => view.apply_add(idx, value),
        };
        match event {
            Ok(event) => view.fan_out(Arc::new(event)),
            // The ops were derived from the cached values; a failure
            // here means the view changed underneath us.
            Err(err) => {
                error!("Failed to apply query diff for {}?{}: {}", name, query, err);
                counter!("cache_query_errors_total").increment(1);
                return;
            }
        }
    }
}

/// Drop one query view: its subscribers observe a delete. Sibling
/// views are untouched; a direct delete event on the resource is what
/// removes them all.
fn dispose_view(state: &mut CacheState, name: &str, query: &str) {
    let view = {
        let entry = match state.entries.get_mut(name) {
            Some(entry) => entry,
            None => return,
        };
        let view = match entry.views.remove(query) {
            Some(view) => view,
            None => return,
        };
        entry.links.retain(|_, target| target != query);
        view
    };

    let event = Arc::new(ResourceEvent::Delete);
    for (_, sub) in view.pending {
        sub.loaded(Err(RError::not_found()));
    }
    for (_, sub) in view.subscribers {
        sub.event(event.clone());
    }
    state.drop_entry_if_unused(name);
}
