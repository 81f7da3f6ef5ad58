//! The cache actor.

use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use common::bus::{BusClient, BusError};
use common::{RError, Rid};
use futures::StreamExt;
use metrics::{counter, gauge};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::access::{Access, AccessCache, AccessKey};
use crate::codec;
use crate::entry::{Entry, View, ViewState};
use crate::query;
use crate::subscriber::{LoadedResource, ResourceEvent, ResourceHandle, SubId, Subscriber};

pub(crate) type CacheJob = Box<dyn FnOnce(&mut CacheState) + Send>;

/// Callback for an access request.
pub type AccessCallback = Box<dyn FnOnce(Result<Access, RError>) + Send>;

/// Handle to the process-wide resource cache.
///
/// Cheap to clone; all clones drive the same actor task. The cache runs
/// until [`Cache::stop`] is called.
#[derive(Clone)]
pub struct Cache {
    tx: mpsc::UnboundedSender<CacheJob>,
    access: Arc<AccessCache>,
    next_sub_id: Arc<AtomicU64>,
}

impl Cache {
    /// Spawn the cache actor on the current runtime.
    pub fn start(bus: Arc<dyn BusClient>) -> Cache {
        let (tx, mut rx) = mpsc::unbounded_channel::<CacheJob>();
        let access = Arc::new(AccessCache::new());
        let cache = Cache {
            tx,
            access: access.clone(),
            next_sub_id: Arc::new(AtomicU64::new(1)),
        };

        let handle = cache.clone();
        tokio::spawn(async move {
            let mut state = CacheState {
                bus,
                cache: handle,
                entries: HashMap::new(),
                access,
                stopped: false,
            };
            while let Some(job) = rx.recv().await {
                job(&mut state);
                if state.stopped {
                    break;
                }
            }
            state.shutdown();
            info!("Resource cache stopped");
        });

        cache
    }

    /// Subscribe to a resource. The result arrives through
    /// [`Subscriber::loaded`]; an existing loaded view answers without
    /// backend work, and concurrent loads of the same view coalesce
    /// into one get request.
    pub fn subscribe(&self, rid: &Rid, sub: Arc<dyn Subscriber>) {
        let sub_id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let name = rid.name().to_string();
        let query = rid.query().to_string();
        self.enqueue(Box::new(move |state| state.subscribe(name, query, sub_id, sub)));
    }

    /// Resolve an access decision for (resource, token). Cached
    /// decisions answer synchronously on the caller's task; misses go
    /// through the cache queue and the backend.
    pub fn access(&self, rid: &Rid, token: Option<serde_json::Value>, cid: &str, cb: AccessCallback) {
        let key = AccessKey::new(rid, token.as_ref());
        if let Some(result) = self.access.get(&key) {
            cb(result);
            return;
        }
        let name = rid.name().to_string();
        let query = rid.query().to_string();
        let cid = cid.to_string();
        self.enqueue(Box::new(move |state| {
            state.request_access(key, name, query, token, cid, cb)
        }));
    }

    /// Stop the actor. Event pumps are aborted; jobs enqueued after the
    /// stop are dropped.
    pub fn stop(&self) {
        self.enqueue(Box::new(|state| state.stopped = true));
    }

    pub(crate) fn enqueue(&self, job: CacheJob) {
        let _ = self.tx.send(job);
    }

    pub(crate) fn enqueue_unsubscribe(&self, name: String, query: String, sub_id: SubId) {
        self.enqueue(Box::new(move |state| state.unsubscribe(&name, &query, sub_id)));
    }
}

pub(crate) struct CacheState {
    pub(crate) bus: Arc<dyn BusClient>,
    pub(crate) cache: Cache,
    pub(crate) entries: HashMap<String, Entry>,
    pub(crate) access: Arc<AccessCache>,
    pub(crate) stopped: bool,
}

impl CacheState {
    fn subscribe(&mut self, name: String, query: String, sub_id: SubId, sub: Arc<dyn Subscriber>) {
        if !self.entries.contains_key(&name) {
            let entry = self.spawn_entry(&name);
            self.entries.insert(name.clone(), entry);
            gauge!("cache_resources").increment(1.0);
        }
        let cache = self.cache.clone();
        let entry = match self.entries.get_mut(&name) {
            Some(entry) => entry,
            None => return,
        };

        // A query the service already normalised maps onto its view.
        let key = entry.links.get(&query).cloned().unwrap_or_else(|| query.clone());

        enum Action {
            Deliver(LoadedResource),
            Load,
            Wait,
        }

        let action = match entry.views.get_mut(&key) {
            Some(view) if view.state == ViewState::Loaded => {
                let resource = match view.resource.clone() {
                    Some(resource) => resource,
                    None => return,
                };
                view.subscribers.push((sub_id, sub.clone()));
                Action::Deliver(LoadedResource {
                    handle: ResourceHandle {
                        cache,
                        name: name.clone(),
                        query: key.clone(),
                        sub_id,
                    },
                    resource,
                })
            }
            Some(view) => {
                view.pending.push((sub_id, sub.clone()));
                Action::Wait
            }
            None => {
                let mut view = View::loading();
                view.pending.push((sub_id, sub.clone()));
                entry.views.insert(key.clone(), view);
                Action::Load
            }
        };

        match action {
            Action::Deliver(loaded) => {
                if !sub.loaded(Ok(loaded)) {
                    self.unsubscribe(&name, &key, sub_id);
                }
            }
            Action::Load => self.request_get(&name, &key),
            Action::Wait => {}
        }
    }

    fn spawn_entry(&self, name: &str) -> Entry {
        let bus = self.bus.clone();
        let cache = self.cache.clone();
        let (ready_tx, ready_rx) = watch::channel(false);
        let pattern = format!("event.{}.*", name);
        let event_prefix = format!("event.{}.", name);
        let entry_name = name.to_string();

        debug!("Subscribing to resource events on {}", pattern);
        let pump = tokio::spawn(async move {
            let mut stream = match bus.subscribe(&pattern).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("Event subscription for {} failed: {}", entry_name, err);
                    cache.enqueue(Box::new(move |state| state.fail_entry(&entry_name)));
                    return;
                }
            };
            let _ = ready_tx.send(true);

            while let Some(msg) = stream.next().await {
                let event = match msg.subject.strip_prefix(&event_prefix) {
                    Some(ev) if !ev.is_empty() && !ev.contains('.') => ev.to_string(),
                    _ => continue,
                };
                let name = entry_name.clone();
                cache.enqueue(Box::new(move |state| {
                    state.handle_event(&name, &event, msg.payload)
                }));
            }
        });

        Entry::new(pump, ready_rx)
    }

    fn request_get(&mut self, name: &str, query: &str) {
        let entry = match self.entries.get(name) {
            Some(entry) => entry,
            None => return,
        };
        let bus = self.bus.clone();
        let cache = self.cache.clone();
        let mut subscribed = entry.subscribed.clone();
        let subject = format!("get.{}", name);
        let payload = if query.is_empty() {
            Bytes::new()
        } else {
            codec::to_bytes(&serde_json::json!({ "query": query }))
        };
        let name = name.to_string();
        let query = query.to_string();

        counter!("cache_get_requests_total").increment(1);
        tokio::spawn(async move {
            // Events must be flowing before the get reply so nothing is
            // missed between snapshot and stream.
            let _ = subscribed.wait_for(|ready| *ready).await;
            let result = bus.request(&subject, payload).await;
            cache.enqueue(Box::new(move |state| {
                state.handle_get_response(&name, &query, result)
            }));
        });
    }

    fn handle_get_response(&mut self, name: &str, key: &str, result: Result<Bytes, BusError>) {
        {
            let entry = match self.entries.get(name) {
                Some(entry) => entry,
                None => return,
            };
            if !matches!(entry.views.get(key), Some(view) if view.state == ViewState::Loading) {
                return;
            }
        }

        let parsed = result
            .map_err(rerror_from_bus)
            .and_then(|payload| codec::parse_get_response(&payload));

        let get = match parsed {
            Ok(get) => get,
            Err(err) => {
                warn!("Failed to load {}?{}: {}", name, key, err);
                let view = self.entries.get_mut(name).and_then(|e| e.views.remove(key));
                if let Some(view) = view {
                    for (_, sub) in view.pending {
                        sub.loaded(Err(err.clone()));
                    }
                }
                self.drop_entry_if_unused(name);
                return;
            }
        };

        // The service's normalised query overrides the raw one for
        // event-topic purposes. Normalisation only applies to gets that
        // carried a query.
        let normalized = if key.is_empty() {
            String::new()
        } else {
            get.query.clone().unwrap_or_else(|| key.to_string())
        };

        if normalized != key {
            debug!("Query for {} normalised: {:?} -> {:?}", name, key, normalized);
            let merged = {
                let entry = match self.entries.get_mut(name) {
                    Some(entry) => entry,
                    None => return,
                };
                entry.links.insert(key.to_string(), normalized.clone());
                // Links that pointed at the raw key follow the move.
                for target in entry.links.values_mut() {
                    if target == key {
                        *target = normalized.clone();
                    }
                }
                let loading = match entry.views.remove(key) {
                    Some(view) => view,
                    None => return,
                };
                if let Some(existing) = entry.views.get_mut(&normalized) {
                    // Another view already owns the normalised query.
                    existing.pending.extend(loading.pending);
                    Some(existing.state)
                } else {
                    entry.views.insert(normalized.clone(), loading);
                    None
                }
            };
            match merged {
                Some(ViewState::Loaded) => {
                    self.settle_view(name, &normalized);
                    return;
                }
                Some(ViewState::Loading) => return,
                None => {}
            }
        }

        if let Some(view) = self.entries.get_mut(name).and_then(|e| e.views.get_mut(&normalized)) {
            view.state = ViewState::Loaded;
            view.resource = Some(get.resource);
        } else {
            return;
        }
        self.settle_view(name, &normalized);

        // Events that raced the get reply apply on top of the snapshot.
        let buffered = match self.entries.get_mut(name).and_then(|e| e.views.get_mut(&normalized)) {
            Some(view) => mem::take(&mut view.buffered),
            None => return,
        };
        for (event, payload) in buffered {
            self.apply_default_view_event(name, &event, payload);
        }
    }

    /// Move a loaded view's pending subscribers into its subscriber
    /// list, delivering the load result to each.
    fn settle_view(&mut self, name: &str, key: &str) {
        let cache = self.cache.clone();
        let mut dead = Vec::new();
        let unused = {
            let view = match self.entries.get_mut(name).and_then(|e| e.views.get_mut(key)) {
                Some(view) => view,
                None => return,
            };
            let resource = match view.resource.clone() {
                Some(resource) => resource,
                None => return,
            };
            let pending = mem::take(&mut view.pending);
            for (sub_id, sub) in pending {
                let loaded = LoadedResource {
                    handle: ResourceHandle {
                        cache: cache.clone(),
                        name: name.to_string(),
                        query: key.to_string(),
                        sub_id,
                    },
                    resource: resource.clone(),
                };
                if sub.loaded(Ok(loaded)) {
                    view.subscribers.push((sub_id, sub));
                } else {
                    dead.push(sub_id);
                }
            }
            view.is_unused()
        };
        for sub_id in dead {
            self.unsubscribe(name, key, sub_id);
        }
        if unused {
            self.remove_view_if_unused(name, key);
        }
    }

    pub(crate) fn unsubscribe(&mut self, name: &str, key: &str, sub_id: SubId) {
        let removed = {
            let view = match self.entries.get_mut(name).and_then(|e| e.views.get_mut(key)) {
                Some(view) => view,
                None => return,
            };
            view.subscribers.retain(|(id, _)| *id != sub_id);
            view.pending.retain(|(id, _)| *id != sub_id);
            view.is_unused()
        };
        if removed {
            self.remove_view_if_unused(name, key);
        }
    }

    fn remove_view_if_unused(&mut self, name: &str, key: &str) {
        if let Some(entry) = self.entries.get_mut(name) {
            if matches!(entry.views.get(key), Some(view) if view.is_unused()) {
                entry.views.remove(key);
                entry.links.retain(|_, target| target != key);
            }
        }
        self.drop_entry_if_unused(name);
    }

    pub(crate) fn drop_entry_if_unused(&mut self, name: &str) {
        let empty = matches!(self.entries.get(name), Some(entry) if entry.views.is_empty());
        if empty {
            if let Some(entry) = self.entries.remove(name) {
                // Dropping the pump unsubscribes from the backend.
                entry.pump.abort();
                gauge!("cache_resources").decrement(1.0);
                debug!("Dropped cache entry {}", name);
            }
        }
    }

    fn fail_entry(&mut self, name: &str) {
        let entry = match self.entries.remove(name) {
            Some(entry) => entry,
            None => return,
        };
        entry.pump.abort();
        gauge!("cache_resources").decrement(1.0);
        let err = RError::internal_error("event subscription failed");
        let event = Arc::new(ResourceEvent::Delete);
        for (_, view) in entry.views {
            for (_, sub) in view.pending {
                sub.loaded(Err(err.clone()));
            }
            for (_, sub) in view.subscribers {
                sub.event(event.clone());
            }
        }
    }

    pub(crate) fn handle_event(&mut self, name: &str, event: &str, payload: Bytes) {
        let locked = match self.entries.get_mut(name) {
            Some(entry) => {
                counter!("cache_events_total").increment(1);
                if entry.lock_count > 0 {
                    // A query event's backend requests are in flight;
                    // later bus events wait behind the synthetic ones.
                    entry.queued.push_back((event.to_string(), payload.clone()));
                    true
                } else {
                    false
                }
            }
            None => return,
        };
        if !locked {
            self.process_event(name, event, payload);
        }
    }

    pub(crate) fn process_event(&mut self, name: &str, event: &str, payload: Bytes) {
        match event {
            "change" | "add" | "remove" => {
                let entry = match self.entries.get_mut(name) {
                    Some(entry) => entry,
                    None => return,
                };
                let apply = match entry.views.get_mut("") {
                    Some(view) if view.state == ViewState::Loading => {
                        view.buffered.push((event.to_string(), payload));
                        return;
                    }
                    Some(_) => true,
                    None => false,
                };
                if apply {
                    self.apply_default_view_event(name, event, payload);
                } else {
                    debug!("Dropping {} event for {}: no default view", event, name);
                }
            }
            "delete" => self.delete_entry(name),
            "reaccess" => {
                self.access.invalidate(name);
                let entry = match self.entries.get(name) {
                    Some(entry) => entry,
                    None => return,
                };
                let event = Arc::new(ResourceEvent::Reaccess);
                for view in entry.views.values() {
                    view.fan_out(event.clone());
                }
            }
            "query" => query::handle_query_event(self, name, payload),
            other => {
                debug!("Dropping unsupported event {} for {}", other, name);
            }
        }
    }

    /// Apply a change/add/remove event to the default view and fan it
    /// out. Malformed payloads are logged and dropped.
    fn apply_default_view_event(&mut self, name: &str, event: &str, payload: Bytes) {
        let view = match self.entries.get_mut(name).and_then(|e| e.views.get_mut("")) {
            Some(view) => view,
            None => return,
        };
        let applied = codec::parse_json(&payload).and_then(|data| match event {
            "change" => {
                let change = codec::parse_change_data(data)?;
                view.apply_change(change.values)
            }
            "add" => {
                let add = codec::parse_add_data(data)?;
                view.apply_add(add.idx, add.value).map(Some)
            }
            "remove" => {
                let remove = codec::parse_remove_data(data)?;
                view.apply_remove(remove.idx).map(Some)
            }
            _ => Ok(None),
        });
        match applied {
            Ok(Some(resource_event)) => view.fan_out(Arc::new(resource_event)),
            Ok(None) => {}
            Err(err) => {
                error!("Discarding {} event for {}: {}", event, name, err);
                counter!("cache_protocol_errors_total").increment(1);
            }
        }
    }

    /// A delete event: every view is gone, every subscription disposes.
    pub(crate) fn delete_entry(&mut self, name: &str) {
        let entry = match self.entries.remove(name) {
            Some(entry) => entry,
            None => return,
        };
        entry.pump.abort();
        gauge!("cache_resources").decrement(1.0);
        counter!("cache_deleted_resources_total").increment(1);
        info!("Resource {} deleted", name);

        let event = Arc::new(ResourceEvent::Delete);
        for (_, view) in entry.views {
            for (_, sub) in view.pending {
                sub.loaded(Err(RError::not_found()));
            }
            for (_, sub) in view.subscribers {
                sub.event(event.clone());
            }
        }
    }

    fn request_access(
        &mut self,
        key: AccessKey,
        name: String,
        query: String,
        token: Option<serde_json::Value>,
        cid: String,
        cb: AccessCallback,
    ) {
        // Re-check under the cache queue; another task may have raced
        // the same miss.
        if let Some(result) = self.access.get(&key) {
            cb(result);
            return;
        }

        let subject = format!("access.{}", name);
        let mut body = serde_json::json!({
            "cid": cid,
            "token": token.unwrap_or(serde_json::Value::Null),
        });
        if !query.is_empty() {
            body["query"] = serde_json::Value::String(query);
        }
        let payload = codec::to_bytes(&body);
        let bus = self.bus.clone();
        let cache = self.cache.clone();

        counter!("cache_access_requests_total").increment(1);
        tokio::spawn(async move {
            let result = bus.request(&subject, payload).await;
            // Decisions are written only under the cache queue.
            cache.enqueue(Box::new(move |state| {
                let result = result
                    .map_err(rerror_from_bus)
                    .and_then(|payload| codec::parse_access_response(&payload));
                state.access.store(&key, &result);
                cb(result);
            }));
        });
    }

    fn shutdown(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.pump.abort();
        }
    }
}

pub(crate) fn rerror_from_bus(err: BusError) -> RError {
    match err {
        BusError::Timeout => RError::timeout(),
        other => RError::internal_error(other.to_string()),
    }
}
