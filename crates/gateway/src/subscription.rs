//! The per-(connection, RID) subscription state machine.
//!
//! A subscription loads its resource from the cache, subscribes to
//! every resource reference it holds (recursively, cycles tolerated),
//! and only then lets the connection flush the initial snapshot. Until
//! that snapshot is released, and again while a reaccess check or a
//! newly referenced child is in flight, incoming events queue in
//! arrival order and drain once the gate clears.
//!
//! Subscriptions live in the connection state map keyed by the RID the
//! client requested; completion callbacks are arena records holding
//! closures over the connection state, fired when their pending count
//! reaches zero.

use std::collections::{HashMap, HashSet};
use std::mem;
use std::sync::Arc;

use common::{rid as ridutil, RError, Resource, Rid, Value};
use metrics::counter;
use resource_cache::{Access, LoadedResource, ResourceEvent};
use tracing::debug;

use crate::conn::{ConnState, PendingChange, SubRef};
use crate::protocol::{ClientEvent, Resources};

/// Event queueing reasons. Events deliver only while the flag is zero.
pub(crate) const QUEUE_LOADING: u8 = 1 << 0;
pub(crate) const QUEUE_REACCESS: u8 = 1 << 1;

const FLAG_ACCESS_CALLED: u8 = 1 << 0;
const FLAG_REACCESS: u8 = 1 << 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum SubState {
    Disposed,
    Loading,
    Loaded,
    Ready,
    ToSend,
    Sent,
}

pub(crate) type AccessCb = Box<dyn FnOnce(&mut ConnState, Result<Access, RError>) + Send>;
pub(crate) type ReadyCb = Box<dyn FnOnce(&mut ConnState) + Send>;

pub(crate) struct Subscription {
    /// The RID as the client requested it.
    pub rid: String,
    pub name: String,
    pub query: String,
    pub state: SubState,
    pub resource: Option<LoadedResource>,
    /// Child subscriptions by RID, with per-parent occurrence counts.
    pub refs: HashMap<String, Reference>,
    pub err: Option<RError>,
    pub queue_flag: u8,
    pub event_queue: Vec<Arc<ResourceEvent>>,
    /// Ready-callback arena ids waiting on this subscription's load.
    pub ready_cbs: Vec<u64>,
    pub access: Option<Result<Access, RError>>,
    pub access_cbs: Vec<AccessCb>,
    pub flags: u8,
    pub direct: usize,
    pub indirect: usize,
}

pub(crate) struct Reference {
    pub count: usize,
}

/// Waits for a subscription tree to become ready. `ref_map` breaks
/// reference cycles; `loading` counts subscriptions still expanding.
pub(crate) struct ReadyCallback {
    ref_map: HashSet<String>,
    loading: usize,
    cb: Option<ReadyCb>,
}

impl Subscription {
    pub fn is_ready(&self) -> bool {
        self.state >= SubState::Ready
    }

    pub fn is_sent(&self) -> bool {
        self.state == SubState::Sent
    }

    fn error(&self) -> Option<RError> {
        if self.state == SubState::Disposed {
            return Some(RError::disposed_subscription());
        }
        self.err.clone()
    }

    fn resource_type(&self) -> Option<common::ResourceType> {
        self.resource.as_ref().map(|lr| lr.resource.resource_type())
    }
}

/// Create or reuse a subscription for `rid`. Direct subscribes come
/// from the client; indirect ones from reference expansion.
pub(crate) fn subscribe(state: &mut ConnState, rid: &str, direct: bool) -> Result<(), RError> {
    if state.disposed {
        return Err(RError::disposed_subscription());
    }
    if let Some(sub) = state.subs.get_mut(rid) {
        if direct {
            sub.direct += 1;
        } else {
            sub.indirect += 1;
        }
        return Ok(());
    }
    if state.subs.len() >= state.config.subscription_limit {
        return Err(RError::subscription_limit_exceeded());
    }

    let expanded = ridutil::expand_cid(rid, &state.cid);
    let parsed = Rid::parse(&expanded)?;

    let sub = Subscription {
        rid: rid.to_string(),
        name: parsed.name().to_string(),
        query: parsed.query().to_string(),
        state: SubState::Loading,
        resource: None,
        refs: HashMap::new(),
        err: None,
        queue_flag: QUEUE_LOADING,
        event_queue: Vec::new(),
        ready_cbs: Vec::new(),
        access: None,
        access_cbs: Vec::new(),
        flags: 0,
        direct: if direct { 1 } else { 0 },
        indirect: if direct { 0 } else { 1 },
    };
    state.subs.insert(rid.to_string(), sub);
    counter!("gateway_subscriptions_total").increment(1);

    let sub_ref = Arc::new(SubRef {
        conn: state.handle.clone(),
        rid: rid.to_string(),
    });
    state.cache.subscribe(&parsed, sub_ref);
    Ok(())
}

/// Decrement a subscription's count; at zero (with `try_delete`) the
/// subscription disposes and leaves the connection.
pub(crate) fn unsubscribe_rid(
    state: &mut ConnState,
    rid: &str,
    direct: bool,
    count: usize,
    try_delete: bool,
) {
    let gone = {
        let sub = match state.subs.get_mut(rid) {
            Some(sub) => sub,
            None => return,
        };
        if direct {
            sub.direct = sub.direct.saturating_sub(count);
        } else {
            sub.indirect = sub.indirect.saturating_sub(count);
        }
        sub.direct + sub.indirect == 0
    };
    if try_delete && gone {
        dispose(state, rid);
        state.subs.remove(rid);
    }
}

/// Dispose a subscription: detach from the cache, release children,
/// drop queued work. The entry stays in the connection map (marked
/// disposed) until its counts reach zero.
pub(crate) fn dispose(state: &mut ConnState, rid: &str) {
    let (children, resource) = {
        let sub = match state.subs.get_mut(rid) {
            Some(sub) => sub,
            None => return,
        };
        if sub.state == SubState::Disposed {
            return;
        }
        sub.state = SubState::Disposed;
        sub.ready_cbs.clear();
        sub.event_queue.clear();
        sub.access_cbs.clear();
        let children: Vec<String> = sub.refs.drain().map(|(child, _)| child).collect();
        (children, sub.resource.take())
    };
    for child in children {
        unsubscribe_rid(state, &child, false, 1, true);
    }
    if let Some(loaded) = resource {
        loaded.handle.unsubscribe();
    }
}

/// Cache load callback.
pub(crate) fn loaded(state: &mut ConnState, rid: &str, result: Result<LoadedResource, RError>) {
    let alive = matches!(state.subs.get(rid), Some(sub) if sub.state != SubState::Disposed);
    if !alive {
        // Disposed while loading; detach the view we just got.
        if let Ok(loaded) = result {
            loaded.handle.unsubscribe();
        }
        return;
    }

    match result {
        Err(err) => {
            if let Some(sub) = state.subs.get_mut(rid) {
                sub.err = Some(err);
            }
            done_loading(state, rid);
        }
        Ok(loaded) => {
            if let Some(sub) = state.subs.get_mut(rid) {
                sub.state = SubState::Loaded;
                sub.resource = Some(loaded);
            }
            if !expand_refs(state, rid) {
                return;
            }
            let rcb_ids = match state.subs.get_mut(rid) {
                Some(sub) => mem::take(&mut sub.ready_cbs),
                None => return,
            };
            for rcb_id in rcb_ids {
                collect_refs(state, rid, rcb_id);
            }
        }
    }
}

/// Subscribe to every resource reference in the loaded snapshot.
/// On failure every partial reference is released and the subscription
/// fails as a whole.
fn expand_refs(state: &mut ConnState, rid: &str) -> bool {
    let children: Vec<String> = match state.subs.get(rid).and_then(|s| s.resource.as_ref()) {
        Some(loaded) => loaded.resource.references().iter().map(|r| r.to_string()).collect(),
        None => return true,
    };
    for child in children {
        if let Err(err) = add_reference(state, rid, &child) {
            debug!("Subscription {}: failed to subscribe to {}: {}", rid, child, err);
            let partial: Vec<String> = match state.subs.get_mut(rid) {
                Some(sub) => sub.refs.drain().map(|(c, _)| c).collect(),
                None => return false,
            };
            for child in partial {
                unsubscribe_rid(state, &child, false, 1, true);
            }
            if let Some(sub) = state.subs.get_mut(rid) {
                sub.err = Some(err);
            }
            done_loading(state, rid);
            return false;
        }
    }
    true
}

fn add_reference(state: &mut ConnState, parent: &str, child: &str) -> Result<(), RError> {
    let existing = match state.subs.get_mut(parent) {
        Some(sub) => sub.refs.contains_key(child),
        None => return Err(RError::disposed_subscription()),
    };
    if existing {
        if let Some(reference) = state.subs.get_mut(parent).and_then(|s| s.refs.get_mut(child)) {
            reference.count += 1;
        }
        return Ok(());
    }
    subscribe(state, child, false)?;
    if let Some(sub) = state.subs.get_mut(parent) {
        sub.refs.insert(child.to_string(), Reference { count: 1 });
    }
    Ok(())
}

fn remove_reference(state: &mut ConnState, parent: &str, child: &str) {
    let gone = {
        let reference = match state.subs.get_mut(parent).and_then(|s| s.refs.get_mut(child)) {
            Some(reference) => reference,
            None => return,
        };
        reference.count -= 1;
        reference.count == 0
    };
    if gone {
        if let Some(sub) = state.subs.get_mut(parent) {
            sub.refs.remove(child);
        }
        unsubscribe_rid(state, child, false, 1, true);
    }
}

/// Register a callback fired once the subscription and all of its
/// references, recursively, are done loading.
pub(crate) fn on_ready(state: &mut ConnState, rid: &str, cb: ReadyCb) {
    let ready = match state.subs.get(rid) {
        Some(sub) => sub.is_ready(),
        None => true,
    };
    if ready {
        cb(state);
        return;
    }
    let id = state.alloc_id();
    state.ready_cbs.insert(
        id,
        ReadyCallback {
            ref_map: HashSet::new(),
            loading: 0,
            cb: Some(cb),
        },
    );
    on_loaded(state, rid, id);
}

fn on_loaded(state: &mut ConnState, rid: &str, rcb_id: u64) {
    if let Some(rcb) = state.ready_cbs.get_mut(&rcb_id) {
        rcb.ref_map.insert(rid.to_string());
        rcb.loading += 1;
    }
    let sub_state = match state.subs.get(rid) {
        Some(sub) => sub.state,
        None => SubState::Disposed,
    };
    match sub_state {
        // A disposed subscription never loads; don't wait on it.
        SubState::Disposed => finish_one(state, rcb_id),
        SubState::Loading => {
            if let Some(sub) = state.subs.get_mut(rid) {
                sub.ready_cbs.push(rcb_id);
            }
        }
        _ => collect_refs(state, rid, rcb_id),
    }
}

/// Walk this subscription's references, waiting on any that are not
/// ready yet. References already visited by this callback satisfy it
/// immediately, which is what breaks cycles.
fn collect_refs(state: &mut ConnState, rid: &str, rcb_id: u64) {
    let children: Vec<String> = match state.subs.get(rid) {
        Some(sub) => sub.refs.keys().cloned().collect(),
        None => Vec::new(),
    };
    for child in children {
        let ready = match state.subs.get(&child) {
            Some(sub) => sub.is_ready(),
            None => true,
        };
        let visited = match state.ready_cbs.get(&rcb_id) {
            Some(rcb) => rcb.ref_map.contains(&child),
            None => return,
        };
        if !ready && !visited {
            on_loaded(state, &child, rcb_id);
        }
    }
    finish_one(state, rcb_id);
}

fn finish_one(state: &mut ConnState, rcb_id: u64) {
    let fire = {
        let rcb = match state.ready_cbs.get_mut(&rcb_id) {
            Some(rcb) => rcb,
            None => return,
        };
        rcb.loading -= 1;
        rcb.loading == 0
    };
    if fire {
        if let Some(mut rcb) = state.ready_cbs.remove(&rcb_id) {
            if let Some(cb) = rcb.cb.take() {
                cb(state);
            }
        }
    }
}

/// Loading settled with an error: the subscription is ready (carrying
/// the error) and everything waiting on it advances.
pub(crate) fn done_loading(state: &mut ConnState, rid: &str) {
    let rcb_ids = match state.subs.get_mut(rid) {
        Some(sub) => {
            sub.state = SubState::Ready;
            mem::take(&mut sub.ready_cbs)
        }
        None => return,
    };
    for rcb_id in rcb_ids {
        finish_one(state, rcb_id);
    }
}

/// Build the snapshot for a subscription tree: the resource and every
/// referenced resource the client has not seen, with failed children
/// in the errors map. Visited subscriptions are marked to-send; call
/// [`release_resources`] after the snapshot goes out.
pub(crate) fn collect_resources(state: &mut ConnState, rid: &str) -> Resources {
    let mut resources = Resources::default();
    populate_resources(state, rid, &mut resources);
    resources
}

fn populate_resources(state: &mut ConnState, rid: &str, resources: &mut Resources) {
    let children = {
        let sub = match state.subs.get_mut(rid) {
            Some(sub) => sub,
            None => return,
        };
        if sub.state == SubState::Sent || sub.state == SubState::ToSend {
            return;
        }
        if let Some(err) = sub.error() {
            resources.add_error(rid.to_string(), err);
            return;
        }
        match sub.resource.as_ref().map(|lr| &lr.resource) {
            Some(Resource::Model(model)) => resources.add_model(rid.to_string(), model.clone()),
            Some(Resource::Collection(collection)) => {
                resources.add_collection(rid.to_string(), collection.clone())
            }
            None => return,
        }
        sub.state = SubState::ToSend;
        sub.refs.keys().cloned().collect::<Vec<String>>()
    };
    for child in children {
        populate_resources(state, &child, resources);
    }
}

/// Mark a flushed snapshot as sent and let queued events flow.
pub(crate) fn release_resources(state: &mut ConnState, rid: &str) {
    let children = {
        let sub = match state.subs.get_mut(rid) {
            Some(sub) => sub,
            None => return,
        };
        if sub.state == SubState::Disposed || sub.state == SubState::Sent || sub.err.is_some() {
            return;
        }
        sub.state = SubState::Sent;
        sub.refs.keys().cloned().collect::<Vec<String>>()
    };
    for child in children {
        release_resources(state, &child);
    }
    unqueue_events(state, rid, QUEUE_LOADING);
}

pub(crate) fn queue_events(state: &mut ConnState, rid: &str, reason: u8) {
    if let Some(sub) = state.subs.get_mut(rid) {
        sub.queue_flag |= reason;
    }
}

/// Clear a queueing reason; when none remain, handle any deferred
/// reaccess first, then drain the queue in order. An event that raises
/// the flag again splices the remainder back to the front.
pub(crate) fn unqueue_events(state: &mut ConnState, rid: &str, reason: u8) {
    {
        let sub = match state.subs.get_mut(rid) {
            Some(sub) => sub,
            None => return,
        };
        sub.queue_flag &= !reason;
        if sub.queue_flag != 0 {
            return;
        }
    }

    let deferred_reaccess =
        matches!(state.subs.get(rid), Some(sub) if sub.flags & FLAG_REACCESS != 0);
    if deferred_reaccess {
        handle_reaccess(state, rid);
        let requeued = match state.subs.get(rid) {
            Some(sub) => sub.queue_flag != 0,
            None => return,
        };
        if requeued {
            return;
        }
    }

    let queue = match state.subs.get_mut(rid) {
        Some(sub) => mem::take(&mut sub.event_queue),
        None => return,
    };
    let mut i = 0;
    while i < queue.len() {
        process_event(state, rid, queue[i].clone());
        i += 1;
        let sub = match state.subs.get_mut(rid) {
            Some(sub) => sub,
            None => return,
        };
        if sub.state == SubState::Disposed {
            return;
        }
        if sub.queue_flag != 0 {
            let mut rest = queue[i..].to_vec();
            rest.append(&mut sub.event_queue);
            sub.event_queue = rest;
            return;
        }
    }
}

/// Entry point for cache events, on the connection queue.
pub(crate) fn handle_event(state: &mut ConnState, rid: &str, event: Arc<ResourceEvent>) {
    {
        let sub = match state.subs.get_mut(rid) {
            Some(sub) => sub,
            None => return,
        };
        if sub.state == SubState::Disposed {
            return;
        }
        if matches!(*event, ResourceEvent::Reaccess) {
            // Handled out of band; reaccess does not enter the queue.
        } else {
            // Events before the resource arrived are covered by the
            // snapshot.
            if sub.resource.is_none() {
                return;
            }
            if sub.queue_flag != 0 {
                sub.event_queue.push(event);
                return;
            }
        }
    }
    if matches!(*event, ResourceEvent::Reaccess) {
        reaccess(state, rid);
        return;
    }
    process_event(state, rid, event);
}

fn process_event(state: &mut ConnState, rid: &str, event: Arc<ResourceEvent>) {
    let typ = match state.subs.get(rid).and_then(|s| s.resource_type()) {
        Some(typ) => typ,
        None => return,
    };
    match (&*event, typ) {
        (ResourceEvent::Delete, _) => process_delete(state, rid),
        (ResourceEvent::Change { values, old_values }, common::ResourceType::Model) => {
            process_model_change(state, rid, values.clone(), old_values.clone());
        }
        (ResourceEvent::Add { idx, value }, common::ResourceType::Collection) => {
            process_collection_add(state, rid, *idx, value.clone());
        }
        (ResourceEvent::Remove { idx, value }, common::ResourceType::Collection) => {
            process_collection_remove(state, rid, *idx, value.clone());
        }
        (ResourceEvent::Reaccess, _) => reaccess(state, rid),
        (event, typ) => {
            debug!("Subscription {}: dropping {:?} event on a {}", rid, event, typ);
        }
    }
}

fn process_delete(state: &mut ConnState, rid: &str) {
    state.send(ClientEvent::delete(rid));
    dispose(state, rid);
}

/// A model change. New references subscribe before old ones release,
/// so a value moving between keys never transits through unsubscribed.
/// If any newly referenced child is unsent, the event waits until all
/// such children are ready and goes out with their snapshots embedded.
fn process_model_change(
    state: &mut ConnState,
    rid: &str,
    values: HashMap<String, Value>,
    old_values: HashMap<String, Value>,
) {
    let mut unsent: Vec<String> = Vec::new();
    for value in values.values() {
        if let Value::Reference(child) = value {
            if let Err(err) = add_reference(state, rid, child) {
                debug!("Subscription {}: failed to subscribe to {}: {}", rid, child, err);
                return;
            }
            let sent = matches!(state.subs.get(child.as_str()), Some(sub) if sub.is_sent());
            if !sent && !unsent.contains(child) {
                unsent.push(child.clone());
            }
        }
    }

    for key in values.keys() {
        if let Some(Value::Reference(old_child)) = old_values.get(key) {
            let old_child = old_child.clone();
            remove_reference(state, rid, &old_child);
        }
    }

    if unsent.is_empty() {
        let event = ClientEvent::change(rid, &values, None);
        state.send(event);
        return;
    }

    queue_events(state, rid, QUEUE_LOADING);
    let id = state.alloc_id();
    state.pending_changes.insert(
        id,
        PendingChange {
            parent: rid.to_string(),
            remaining: unsent.len(),
            values,
            children: unsent.clone(),
        },
    );
    for child in unsent {
        on_ready(
            state,
            &child,
            Box::new(move |state| complete_model_change(state, id)),
        );
    }
}

fn complete_model_change(state: &mut ConnState, id: u64) {
    let done = {
        let pending = match state.pending_changes.get_mut(&id) {
            Some(pending) => pending,
            None => return,
        };
        pending.remaining -= 1;
        pending.remaining == 0
    };
    if !done {
        return;
    }
    let pending = match state.pending_changes.remove(&id) {
        Some(pending) => pending,
        None => return,
    };
    let alive = matches!(
        state.subs.get(&pending.parent),
        Some(sub) if sub.state != SubState::Disposed
    );
    if !alive {
        return;
    }

    let mut resources = Resources::default();
    for child in &pending.children {
        populate_resources(state, child, &mut resources);
    }
    let event = ClientEvent::change(
        &pending.parent,
        &pending.values,
        if resources.is_empty() { None } else { Some(&resources) },
    );
    state.send(event);
    for child in &pending.children {
        release_resources(state, child);
    }
    unqueue_events(state, &pending.parent, QUEUE_LOADING);
}

fn process_collection_add(state: &mut ConnState, rid: &str, idx: usize, value: Value) {
    if let Value::Reference(child) = &value {
        if let Err(err) = add_reference(state, rid, child) {
            debug!("Subscription {}: failed to subscribe to {}: {}", rid, child, err);
            return;
        }
        let sent = matches!(state.subs.get(child.as_str()), Some(sub) if sub.is_sent());
        if !sent {
            queue_events(state, rid, QUEUE_LOADING);
            let parent = rid.to_string();
            let child = child.clone();
            let value = value.clone();
            on_ready(
                state,
                &child.clone(),
                Box::new(move |state| {
                    let alive = matches!(
                        state.subs.get(&parent),
                        Some(sub) if sub.state != SubState::Disposed
                    );
                    if !alive {
                        return;
                    }
                    let mut resources = Resources::default();
                    populate_resources(state, &child, &mut resources);
                    let event = ClientEvent::add(
                        &parent,
                        idx,
                        &value,
                        if resources.is_empty() { None } else { Some(&resources) },
                    );
                    state.send(event);
                    release_resources(state, &child);
                    unqueue_events(state, &parent, QUEUE_LOADING);
                }),
            );
            return;
        }
    }
    let event = ClientEvent::add(rid, idx, &value, None);
    state.send(event);
}

fn process_collection_remove(state: &mut ConnState, rid: &str, idx: usize, value: Value) {
    if let Value::Reference(child) = &value {
        let child = child.clone();
        remove_reference(state, rid, &child);
    }
    state.send(ClientEvent::remove(rid, idx));
}

/// A reaccess signal. Deferred while events are queueing; otherwise the
/// cached decision is dropped and re-resolved.
pub(crate) fn reaccess(state: &mut ConnState, rid: &str) {
    let queued = {
        let sub = match state.subs.get_mut(rid) {
            Some(sub) => sub,
            None => return,
        };
        if sub.state == SubState::Disposed {
            return;
        }
        if sub.queue_flag != 0 {
            sub.flags |= FLAG_REACCESS;
            true
        } else {
            false
        }
    };
    if !queued {
        handle_reaccess(state, rid);
    }
}

fn handle_reaccess(state: &mut ConnState, rid: &str) {
    {
        let sub = match state.subs.get_mut(rid) {
            Some(sub) => sub,
            None => return,
        };
        sub.access = None;
        sub.flags &= !FLAG_REACCESS;
        // Indirect-only subscriptions ride on their parent's access.
        if sub.direct == 0 {
            return;
        }
    }
    queue_events(state, rid, QUEUE_REACCESS);
    let rid_owned = rid.to_string();
    load_access(
        state,
        rid,
        Box::new(move |state, access| {
            validate_access(state, &rid_owned, access);
            unqueue_events(state, &rid_owned, QUEUE_REACCESS);
        }),
    );
}

/// Drop the client if it no longer has read access.
fn validate_access(state: &mut ConnState, rid: &str, access: Result<Access, RError>) {
    if let Err(err) = access.and_then(|a| a.can_get()) {
        let direct = state.subs.get(rid).map(|sub| sub.direct).unwrap_or(0);
        unsubscribe_rid(state, rid, true, direct, true);
        state.send(ClientEvent::unsubscribe(rid, &err));
    }
}

/// Resolve the access decision for this subscription, coalescing
/// concurrent callers onto one request. Successful decisions and
/// explicit denials are kept on the subscription; other errors are not,
/// so the next check retries.
pub(crate) fn load_access(state: &mut ConnState, rid: &str, cb: AccessCb) {
    let cached = state.subs.get(rid).and_then(|sub| sub.access.clone());
    if let Some(result) = cached {
        cb(state, result);
        return;
    }
    {
        let sub = match state.subs.get_mut(rid) {
            Some(sub) => sub,
            None => return,
        };
        sub.access_cbs.push(cb);
        if sub.flags & FLAG_ACCESS_CALLED != 0 {
            return;
        }
        sub.flags |= FLAG_ACCESS_CALLED;
    }

    let (name, query) = match state.subs.get(rid) {
        Some(sub) => (sub.name.clone(), sub.query.clone()),
        None => return,
    };
    let parsed = Rid::from_parts(&name, &query);
    let token = state.token.clone();
    let conn = state.handle.clone();
    let rid_owned = rid.to_string();

    state.cache.access(
        &parsed,
        token,
        &state.cid,
        Box::new(move |result| {
            let _ = conn.enqueue(Box::new(move |state| {
                let cbs = {
                    let sub = match state.subs.get_mut(&rid_owned) {
                        Some(sub) => sub,
                        None => return,
                    };
                    if sub.state == SubState::Disposed {
                        return;
                    }
                    sub.flags &= !FLAG_ACCESS_CALLED;
                    let cacheable = match &result {
                        Ok(_) => true,
                        Err(err) => err.is_access_denied(),
                    };
                    if cacheable {
                        sub.access = Some(result.clone());
                    }
                    mem::take(&mut sub.access_cbs)
                };
                for cb in cbs {
                    cb(state, result.clone());
                }
            }));
        }),
    );
}

/// Check read access asynchronously.
pub(crate) fn can_get(
    state: &mut ConnState,
    rid: &str,
    cb: Box<dyn FnOnce(&mut ConnState, Result<(), RError>) + Send>,
) {
    load_access(
        state,
        rid,
        Box::new(move |state, access| cb(state, access.and_then(|a| a.can_get()))),
    );
}

/// Check call access for an action asynchronously.
pub(crate) fn can_call(
    state: &mut ConnState,
    rid: &str,
    action: String,
    cb: Box<dyn FnOnce(&mut ConnState, Result<(), RError>) + Send>,
) {
    load_access(
        state,
        rid,
        Box::new(move |state, access| cb(state, access.and_then(|a| a.can_call(&action)))),
    );
}
