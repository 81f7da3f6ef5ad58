//! Cache entries and resource views.
//!
//! One [`Entry`] exists per resource name while anything references it.
//! An entry holds one [`View`] per distinct normalised query (the empty
//! query is the default view). Regular events mutate the default view
//! only; query views are updated exclusively through query replies.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use common::{RError, Resource, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::subscriber::{ResourceEvent, SubId, Subscriber};

pub(crate) struct Entry {
    /// Views keyed by normalised query; `""` is the default view.
    pub views: HashMap<String, View>,
    /// Raw query → normalised query, for queries the service rewrote.
    pub links: HashMap<String, String>,
    /// Bus event pump for `event.<name>.*`. Aborting it unsubscribes.
    pub pump: JoinHandle<()>,
    /// Resolves true once the event subscription is established.
    pub subscribed: watch::Receiver<bool>,
    /// Number of in-flight query-event requests. While non-zero, bus
    /// events queue in `queued` to keep synthetic events ordered first.
    pub lock_count: usize,
    pub queued: VecDeque<(String, Bytes)>,
}

impl Entry {
    pub fn new(pump: JoinHandle<()>, subscribed: watch::Receiver<bool>) -> Entry {
        Entry {
            views: HashMap::new(),
            links: HashMap::new(),
            pump,
            subscribed,
            lock_count: 0,
            queued: VecDeque::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ViewState {
    Loading,
    Loaded,
}

pub(crate) struct View {
    pub state: ViewState,
    pub resource: Option<Resource>,
    pub subscribers: Vec<(SubId, Arc<dyn Subscriber>)>,
    /// Subscribers awaiting the get reply.
    pub pending: Vec<(SubId, Arc<dyn Subscriber>)>,
    /// Events that arrived while the get request was outstanding,
    /// applied in bus order once the reply lands.
    pub buffered: Vec<(String, Bytes)>,
}

impl View {
    pub fn loading() -> View {
        View {
            state: ViewState::Loading,
            resource: None,
            subscribers: Vec::new(),
            pending: Vec::new(),
            buffered: Vec::new(),
        }
    }

    pub fn is_unused(&self) -> bool {
        self.subscribers.is_empty() && self.pending.is_empty()
    }

    pub fn fan_out(&self, event: Arc<ResourceEvent>) {
        for (_, sub) in &self.subscribers {
            sub.event(event.clone());
        }
    }

    /// Apply a change to the view's model, returning the event to fan
    /// out, or `None` when every value was a no-op.
    pub fn apply_change(
        &mut self,
        values: HashMap<String, Value>,
    ) -> Result<Option<ResourceEvent>, RError> {
        let model = match &mut self.resource {
            Some(Resource::Model(m)) => m,
            _ => return Err(RError::internal_error("change event on a non-model resource")),
        };

        let mut changed = HashMap::new();
        let mut old_values = HashMap::new();
        for (key, value) in values {
            if value == Value::Delete {
                if let Some(prev) = model.values.remove(&key) {
                    old_values.insert(key.clone(), prev);
                    changed.insert(key, Value::Delete);
                }
                continue;
            }
            if model.values.get(&key) == Some(&value) {
                continue;
            }
            if let Some(prev) = model.values.insert(key.clone(), value.clone()) {
                old_values.insert(key.clone(), prev);
            }
            changed.insert(key, value);
        }

        if changed.is_empty() {
            return Ok(None);
        }
        Ok(Some(ResourceEvent::Change {
            values: changed,
            old_values,
        }))
    }

    pub fn apply_add(&mut self, idx: usize, value: Value) -> Result<ResourceEvent, RError> {
        let collection = match &mut self.resource {
            Some(Resource::Collection(c)) => c,
            _ => return Err(RError::internal_error("add event on a non-collection resource")),
        };
        if idx > collection.values.len() {
            return Err(RError::internal_error(format!(
                "add index {} out of bounds (len {})",
                idx,
                collection.values.len()
            )));
        }
        collection.values.insert(idx, value.clone());
        Ok(ResourceEvent::Add { idx, value })
    }

    pub fn apply_remove(&mut self, idx: usize) -> Result<ResourceEvent, RError> {
        let collection = match &mut self.resource {
            Some(Resource::Collection(c)) => c,
            _ => return Err(RError::internal_error("remove event on a non-collection resource")),
        };
        if idx >= collection.values.len() {
            return Err(RError::internal_error(format!(
                "remove index {} out of bounds (len {})",
                idx,
                collection.values.len()
            )));
        }
        let value = collection.values.remove(idx);
        Ok(ResourceEvent::Remove { idx, value })
    }
}
