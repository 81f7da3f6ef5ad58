//! The cache→subscription seam.
//!
//! The gateway registers one [`Subscriber`] per client subscription.
//! The cache calls back with the load result and a stream of resource
//! events; the implementation is expected to hand both off to the
//! owning connection's work queue.

use std::collections::HashMap;
use std::sync::Arc;

use common::{RError, Resource, Rid, Value};

use crate::cache::Cache;

/// Identifies one subscriber registration within the cache.
pub type SubId = u64;

/// A callback target for one client subscription.
pub trait Subscriber: Send + Sync {
    /// Connection id, for logging.
    fn cid(&self) -> &str;

    /// Called exactly once when the resource load settles. Returns
    /// false if the receiver is gone, in which case the cache drops the
    /// registration.
    fn loaded(&self, result: Result<LoadedResource, RError>) -> bool;

    /// Called for every resource event after a successful load, in bus
    /// order.
    fn event(&self, event: Arc<ResourceEvent>);
}

/// A successful load: the view handle plus an as-of-load snapshot.
///
/// The snapshot is consistent with the event stream: every event fanned
/// out after `loaded` applies on top of it.
pub struct LoadedResource {
    pub handle: ResourceHandle,
    pub resource: Resource,
}

/// A ref-counted view onto a cache entry, owned by one client
/// subscription. Dropping a subscription must explicitly detach by
/// calling [`ResourceHandle::unsubscribe`].
#[derive(Clone)]
pub struct ResourceHandle {
    pub(crate) cache: Cache,
    pub(crate) name: String,
    pub(crate) query: String,
    pub(crate) sub_id: SubId,
}

impl ResourceHandle {
    /// The resource name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The normalised query this view is keyed by.
    pub fn query(&self) -> &str {
        &self.query
    }

    /// The normalised RID of the view.
    pub fn rid(&self) -> Rid {
        Rid::from_parts(&self.name, &self.query)
    }

    /// Detach this subscriber from the view. When the last subscriber
    /// detaches, the cache unsubscribes from the backend and drops the
    /// entry.
    pub fn unsubscribe(&self) {
        self.cache
            .enqueue_unsubscribe(self.name.clone(), self.query.clone(), self.sub_id);
    }
}

impl std::fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("rid", &self.rid().as_str())
            .field("sub_id", &self.sub_id)
            .finish()
    }
}

/// A resource event fanned out to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceEvent {
    /// Model change. `values` is the actual delta (no-ops omitted,
    /// removed keys as delete markers); `old_values` holds the prior
    /// values of every changed pre-existing key.
    Change {
        values: HashMap<String, Value>,
        old_values: HashMap<String, Value>,
    },
    /// Collection insert.
    Add { idx: usize, value: Value },
    /// Collection removal. `value` is the removed element.
    Remove { idx: usize, value: Value },
    /// The resource is gone; the subscription must dispose.
    Delete,
    /// Access must be re-validated.
    Reaccess,
}
