//! Connection actor.
//!
//! Each connection owns a serial work queue: closures over the
//! connection state, executed one at a time by a spawned task. Cache
//! callbacks and client operations never touch subscription state
//! directly; they enqueue.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::RError;
use metrics::{counter, gauge};
use resource_cache::{Cache, LoadedResource, ResourceEvent, Subscriber};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};
use uuid::Uuid;

use crate::protocol::{ClientEvent, ClientTransport, Resources};
use crate::subscription::{self, ReadyCallback, Subscription};

pub(crate) type ConnJob = Box<dyn FnOnce(&mut ConnState) + Send>;

/// Connection tuning.
#[derive(Debug, Clone)]
pub struct ConnConfig {
    /// Maximum number of distinct subscriptions, direct and indirect.
    pub subscription_limit: usize,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            subscription_limit: 256,
        }
    }
}

/// Handle to one client connection.
///
/// Cheap to clone. The owner (the network listener) must call
/// [`Conn::dispose`] when the client disconnects; disposal detaches
/// every subscription from the cache.
#[derive(Clone)]
pub struct Conn {
    tx: mpsc::UnboundedSender<ConnJob>,
    cid: Arc<str>,
}

impl Conn {
    /// Spawn a connection actor on the current runtime.
    pub fn start(cache: Cache, transport: Arc<dyn ClientTransport>, config: ConnConfig) -> Conn {
        let (tx, mut rx) = mpsc::unbounded_channel::<ConnJob>();
        let cid: Arc<str> = Uuid::new_v4().simple().to_string().into();
        let conn = Conn { tx, cid: cid.clone() };

        counter!("gateway_connections_total").increment(1);
        gauge!("gateway_active_connections").increment(1.0);
        info!("Connection {} opened", cid);

        let handle = conn.clone();
        tokio::spawn(async move {
            let mut state = ConnState {
                cid,
                cache,
                handle,
                transport,
                config,
                token: None,
                subs: HashMap::new(),
                ready_cbs: HashMap::new(),
                pending_subscribes: HashMap::new(),
                pending_changes: HashMap::new(),
                next_id: 0,
                disposed: false,
                connected_at: Utc::now(),
            };
            while let Some(job) = rx.recv().await {
                job(&mut state);
                if state.disposed {
                    break;
                }
            }
            if !state.disposed {
                state.dispose();
            }
        });

        conn
    }

    /// The unique connection id.
    pub fn cid(&self) -> &str {
        &self.cid
    }

    /// Subscribe to a resource. Resolves with the initial snapshot
    /// (the resource and everything it references that the client has
    /// not seen), or the error that prevented the subscription.
    pub async fn subscribe(&self, rid: &str) -> Result<Resources, RError> {
        let (reply, rx) = oneshot::channel();
        let rid = rid.to_string();
        self.enqueue(Box::new(move |state| state.handle_subscribe(rid, reply)));
        rx.await.unwrap_or_else(|_| Err(RError::disposed_subscription()))
    }

    /// Drop a direct subscription.
    pub async fn unsubscribe(&self, rid: &str) -> Result<(), RError> {
        let (reply, rx) = oneshot::channel();
        let rid = rid.to_string();
        self.enqueue(Box::new(move |state| state.handle_unsubscribe(rid, reply)));
        rx.await.unwrap_or_else(|_| Err(RError::disposed_subscription()))
    }

    /// Check call access for an action on a subscribed resource, using
    /// the subscription's cached access decision when one is held.
    pub async fn can_call(&self, rid: &str, action: &str) -> Result<(), RError> {
        let (reply, rx) = oneshot::channel();
        let rid = rid.to_string();
        let action = action.to_string();
        self.enqueue(Box::new(move |state| state.handle_can_call(rid, action, reply)));
        rx.await.unwrap_or_else(|_| Err(RError::disposed_subscription()))
    }

    /// Replace the connection's access token. Every directly
    /// subscribed resource re-validates access against the new token.
    pub fn set_token(&self, token: Option<serde_json::Value>) {
        self.enqueue(Box::new(move |state| state.handle_set_token(token)));
    }

    /// Tear the connection down. All subscriptions dispose; in-flight
    /// callbacks become no-ops.
    pub fn dispose(&self) {
        self.enqueue(Box::new(|state| state.dispose()));
    }

    /// Enqueue work onto the connection's serial queue. Returns false
    /// when the connection is gone.
    pub(crate) fn enqueue(&self, job: ConnJob) -> bool {
        self.tx.send(job).is_ok()
    }
}

pub(crate) struct ConnState {
    pub(crate) cid: Arc<str>,
    pub(crate) cache: Cache,
    pub(crate) handle: Conn,
    pub(crate) transport: Arc<dyn ClientTransport>,
    pub(crate) config: ConnConfig,
    pub(crate) token: Option<serde_json::Value>,
    pub(crate) subs: HashMap<String, Subscription>,
    pub(crate) ready_cbs: HashMap<u64, ReadyCallback>,
    pub(crate) pending_subscribes: HashMap<u64, PendingSubscribe>,
    pub(crate) pending_changes: HashMap<u64, PendingChange>,
    next_id: u64,
    pub(crate) disposed: bool,
    connected_at: DateTime<Utc>,
}

/// A subscribe operation waiting for both its access decision and the
/// readiness of the subscription tree.
pub(crate) struct PendingSubscribe {
    rid: String,
    reply: Option<oneshot::Sender<Result<Resources, RError>>>,
    access: Option<Result<(), RError>>,
    ready: bool,
}

/// A model change event held back until its newly referenced children
/// are ready to be embedded.
pub(crate) struct PendingChange {
    pub parent: String,
    pub remaining: usize,
    pub values: HashMap<String, common::Value>,
    pub children: Vec<String>,
}

impl ConnState {
    pub(crate) fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub(crate) fn send(&self, event: ClientEvent) {
        counter!("gateway_events_sent_total").increment(1);
        self.transport.send(event);
    }

    fn handle_subscribe(&mut self, rid: String, reply: oneshot::Sender<Result<Resources, RError>>) {
        if self.disposed {
            let _ = reply.send(Err(RError::disposed_subscription()));
            return;
        }
        debug!("Connection {} subscribing to {}", self.cid, rid);
        if let Err(err) = subscription::subscribe(self, &rid, true) {
            let _ = reply.send(Err(err));
            return;
        }

        let id = self.alloc_id();
        self.pending_subscribes.insert(
            id,
            PendingSubscribe {
                rid: rid.clone(),
                reply: Some(reply),
                access: None,
                ready: false,
            },
        );

        // Access resolution and resource loading run in parallel; the
        // response goes out when both have settled.
        subscription::can_get(
            self,
            &rid,
            Box::new(move |state, result| {
                if let Some(pending) = state.pending_subscribes.get_mut(&id) {
                    pending.access = Some(result);
                }
                state.finish_subscribe(id);
            }),
        );
        subscription::on_ready(
            self,
            &rid,
            Box::new(move |state| {
                if let Some(pending) = state.pending_subscribes.get_mut(&id) {
                    pending.ready = true;
                }
                state.finish_subscribe(id);
            }),
        );
    }

    fn finish_subscribe(&mut self, id: u64) {
        let done = matches!(
            self.pending_subscribes.get(&id),
            Some(pending) if pending.ready && pending.access.is_some()
        );
        if !done {
            return;
        }
        let mut pending = match self.pending_subscribes.remove(&id) {
            Some(pending) => pending,
            None => return,
        };
        let reply = match pending.reply.take() {
            Some(reply) => reply,
            None => return,
        };
        let rid = pending.rid;

        if let Some(Err(err)) = pending.access {
            subscription::unsubscribe_rid(self, &rid, true, 1, true);
            let _ = reply.send(Err(err));
            return;
        }

        let load_err = match self.subs.get(&rid) {
            None => Some(RError::disposed_subscription()),
            Some(sub) if sub.state == subscription::SubState::Disposed => {
                Some(RError::disposed_subscription())
            }
            Some(sub) => sub.err.clone(),
        };
        if let Some(err) = load_err {
            subscription::unsubscribe_rid(self, &rid, true, 1, true);
            let _ = reply.send(Err(err));
            return;
        }

        let resources = subscription::collect_resources(self, &rid);
        let _ = reply.send(Ok(resources));
        subscription::release_resources(self, &rid);
    }

    fn handle_unsubscribe(&mut self, rid: String, reply: oneshot::Sender<Result<(), RError>>) {
        if self.disposed {
            let _ = reply.send(Err(RError::disposed_subscription()));
            return;
        }
        let direct = match self.subs.get(&rid) {
            Some(sub) => sub.direct,
            None => 0,
        };
        if direct == 0 {
            let _ = reply.send(Err(RError::no_subscription(&rid)));
            return;
        }
        debug!("Connection {} unsubscribing from {}", self.cid, rid);
        subscription::unsubscribe_rid(self, &rid, true, 1, true);
        let _ = reply.send(Ok(()));
    }

    fn handle_can_call(
        &mut self,
        rid: String,
        action: String,
        reply: oneshot::Sender<Result<(), RError>>,
    ) {
        if self.disposed {
            let _ = reply.send(Err(RError::disposed_subscription()));
            return;
        }
        if !self.subs.contains_key(&rid) {
            let _ = reply.send(Err(RError::no_subscription(&rid)));
            return;
        }
        let mut reply = Some(reply);
        subscription::can_call(
            self,
            &rid,
            action,
            Box::new(move |_state, result| {
                if let Some(reply) = reply.take() {
                    let _ = reply.send(result);
                }
            }),
        );
    }

    fn handle_set_token(&mut self, token: Option<serde_json::Value>) {
        self.token = token;
        // A token change is an explicit reaccess signal for everything
        // the client subscribed to directly.
        let rids: Vec<String> = self
            .subs
            .iter()
            .filter(|(_, sub)| sub.direct > 0 && sub.state != subscription::SubState::Disposed)
            .map(|(rid, _)| rid.clone())
            .collect();
        for rid in rids {
            subscription::reaccess(self, &rid);
        }
    }

    pub(crate) fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        let rids: Vec<String> = self.subs.keys().cloned().collect();
        for rid in rids {
            subscription::dispose(self, &rid);
        }
        self.subs.clear();
        self.ready_cbs.clear();
        self.pending_subscribes.clear();
        self.pending_changes.clear();

        gauge!("gateway_active_connections").decrement(1.0);
        let duration = (Utc::now() - self.connected_at).num_seconds();
        info!("Connection {} closed after {}s", self.cid, duration);
    }
}

/// The cache-side callback target for one subscription: everything
/// lands back on the owning connection's queue.
pub(crate) struct SubRef {
    pub conn: Conn,
    pub rid: String,
}

impl Subscriber for SubRef {
    fn cid(&self) -> &str {
        self.conn.cid()
    }

    fn loaded(&self, result: Result<LoadedResource, RError>) -> bool {
        let rid = self.rid.clone();
        self.conn
            .enqueue(Box::new(move |state| subscription::loaded(state, &rid, result)))
    }

    fn event(&self, event: Arc<ResourceEvent>) {
        let rid = self.rid.clone();
        let _ = self
            .conn
            .enqueue(Box::new(move |state| subscription::handle_event(state, &rid, event)));
    }
}
