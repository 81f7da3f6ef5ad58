//! Client-facing protocol types.
//!
//! Events addressed to a subscription RID `<rid>`:
//!
//! | event                | data                                    |
//! |----------------------|-----------------------------------------|
//! | `<rid>.change`       | `{values, resources?}`                  |
//! | `<rid>.add`          | `{idx, value, resources?}`              |
//! | `<rid>.remove`       | `{idx}`                                 |
//! | `<rid>.delete`       | `null`                                  |
//! | `<rid>.unsubscribe`  | `{reason: {code, message, data?}}`      |
//!
//! `resources` embeds the snapshots of referenced resources the client
//! has not seen yet, in the same shape a subscribe response carries.

use std::collections::HashMap;

use common::{Collection, Model, RError, Value};
use serde::Serialize;

/// Resource data accompanying a response or event: every not-yet-sent
/// resource in the subscription tree, keyed by RID. Children that
/// failed to load land in `errors`; their siblings stay functional.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Resources {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub models: Option<HashMap<String, Model>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collections: Option<HashMap<String, Collection>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<HashMap<String, RError>>,
}

impl Resources {
    pub fn is_empty(&self) -> bool {
        self.models.is_none() && self.collections.is_none() && self.errors.is_none()
    }

    pub(crate) fn add_model(&mut self, rid: String, model: Model) {
        self.models.get_or_insert_with(HashMap::new).insert(rid, model);
    }

    pub(crate) fn add_collection(&mut self, rid: String, collection: Collection) {
        self.collections.get_or_insert_with(HashMap::new).insert(rid, collection);
    }

    pub(crate) fn add_error(&mut self, rid: String, err: RError) {
        self.errors.get_or_insert_with(HashMap::new).insert(rid, err);
    }
}

/// One event addressed to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientEvent {
    /// `<rid>.<event-name>`.
    pub event: String,
    pub data: serde_json::Value,
}

/// The capability the network listener provides: delivery of events to
/// the connected client. Implementations must not block.
pub trait ClientTransport: Send + Sync {
    fn send(&self, event: ClientEvent);
}

fn to_json<T: Serialize>(value: &T) -> serde_json::Value {
    // Our protocol types serialize infallibly.
    serde_json::to_value(value).expect("JSON serialization")
}

impl ClientEvent {
    pub fn change(rid: &str, values: &HashMap<String, Value>, resources: Option<&Resources>) -> ClientEvent {
        let mut data = serde_json::json!({ "values": to_json(values) });
        if let Some(resources) = resources {
            data["resources"] = to_json(resources);
        }
        ClientEvent {
            event: format!("{}.change", rid),
            data,
        }
    }

    pub fn add(rid: &str, idx: usize, value: &Value, resources: Option<&Resources>) -> ClientEvent {
        let mut data = serde_json::json!({ "idx": idx, "value": to_json(value) });
        if let Some(resources) = resources {
            data["resources"] = to_json(resources);
        }
        ClientEvent {
            event: format!("{}.add", rid),
            data,
        }
    }

    pub fn remove(rid: &str, idx: usize) -> ClientEvent {
        ClientEvent {
            event: format!("{}.remove", rid),
            data: serde_json::json!({ "idx": idx }),
        }
    }

    pub fn delete(rid: &str) -> ClientEvent {
        ClientEvent {
            event: format!("{}.delete", rid),
            data: serde_json::Value::Null,
        }
    }

    pub fn unsubscribe(rid: &str, reason: &RError) -> ClientEvent {
        ClientEvent {
            event: format!("{}.unsubscribe", rid),
            data: serde_json::json!({ "reason": to_json(reason) }),
        }
    }
}
