//! Service payload parsing.
//!
//! Backend replies are `{"result": ...}` or `{"error": {...}}`
//! envelopes; resource events carry bare JSON bodies. Malformed
//! payloads surface as `system.internalError` values that the caller
//! logs and drops; they never poison the cache.

use std::collections::HashMap;

use bytes::Bytes;
use common::{Collection, Model, RError, Resource, Value};
use serde::Deserialize;

use crate::access::Access;

/// Serialize a JSON body for a bus request.
pub fn to_bytes(value: &serde_json::Value) -> Bytes {
    // Serializing a value built from JSON types cannot fail.
    Bytes::from(serde_json::to_vec(value).expect("JSON serialization"))
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<RError>,
}

/// Unwrap a service reply envelope into its result, or the error it
/// carried.
pub fn parse_envelope(payload: &[u8]) -> Result<serde_json::Value, RError> {
    let env: Envelope = serde_json::from_slice(payload)
        .map_err(|e| RError::internal_error(format!("malformed service response: {}", e)))?;
    if let Some(err) = env.error {
        return Err(err);
    }
    env.result
        .ok_or_else(|| RError::internal_error("service response carries neither result nor error"))
}

/// A parsed get reply: the resource plus the service's normalised query,
/// if it returned one.
#[derive(Debug)]
pub struct GetResult {
    pub resource: Resource,
    pub query: Option<String>,
}

#[derive(Deserialize)]
struct RawGetResult {
    #[serde(default)]
    model: Option<Model>,
    #[serde(default)]
    collection: Option<Collection>,
    #[serde(default)]
    query: Option<String>,
}

pub fn parse_get_response(payload: &[u8]) -> Result<GetResult, RError> {
    let result = parse_envelope(payload)?;
    let raw: RawGetResult = serde_json::from_value(result)
        .map_err(|e| RError::internal_error(format!("malformed get result: {}", e)))?;

    let resource = match (raw.model, raw.collection) {
        (Some(model), None) => {
            reject_delete_markers(model.values.values())?;
            Resource::Model(model)
        }
        (None, Some(collection)) => {
            reject_delete_markers(collection.values.iter())?;
            Resource::Collection(collection)
        }
        _ => {
            return Err(RError::internal_error(
                "get result must carry exactly one of model or collection",
            ))
        }
    };

    Ok(GetResult {
        resource,
        query: raw.query,
    })
}

#[derive(Deserialize)]
struct RawAccessResult {
    #[serde(default)]
    get: bool,
    #[serde(default)]
    call: Option<String>,
}

pub fn parse_access_response(payload: &[u8]) -> Result<Access, RError> {
    let result = parse_envelope(payload)?;
    let raw: RawAccessResult = serde_json::from_value(result)
        .map_err(|e| RError::internal_error(format!("malformed access result: {}", e)))?;
    Ok(Access::new(raw.get, raw.call))
}

/// Payload of a model change event.
#[derive(Debug, Deserialize)]
pub struct ChangeData {
    pub values: HashMap<String, Value>,
}

/// Payload of a collection add event.
#[derive(Debug, Deserialize)]
pub struct AddData {
    pub idx: usize,
    pub value: Value,
}

/// Payload of a collection remove event.
#[derive(Debug, Deserialize)]
pub struct RemoveData {
    pub idx: usize,
}

pub fn parse_change_data(data: serde_json::Value) -> Result<ChangeData, RError> {
    serde_json::from_value(data)
        .map_err(|e| RError::internal_error(format!("malformed change event: {}", e)))
}

pub fn parse_add_data(data: serde_json::Value) -> Result<AddData, RError> {
    let add: AddData = serde_json::from_value(data)
        .map_err(|e| RError::internal_error(format!("malformed add event: {}", e)))?;
    if add.value == Value::Delete {
        return Err(RError::internal_error("delete marker not allowed as add value"));
    }
    Ok(add)
}

pub fn parse_remove_data(data: serde_json::Value) -> Result<RemoveData, RError> {
    serde_json::from_value(data)
        .map_err(|e| RError::internal_error(format!("malformed remove event: {}", e)))
}

pub fn parse_json(payload: &[u8]) -> Result<serde_json::Value, RError> {
    serde_json::from_slice(payload)
        .map_err(|e| RError::internal_error(format!("malformed event payload: {}", e)))
}

#[derive(Deserialize)]
struct QueryEventData {
    subject: String,
}

/// Parse a query event payload, returning the reply subject.
pub fn parse_query_event(payload: &[u8]) -> Result<String, RError> {
    let data: QueryEventData = serde_json::from_slice(payload)
        .map_err(|e| RError::internal_error(format!("malformed query event: {}", e)))?;
    if data.subject.is_empty() {
        return Err(RError::internal_error("query event carries an empty subject"));
    }
    Ok(data.subject)
}

/// A synthetic event inside a query reply.
#[derive(Debug, Deserialize)]
pub struct SyntheticEvent {
    pub event: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// A parsed query reply.
#[derive(Debug)]
pub enum QueryResult {
    /// Synthetic events to replay on the view, in order.
    Events(Vec<SyntheticEvent>),
    /// Full model snapshot to diff against the cached view.
    Model(Model),
    /// Full collection snapshot to diff against the cached view.
    Collection(Collection),
    /// `{}` or `{"events": []}`: nothing changed.
    None,
}

#[derive(Deserialize)]
struct RawQueryResult {
    #[serde(default)]
    events: Option<serde_json::Value>,
    #[serde(default)]
    model: Option<Model>,
    #[serde(default)]
    collection: Option<Collection>,
}

pub fn parse_query_response(payload: &[u8]) -> Result<QueryResult, RError> {
    let result = parse_envelope(payload)?;
    let raw: RawQueryResult = serde_json::from_value(result)
        .map_err(|e| RError::internal_error(format!("malformed query result: {}", e)))?;

    if raw.events.is_some() && (raw.model.is_some() || raw.collection.is_some()) {
        return Err(RError::internal_error(
            "query result carries both events and a resource snapshot",
        ));
    }

    if let Some(events) = raw.events {
        let events: Vec<SyntheticEvent> = serde_json::from_value(events)
            .map_err(|e| RError::internal_error(format!("malformed query events: {}", e)))?;
        if events.is_empty() {
            return Ok(QueryResult::None);
        }
        return Ok(QueryResult::Events(events));
    }

    match (raw.model, raw.collection) {
        (Some(model), None) => {
            reject_delete_markers(model.values.values())?;
            Ok(QueryResult::Model(model))
        }
        (None, Some(collection)) => {
            reject_delete_markers(collection.values.iter())?;
            Ok(QueryResult::Collection(collection))
        }
        (None, None) => Ok(QueryResult::None),
        _ => Err(RError::internal_error(
            "query result carries both a model and a collection",
        )),
    }
}

fn reject_delete_markers<'a>(mut values: impl Iterator<Item = &'a Value>) -> Result<(), RError> {
    if values.any(|v| *v == Value::Delete) {
        Err(RError::internal_error("delete marker not allowed in resource values"))
    } else {
        Ok(())
    }
}
