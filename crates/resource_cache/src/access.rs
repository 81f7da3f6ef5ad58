//! Access decisions and the process-wide access cache.

use common::{error::codes, RError, Rid};
use dashmap::DashMap;

/// An access decision returned by a service.
#[derive(Debug, Clone, PartialEq)]
pub struct Access {
    get: bool,
    call: CallSpec,
}

#[derive(Debug, Clone, PartialEq)]
enum CallSpec {
    None,
    All,
    Actions(Vec<String>),
}

impl Access {
    /// Build a decision from the wire form: `get` flag plus a call spec
    /// of `"*"` or a comma-separated action list.
    pub fn new(get: bool, call: Option<String>) -> Access {
        let call = match call.as_deref() {
            None | Some("") => CallSpec::None,
            Some("*") => CallSpec::All,
            Some(list) => CallSpec::Actions(list.split(',').map(|a| a.trim().to_string()).collect()),
        };
        Access { get, call }
    }

    /// Check read access.
    pub fn can_get(&self) -> Result<(), RError> {
        if self.get {
            Ok(())
        } else {
            Err(RError::access_denied())
        }
    }

    /// Check call access for a named action.
    pub fn can_call(&self, action: &str) -> Result<(), RError> {
        match &self.call {
            CallSpec::All => Ok(()),
            CallSpec::Actions(actions) if actions.iter().any(|a| a == action) => Ok(()),
            _ => Err(RError::access_denied()),
        }
    }
}

/// Cache key: resource name, query, and the canonical token form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct AccessKey {
    name: String,
    query: String,
    token: String,
}

impl AccessKey {
    pub(crate) fn new(rid: &Rid, token: Option<&serde_json::Value>) -> AccessKey {
        AccessKey {
            name: rid.name().to_string(),
            query: rid.query().to_string(),
            // serde_json orders object keys, so equal tokens serialize
            // equally.
            token: token.map(|t| t.to_string()).unwrap_or_default(),
        }
    }
}

/// Cached access decisions keyed by (resource, token).
///
/// Reads take a lock-free fast path from connection tasks; writes and
/// invalidation happen only on the cache task. Only successful results
/// and `system.accessDenied` errors are cached; any other error is
/// left uncached so the next check retries against the service.
#[derive(Default)]
pub(crate) struct AccessCache {
    map: DashMap<AccessKey, Result<Access, RError>>,
}

impl AccessCache {
    pub(crate) fn new() -> AccessCache {
        AccessCache::default()
    }

    pub(crate) fn get(&self, key: &AccessKey) -> Option<Result<Access, RError>> {
        self.map.get(key).map(|r| r.clone())
    }

    pub(crate) fn store(&self, key: &AccessKey, result: &Result<Access, RError>) {
        let cacheable = match result {
            Ok(_) => true,
            Err(err) => err.code == codes::ACCESS_DENIED,
        };
        if cacheable {
            self.map.insert(key.clone(), result.clone());
        }
    }

    /// Drop every decision for a resource name.
    pub(crate) fn invalidate(&self, name: &str) {
        self.map.retain(|key, _| key.name != name);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.map.len()
    }
}
