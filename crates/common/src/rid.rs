//! Resource identifiers.
//!
//! A RID is `name` or `name?query`. The name is dot-separated; the query
//! is opaque to the gateway (services may return a normalised form of it
//! in their get responses).

use crate::error::RError;

/// Placeholder in a RID that expands to the connection id.
pub const CID_PLACEHOLDER: &str = "{cid}";

/// A parsed resource identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rid {
    rid: String,
    /// Byte offset of `?`, if the RID carries a query.
    query_at: Option<usize>,
}

impl Rid {
    /// Parse and validate a resource identifier.
    ///
    /// The name must be non-empty with non-empty dot-separated segments,
    /// and may not contain whitespace or the `*`/`>` wildcard characters.
    pub fn parse(rid: &str) -> Result<Rid, RError> {
        let (name, query_at) = match rid.find('?') {
            Some(i) => (&rid[..i], Some(i)),
            None => (rid, None),
        };

        if name.is_empty() {
            return Err(RError::invalid_request("empty resource name"));
        }
        for part in name.split('.') {
            if part.is_empty() {
                return Err(RError::invalid_request("empty segment in resource name"));
            }
            if part.contains(['*', '>']) || part.contains(char::is_whitespace) {
                return Err(RError::invalid_request("invalid character in resource name"));
            }
        }

        Ok(Rid {
            rid: rid.to_string(),
            query_at,
        })
    }

    /// Build a RID from a name and an optional query string.
    pub fn from_parts(name: &str, query: &str) -> Rid {
        if query.is_empty() {
            Rid {
                rid: name.to_string(),
                query_at: None,
            }
        } else {
            Rid {
                rid: format!("{}?{}", name, query),
                query_at: Some(name.len()),
            }
        }
    }

    /// The full identifier as requested.
    pub fn as_str(&self) -> &str {
        &self.rid
    }

    /// The resource name part.
    pub fn name(&self) -> &str {
        match self.query_at {
            Some(i) => &self.rid[..i],
            None => &self.rid,
        }
    }

    /// The query part, or `""` when the RID has none.
    pub fn query(&self) -> &str {
        match self.query_at {
            Some(i) => &self.rid[i + 1..],
            None => "",
        }
    }
}

impl std::fmt::Display for Rid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.rid)
    }
}

/// Expand the `{cid}` placeholder in a raw RID string.
///
/// Expansion happens before parsing; the client keeps addressing the
/// subscription by the RID it requested.
pub fn expand_cid(rid: &str, cid: &str) -> String {
    if rid.contains(CID_PLACEHOLDER) {
        rid.replace(CID_PLACEHOLDER, cid)
    } else {
        rid.to_string()
    }
}
