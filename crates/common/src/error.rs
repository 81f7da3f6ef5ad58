//! Wire error taxonomy.
//!
//! Errors crossing the client or service boundary are
//! `{code, message, data?}` objects with `system.*` code strings.

use serde::{Deserialize, Serialize};

/// Well-known error codes.
pub mod codes {
    pub const NOT_FOUND: &str = "system.notFound";
    pub const ACCESS_DENIED: &str = "system.accessDenied";
    pub const INTERNAL_ERROR: &str = "system.internalError";
    pub const TIMEOUT: &str = "system.timeout";
    pub const SUBSCRIPTION_LIMIT_EXCEEDED: &str = "system.subscriptionLimitExceeded";
    pub const DISPOSED_SUBSCRIPTION: &str = "system.disposedSubscription";
    pub const INVALID_REQUEST: &str = "system.invalidRequest";
    pub const NO_SUBSCRIPTION: &str = "system.noSubscription";
}

/// An error as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RError {
    pub fn new(code: &str, message: impl Into<String>) -> RError {
        RError {
            code: code.to_string(),
            message: message.into(),
            data: None,
        }
    }

    pub fn not_found() -> RError {
        RError::new(codes::NOT_FOUND, "Not found")
    }

    pub fn access_denied() -> RError {
        RError::new(codes::ACCESS_DENIED, "Access denied")
    }

    pub fn internal_error(message: impl Into<String>) -> RError {
        RError::new(codes::INTERNAL_ERROR, message)
    }

    pub fn timeout() -> RError {
        RError::new(codes::TIMEOUT, "Request timeout")
    }

    pub fn subscription_limit_exceeded() -> RError {
        RError::new(codes::SUBSCRIPTION_LIMIT_EXCEEDED, "Subscription limit exceeded")
    }

    pub fn disposed_subscription() -> RError {
        RError::new(codes::DISPOSED_SUBSCRIPTION, "Resource subscription is disposed")
    }

    pub fn invalid_request(message: impl Into<String>) -> RError {
        RError::new(codes::INVALID_REQUEST, message)
    }

    pub fn no_subscription(rid: &str) -> RError {
        RError::new(codes::NO_SUBSCRIPTION, format!("No subscription for {}", rid))
    }

    /// True if the error indicates the resource is gone.
    pub fn is_not_found(&self) -> bool {
        self.code == codes::NOT_FOUND
    }

    pub fn is_access_denied(&self) -> bool {
        self.code == codes::ACCESS_DENIED
    }
}
