//! Error types for control-plane operations.
//!
//! Every public operation returns [`OrchResult`]. The variants form the
//! caller-facing taxonomy: whether a call may be retried as-is is answered by
//! [`OrchError::is_retryable`].

use crate::types::{ApplianceId, ApplianceKind};
use extnet_common::LockError;
use thiserror::Error;

/// Result type alias for control-plane operations.
pub type OrchResult<T> = Result<T, OrchError>;

fn on_appliance(appliance: &Option<ApplianceId>) -> String {
    match appliance {
        Some(id) => format!(" on appliance {}", id),
        None => String::new(),
    }
}

/// Errors that can occur during control-plane operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OrchError {
    /// Bad or missing input; the caller must fix the request.
    #[error("Invalid parameter {field}: {message}")]
    InvalidParameter {
        /// The offending field.
        field: String,
        /// Error message.
        message: String,
    },

    /// A state precondition does not hold.
    #[error("Conflict: {message}")]
    Conflict {
        /// Error message.
        message: String,
    },

    /// No appliance of the requested kind has a free slot.
    #[error("Insufficient capacity: no {kind} appliance in zone {zone} has a free slot")]
    InsufficientCapacity {
        /// Zone name.
        zone: String,
        /// Appliance kind that was requested.
        kind: ApplianceKind,
    },

    /// The remote appliance or a lock could not serve the request.
    #[error("Resource unavailable in zone {zone}{}: {details}", on_appliance(.appliance))]
    ResourceUnavailable {
        /// Zone name.
        zone: String,
        /// Appliance involved, if any.
        appliance: Option<ApplianceId>,
        /// Remote-reported detail, verbatim.
        details: String,
    },

    /// A required system-wide setting is missing or invalid.
    #[error("Misconfiguration of '{key}': {message}")]
    Misconfiguration {
        /// Dotted configuration key.
        key: String,
        /// Error message.
        message: String,
    },

    /// A collaborator store failed.
    #[error("Store operation failed: {operation}: {message}")]
    Store {
        /// The operation that failed (e.g., "insert_mapping").
        operation: String,
        /// Error message.
        message: String,
    },
}

impl OrchError {
    /// Creates an InvalidParameter error.
    pub fn invalid_parameter(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates a Conflict error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Creates an InsufficientCapacity error.
    pub fn insufficient_capacity(zone: impl Into<String>, kind: ApplianceKind) -> Self {
        Self::InsufficientCapacity {
            zone: zone.into(),
            kind,
        }
    }

    /// Creates a ResourceUnavailable error.
    pub fn unavailable(
        zone: impl Into<String>,
        appliance: Option<ApplianceId>,
        details: impl Into<String>,
    ) -> Self {
        Self::ResourceUnavailable {
            zone: zone.into(),
            appliance,
            details: details.into(),
        }
    }

    /// Creates a Misconfiguration error.
    pub fn misconfiguration(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Misconfiguration {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Creates a Store error.
    pub fn store(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Maps a lock failure in `zone` to ResourceUnavailable.
    pub fn from_lock(zone: impl Into<String>, err: LockError) -> Self {
        Self::unavailable(zone, None, err.to_string())
    }

    /// Returns true if the same call may succeed later without changes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchError::InsufficientCapacity { .. } | OrchError::ResourceUnavailable { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_display() {
        let err = OrchError::unavailable("zone-1", Some(7), "device busy");
        assert_eq!(
            err.to_string(),
            "Resource unavailable in zone zone-1 on appliance 7: device busy"
        );

        let err = OrchError::unavailable("zone-1", None, "lock wait expired");
        assert_eq!(
            err.to_string(),
            "Resource unavailable in zone zone-1: lock wait expired"
        );

        let err = OrchError::insufficient_capacity("zone-1", ApplianceKind::Firewall);
        assert!(err.to_string().contains("zone-1"));

        let err = OrchError::misconfiguration("capacity.firewall_default", "must be non-zero");
        assert!(err.to_string().contains("capacity.firewall_default"));
    }

    #[test]
    fn test_is_retryable() {
        assert!(OrchError::unavailable("z", None, "x").is_retryable());
        assert!(OrchError::insufficient_capacity("z", ApplianceKind::LoadBalancer).is_retryable());
        assert!(!OrchError::invalid_parameter("endpoint", "bad").is_retryable());
        assert!(!OrchError::conflict("device in use").is_retryable());
        assert!(!OrchError::misconfiguration("k", "m").is_retryable());
        assert!(!OrchError::store("get", "m").is_retryable());
    }

    #[test]
    fn test_from_lock() {
        let err = OrchError::from_lock(
            "zone-2",
            LockError::Timeout {
                name: "device-map-mutation".to_string(),
                waited: Duration::from_secs(30),
            },
        );
        assert!(err.is_retryable());
        assert!(err.to_string().contains("device-map-mutation"));
    }
}
