//! Structured audit records for mutating control-plane operations.
//!
//! Every appliance registration change, network implement/shutdown and rule
//! push emits one [`AuditRecord`] on the `audit` tracing target. The record is
//! rendered as JSON so that log shippers can index it without parsing the
//! human-readable message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Audit event categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditCategory {
    /// Appliance registration and removal
    ApplianceRegistry,
    /// Capacity or state changes made by an administrator
    AdminAction,
    /// Guest network implement and shutdown
    NetworkLifecycle,
    /// Rule sets pushed to an appliance
    RuleApplication,
    /// Usage collection ticks
    UsageCollection,
    /// Daemon startup and shutdown
    SystemLifecycle,
}

impl AuditCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditCategory::ApplianceRegistry => "APPLIANCE_REGISTRY",
            AuditCategory::AdminAction => "ADMIN_ACTION",
            AuditCategory::NetworkLifecycle => "NETWORK_LIFECYCLE",
            AuditCategory::RuleApplication => "RULE_APPLICATION",
            AuditCategory::UsageCollection => "USAGE_COLLECTION",
            AuditCategory::SystemLifecycle => "SYSTEM_LIFECYCLE",
        }
    }
}

impl fmt::Display for AuditCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failure,
    InProgress,
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AuditOutcome::Success => "success",
            AuditOutcome::Failure => "failure",
            AuditOutcome::InProgress => "in_progress",
        })
    }
}

/// One audit event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub category: AuditCategory,
    /// Component generating the event
    pub source: String,
    pub action: String,
    pub outcome: AuditOutcome,
    /// Affected object, e.g. an appliance or network id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
    /// Examples: "appliance", "guest_network", "rule_batch"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditRecord {
    /// Creates a record stamped now; the outcome starts as InProgress.
    pub fn new(
        category: AuditCategory,
        source: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            category,
            source: source.into(),
            action: action.into(),
            outcome: AuditOutcome::InProgress,
            object_id: None,
            object_type: None,
            details: None,
            error: None,
        }
    }

    pub fn with_outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn with_object_id(mut self, id: impl Into<String>) -> Self {
        self.object_id = Some(id.into());
        self
    }

    pub fn with_object_type(mut self, obj_type: impl Into<String>) -> Self {
        self.object_type = Some(obj_type.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Sets the error message and marks the outcome as Failure.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self.outcome = AuditOutcome::Failure;
        self
    }

    /// Success or failure depending on `result`.
    pub fn with_result<T, E: fmt::Display>(self, result: &Result<T, E>) -> Self {
        match result {
            Ok(_) => self.with_outcome(AuditOutcome::Success),
            Err(e) => self.with_error(e.to_string()),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|e| format!(r#"{{"error":"serialization_failed","message":"{}"}}"#, e))
    }
}

/// Emits an [`AuditRecord`] on the `audit` target.
///
/// Success is logged at info, InProgress at debug, Failure at warn.
///
/// ```ignore
/// let record = AuditRecord::new(AuditCategory::ApplianceRegistry, "ApplianceRegistry", "register")
///     .with_outcome(AuditOutcome::Success)
///     .with_object_id("7")
///     .with_object_type("appliance");
/// audit_log!(record);
/// ```
macro_rules! audit_log {
    ($record:expr) => {{
        let record = $record;
        let audit_json = record.to_json();
        match record.outcome {
            $crate::audit::AuditOutcome::Success => tracing::info!(
                target: "audit",
                category = record.category.as_str(),
                object = ?record.object_id,
                %audit_json,
                "{} {} succeeded",
                record.source,
                record.action
            ),
            $crate::audit::AuditOutcome::InProgress => tracing::debug!(
                target: "audit",
                category = record.category.as_str(),
                object = ?record.object_id,
                %audit_json,
                "{} {} started",
                record.source,
                record.action
            ),
            $crate::audit::AuditOutcome::Failure => tracing::warn!(
                target: "audit",
                category = record.category.as_str(),
                object = ?record.object_id,
                error = record.error.as_deref().unwrap_or(""),
                %audit_json,
                "{} {} failed",
                record.source,
                record.action
            ),
        }
    }};
}

pub(crate) use audit_log;
