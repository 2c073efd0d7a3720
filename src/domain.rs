//! Concrete event domains carried by the generic broker
//!
//! The backend publishes two kinds of notifications: audit-log entries and
//! user-lifecycle changes. Both ride the same `Broker<P>`; only the payload
//! type and the filters differ.

use crate::broker::Broker;
use crate::filter::EventFilter;
use crate::types::EventEnvelope;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Event type published when an audit-log row is written
pub const AUDIT_LOG_CREATED: &str = "audit_log_created";

/// Payload of an audit-log notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// What happened (e.g., "expense.update")
    pub action: String,

    /// User who performed the action
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<i64>,

    /// Property the action concerns, for per-property dashboards
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_id: Option<i64>,

    /// Human-readable summary
    #[serde(default)]
    pub summary: String,
}

impl AuditEvent {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            actor_id: None,
            property_id: None,
            summary: String::new(),
        }
    }

    pub fn with_actor(mut self, actor_id: i64) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    pub fn with_property(mut self, property_id: i64) -> Self {
        self.property_id = Some(property_id);
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }
}

/// Build the envelope for a newly written audit-log row
pub fn audit_log_created(
    tenant_id: i64,
    log_id: i64,
    payload: AuditEvent,
) -> EventEnvelope<AuditEvent> {
    EventEnvelope::new(tenant_id, AUDIT_LOG_CREATED, payload)
        .with_entity("audit_log", log_id.to_string())
}

/// Only audit events concerning one property
pub fn audit_property_filter(property_id: i64) -> EventFilter<AuditEvent> {
    EventFilter::new(move |event: &EventEnvelope<AuditEvent>| {
        event.metadata.property_id == Some(property_id)
    })
}

/// User-lifecycle event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserEventKind {
    Created,
    Updated,
    Deleted,
    Login,
    Logout,
    StatusChanged,
}

impl UserEventKind {
    /// Wire event type for this kind
    pub fn event_type(self) -> &'static str {
        match self {
            Self::Created => "user_created",
            Self::Updated => "user_updated",
            Self::Deleted => "user_deleted",
            Self::Login => "user_login",
            Self::Logout => "user_logout",
            Self::StatusChanged => "user_status_changed",
        }
    }
}

impl fmt::Display for UserEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_type())
    }
}

/// Payload of a user-lifecycle notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserEvent {
    pub user_id: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl UserEvent {
    pub fn new(user_id: i64) -> Self {
        Self {
            user_id,
            email: None,
            role: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }
}

/// Build the envelope for a user-lifecycle change
pub fn user_event(
    tenant_id: i64,
    kind: UserEventKind,
    payload: UserEvent,
) -> EventEnvelope<UserEvent> {
    let user_id = payload.user_id.to_string();
    EventEnvelope::new(tenant_id, kind.event_type(), payload).with_entity("user", user_id)
}

/// Only the given user-lifecycle kinds
pub fn user_event_kinds(kinds: impl IntoIterator<Item = UserEventKind>) -> EventFilter<UserEvent> {
    EventFilter::event_types(kinds.into_iter().map(UserEventKind::event_type))
}

/// Only events about one user
pub fn user_filter(user_id: i64) -> EventFilter<UserEvent> {
    EventFilter::new(move |event: &EventEnvelope<UserEvent>| event.metadata.user_id == user_id)
}

/// Broker carrying audit-log notifications
pub type AuditBroker = Broker<AuditEvent>;

/// Broker carrying user-lifecycle notifications
pub type UserBroker = Broker<UserEvent>;
