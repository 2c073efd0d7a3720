//! Core types for the tenant broker
//!
//! All wire-facing types use camelCase JSON serialization so they can be
//! returned unchanged from a long-poll endpoint.

use crate::error::{BrokerError, Result};
use crate::filter::EventFilter;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default envelope payload: an opaque string-keyed JSON object
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// A single notification published to a tenant
///
/// Envelopes are immutable once published. The broker only ever changes
/// which buffer holds them, never their fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope<P = Metadata> {
    /// Unique event identifier (evt-<uuid>)
    pub event_id: String,

    /// Tenant (organization) this event belongs to
    ///
    /// Kept as a raw integer because producers hand in unvalidated ids.
    /// Publishing an envelope with an invalid id is a logged no-op.
    pub tenant_id: i64,

    /// Event discriminator (e.g., "audit_log_created", "user_login")
    pub event_type: String,

    /// Kind of domain object that changed, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Identifier of the domain object that changed, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Producer's wall-clock time when the envelope was built
    ///
    /// Cursors follow the broker's arrival stamp, which equals this value
    /// unless the envelope arrived behind a newer one.
    pub timestamp: DateTime<Utc>,

    /// Producer-defined payload, passed through unmodified
    pub metadata: P,
}

impl<P> EventEnvelope<P> {
    /// Create an envelope with an auto-generated id and the current time
    pub fn new(tenant_id: i64, event_type: impl Into<String>, metadata: P) -> Self {
        Self {
            event_id: format!("evt-{}", uuid::Uuid::new_v4()),
            tenant_id,
            event_type: event_type.into(),
            entity_type: None,
            entity_id: None,
            timestamp: Utc::now(),
            metadata,
        }
    }

    /// Attach the domain object this event refers to
    pub fn with_entity(
        mut self,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    /// Override the publish timestamp
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Override the generated event id
    pub fn with_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = event_id.into();
        self
    }

    /// A cursor at this event's own timestamp
    ///
    /// Matches the `next_cursor` a wait returns for it unless the envelope
    /// arrived behind a newer one and was restamped by its buffer.
    pub fn cursor(&self) -> Cursor {
        Cursor(self.timestamp)
    }
}

/// A validated tenant identifier
///
/// Valid tenant ids are strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct TenantId(i64);

impl TenantId {
    /// Validate a raw tenant id
    pub fn new(id: i64) -> Result<Self> {
        if id > 0 {
            Ok(Self(id))
        } else {
            Err(BrokerError::InvalidTenant(id))
        }
    }

    /// The raw integer id
    pub fn get(self) -> i64 {
        self.0
    }
}

impl TryFrom<i64> for TenantId {
    type Error = BrokerError;

    fn try_from(id: i64) -> Result<Self> {
        Self::new(id)
    }
}

impl From<TenantId> for i64 {
    fn from(id: TenantId) -> Self {
        id.0
    }
}

impl FromStr for TenantId {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self> {
        let id = s.trim().parse::<i64>().map_err(|e| BrokerError::TenantParse {
            input: s.to_string(),
            reason: e.to_string(),
        })?;
        Self::new(id)
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Delivery watermark: the timestamp of the last envelope a consumer saw
///
/// On the wire a cursor is an ISO-8601 / RFC 3339 string. Sub-second
/// precision is kept in full so a round-tripped cursor never re-delivers
/// the event it was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cursor(DateTime<Utc>);

impl Cursor {
    /// Parse a cursor from its wire form
    pub fn parse(input: &str) -> Result<Self> {
        DateTime::parse_from_rfc3339(input.trim())
            .map(|ts| Self(ts.with_timezone(&Utc)))
            .map_err(|e| BrokerError::InvalidCursor {
                input: input.to_string(),
                reason: e.to_string(),
            })
    }

    /// A cursor at the current wall-clock time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// The underlying timestamp
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.0
    }

    /// Whether an envelope published at `timestamp` is newer than this cursor
    pub fn is_before(&self, timestamp: &DateTime<Utc>) -> bool {
        *timestamp > self.0
    }
}

impl From<DateTime<Utc>> for Cursor {
    fn from(ts: DateTime<Utc>) -> Self {
        Self(ts)
    }
}

impl FromStr for Cursor {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Cursor {
    type Error = BrokerError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<Cursor> for String {
    fn from(cursor: Cursor) -> Self {
        cursor.to_string()
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }
}

/// A long-poll request for one tenant
#[derive(Debug, Clone)]
pub struct WaitRequest<P = Metadata> {
    /// Tenant to wait on
    pub tenant: TenantId,

    /// Last timestamp already seen; `None` returns everything still buffered
    pub cursor: Option<Cursor>,

    /// Optional predicate narrowing which events satisfy the wait
    pub filter: Option<EventFilter<P>>,

    /// Long-poll ceiling; clamped to the broker's configured maximum
    pub timeout: Option<Duration>,
}

impl<P> WaitRequest<P> {
    /// Wait on a tenant with no cursor, filter, or custom timeout
    pub fn new(tenant: TenantId) -> Self {
        Self {
            tenant,
            cursor: None,
            filter: None,
            timeout: None,
        }
    }

    /// Only return events newer than `cursor`
    pub fn since(mut self, cursor: Cursor) -> Self {
        self.cursor = Some(cursor);
        self
    }

    /// Only return events matching `filter`
    pub fn filtered(mut self, filter: EventFilter<P>) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Use a shorter long-poll budget than the configured maximum
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// How a wait call was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WaitOutcome {
    /// Matching events were returned
    Delivered,
    /// A publish woke the waiter but nothing matched its filter
    Woken,
    /// The deadline elapsed with nothing to deliver
    TimedOut,
    /// The tenant already had the maximum number of pending waiters
    Rejected,
    /// The caller went away; no response should be sent
    Cancelled,
    /// The broker is shutting down
    Shutdown,
}

/// Result of a long-poll wait
///
/// Serializes as `{ "events": [...], "nextCursor": "..." }`. A timeout
/// is a normal, successful result with no events.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitResult<P = Metadata> {
    /// Events newer than the request cursor, in arrival order
    pub events: Vec<EventEnvelope<P>>,

    /// Cursor to send with the next wait
    pub next_cursor: Cursor,

    /// How the wait was resolved
    #[serde(skip)]
    pub outcome: WaitOutcome,
}

impl<P> WaitResult<P> {
    /// A result with events
    ///
    /// `newest` is the stream stamp of the last event; without events the
    /// cursor stays at `fallback`.
    pub(crate) fn delivered(
        events: Vec<EventEnvelope<P>>,
        newest: Option<Cursor>,
        fallback: Cursor,
    ) -> Self {
        let outcome = if events.is_empty() {
            WaitOutcome::Woken
        } else {
            WaitOutcome::Delivered
        };
        Self {
            events,
            next_cursor: newest.unwrap_or(fallback),
            outcome,
        }
    }

    /// An empty result that leaves the cursor where it was
    pub(crate) fn empty(next_cursor: Cursor, outcome: WaitOutcome) -> Self {
        Self {
            events: Vec::new(),
            next_cursor,
            outcome,
        }
    }

    /// Whether the HTTP layer should answer this result
    pub fn should_respond(&self) -> bool {
        self.outcome != WaitOutcome::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    #[test]
    fn test_envelope_creation() {
        let event = EventEnvelope::new(42, "audit_log_created", Metadata::new())
            .with_entity("audit_log", "991");

        assert!(event.event_id.starts_with("evt-"));
        assert_eq!(event.tenant_id, 42);
        assert_eq!(event.event_type, "audit_log_created");
        assert_eq!(event.entity_type.as_deref(), Some("audit_log"));
        assert_eq!(event.entity_id.as_deref(), Some("991"));
    }

    #[test]
    fn test_envelope_serialization() {
        let mut metadata = Metadata::new();
        metadata.insert("propertyId".to_string(), serde_json::json!(7));
        let event = EventEnvelope::new(42, "user_login", metadata)
            .with_id("evt-1")
            .with_timestamp(ts(0));

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"eventId\":\"evt-1\""));
        assert!(json.contains("\"tenantId\":42"));
        assert!(json.contains("\"eventType\":\"user_login\""));
        assert!(!json.contains("entityType"));

        let parsed: EventEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
        assert_eq!(parsed.metadata["propertyId"], 7);
    }

    #[test]
    fn test_tenant_id_validation() {
        assert_eq!(TenantId::new(7).unwrap().get(), 7);
        assert!(matches!(TenantId::new(0), Err(BrokerError::InvalidTenant(0))));
        assert!(matches!(TenantId::new(-1), Err(BrokerError::InvalidTenant(-1))));
    }

    #[test]
    fn test_tenant_id_from_str() {
        assert_eq!(" 42 ".parse::<TenantId>().unwrap().get(), 42);
        assert!(matches!(
            "NaN".parse::<TenantId>(),
            Err(BrokerError::TenantParse { .. })
        ));
        assert!(matches!(
            "0".parse::<TenantId>(),
            Err(BrokerError::InvalidTenant(0))
        ));
    }

    #[test]
    fn test_tenant_id_deserialize_rejects_invalid() {
        assert!(serde_json::from_str::<TenantId>("5").is_ok());
        assert!(serde_json::from_str::<TenantId>("-5").is_err());
    }

    #[test]
    fn test_cursor_parse_and_display() {
        let cursor = Cursor::parse("2024-03-01T10:00:00.250Z").unwrap();
        assert_eq!(cursor.to_string(), "2024-03-01T10:00:00.250Z");

        let offset = Cursor::parse("2024-03-01T12:00:00+02:00").unwrap();
        assert_eq!(offset.to_string(), "2024-03-01T10:00:00Z");
    }

    #[test]
    fn test_cursor_keeps_sub_millisecond_precision() {
        let ts = Utc.timestamp_nanos(1_700_000_000_123_456_789);
        let cursor = Cursor::from(ts);
        let parsed = Cursor::parse(&cursor.to_string()).unwrap();
        assert_eq!(parsed, cursor);
        assert!(!parsed.is_before(&ts));
    }

    #[test]
    fn test_cursor_parse_rejects_garbage() {
        let err = Cursor::parse("yesterday").unwrap_err();
        assert!(matches!(err, BrokerError::InvalidCursor { .. }));
    }

    #[test]
    fn test_cursor_ordering() {
        let cursor = Cursor::from(ts(0));
        assert!(cursor.is_before(&ts(1)));
        assert!(!cursor.is_before(&ts(0)));
        assert!(!cursor.is_before(&ts(-1)));
    }

    #[test]
    fn test_wait_result_next_cursor() {
        let events = vec![EventEnvelope::new(1, "a", Metadata::new()).with_timestamp(ts(10))];
        let newest = Some(Cursor::from(ts(30)));
        let result = WaitResult::delivered(events, newest, Cursor::from(ts(0)));
        assert_eq!(result.outcome, WaitOutcome::Delivered);
        assert_eq!(result.next_cursor, Cursor::from(ts(30)));

        let woken: WaitResult = WaitResult::delivered(Vec::new(), None, Cursor::from(ts(5)));
        assert_eq!(woken.outcome, WaitOutcome::Woken);
        assert_eq!(woken.next_cursor, Cursor::from(ts(5)));
    }

    #[test]
    fn test_wait_result_wire_shape() {
        let result: WaitResult = WaitResult::empty(Cursor::from(ts(0)), WaitOutcome::TimedOut);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["events"], serde_json::json!([]));
        assert_eq!(json["nextCursor"], "2023-11-14T22:13:20Z");
        assert!(json.get("outcome").is_none());
        assert!(result.should_respond());

        let cancelled: WaitResult = WaitResult::empty(Cursor::from(ts(0)), WaitOutcome::Cancelled);
        assert!(!cancelled.should_respond());
    }
}
