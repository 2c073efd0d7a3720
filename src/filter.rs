//! Caller-supplied predicates narrowing which events satisfy a wait
//!
//! The broker never branches on event domains. Anything domain-specific,
//! such as "only events for property 12", is an `EventFilter` built by the
//! caller and evaluated identically on the polled and pushed paths.

use crate::types::{EventEnvelope, Metadata};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

type Predicate<P> = dyn Fn(&EventEnvelope<P>) -> bool + Send + Sync;

/// A cheaply clonable predicate over envelopes
pub struct EventFilter<P = Metadata> {
    predicate: Arc<Predicate<P>>,
}

impl<P: 'static> EventFilter<P> {
    /// Build a filter from an arbitrary predicate
    pub fn new(predicate: impl Fn(&EventEnvelope<P>) -> bool + Send + Sync + 'static) -> Self {
        Self {
            predicate: Arc::new(predicate),
        }
    }

    /// Whether `event` satisfies this filter
    pub fn matches(&self, event: &EventEnvelope<P>) -> bool {
        (self.predicate)(event)
    }

    /// Match events whose `event_type` is one of `types`
    pub fn event_types<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let types: HashSet<String> = types.into_iter().map(Into::into).collect();
        Self::new(move |event| types.contains(&event.event_type))
    }

    /// Match events referring to one specific domain object
    pub fn entity(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        Self::new(move |event| {
            event.entity_type.as_deref() == Some(entity_type.as_str())
                && event.entity_id.as_deref() == Some(entity_id.as_str())
        })
    }

    /// Match events satisfying both filters
    pub fn and(self, other: EventFilter<P>) -> Self {
        Self::new(move |event| self.matches(event) && other.matches(event))
    }
}

impl EventFilter<Metadata> {
    /// Match envelopes whose metadata has `key` equal to `value`
    pub fn metadata_eq(key: impl Into<String>, value: serde_json::Value) -> Self {
        let key = key.into();
        Self::new(move |event| event.metadata.get(&key) == Some(&value))
    }
}

impl<P> Clone for EventFilter<P> {
    fn clone(&self) -> Self {
        Self {
            predicate: Arc::clone(&self.predicate),
        }
    }
}

impl<P> fmt::Debug for EventFilter<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventFilter").finish_non_exhaustive()
    }
}
