//! Per-tenant event buffer
//!
//! A `TenantBuffer` is the unit of isolation and locking: one bounded,
//! time-windowed queue plus the waiters parked on it. Every buffer sits
//! behind its own mutex. The lock is only ever held for in-memory work and
//! never across an `.await`.

use crate::config::WakePolicy;
use crate::filter::EventFilter;
use crate::types::{Cursor, EventEnvelope, TenantId};
use crate::waiter::Waiter;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// A tenant buffer shared between the broker map and wait guards
pub(crate) type SharedBuffer<P> = Arc<Mutex<TenantBuffer<P>>>;

/// Lock a buffer, recovering the state if a previous holder panicked
///
/// Buffer operations leave the queue and waiter list consistent between
/// statements, so a poisoned lock still guards usable state.
pub(crate) fn lock_buffer<P>(
    buffer: &Mutex<TenantBuffer<P>>,
) -> MutexGuard<'_, TenantBuffer<P>> {
    buffer.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("Recovering poisoned tenant buffer lock");
        poisoned.into_inner()
    })
}

struct BufferedEvent<P> {
    envelope: EventEnvelope<P>,
    arrived_at: Instant,
    /// Position in the tenant stream that cursors are compared against
    stamp: DateTime<Utc>,
}

/// Envelopes handed to one consumer, plus the stamp to resume after
#[derive(Debug)]
pub(crate) struct Batch<P> {
    pub events: Vec<EventEnvelope<P>>,
    /// Stream stamp of the last envelope in `events`
    pub cursor: Option<Cursor>,
}

impl<P> Batch<P> {
    pub(crate) fn empty() -> Self {
        Self {
            events: Vec::new(),
            cursor: None,
        }
    }
}

/// Counts from appending one envelope
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PushOutcome {
    /// Entries removed because they outlived the TTL
    pub expired: usize,
    /// Entries removed because the queue was over capacity
    pub dropped: usize,
}

pub(crate) struct TenantBuffer<P> {
    tenant: TenantId,
    queue: VecDeque<BufferedEvent<P>>,
    capacity: usize,
    ttl: Duration,
    waiters: Vec<Waiter<P>>,
    last_active: Instant,
    last_stamp: Option<DateTime<Utc>>,
    evicted: bool,
}

impl<P> TenantBuffer<P> {
    pub(crate) fn new(tenant: TenantId, capacity: usize, ttl: Duration, now: Instant) -> Self {
        Self {
            tenant,
            queue: VecDeque::new(),
            capacity,
            ttl,
            waiters: Vec::new(),
            last_active: now,
            last_stamp: None,
            evicted: false,
        }
    }

    pub(crate) fn tenant(&self) -> TenantId {
        self.tenant
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    pub(crate) fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_active)
    }

    pub(crate) fn touch(&mut self, now: Instant) {
        if now > self.last_active {
            self.last_active = now;
        }
    }

    /// Append an envelope, then trim expired and overflowing entries
    ///
    /// Each entry is stamped strictly after the previous one, so stream
    /// order always matches arrival order even when producers' clocks
    /// disagree. The envelope keeps its own timestamp.
    pub(crate) fn push(&mut self, envelope: EventEnvelope<P>, now: Instant) -> PushOutcome {
        debug_assert_eq!(envelope.tenant_id, self.tenant.get());
        self.touch(now);

        let stamp = self.next_stamp(envelope.timestamp);
        if stamp != envelope.timestamp {
            tracing::debug!(
                tenant_id = self.tenant.get(),
                event_id = %envelope.event_id,
                timestamp = %envelope.timestamp,
                stamp = %stamp,
                "Envelope arrived behind the tenant stream, restamped"
            );
        }
        self.last_stamp = Some(stamp);
        self.queue.push_back(BufferedEvent {
            envelope,
            arrived_at: now,
            stamp,
        });

        let expired = self.purge_expired(now);

        let mut dropped = 0;
        if self.queue.len() > self.capacity {
            dropped = self.queue.len() - self.capacity;
            self.queue.drain(..dropped);
        }

        PushOutcome { expired, dropped }
    }

    fn next_stamp(&self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        match self.last_stamp {
            Some(last) if timestamp <= last => last + chrono::Duration::nanoseconds(1),
            _ => timestamp,
        }
    }

    /// Drop entries at least `ttl` old from the head of the queue
    ///
    /// The queue is in arrival order, so expiry stops at the first entry
    /// still inside the window.
    pub(crate) fn purge_expired(&mut self, now: Instant) -> usize {
        let mut expired = 0;
        while let Some(front) = self.queue.front() {
            if now.saturating_duration_since(front.arrived_at) < self.ttl {
                break;
            }
            self.queue.pop_front();
            expired += 1;
        }
        expired
    }

    pub(crate) fn add_waiter(&mut self, waiter: Waiter<P>) {
        self.waiters.push(waiter);
    }

    pub(crate) fn remove_waiter(&mut self, waiter_id: u64, now: Instant) -> Option<Waiter<P>> {
        let index = self.waiters.iter().position(|w| w.id() == waiter_id)?;
        self.touch(now);
        Some(self.waiters.remove(index))
    }

    pub(crate) fn take_all_waiters(&mut self) -> Vec<Waiter<P>> {
        std::mem::take(&mut self.waiters)
    }

    /// Remove waiters whose caller is gone or whose deadline passed long ago
    pub(crate) fn take_stale_waiters(&mut self, now: Instant, grace: Duration) -> Vec<Waiter<P>> {
        let (stale, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.waiters)
            .into_iter()
            .partition(|w| w.is_abandoned() || now >= w.deadline() + grace);
        self.waiters = live;
        stale
    }

    /// Whether the sweep may reclaim this buffer
    pub(crate) fn is_evictable(&self, now: Instant, idle: Duration) -> bool {
        self.queue.is_empty() && self.waiters.is_empty() && self.idle_for(now) > idle
    }

    pub(crate) fn mark_evicted(&mut self) {
        self.evicted = true;
    }

    pub(crate) fn is_evicted(&self) -> bool {
        self.evicted
    }
}

impl<P: Clone + 'static> TenantBuffer<P> {
    /// Envelopes stamped after `cursor` matching `filter`, in arrival order
    ///
    /// Does not purge; callers purge first so polled and pushed delivery
    /// see the same window.
    pub(crate) fn collect_since(
        &self,
        cursor: Option<&Cursor>,
        filter: Option<&EventFilter<P>>,
    ) -> Batch<P> {
        let mut batch = Batch::empty();
        for entry in &self.queue {
            if cursor.is_some_and(|c| !c.is_before(&entry.stamp)) {
                continue;
            }
            if filter.is_some_and(|f| !f.matches(&entry.envelope)) {
                continue;
            }
            batch.events.push(entry.envelope.clone());
            batch.cursor = Some(Cursor::from(entry.stamp));
        }
        batch
    }

    /// Detach the waiters a publish should wake, each paired with its events
    ///
    /// Events are evaluated against the current queue. The caller resolves
    /// the returned waiters after releasing the buffer lock.
    pub(crate) fn detach_waiters(
        &mut self,
        policy: WakePolicy,
    ) -> Vec<(Waiter<P>, Batch<P>)> {
        let mut woken = Vec::new();
        for waiter in std::mem::take(&mut self.waiters) {
            let batch = self.collect_since(waiter.cursor(), waiter.filter());
            if batch.events.is_empty() && policy == WakePolicy::Matching {
                self.waiters.push(waiter);
            } else {
                woken.push((waiter, batch));
            }
        }
        woken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Metadata;
    use chrono::{TimeZone, Utc};
    use tokio::sync::oneshot;

    const TTL: Duration = Duration::from_secs(25);

    fn buffer(capacity: usize) -> TenantBuffer<Metadata> {
        TenantBuffer::new(TenantId::new(42).unwrap(), capacity, TTL, Instant::now())
    }

    fn event(id: &str, ms: i64) -> EventEnvelope {
        EventEnvelope::new(42, "audit_log_created", Metadata::new())
            .with_id(id)
            .with_timestamp(Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap())
    }

    fn ids(events: &[EventEnvelope]) -> Vec<&str> {
        events.iter().map(|e| e.event_id.as_str()).collect()
    }

    fn waiter(id: u64, cursor: Option<Cursor>, filter: Option<EventFilter>) -> Waiter<Metadata> {
        let (tx, _rx) = oneshot::channel();
        Waiter::new(id, cursor, filter, tx, Instant::now() + TTL)
    }

    #[tokio::test]
    async fn test_push_preserves_arrival_order() {
        let mut buf = buffer(10);
        let now = Instant::now();
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            buf.push(event(id, i as i64), now);
        }
        assert_eq!(ids(&buf.collect_since(None, None).events), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_push_drops_oldest_on_overflow() {
        let mut buf = buffer(3);
        let now = Instant::now();
        let mut dropped = 0;
        for (i, id) in ["A", "B", "C", "D"].iter().enumerate() {
            dropped += buf.push(event(id, i as i64), now).dropped;
        }
        assert_eq!(dropped, 1);
        assert_eq!(buf.len(), 3);
        assert_eq!(ids(&buf.collect_since(None, None).events), vec!["B", "C", "D"]);
    }

    #[tokio::test]
    async fn test_purge_expired_from_head() {
        let mut buf = buffer(10);
        let start = Instant::now();
        buf.push(event("old", 0), start);
        buf.push(event("new", 1), start + Duration::from_secs(10));

        assert_eq!(buf.purge_expired(start + TTL - Duration::from_millis(1)), 0);
        assert_eq!(buf.purge_expired(start + TTL), 1);
        assert_eq!(ids(&buf.collect_since(None, None).events), vec!["new"]);
    }

    #[tokio::test]
    async fn test_push_reports_expired_entries() {
        let mut buf = buffer(10);
        let start = Instant::now();
        buf.push(event("a", 0), start);
        let outcome = buf.push(event("b", 1), start + TTL);
        assert_eq!(outcome, PushOutcome { expired: 1, dropped: 0 });
    }

    #[tokio::test]
    async fn test_collect_since_cursor_and_filter() {
        let mut buf = buffer(10);
        let now = Instant::now();
        buf.push(event("a", 0), now);
        buf.push(event("b", 10).with_entity("task", "1"), now);
        buf.push(event("c", 20), now);

        let cursor = Cursor::from(event("x", 0).timestamp);
        assert_eq!(ids(&buf.collect_since(Some(&cursor), None).events), vec!["b", "c"]);

        let filter = EventFilter::entity("task", "1");
        assert_eq!(ids(&buf.collect_since(None, Some(&filter)).events), vec!["b"]);
    }

    #[tokio::test]
    async fn test_late_envelope_stamped_after_stream() {
        let mut buf = buffer(10);
        let now = Instant::now();
        buf.push(event("b", 10), now);

        let first = buf.collect_since(None, None);
        let cursor = first.cursor.unwrap();
        assert_eq!(cursor, Cursor::from(event("x", 10).timestamp));

        // Built earlier, arrives later
        buf.push(event("a", 5), now);
        let second = buf.collect_since(Some(&cursor), None);
        assert_eq!(ids(&second.events), vec!["a"]);
        assert_eq!(second.events[0].timestamp, event("x", 5).timestamp);
        assert!(second.cursor.unwrap() > cursor);

        assert!(buf.collect_since(second.cursor.as_ref(), None).events.is_empty());
    }

    #[tokio::test]
    async fn test_equal_timestamps_get_distinct_stamps() {
        let mut buf = buffer(10);
        let now = Instant::now();
        buf.push(event("a", 0), now);
        let cursor = buf.collect_since(None, None).cursor.unwrap();

        buf.push(event("b", 0), now);
        assert_eq!(ids(&buf.collect_since(Some(&cursor), None).events), vec!["b"]);
    }

    #[tokio::test]
    async fn test_batch_cursor_skips_filtered_entries() {
        let mut buf = buffer(10);
        let now = Instant::now();
        buf.push(event("a", 0).with_entity("task", "1"), now);
        buf.push(event("b", 10), now);

        let filter = EventFilter::entity("task", "1");
        let batch = buf.collect_since(None, Some(&filter));
        assert_eq!(batch.cursor, Some(Cursor::from(event("x", 0).timestamp)));
    }

    #[tokio::test]
    async fn test_detach_waiters_broadcast() {
        let mut buf = buffer(10);
        buf.add_waiter(waiter(1, None, None));
        buf.add_waiter(waiter(2, None, Some(EventFilter::entity("task", "9"))));
        buf.push(event("a", 0), Instant::now());

        let woken = buf.detach_waiters(WakePolicy::Broadcast);
        assert_eq!(woken.len(), 2);
        assert_eq!(woken[0].1.events.len(), 1);
        assert!(woken[1].1.events.is_empty());
        assert!(woken[1].1.cursor.is_none());
        assert_eq!(buf.waiter_count(), 0);
    }

    #[tokio::test]
    async fn test_detach_waiters_matching_keeps_unmatched() {
        let mut buf = buffer(10);
        buf.add_waiter(waiter(1, None, None));
        buf.add_waiter(waiter(2, None, Some(EventFilter::entity("task", "9"))));
        buf.push(event("a", 0), Instant::now());

        let woken = buf.detach_waiters(WakePolicy::Matching);
        assert_eq!(woken.len(), 1);
        assert_eq!(woken[0].0.id(), 1);
        assert_eq!(buf.waiter_count(), 1);
    }

    #[tokio::test]
    async fn test_remove_waiter() {
        let mut buf = buffer(10);
        buf.add_waiter(waiter(1, None, None));
        buf.add_waiter(waiter(2, None, None));

        assert!(buf.remove_waiter(1, Instant::now()).is_some());
        assert!(buf.remove_waiter(1, Instant::now()).is_none());
        assert_eq!(buf.waiter_count(), 1);
    }

    #[tokio::test]
    async fn test_take_stale_waiters() {
        let mut buf = buffer(10);
        // Receiver dropped inside the helper
        buf.add_waiter(waiter(1, None, None));

        let (tx, _live_rx) = oneshot::channel();
        buf.add_waiter(Waiter::new(2, None, None, tx, Instant::now() + TTL));

        let stale = buf.take_stale_waiters(Instant::now(), Duration::from_secs(1));
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id(), 1);
        assert_eq!(buf.waiter_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_is_evictable() {
        let idle = Duration::from_secs(120);
        let mut buf = buffer(10);
        let start = Instant::now();

        assert!(!buf.is_evictable(start + idle, idle));
        assert!(buf.is_evictable(start + idle + Duration::from_millis(1), idle));

        buf.push(event("a", 0), start);
        assert!(!buf.is_evictable(start + idle * 2, idle));

        buf.purge_expired(start + idle * 2);
        let (tx, _rx) = oneshot::channel();
        buf.add_waiter(Waiter::new(1, None, None, tx, start + TTL));
        assert!(!buf.is_evictable(start + idle * 2, idle));
    }
}
