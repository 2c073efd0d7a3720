//! Broker counters and read-only snapshots
//!
//! Producers never learn whether an event was delivered, dropped, or
//! expired; these counters are the only place that is visible.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters shared by every broker clone
///
/// `published` and `delivered` keep one entry per distinct event type and
/// are never pruned. Event types are expected to be a closed set of
/// constants (see `domain`), not values derived from request data.
#[derive(Debug, Default)]
pub struct BrokerMetrics {
    published: DashMap<String, u64>,
    delivered: DashMap<String, u64>,
    dropped_total: AtomicU64,
    expired_total: AtomicU64,
    invalid_tenant_total: AtomicU64,
    waiters_registered: AtomicU64,
    waiters_woken: AtomicU64,
    waiters_timed_out: AtomicU64,
    waiters_rejected: AtomicU64,
    waiters_cancelled: AtomicU64,
    tenants_evicted: AtomicU64,
}

impl BrokerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_published(&self, event_type: &str) {
        bump(&self.published, event_type, 1);
    }

    pub fn record_delivered<'a>(&self, event_types: impl IntoIterator<Item = &'a str>) {
        for event_type in event_types {
            bump(&self.delivered, event_type, 1);
        }
    }

    pub fn record_dropped(&self, count: usize) {
        add(&self.dropped_total, count);
    }

    pub fn record_expired(&self, count: usize) {
        add(&self.expired_total, count);
    }

    pub fn record_invalid_tenant(&self) {
        add(&self.invalid_tenant_total, 1);
    }

    pub fn record_waiter_registered(&self) {
        add(&self.waiters_registered, 1);
    }

    pub fn record_waiters_woken(&self, count: usize) {
        add(&self.waiters_woken, count);
    }

    pub fn record_waiter_timed_out(&self) {
        add(&self.waiters_timed_out, 1);
    }

    pub fn record_waiter_rejected(&self) {
        add(&self.waiters_rejected, 1);
    }

    pub fn record_waiter_cancelled(&self) {
        add(&self.waiters_cancelled, 1);
    }

    pub fn record_evicted(&self, count: usize) {
        add(&self.tenants_evicted, count);
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    /// Snapshot the counters; tenant gauges are filled in by the broker
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tenants_tracked: 0,
            buffer_sizes: BTreeMap::new(),
            pending_waiters: 0,
            dropped_total: self.dropped_total.load(Ordering::Relaxed),
            expired_total: self.expired_total.load(Ordering::Relaxed),
            invalid_tenant_total: self.invalid_tenant_total.load(Ordering::Relaxed),
            published: collect(&self.published),
            delivered: collect(&self.delivered),
            waiters: WaiterCounts {
                registered: self.waiters_registered.load(Ordering::Relaxed),
                woken: self.waiters_woken.load(Ordering::Relaxed),
                timed_out: self.waiters_timed_out.load(Ordering::Relaxed),
                rejected: self.waiters_rejected.load(Ordering::Relaxed),
                cancelled: self.waiters_cancelled.load(Ordering::Relaxed),
            },
            tenants_evicted: self.tenants_evicted.load(Ordering::Relaxed),
        }
    }
}

fn add(counter: &AtomicU64, count: usize) {
    if count > 0 {
        counter.fetch_add(count as u64, Ordering::Relaxed);
    }
}

fn bump(map: &DashMap<String, u64>, key: &str, count: u64) {
    if let Some(mut entry) = map.get_mut(key) {
        *entry += count;
        return;
    }
    *map.entry(key.to_string()).or_insert(0) += count;
}

fn collect(map: &DashMap<String, u64>) -> BTreeMap<String, u64> {
    map.iter().map(|e| (e.key().clone(), *e.value())).collect()
}

/// Waiter lifecycle counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WaiterCounts {
    pub registered: u64,
    pub woken: u64,
    pub timed_out: u64,
    pub rejected: u64,
    pub cancelled: u64,
}

/// Point-in-time view of broker state for dashboards
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// Number of tenant buffers currently held
    pub tenants_tracked: usize,
    /// Current queue length per tenant
    pub buffer_sizes: BTreeMap<i64, usize>,
    /// Waiters parked across all tenants
    pub pending_waiters: usize,
    /// Envelopes dropped by overflow since start
    pub dropped_total: u64,
    /// Envelopes removed by TTL since start
    pub expired_total: u64,
    /// Publishes ignored because of an invalid tenant id
    pub invalid_tenant_total: u64,
    /// Published envelopes by event type
    pub published: BTreeMap<String, u64>,
    /// Envelopes handed to consumers by event type
    pub delivered: BTreeMap<String, u64>,
    pub waiters: WaiterCounts,
    pub tenants_evicted: u64,
}

/// Point-in-time view of one tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantStats {
    pub tenant_id: i64,
    pub buffered: usize,
    pub pending_waiters: usize,
    pub idle_ms: u64,
}
