//! Idle-tenant eviction sweep
//!
//! A background task owned by the broker. It holds only a weak reference
//! to broker state, so dropping the last `Broker` handle ends it as surely
//! as `Broker::shutdown` does.

use crate::broker::BrokerInner;
use crate::buffer::{lock_buffer, Batch};
use crate::waiter::Wake;
use std::sync::Weak;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// How long past its deadline a waiter may linger before the sweep resolves it
const STALE_WAITER_GRACE: Duration = Duration::from_secs(5);

/// What one sweep pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Tenant buffers removed from the map
    pub evicted: usize,
    /// Envelopes removed by TTL during the pass
    pub expired: usize,
    /// Abandoned or overdue waiters cleared during the pass
    pub stale_waiters: usize,
}

/// Run the sweep loop until `cancel` fires or the broker is dropped
pub(crate) async fn run<P>(inner: Weak<BrokerInner<P>>, every: Duration, cancel: CancellationToken)
where
    P: Clone + Send + Sync + 'static,
{
    tracing::debug!(interval_ms = every.as_millis() as u64, "Eviction sweep started");

    let mut interval = tokio::time::interval_at(Instant::now() + every, every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Eviction sweep stopping");
                break;
            }
            _ = interval.tick() => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let report = sweep_once(&inner, Instant::now());
                if report.evicted > 0 {
                    tracing::debug!(
                        evicted = report.evicted,
                        expired = report.expired,
                        stale_waiters = report.stale_waiters,
                        remaining = inner.tenants.len(),
                        "Evicted idle tenants"
                    );
                }
            }
        }
    }
}

/// One pass over every tenant buffer
///
/// Expired entries are purged first, so a tenant whose last events aged
/// out becomes eligible in the same pass. A buffer with queued events or
/// a live waiter is never evicted.
pub(crate) fn sweep_once<P>(inner: &BrokerInner<P>, now: Instant) -> SweepReport
where
    P: Clone + Send + Sync + 'static,
{
    let idle = inner.config.idle_evict();
    let mut report = SweepReport::default();
    let mut stale = Vec::new();

    inner.tenants.retain(|_, handle| {
        let mut buffer = lock_buffer(handle);
        report.expired += buffer.purge_expired(now);
        stale.extend(buffer.take_stale_waiters(now, STALE_WAITER_GRACE));

        if buffer.is_evictable(now, idle) {
            buffer.mark_evicted();
            tracing::debug!(tenant_id = buffer.tenant().get(), "Tenant buffer evicted");
            report.evicted += 1;
            false
        } else {
            true
        }
    });

    report.stale_waiters = stale.len();
    for waiter in stale {
        waiter.resolve(Wake::Events(Batch::empty()));
    }

    inner.metrics.record_expired(report.expired);
    inner.metrics.record_evicted(report.evicted);
    report
}
