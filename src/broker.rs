//! Per-tenant event broker with long-poll delivery
//!
//! `Broker` owns a concurrent map of tenant buffers. Producers call
//! [`Broker::publish`]; long-poll handlers call [`Broker::wait_for_events`].
//! Each tenant buffer has its own lock, so tenants never contend with each
//! other, and waiters are always completed after that lock is released.

use crate::buffer::{lock_buffer, Batch, SharedBuffer, TenantBuffer};
use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::filter::EventFilter;
use crate::metrics::{BrokerMetrics, MetricsSnapshot, TenantStats};
use crate::sweep::{self, SweepReport};
use crate::types::{Cursor, EventEnvelope, Metadata, TenantId, WaitOutcome, WaitRequest, WaitResult};
use crate::waiter::{Wake, WaitGuard, Waiter};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Shared broker state; the sweep task only holds a weak reference to it
pub(crate) struct BrokerInner<P> {
    pub(crate) config: BrokerConfig,
    pub(crate) tenants: DashMap<TenantId, SharedBuffer<P>>,
    pub(crate) metrics: BrokerMetrics,
    next_waiter_id: AtomicU64,
    shutdown: CancellationToken,
    sweep: Mutex<Option<JoinHandle<()>>>,
}

impl<P> Drop for BrokerInner<P> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// In-memory, per-tenant event broker
///
/// Cheap to clone; every clone shares the same tenant map. Construct one
/// per process and hand clones to request handlers and the event
/// subscriber.
pub struct Broker<P = Metadata> {
    inner: Arc<BrokerInner<P>>,
}

impl<P> Clone for Broker<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// What a wait call found when it took the buffer lock
enum Registration<P> {
    Ready(Batch<P>),
    Full,
    Parked {
        rx: oneshot::Receiver<Wake<P>>,
        guard: WaitGuard<P>,
    },
}

impl<P> Broker<P>
where
    P: Clone + Send + Sync + 'static,
{
    /// Create a broker and start its eviction sweep
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: BrokerConfig) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| BrokerError::NoRuntime)?;

        let inner = Arc::new(BrokerInner {
            config,
            tenants: DashMap::new(),
            metrics: BrokerMetrics::new(),
            next_waiter_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            sweep: Mutex::new(None),
        });

        let task = runtime.spawn(sweep::run(
            Arc::downgrade(&inner),
            inner.config.idle_evict(),
            inner.shutdown.clone(),
        ));
        *inner.sweep.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);

        tracing::info!(
            max_buffer_size = inner.config.max_buffer_size,
            event_ttl_ms = inner.config.event_ttl_ms,
            long_poll_timeout_ms = inner.config.long_poll_timeout_ms,
            max_waiters_per_tenant = inner.config.max_waiters_per_tenant,
            idle_evict_ms = inner.config.idle_evict_ms,
            wake_policy = %inner.config.wake_policy,
            "Event broker started"
        );

        Ok(Self { inner })
    }

    /// Broker configuration
    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// Publish an event to its tenant
    ///
    /// Fire-and-forget: never blocks beyond in-memory work and never fails.
    /// An envelope with an invalid tenant id is dropped with a warning.
    pub fn publish(&self, event: EventEnvelope<P>) {
        let tenant = match TenantId::new(event.tenant_id) {
            Ok(tenant) => tenant,
            Err(_) => {
                self.inner.metrics.record_invalid_tenant();
                tracing::warn!(
                    tenant_id = event.tenant_id,
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    "Dropping event with invalid tenant id"
                );
                return;
            }
        };

        let now = Instant::now();
        let event_id = event.event_id.clone();
        let event_type = event.event_type.clone();
        let policy = self.inner.config.wake_policy;

        let (outcome, woken, queued) = self.with_buffer(tenant, |buffer, _| {
            let outcome = buffer.push(event, now);
            let woken = buffer.detach_waiters(policy);
            (outcome, woken, buffer.len())
        });

        let metrics = &self.inner.metrics;
        metrics.record_published(&event_type);
        metrics.record_expired(outcome.expired);
        metrics.record_dropped(outcome.dropped);
        metrics.record_waiters_woken(woken.len());

        if outcome.dropped > 0 {
            tracing::debug!(
                tenant_id = tenant.get(),
                dropped = outcome.dropped,
                capacity = self.inner.config.max_buffer_size,
                "Tenant buffer overflow, dropped oldest events"
            );
        }

        tracing::debug!(
            tenant_id = tenant.get(),
            event_id = %event_id,
            event_type = %event_type,
            queued,
            woken = woken.len(),
            "Event published"
        );

        for (waiter, batch) in woken {
            waiter.resolve(Wake::Events(batch));
        }
    }

    /// Wait for events newer than the request cursor
    ///
    /// Returns at once when matching events are buffered. Otherwise parks
    /// until a publish wakes it, the timeout elapses, `cancel` fires, or the
    /// broker shuts down. Dropping the returned future also releases the
    /// parked waiter immediately.
    pub async fn wait_for_events(
        &self,
        request: WaitRequest<P>,
        cancel: &CancellationToken,
    ) -> WaitResult<P> {
        let WaitRequest {
            tenant,
            cursor,
            filter,
            timeout,
        } = request;

        let fallback = cursor.unwrap_or_else(Cursor::now);
        if cancel.is_cancelled() {
            return WaitResult::empty(fallback, WaitOutcome::Cancelled);
        }

        let max_timeout = self.inner.config.long_poll_timeout();
        let budget = timeout.map_or(max_timeout, |t| t.min(max_timeout));
        let now = Instant::now();
        let deadline = now + budget;
        let shutting_down = self.inner.shutdown.is_cancelled();

        let registration = self.with_buffer(tenant, |buffer, handle| {
            buffer.touch(now);
            let expired = buffer.purge_expired(now);
            self.inner.metrics.record_expired(expired);

            let available = buffer.collect_since(cursor.as_ref(), filter.as_ref());
            if !available.events.is_empty() {
                return Registration::Ready(available);
            }
            if shutting_down || buffer.waiter_count() >= self.inner.config.max_waiters_per_tenant {
                return Registration::Full;
            }

            let (tx, rx) = oneshot::channel();
            let id = self.inner.next_waiter_id.fetch_add(1, Ordering::Relaxed);
            buffer.add_waiter(Waiter::new(id, cursor, filter.clone(), tx, deadline));
            Registration::Parked {
                rx,
                guard: WaitGuard::new(Arc::clone(handle), id),
            }
        });

        let (mut rx, mut guard) = match registration {
            Registration::Ready(batch) => return self.deliver(batch, fallback),
            Registration::Full if shutting_down => {
                return WaitResult::empty(fallback, WaitOutcome::Shutdown);
            }
            Registration::Full => {
                self.inner.metrics.record_waiter_rejected();
                tracing::debug!(
                    tenant_id = tenant.get(),
                    max_waiters = self.inner.config.max_waiters_per_tenant,
                    "Waiter cap reached, returning empty result"
                );
                return WaitResult::empty(fallback, WaitOutcome::Rejected);
            }
            Registration::Parked { rx, guard } => (rx, guard),
        };

        self.inner.metrics.record_waiter_registered();
        tracing::debug!(
            tenant_id = tenant.get(),
            timeout_ms = budget.as_millis() as u64,
            "Waiter parked"
        );

        tokio::select! {
            biased;
            wake = &mut rx => {
                guard.disarm();
                self.on_wake(wake, fallback)
            }
            _ = cancel.cancelled() => {
                guard.detach();
                self.inner.metrics.record_waiter_cancelled();
                tracing::debug!(tenant_id = tenant.get(), "Waiter cancelled by caller");
                WaitResult::empty(fallback, WaitOutcome::Cancelled)
            }
            _ = tokio::time::sleep_until(deadline) => {
                if guard.detach() {
                    self.inner.metrics.record_waiter_timed_out();
                    WaitResult::empty(fallback, WaitOutcome::TimedOut)
                } else {
                    // A publish detached this waiter in the same instant
                    self.on_wake(rx.await, fallback)
                }
            }
            _ = self.inner.shutdown.cancelled() => {
                if guard.detach() {
                    WaitResult::empty(fallback, WaitOutcome::Shutdown)
                } else {
                    self.on_wake(rx.await, fallback)
                }
            }
        }
    }

    /// Buffered events for a tenant newer than `cursor` matching `filter`
    ///
    /// Purges expired entries first. An untracked tenant yields nothing and
    /// is not created. Returned envelopes are copies.
    pub fn get_events_since(
        &self,
        tenant: TenantId,
        cursor: Option<&Cursor>,
        filter: Option<&EventFilter<P>>,
    ) -> Vec<EventEnvelope<P>> {
        let Some(handle) = self.existing_buffer(tenant) else {
            return Vec::new();
        };

        let events = {
            let mut buffer = lock_buffer(&handle);
            let expired = buffer.purge_expired(Instant::now());
            self.inner.metrics.record_expired(expired);
            buffer.collect_since(cursor, filter).events
        };

        self.inner
            .metrics
            .record_delivered(events.iter().map(|e| e.event_type.as_str()));
        events
    }

    /// Snapshot of counters and per-tenant gauges
    pub fn metrics(&self) -> MetricsSnapshot {
        let mut snapshot = self.inner.metrics.snapshot();
        for handle in self.buffers() {
            let buffer = lock_buffer(&handle);
            snapshot.buffer_sizes.insert(buffer.tenant().get(), buffer.len());
            snapshot.pending_waiters += buffer.waiter_count();
        }
        snapshot.tenants_tracked = snapshot.buffer_sizes.len();
        snapshot
    }

    /// Current state of one tenant, if tracked
    pub fn tenant_stats(&self, tenant: TenantId) -> Option<TenantStats> {
        let handle = self.existing_buffer(tenant)?;
        let buffer = lock_buffer(&handle);
        Some(TenantStats {
            tenant_id: tenant.get(),
            buffered: buffer.len(),
            pending_waiters: buffer.waiter_count(),
            idle_ms: buffer.idle_for(Instant::now()).as_millis() as u64,
        })
    }

    /// Number of tenant buffers currently held
    pub fn tenant_count(&self) -> usize {
        self.inner.tenants.len()
    }

    /// Total envelopes dropped by overflow
    pub fn dropped_total(&self) -> u64 {
        self.inner.metrics.dropped_total()
    }

    /// Run one eviction pass now instead of waiting for the next tick
    pub fn sweep_now(&self) -> SweepReport {
        sweep::sweep_once(&self.inner, Instant::now())
    }

    /// Whether `shutdown` has been called
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Stop the sweep and release every parked waiter
    ///
    /// Parked wait calls return an empty `Shutdown` result. Publishing
    /// still buffers events afterwards but new waits no longer park.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let task = self
            .inner
            .sweep
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Eviction sweep ended abnormally");
            }
        }

        let mut released = 0;
        for handle in self.buffers() {
            let waiters = lock_buffer(&handle).take_all_waiters();
            released += waiters.len();
            for waiter in waiters {
                waiter.resolve(Wake::Shutdown);
            }
        }

        tracing::info!(
            tenants = self.inner.tenants.len(),
            released_waiters = released,
            "Event broker shut down"
        );
    }

    fn on_wake(
        &self,
        wake: std::result::Result<Wake<P>, oneshot::error::RecvError>,
        fallback: Cursor,
    ) -> WaitResult<P> {
        match wake {
            Ok(Wake::Events(batch)) => self.deliver(batch, fallback),
            Ok(Wake::Shutdown) | Err(_) => WaitResult::empty(fallback, WaitOutcome::Shutdown),
        }
    }

    fn deliver(&self, batch: Batch<P>, fallback: Cursor) -> WaitResult<P> {
        self.inner
            .metrics
            .record_delivered(batch.events.iter().map(|e| e.event_type.as_str()));
        WaitResult::delivered(batch.events, batch.cursor, fallback)
    }

    /// Run `f` against the tenant's live buffer, creating it if needed
    ///
    /// The map shard lock is released before the buffer lock is taken. If
    /// the sweep evicted the buffer in between, retry on a fresh one.
    fn with_buffer<R>(
        &self,
        tenant: TenantId,
        f: impl FnOnce(&mut TenantBuffer<P>, &SharedBuffer<P>) -> R,
    ) -> R {
        loop {
            let handle = self.buffer_handle(tenant);
            let mut buffer = lock_buffer(&handle);
            if buffer.is_evicted() {
                continue;
            }
            return f(&mut *buffer, &handle);
        }
    }

    fn buffer_handle(&self, tenant: TenantId) -> SharedBuffer<P> {
        if let Some(handle) = self.existing_buffer(tenant) {
            return handle;
        }
        let config = &self.inner.config;
        self.inner
            .tenants
            .entry(tenant)
            .or_insert_with(|| {
                tracing::debug!(tenant_id = tenant.get(), "Tenant buffer created");
                Arc::new(Mutex::new(TenantBuffer::new(
                    tenant,
                    config.max_buffer_size,
                    config.event_ttl(),
                    Instant::now(),
                )))
            })
            .value()
            .clone()
    }

    fn existing_buffer(&self, tenant: TenantId) -> Option<SharedBuffer<P>> {
        self.inner.tenants.get(&tenant).map(|entry| entry.value().clone())
    }

    fn buffers(&self) -> Vec<SharedBuffer<P>> {
        self.inner
            .tenants
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}
