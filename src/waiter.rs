//! Parked long-poll continuations
//!
//! A `Waiter` lives in its tenant's buffer while a wait call is suspended.
//! It owns the sending half of a oneshot channel, so it can be resolved at
//! most once. The `WaitGuard` held by the suspended call removes the waiter
//! from the buffer when the call finishes without being woken, including
//! when its future is dropped by a disconnecting client.

use crate::buffer::{lock_buffer, Batch, SharedBuffer};
use crate::filter::EventFilter;
use crate::types::Cursor;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// What a woken waiter receives
#[derive(Debug)]
pub(crate) enum Wake<P> {
    /// Events newer than the waiter's cursor matching its filter; may be empty
    Events(Batch<P>),
    /// The broker is shutting down
    Shutdown,
}

/// A pending wait registered on a tenant buffer
pub(crate) struct Waiter<P> {
    id: u64,
    cursor: Option<Cursor>,
    filter: Option<EventFilter<P>>,
    completion: oneshot::Sender<Wake<P>>,
    deadline: Instant,
}

impl<P> Waiter<P> {
    pub(crate) fn new(
        id: u64,
        cursor: Option<Cursor>,
        filter: Option<EventFilter<P>>,
        completion: oneshot::Sender<Wake<P>>,
        deadline: Instant,
    ) -> Self {
        Self {
            id,
            cursor,
            filter,
            completion,
            deadline,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn cursor(&self) -> Option<&Cursor> {
        self.cursor.as_ref()
    }

    pub(crate) fn filter(&self) -> Option<&EventFilter<P>> {
        self.filter.as_ref()
    }

    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
    }

    /// The suspended call has gone away without removing this waiter
    pub(crate) fn is_abandoned(&self) -> bool {
        self.completion.is_closed()
    }

    /// Complete the wait. Returns false if the caller is no longer listening.
    pub(crate) fn resolve(self, wake: Wake<P>) -> bool {
        self.completion.send(wake).is_ok()
    }
}

/// Removes a waiter from its buffer unless the waiter was already woken
pub(crate) struct WaitGuard<P> {
    buffer: SharedBuffer<P>,
    waiter_id: u64,
    armed: bool,
}

impl<P> WaitGuard<P> {
    pub(crate) fn new(buffer: SharedBuffer<P>, waiter_id: u64) -> Self {
        Self {
            buffer,
            waiter_id,
            armed: true,
        }
    }

    /// The waiter was woken by a publish; nothing is left to clean up
    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }

    /// Remove the waiter from its buffer
    ///
    /// Returns true if this call removed it. False means a publish or
    /// shutdown detached it first and a wake is already on its way.
    pub(crate) fn detach(&mut self) -> bool {
        if !self.armed {
            return false;
        }
        self.armed = false;
        let mut buffer = lock_buffer(&self.buffer);
        buffer.remove_waiter(self.waiter_id, Instant::now()).is_some()
    }
}

impl<P> Drop for WaitGuard<P> {
    fn drop(&mut self) {
        if self.armed && self.detach() {
            tracing::debug!(waiter_id = self.waiter_id, "Waiter dropped before resolution");
        }
    }
}
