//! # tenant-broker
//!
//! Per-tenant in-memory event broker with long-poll delivery.
//!
//! ## Overview
//!
//! `tenant-broker` lets UI clients observe near-real-time state changes
//! without polling a database. Business handlers publish an envelope after
//! committing a change; long-poll handlers wait for envelopes newer than
//! the client's cursor. Every tenant gets its own bounded, time-windowed
//! buffer, and idle tenants are reclaimed by a background sweep.
//!
//! Delivery is best-effort and at-least-once within the buffer window.
//! Nothing is persisted across restarts.
//!
//! ## Quick Start
//!
//! ```rust
//! use tenant_broker::{Broker, BrokerConfig, EventEnvelope, Metadata, TenantId, WaitRequest};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> tenant_broker::Result<()> {
//! let broker: Broker = Broker::new(BrokerConfig::from_env()?)?;
//!
//! // Producer side: fire-and-forget
//! broker.publish(EventEnvelope::new(42, "user_login", Metadata::new()));
//!
//! // Consumer side: returns at once because an event is buffered
//! let result = broker
//!     .wait_for_events(WaitRequest::new(TenantId::new(42)?), &CancellationToken::new())
//!     .await;
//! assert_eq!(result.events.len(), 1);
//!
//! broker.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **Broker**: tenant map, publish, long-poll wait, introspection
//! - **TenantBuffer**: bounded queue plus parked waiters, one lock per tenant
//! - **Waiter**: a parked wait with a one-shot completion and a deadline
//! - **EventFilter**: caller-supplied predicate applied on every delivery path
//! - **Sweep**: owned background task evicting idle tenants

pub mod broker;
mod buffer;
pub mod config;
pub mod domain;
pub mod error;
pub mod filter;
pub mod metrics;
mod sweep;
pub mod types;
mod waiter;

// Re-export core types
pub use broker::Broker;
pub use config::{BrokerConfig, WakePolicy};
pub use domain::{AuditBroker, AuditEvent, UserBroker, UserEvent, UserEventKind};
pub use error::{BrokerError, Result};
pub use filter::EventFilter;
pub use metrics::{MetricsSnapshot, TenantStats, WaiterCounts};
pub use sweep::SweepReport;
pub use types::{
    Cursor, EventEnvelope, Metadata, TenantId, WaitOutcome, WaitRequest, WaitResult,
};
