//! Reconnection resilience for a single long-lived connection.
//!
//! Provides:
//! - `BackoffPolicy` - Exponential backoff with symmetric jitter
//! - `classify` / `is_transient` - Fault classification
//! - `ReconnectCoordinator` - Owns retry count, in-flight flag and the retry timer

pub mod backoff;
pub mod classify;
pub mod coordinator;

pub use backoff::BackoffPolicy;
pub use classify::{Classification, classify, is_transient};
pub use coordinator::{CoordinatorState, ReconnectConfig, ReconnectCoordinator, ReconnectOutcome};
