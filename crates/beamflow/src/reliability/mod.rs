//! Reliability patterns for durable execution
//!
//! This module provides [`RetryPolicy`], the pure backoff/retryability
//! function used by the actor's retry decider (spec.md §4.3, §4.5).

mod retry;

pub use retry::RetryPolicy;
pub(crate) use retry::duration_millis;
