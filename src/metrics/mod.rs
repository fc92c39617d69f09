//! Prometheus metrics for the controller manager
//!
//! Leadership, cache sync, reconcile and webhook metrics, plus the
//! metrics/health/readiness HTTP endpoint.

mod prometheus;

pub use prometheus::*;
