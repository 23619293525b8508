//! HTTP middleware.
//!
//! Request logging with latency tracking for the thin status surface
//! (SPEC_FULL.md §4.14).

pub mod logging;

pub use logging::{request_logging, request_logging_simple};
