//! HTTP middleware.
//!
//! Request logging with latency tracking. Per-subscriber rate limiting
//! lives in the subscriber registry's token buckets, not here.

pub mod logging;

pub use logging::request_logging;
