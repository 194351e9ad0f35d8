//! # Utility Modules
//!
//! Supporting utilities shared by clients, servers and connections.
//!
//! ## Components
//! - **Retry**: reconnect/restart policy (`0` off, `-1` unbounded, `N` bounded)
//! - **Logging**: tracing subscriber setup from [`LoggingConfig`](crate::config::LoggingConfig)
//! - **Metrics**: thread-safe observability counters
//! - **Timeout**: async timeout wrappers and default durations

pub mod logging;
pub mod metrics;
pub mod retry;
pub mod timeout;

pub use retry::RetryPolicy;
