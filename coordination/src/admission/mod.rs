//! Admission control for one agent process.
//!
//! - [`rate_limiter`]: per-identity sliding windows for messages and tool calls
//! - [`circuit_breaker`]: failure-counting guard for the completion API
//! - [`queue`]: bounded FIFO queue with concurrency cap, backed by the breaker
//! - [`pressure`]: the combined backpressure gate

pub mod circuit_breaker;
pub mod pressure;
pub mod queue;
pub mod rate_limiter;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use pressure::{PressureGauge, PressureReport};
pub use queue::{QueueError, RequestQueue, SharedRequestQueue};
pub use rate_limiter::RateLimiter;
