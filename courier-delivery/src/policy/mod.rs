//! Retry policy for delivery attempts.
//!
//! - [`RetryPolicy`]: attempt limit and backoff configuration
//! - [`backoff`]: the exponential backoff curve itself

pub mod backoff;
pub mod retry;

pub use retry::RetryPolicy;
