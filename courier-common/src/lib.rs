//! Pieces shared by every courier crate: the shutdown [`Signal`] broadcast
//! between long-running tasks, and the logging macros.

pub mod logging;

pub use tracing;

/// Lifecycle signal broadcast to the manager loop, the workers and the sweeper.
///
/// `Shutdown` asks tasks to stop taking new work and exit once their current
/// item is released. `Finalised` is sent after the grace period and interrupts
/// whatever is still in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
