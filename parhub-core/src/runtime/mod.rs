//! Event loop substrate
//!
//! A timer queue, a single-threaded reactor on top of it, and the
//! cross-thread signal that stops the reactor.

pub mod reactor;
pub mod shutdown;
pub mod timer;

pub use reactor::{EndpointCallback, Interest, PollOutcome, Reactor};
pub use shutdown::ShutdownSignal;
pub use timer::{TimerCallback, TimerHandle, TimerQueue};
