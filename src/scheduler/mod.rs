//! Request scheduling over the engine step loop.

pub mod batch;

pub use batch::{FinishedOutput, Scheduler, SchedulerConfig};
