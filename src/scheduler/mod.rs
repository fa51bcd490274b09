//! Periodic task scheduler

pub mod core;

pub use self::core::{PeriodicTask, Scheduler};
