//! Device clock synchronization.
//!
//! This crate provides:
//! - [`ClockSyncer`] running the read, write, settle and verify exchange per device
//! - [`SyncOutcome`] describing how far each exchange got
//! - [`report`] module rendering outcomes for the console

pub mod error;
pub mod report;
pub mod syncer;

pub use error::*;
pub use syncer::*;
