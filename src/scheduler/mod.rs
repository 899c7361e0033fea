//! Batch scheduling for continuous batching.
//!
//! This module handles:
//! - Priority-based admission of waiting sequences
//! - Continuous batching (iteration-level scheduling)
//! - Preemption of low-priority sequences under memory pressure

pub mod batch;
pub mod policy;

pub use batch::{Batch, BatchEntry, Scheduler, SchedulerOutputs};
pub use policy::SchedulingKey;
