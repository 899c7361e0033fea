//! Core data model for nano-serve.
//!
//! This module contains the fundamental building blocks:
//! - Block handles and BlockTable for the paged KV cache
//! - BlockAllocator for the raw block id pool
//! - BlockManager for reference counts and prefix caching
//! - Request and Sequence for tracking generation work

pub mod block;
pub mod block_allocator;
pub mod block_manager;
pub mod request;
pub mod sequence;

pub use block::{BlockId, BlockTable};
pub use block_allocator::BlockAllocator;
pub use block_manager::BlockManager;
pub use request::{CancellationFlag, Priority, Request, RequestId, Statistics, StoppingCriteria};
pub use sequence::{FinishReason, ScheduleStatus, Sequence, SequenceId};
