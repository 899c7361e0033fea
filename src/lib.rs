//! nano-serve: the serving core of an LLM inference engine.
//!
//! This crate implements the parts of vLLM-style serving that sit between
//! the API front end and the attention kernels:
//! - Paged KV cache block allocation with reference counts
//! - Prefix caching for shared prompts
//! - Continuous batching with priority admission and preemption
//! - Speculative decoding lookahead
//! - A handler loop with streaming callback delivery

pub mod config;
pub mod error;

pub mod core;
pub mod engine;
pub mod scheduler;
pub mod speculative;

pub use config::{HandlerOptions, SamplingParams, SchedulerConfig};
pub use crate::core::request::{Priority, Request, RequestId, Statistics};
pub use crate::core::sequence::{FinishReason, SequenceId};
pub use engine::{
    ChatTemplate, DraftExecutor, LLMHandler, Message, ModelExecutor, RequestOutput,
    SequenceOutput, Status, StatusCode, StepOutput, Tokenizer,
};
pub use error::{Error, Result};
pub use scheduler::{Batch, BatchEntry, Scheduler, SchedulerOutputs};
pub use speculative::SpeculativeConfig;
