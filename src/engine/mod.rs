//! Request handling.
//!
//! This module contains:
//! - LLMHandler, the loop driving scheduler and executors
//! - Executor and tokenizer interfaces for the external collaborators
//! - Output types and their delivery to user callbacks
//! - Synthetic collaborators for running without a model

mod delivery;
pub mod executor;
pub mod handler;
pub mod output;
pub mod synthetic;
pub mod tokenizer;

pub use executor::{DraftExecutor, ModelExecutor, StepOutput};
pub use handler::LLMHandler;
pub use output::{OutputCallback, RequestOutput, SequenceOutput, Status, StatusCode};
pub use tokenizer::{ChatTemplate, Message, Tokenizer};
