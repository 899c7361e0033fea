//! Model execution interfaces.
//!
//! The attention kernels and the KV cache tensor live behind these traits.
//! The loop thread owns the executors exclusively, so they take `&mut self`
//! and only need to be `Send`.

use crate::core::sequence::SequenceId;
use crate::error::Result;
use crate::scheduler::Batch;

/// Tokens a step produced for one sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutput {
    pub seq_id: SequenceId,
    /// Accepted draft tokens followed by the token sampled by the target
    /// model; exactly one token without speculation.
    pub token_ids: Vec<u32>,
}

impl StepOutput {
    pub fn new(seq_id: SequenceId, token_ids: Vec<u32>) -> Self {
        Self { seq_id, token_ids }
    }
}

/// The target model.
pub trait ModelExecutor: Send {
    /// Bytes of KV cache one token position occupies across all layers.
    fn kv_cache_bytes_per_token(&self) -> u64;

    /// Allocate the physical KV cache for `num_blocks` blocks of
    /// `block_size` slots. Called once before the first step.
    fn allocate_kv_cache(&mut self, num_blocks: usize, block_size: usize) -> Result<()>;

    /// Run one step over `batch`, returning one output per entry.
    fn execute(&mut self, batch: &Batch) -> Result<Vec<StepOutput>>;
}

/// The draft model used for speculative decoding.
pub trait DraftExecutor: Send {
    /// Propose up to `num_tokens` draft tokens for every batch entry, in
    /// batch order.
    fn propose(&mut self, batch: &Batch, num_tokens: usize) -> Result<Vec<Vec<u32>>>;
}
