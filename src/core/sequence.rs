//! Sequence tracking for inference requests.
//!
//! A sequence is one generation thread of a [`Request`](super::request::Request):
//! the tokens produced so far, the blocks holding their KV cache, and where
//! the sequence stands in the scheduler's state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::block::{BlockId, BlockTable};
use crate::core::request::RequestId;
use crate::error::{Error, Result};

/// Identifies a sequence: its request and its index within the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceId {
    pub request_id: RequestId,
    pub index: usize,
}

impl SequenceId {
    pub fn new(request_id: RequestId, index: usize) -> Self {
        Self { request_id, index }
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.request_id, self.index)
    }
}

/// Status of a sequence in the scheduler.
///
/// ```text
/// Waiting ──► Processing ──► Completed
///    │          │   ▲   └──► Cancelled
///    │          ▼   │
///    │        Preempted
///    └──► Completed | Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScheduleStatus {
    /// Waiting in queue to be scheduled for the first time.
    Waiting,
    /// Admitted to the running set.
    Processing,
    /// Evicted from the running set; waiting to be resumed.
    Preempted,
    /// Finished generation (stopping criteria or capacity failure).
    Completed,
    /// Cancelled by the caller.
    Cancelled,
}

impl ScheduleStatus {
    /// Check if the sequence is in the waiting queue.
    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::Waiting | Self::Preempted)
    }

    /// Check if the sequence reached a terminal state.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Get the status name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "Waiting",
            Self::Processing => "Processing",
            Self::Preempted => "Preempted",
            Self::Completed => "Completed",
            Self::Cancelled => "Cancelled",
        }
    }
}

/// Reason for sequence completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// End-of-sequence token, stop token or stop sequence generated.
    Stop,
    /// Token limit reached.
    Length,
    /// Cancelled by the caller.
    Cancelled,
    /// The sequence cannot fit in the KV cache.
    CapacityExceeded,
    /// The executor failed while the sequence was in its batch.
    Error,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::Cancelled => "cancelled",
            Self::CapacityExceeded => "capacity_exceeded",
            Self::Error => "error",
        }
    }
}

/// A single generation thread.
///
/// # Example
///
/// ```
/// use nano_serve::core::sequence::{ScheduleStatus, Sequence};
///
/// let mut seq = Sequence::new(0, vec![1, 2, 3, 4], 16);
/// assert_eq!(seq.status(), ScheduleStatus::Waiting);
/// assert_eq!(seq.num_prompt_tokens(), 4);
///
/// seq.append_token(5);
/// assert_eq!(seq.num_output_tokens(), 1);
/// assert_eq!(seq.len(), 5);
/// ```
#[derive(Debug, Clone)]
pub struct Sequence {
    /// Index within the owning request.
    index: usize,
    /// Prompt followed by generated tokens.
    token_ids: Vec<u32>,
    num_prompt_tokens: usize,
    /// Block table for KV cache mapping.
    block_table: BlockTable,
    /// Leading token positions whose KV is materialised in the block table.
    num_kv_tokens: usize,
    /// Leading prompt blocks published to the prefix cache.
    num_registered_blocks: usize,
    status: ScheduleStatus,
    finish_reason: Option<FinishReason>,
    /// Output tokens already handed to the caller.
    num_streamed_tokens: usize,
    /// Bytes of decoded output text already handed to the caller.
    num_streamed_bytes: usize,
}

impl Sequence {
    /// Create a new sequence with the given prompt tokens.
    pub fn new(index: usize, prompt_token_ids: Vec<u32>, block_size: usize) -> Self {
        Self {
            index,
            num_prompt_tokens: prompt_token_ids.len(),
            token_ids: prompt_token_ids,
            block_table: BlockTable::new(block_size),
            num_kv_tokens: 0,
            num_registered_blocks: 0,
            status: ScheduleStatus::Waiting,
            finish_reason: None,
            num_streamed_tokens: 0,
            num_streamed_bytes: 0,
        }
    }

    // ========== Getters ==========

    /// Index within the owning request.
    pub fn index(&self) -> usize {
        self.index
    }

    /// All token IDs (prompt + output).
    pub fn token_ids(&self) -> &[u32] {
        &self.token_ids
    }

    /// Get the prompt token IDs.
    pub fn prompt_token_ids(&self) -> &[u32] {
        &self.token_ids[..self.num_prompt_tokens]
    }

    /// Get the output token IDs.
    pub fn output_token_ids(&self) -> &[u32] {
        &self.token_ids[self.num_prompt_tokens..]
    }

    /// Get the block table.
    pub fn block_table(&self) -> &BlockTable {
        &self.block_table
    }

    /// Get the current status.
    pub fn status(&self) -> ScheduleStatus {
        self.status
    }

    /// Get the finish reason (if finished).
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    /// Check if the sequence reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }

    // ========== Length queries ==========

    /// Total length (prompt + output).
    pub fn len(&self) -> usize {
        self.token_ids.len()
    }

    /// Whether the sequence holds no tokens at all.
    pub fn is_empty(&self) -> bool {
        self.token_ids.is_empty()
    }

    pub fn num_prompt_tokens(&self) -> usize {
        self.num_prompt_tokens
    }

    pub fn num_output_tokens(&self) -> usize {
        self.token_ids.len() - self.num_prompt_tokens
    }

    /// Token positions whose KV cache is already computed.
    pub fn num_kv_tokens(&self) -> usize {
        self.num_kv_tokens
    }

    /// Tokens the next step has to feed through the model.
    pub fn tokens_to_process(&self) -> &[u32] {
        &self.token_ids[self.num_kv_tokens.min(self.token_ids.len())..]
    }

    /// Occupied slots in the last block of the table.
    pub fn last_block_slots(&self) -> usize {
        let num_blocks = self.block_table.num_blocks();
        if num_blocks == 0 {
            return 0;
        }
        let block_size = self.block_table.block_size();
        self.num_kv_tokens
            .saturating_sub((num_blocks - 1) * block_size)
            .min(block_size)
    }

    pub(crate) fn num_registered_blocks(&self) -> usize {
        self.num_registered_blocks
    }

    pub(crate) fn set_num_registered_blocks(&mut self, num_blocks: usize) {
        self.num_registered_blocks = num_blocks;
    }

    // ========== Token operations ==========

    /// Append a generated token.
    pub fn append_token(&mut self, token_id: u32) {
        self.token_ids.push(token_id);
    }

    /// Get the last token ID.
    pub fn last_token_id(&self) -> Option<u32> {
        self.token_ids.last().copied()
    }

    /// Record the outcome of one model step.
    ///
    /// Every token fed to the step now has its KV cached, as do the accepted
    /// draft tokens; the final accepted token (the one sampled by the target
    /// model) is only fed to the next step. Slots written for rejected drafts
    /// are rewound but their blocks are kept.
    ///
    /// `should_stop` is consulted after each appended token; tokens after the
    /// first one it stops on are dropped and its reason is returned.
    pub fn commit_step<F>(&mut self, accepted: &[u32], mut should_stop: F) -> Option<FinishReason>
    where
        F: FnMut(&Self) -> Option<FinishReason>,
    {
        let old_len = self.token_ids.len();
        let mut reason = None;
        for &token_id in accepted {
            self.token_ids.push(token_id);
            reason = should_stop(self);
            if reason.is_some() {
                break;
            }
        }

        let appended = self.token_ids.len() - old_len;
        if appended > 0 {
            self.num_kv_tokens = old_len + appended - 1;
        }
        reason
    }

    // ========== Blocks ==========

    /// Attach freshly allocated blocks; `num_cached_tokens` leading
    /// positions were served from the prefix cache.
    pub fn attach_blocks(&mut self, block_ids: Vec<BlockId>, num_cached_tokens: usize) {
        if self.block_table.is_empty() {
            self.num_kv_tokens = num_cached_tokens;
            self.num_registered_blocks = num_cached_tokens / self.block_table.block_size();
        }
        self.block_table.extend(block_ids);
    }

    /// Strip every block and forget the KV cursor; the tokens are kept.
    pub fn release_blocks(&mut self) -> Vec<BlockId> {
        self.num_kv_tokens = 0;
        self.num_registered_blocks = 0;
        self.block_table.take()
    }

    // ========== Streaming cursors ==========

    pub(crate) fn num_streamed_tokens(&self) -> usize {
        self.num_streamed_tokens
    }

    pub(crate) fn num_streamed_bytes(&self) -> usize {
        self.num_streamed_bytes
    }

    pub(crate) fn mark_streamed(&mut self, num_tokens: usize, num_bytes: usize) {
        self.num_streamed_tokens = num_tokens;
        self.num_streamed_bytes = num_bytes;
    }

    // ========== State transitions ==========

    /// Transition to processing (admission or resumption).
    ///
    /// # Errors
    ///
    /// Returns error if current state doesn't allow this transition.
    pub fn set_processing(&mut self) -> Result<()> {
        match self.status {
            ScheduleStatus::Waiting | ScheduleStatus::Preempted => {
                self.status = ScheduleStatus::Processing;
                Ok(())
            }
            _ => Err(self.invalid_transition(ScheduleStatus::Processing)),
        }
    }

    /// Transition to preempted.
    ///
    /// # Errors
    ///
    /// Returns error unless the sequence is processing.
    pub fn set_preempted(&mut self) -> Result<()> {
        match self.status {
            ScheduleStatus::Processing => {
                self.status = ScheduleStatus::Preempted;
                Ok(())
            }
            _ => Err(self.invalid_transition(ScheduleStatus::Preempted)),
        }
    }

    /// Mark the sequence as completed.
    ///
    /// # Errors
    ///
    /// Returns error if the sequence already reached a terminal state.
    pub fn set_completed(&mut self, reason: FinishReason) -> Result<()> {
        self.finish_with(ScheduleStatus::Completed, reason)
    }

    /// Mark the sequence as cancelled.
    ///
    /// # Errors
    ///
    /// Returns error if the sequence already reached a terminal state.
    pub fn set_cancelled(&mut self, reason: FinishReason) -> Result<()> {
        self.finish_with(ScheduleStatus::Cancelled, reason)
    }

    fn finish_with(&mut self, status: ScheduleStatus, reason: FinishReason) -> Result<()> {
        if self.status.is_finished() {
            return Err(self.invalid_transition(status));
        }
        self.status = status;
        self.finish_reason = Some(reason);
        Ok(())
    }

    fn invalid_transition(&self, to: ScheduleStatus) -> Error {
        Error::InvalidStateTransition {
            from: self.status.as_str(),
            to: to.as_str(),
        }
    }
}
