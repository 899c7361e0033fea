//! Continuous batching scheduler.
//!
//! The scheduler owns every live request, decides which sequences take part
//! in each model step, and keeps the KV cache block accounting consistent
//! while sequences join, grow, get preempted and finish.
//!
//! ## Scheduling Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        Scheduler Flow                               │
//! └─────────────────────────────────────────────────────────────────────┘
//!
//!   add_request()                                   schedule()
//!        │                                              │
//!        ▼                                              ▼
//!   ┌─────────┐      admission (priority order)   ┌─────────────┐
//!   │ Waiting │ ─────────────────────────────────► │   Running   │
//!   │  Queue  │                                    │     Set     │
//!   └─────────┘                                    └─────────────┘
//!        ▲                preempt()                    │     │
//!        └─────────────────────────────────────────────┘     │ commit_step()
//!               (memory pressure, lower priority)             ▼
//!                                                     Completed / Cancelled
//! ```
//!
//! Each [`schedule`](Scheduler::schedule) call runs four steps:
//! 1. Reap cancelled requests.
//! 2. Admit waiting sequences in priority order while blocks and batch caps
//!    allow, preempting lower priority classes if enabled.
//! 3. Grow every running sequence to hold its next step, preempting the
//!    worst running sequence on memory pressure.
//! 4. Assemble the batch from the running set.
//!
//! ## Example
//!
//! ```
//! use nano_serve::core::request::Request;
//! use nano_serve::scheduler::Scheduler;
//! use nano_serve::SchedulerConfig;
//!
//! let mut scheduler = Scheduler::new(SchedulerConfig::default(), 16, 1024);
//!
//! scheduler.add_request(Request::new(1, vec![1, 2, 3, 4])).unwrap();
//! scheduler.add_request(Request::new(2, vec![5, 6, 7, 8])).unwrap();
//!
//! let outputs = scheduler.schedule().unwrap();
//! assert_eq!(outputs.batch.len(), 2);
//! ```

use std::collections::{BinaryHeap, HashMap};

use tracing::{debug, warn};

use crate::config::{SamplingParams, SchedulerConfig};
use crate::core::block::{compute_num_blocks, BlockId};
use crate::core::block_manager::BlockManager;
use crate::core::request::{Request, RequestId};
use crate::core::sequence::{FinishReason, ScheduleStatus, Sequence, SequenceId};
use crate::error::{Error, Result};
use crate::scheduler::policy::{SchedulingKey, WaitingEntry};

/// One sequence's share of a model step.
#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub seq_id: SequenceId,
    /// Tokens whose KV is not cached yet: the whole history after admission
    /// or resumption, the last sampled token otherwise.
    pub token_ids: Vec<u32>,
    /// Position of `token_ids[0]` in the sequence.
    pub start_pos: usize,
    /// Physical blocks backing the sequence, in logical order.
    pub block_ids: Vec<BlockId>,
    /// Global slots for `token_ids` followed by `num_draft_tokens` draft
    /// positions.
    pub slot_mapping: Vec<usize>,
    pub sampling_params: SamplingParams,
    /// Draft tokens the step verifies for this sequence.
    pub num_draft_tokens: usize,
    /// Proposed drafts, filled in by the draft executor.
    pub draft_token_ids: Vec<u32>,
}

impl BatchEntry {
    /// Tokens this entry feeds through the target model.
    pub fn num_tokens(&self) -> usize {
        self.token_ids.len() + self.draft_token_ids.len()
    }
}

/// The work of one model step.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub entries: Vec<BatchEntry>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total tokens processed by the step.
    pub fn num_tokens(&self) -> usize {
        self.entries.iter().map(BatchEntry::num_tokens).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BatchEntry> {
        self.entries.iter()
    }

    pub fn seq_ids(&self) -> impl Iterator<Item = SequenceId> + '_ {
        self.entries.iter().map(|entry| entry.seq_id)
    }
}

/// Output of a scheduling step.
#[derive(Debug, Default)]
pub struct SchedulerOutputs {
    /// Sequences to run this step, in admission order.
    pub batch: Batch,
    /// Sequences admitted from the waiting queue this step.
    pub admitted: Vec<SequenceId>,
    /// Sequences preempted this step.
    pub preempted: Vec<SequenceId>,
    /// Requests that reached a terminal state and left the scheduler.
    pub finished: Vec<Request>,
}

impl SchedulerOutputs {
    /// Create empty scheduler outputs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if there are any sequences to process.
    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }
}

/// Continuous batching scheduler.
///
/// Manages sequences through their lifecycle:
/// - Waiting: In queue, waiting for blocks
/// - Processing: In the running set, part of every batch
/// - Preempted: Evicted to the waiting queue, blocks released
/// - Completed / Cancelled: Finished, removed at the next collection
pub struct Scheduler {
    /// Configuration.
    config: SchedulerConfig,
    /// Block manager for KV cache allocation.
    block_manager: BlockManager,
    /// Every live request.
    requests: HashMap<RequestId, Request>,
    /// Priority queue for waiting and preempted sequences.
    waiting_queue: BinaryHeap<WaitingEntry>,
    /// Running sequences in admission order.
    running: Vec<SequenceId>,
    /// Counter for arrival ordering.
    arrival_counter: u64,
}

impl Scheduler {
    /// Create a new scheduler.
    ///
    /// # Arguments
    ///
    /// * `config` - Scheduler configuration
    /// * `block_size` - Number of tokens per block
    /// * `num_blocks` - Total number of blocks available
    pub fn new(config: SchedulerConfig, block_size: usize, num_blocks: usize) -> Self {
        let block_manager = BlockManager::new(num_blocks, block_size, config.enable_prefix_cache);
        Self {
            config,
            block_manager,
            requests: HashMap::new(),
            waiting_queue: BinaryHeap::new(),
            running: Vec::new(),
            arrival_counter: 0,
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Add a new request; all of its sequences start in the waiting queue.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an empty prompt or a request id
    /// that is already live.
    pub fn add_request(&mut self, mut request: Request) -> Result<()> {
        if request.num_prompt_tokens() == 0 {
            return Err(Error::InvalidArgument("prompt must not be empty".to_string()));
        }
        if self.requests.contains_key(&request.id()) {
            return Err(Error::InvalidArgument(format!(
                "request {} already exists",
                request.id()
            )));
        }

        request.prepare(
            self.arrival_counter,
            self.block_manager.block_size(),
            self.block_manager.prefix_cache_enabled(),
        );
        self.arrival_counter += 1;

        for (index, seq) in request.sequences().iter().enumerate() {
            if seq.status().is_waiting() {
                self.waiting_queue
                    .push(WaitingEntry(SchedulingKey::new(&request, index)));
            }
        }
        debug!(
            request_id = request.id(),
            prompt_tokens = request.num_prompt_tokens(),
            priority = ?request.priority(),
            "request queued"
        );
        self.requests.insert(request.id(), request);
        Ok(())
    }

    /// Get a reference to a live request.
    pub fn get_request(&self, request_id: RequestId) -> Option<&Request> {
        self.requests.get(&request_id)
    }

    /// Get a mutable reference to a live request.
    pub(crate) fn get_request_mut(&mut self, request_id: RequestId) -> Option<&mut Request> {
        self.requests.get_mut(&request_id)
    }

    /// Get a reference to a sequence.
    pub fn get_sequence(&self, seq_id: SequenceId) -> Option<&Sequence> {
        self.requests
            .get(&seq_id.request_id)
            .and_then(|request| request.sequence(seq_id.index))
    }

    /// Schedule the next iteration.
    ///
    /// # Errors
    ///
    /// Only bookkeeping corruption ([`Error::InvalidBlock`],
    /// [`Error::InvalidStateTransition`]) escapes. Memory pressure is resolved
    /// by preemption and oversized requests are failed in place.
    pub fn schedule(&mut self) -> Result<SchedulerOutputs> {
        let mut outputs = SchedulerOutputs::new();

        // Step 1: Drop cancelled requests before they take any blocks
        self.reap_cancelled()?;

        // Step 2: Admit new sequences from waiting queue
        self.schedule_admission(&mut outputs)?;

        // Step 3: Make room for the next step of every running sequence
        self.schedule_growth(&mut outputs)?;

        outputs.finished = self.take_finished();
        outputs.batch = self.assemble_batch();
        Ok(outputs)
    }

    /// Record the tokens a step produced for `seq_id`.
    ///
    /// Stopping criteria are checked after each token; tokens after the first
    /// stop are dropped, the sequence is completed and its blocks released.
    /// Newly computed full prompt blocks are published to the prefix cache.
    /// Returns the finish reason if the sequence stopped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RequestNotFound`] if the sequence is not live and
    /// [`Error::InvalidStateTransition`] if it is not `Processing`.
    pub fn commit_step(
        &mut self,
        seq_id: SequenceId,
        accepted: &[u32],
    ) -> Result<Option<FinishReason>> {
        let status = self.sequence_mut(seq_id)?.status();
        if status != ScheduleStatus::Processing {
            return Err(Error::InvalidStateTransition {
                from: status.as_str(),
                to: ScheduleStatus::Processing.as_str(),
            });
        }

        let request = self
            .requests
            .get_mut(&seq_id.request_id)
            .ok_or(Error::RequestNotFound(seq_id.request_id))?;
        let reason = request.commit_step(seq_id.index, accepted)?;
        self.register_computed_blocks(seq_id);

        if let Some(reason) = reason {
            self.finish_sequence(seq_id, reason)?;
        }
        Ok(reason)
    }

    /// Append a single sampled token to `seq_id`.
    pub fn append_token(
        &mut self,
        seq_id: SequenceId,
        token_id: u32,
    ) -> Result<Option<FinishReason>> {
        self.commit_step(seq_id, &[token_id])
    }

    /// Finish a sequence: release its blocks and move it to a terminal state.
    ///
    /// [`FinishReason::Cancelled`] leads to `Cancelled`, every other reason to
    /// `Completed`. Finishing an already finished sequence is a no-op.
    pub fn finish_sequence(&mut self, seq_id: SequenceId, reason: FinishReason) -> Result<()> {
        let seq = self.sequence_mut(seq_id)?;
        if seq.is_finished() {
            return Ok(());
        }
        let block_ids = seq.release_blocks();
        match reason {
            FinishReason::Cancelled => seq.set_cancelled(reason)?,
            _ => seq.set_completed(reason)?,
        }
        self.block_manager.release_many(&block_ids)?;

        self.running.retain(|id| *id != seq_id);
        self.waiting_queue.retain(|entry| entry.0.seq_id != seq_id);
        debug!(seq = %seq_id, reason = reason.as_str(), "sequence finished");
        Ok(())
    }

    /// Finish every unfinished sequence of a request with `reason`.
    ///
    /// The request stays in the scheduler until it is collected by
    /// [`take_finished`](Self::take_finished) or the next
    /// [`schedule`](Self::schedule).
    pub fn fail_request(
        &mut self,
        request_id: RequestId,
        reason: FinishReason,
        message: impl Into<String>,
    ) -> Result<()> {
        let request = self
            .requests
            .get_mut(&request_id)
            .ok_or(Error::RequestNotFound(request_id))?;
        request.set_status_message(message);
        let seq_ids: Vec<SequenceId> = request.sequence_ids().collect();

        for seq_id in seq_ids {
            self.finish_sequence(seq_id, reason)?;
        }
        Ok(())
    }

    /// Flag a request as cancelled; it is reaped at the next tick.
    pub fn cancel_request(&mut self, request_id: RequestId) -> Result<()> {
        let request = self
            .requests
            .get(&request_id)
            .ok_or(Error::RequestNotFound(request_id))?;
        request.cancellation().cancel();
        Ok(())
    }

    /// Remove and return every finished request.
    pub fn take_finished(&mut self) -> Vec<Request> {
        let finished: Vec<RequestId> = self
            .requests
            .values()
            .filter(|request| request.is_finished())
            .map(Request::id)
            .collect();

        finished
            .into_iter()
            .filter_map(|id| self.requests.remove(&id))
            .collect()
    }

    // ========== Queries ==========

    /// Number of sequences waiting for admission, preempted ones included.
    pub fn num_waiting(&self) -> usize {
        self.waiting_queue.len()
    }

    /// Number of sequences in the running set.
    pub fn num_running(&self) -> usize {
        self.running.len()
    }

    /// Number of waiting sequences that were preempted.
    pub fn num_preempted(&self) -> usize {
        self.waiting_queue
            .iter()
            .filter(|entry| {
                self.get_sequence(entry.0.seq_id)
                    .is_some_and(|seq| seq.status() == ScheduleStatus::Preempted)
            })
            .count()
    }

    /// Number of live requests.
    pub fn num_requests(&self) -> usize {
        self.requests.len()
    }

    /// Check if there are any requests left.
    pub fn has_unfinished_requests(&self) -> bool {
        !self.requests.is_empty()
    }

    /// Running sequences in admission order.
    pub fn running(&self) -> &[SequenceId] {
        &self.running
    }

    /// Get a reference to the block manager.
    pub fn block_manager(&self) -> &BlockManager {
        &self.block_manager
    }

    /// Reset the scheduler, dropping every request.
    pub fn reset(&mut self) {
        self.requests.clear();
        self.waiting_queue.clear();
        self.running.clear();
        self.block_manager.reset();
    }

    // ========== Scheduling steps ==========

    /// Cancel every request whose cancellation flag is set.
    fn reap_cancelled(&mut self) -> Result<()> {
        let cancelled: Vec<RequestId> = self
            .requests
            .values()
            .filter(|request| request.is_cancelled() && !request.is_finished())
            .map(Request::id)
            .collect();

        for request_id in cancelled {
            debug!(request_id, "reaping cancelled request");
            self.fail_request(request_id, FinishReason::Cancelled, "cancelled")?;
        }
        Ok(())
    }

    /// Admit waiting sequences in priority order.
    ///
    /// Admission stops at the first head that cannot be satisfied; it keeps
    /// its place for the next tick.
    fn schedule_admission(&mut self, outputs: &mut SchedulerOutputs) -> Result<()> {
        let lookahead = self.config.num_speculative_tokens;
        let block_size = self.block_manager.block_size();
        let total_blocks = self.block_manager.total_blocks();

        while self.running.len() < self.config.max_seqs_per_batch {
            let Some(&WaitingEntry(head)) = self.waiting_queue.peek() else {
                break;
            };
            let seq_id = head.seq_id;
            let Some(seq) = self.get_sequence(seq_id) else {
                self.waiting_queue.pop();
                continue;
            };

            let required = compute_num_blocks(seq.len() + lookahead, block_size);
            let num_tokens = seq.tokens_to_process().len() + lookahead;

            // The first sequence of a batch may exceed the token budget alone
            if !self.running.is_empty()
                && self.running_token_load() + num_tokens > self.config.max_tokens_per_batch
            {
                break;
            }

            if required > total_blocks {
                self.waiting_queue.pop();
                self.fail_capacity(seq_id, required)?;
                continue;
            }

            if !self.can_admit(required)
                && !(self.config.enable_priority_preemption
                    && self.preempt_for_admission(head, required, outputs)?)
            {
                break;
            }

            self.waiting_queue.pop();
            self.admit(seq_id, required)?;
            outputs.admitted.push(seq_id);
        }
        Ok(())
    }

    /// Whether `required` blocks fit next to the growth of the running set.
    fn can_admit(&self, required: usize) -> bool {
        self.block_manager
            .can_allocate(required + self.growth_reservation())
    }

    /// Preempt running sequences of a strictly lower priority class than
    /// `head` until it fits. Nothing is preempted unless that is enough.
    fn preempt_for_admission(
        &mut self,
        head: SchedulingKey,
        required: usize,
        outputs: &mut SchedulerOutputs,
    ) -> Result<bool> {
        let victims: Vec<SchedulingKey> = self
            .running_keys()
            .into_iter()
            .filter(|key| key.priority > head.priority)
            .collect();

        let releasable: usize = victims
            .iter()
            .map(|key| self.releasable_blocks(key.seq_id))
            .sum();
        let victim_growth: usize = victims
            .iter()
            .map(|key| self.growth_needed(key.seq_id))
            .sum();
        let reserved = self.growth_reservation() - victim_growth;
        if self.block_manager.num_free_blocks() + releasable < required + reserved {
            return Ok(false);
        }

        // Worst victim first
        let mut victims = victims;
        victims.sort();
        while !self.can_admit(required) {
            let Some(victim) = victims.pop() else {
                return Ok(false);
            };
            debug!(
                victim = %victim.seq_id,
                admitting = %head.seq_id,
                "preempting lower priority sequence for admission"
            );
            self.preempt(victim.seq_id, outputs)?;
        }
        Ok(true)
    }

    /// Move a waiting sequence into the running set with `required` blocks.
    fn admit(&mut self, seq_id: SequenceId, required: usize) -> Result<()> {
        let block_size = self.block_manager.block_size();
        let request = self
            .requests
            .get(&seq_id.request_id)
            .ok_or(Error::RequestNotFound(seq_id.request_id))?;
        let seq = request
            .sequence(seq_id.index)
            .ok_or(Error::RequestNotFound(seq_id.request_id))?;

        // Leave at least one token to compute
        let num_cacheable = (seq.len() - 1) / block_size;
        let hashes = request.prompt_block_hashes();
        let hashes = hashes[..num_cacheable.min(hashes.len())].to_vec();

        let (block_ids, num_hits) = self.block_manager.allocate_cached(&hashes, required)?;
        let seq = self.sequence_mut(seq_id)?;
        seq.attach_blocks(block_ids, num_hits * block_size);
        seq.set_processing()?;
        self.running.push(seq_id);

        debug!(
            seq = %seq_id,
            blocks = required,
            cached_blocks = num_hits,
            "sequence admitted"
        );
        Ok(())
    }

    /// Grow every running sequence to hold its next step.
    ///
    /// On memory pressure the worst running sequence is preempted, possibly
    /// the one being grown.
    fn schedule_growth(&mut self, outputs: &mut SchedulerOutputs) -> Result<()> {
        let total_blocks = self.block_manager.total_blocks();

        for seq_id in self.running.clone() {
            loop {
                if !self.running.contains(&seq_id) {
                    break;
                }
                let needed = self.growth_needed(seq_id);
                if needed == 0 {
                    break;
                }

                let held = self
                    .get_sequence(seq_id)
                    .map_or(0, |seq| seq.block_table().num_blocks());
                if held + needed > total_blocks {
                    self.fail_capacity(seq_id, held + needed)?;
                    break;
                }

                match self.block_manager.allocate(needed) {
                    Ok(block_ids) => {
                        self.sequence_mut(seq_id)?.attach_blocks(block_ids, 0);
                        break;
                    }
                    Err(Error::OutOfMemory { .. }) => {
                        let Some(victim) = self.running_keys().into_iter().max() else {
                            break;
                        };
                        debug!(
                            victim = %victim.seq_id,
                            growing = %seq_id,
                            "preempting sequence under memory pressure"
                        );
                        self.preempt(victim.seq_id, outputs)?;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Build the batch from the running set.
    fn assemble_batch(&self) -> Batch {
        let lookahead = self.config.num_speculative_tokens;
        let entries = self
            .running
            .iter()
            .filter_map(|&seq_id| {
                let request = self.requests.get(&seq_id.request_id)?;
                let seq = request.sequence(seq_id.index)?;
                let start_pos = seq.num_kv_tokens();
                let table = seq.block_table();

                Some(BatchEntry {
                    seq_id,
                    token_ids: seq.tokens_to_process().to_vec(),
                    start_pos,
                    block_ids: table.block_ids().to_vec(),
                    slot_mapping: table.slot_mapping(start_pos..seq.len() + lookahead),
                    sampling_params: request.sampling_params().clone(),
                    num_draft_tokens: lookahead,
                    draft_token_ids: Vec::new(),
                })
            })
            .collect();
        Batch { entries }
    }

    // ========== Helpers ==========

    /// Release a running sequence's blocks and send it back to the queue.
    fn preempt(&mut self, seq_id: SequenceId, outputs: &mut SchedulerOutputs) -> Result<()> {
        self.running.retain(|id| *id != seq_id);

        let seq = self.sequence_mut(seq_id)?;
        let block_ids = seq.release_blocks();
        seq.set_preempted()?;
        self.block_manager.release_many(&block_ids)?;

        let request = self
            .requests
            .get(&seq_id.request_id)
            .ok_or(Error::RequestNotFound(seq_id.request_id))?;
        self.waiting_queue
            .push(WaitingEntry(SchedulingKey::new(request, seq_id.index)));
        outputs.preempted.push(seq_id);
        Ok(())
    }

    /// Fail the request owning `seq_id`: one of its sequences can never fit.
    fn fail_capacity(&mut self, seq_id: SequenceId, required: usize) -> Result<()> {
        let total = self.block_manager.total_blocks();
        let error = Error::CapacityExceeded { required, total };
        warn!(seq = %seq_id, required, total, "request exceeds KV cache capacity");
        self.fail_request(
            seq_id.request_id,
            FinishReason::CapacityExceeded,
            error.to_string(),
        )
    }

    /// Publish the full prompt blocks of `seq_id` whose KV is now computed.
    fn register_computed_blocks(&mut self, seq_id: SequenceId) {
        if !self.block_manager.prefix_cache_enabled() {
            return;
        }
        let block_size = self.block_manager.block_size();
        let Some(request) = self.requests.get_mut(&seq_id.request_id) else {
            return;
        };
        let hashes = request.prompt_block_hashes().to_vec();
        let Some(seq) = request.sequence_mut(seq_id.index) else {
            return;
        };

        let num_computed = (seq.num_kv_tokens() / block_size).min(hashes.len());
        for index in seq.num_registered_blocks()..num_computed {
            if let Some(block_id) = seq.block_table().get_block_id(index) {
                self.block_manager.register_block(block_id, hashes[index]);
            }
        }
        if num_computed > seq.num_registered_blocks() {
            seq.set_num_registered_blocks(num_computed);
        }
    }

    /// Blocks `seq_id` still needs for its next step.
    fn growth_needed(&self, seq_id: SequenceId) -> usize {
        let lookahead = self.config.num_speculative_tokens;
        let block_size = self.block_manager.block_size();
        self.get_sequence(seq_id).map_or(0, |seq| {
            compute_num_blocks(seq.len() + lookahead, block_size)
                .saturating_sub(seq.block_table().num_blocks())
        })
    }

    /// Blocks the running set needs to grow this tick.
    fn growth_reservation(&self) -> usize {
        self.running
            .iter()
            .map(|&seq_id| self.growth_needed(seq_id))
            .sum()
    }

    /// Tokens the running set feeds through the model this tick.
    fn running_token_load(&self) -> usize {
        let lookahead = self.config.num_speculative_tokens;
        self.running
            .iter()
            .filter_map(|&seq_id| self.get_sequence(seq_id))
            .map(|seq| seq.tokens_to_process().len() + lookahead)
            .sum()
    }

    /// Blocks that would become allocatable if `seq_id` were preempted.
    fn releasable_blocks(&self, seq_id: SequenceId) -> usize {
        self.get_sequence(seq_id).map_or(0, |seq| {
            seq.block_table()
                .block_ids()
                .iter()
                .filter(|&&block_id| self.block_manager.ref_count(block_id) == Some(1))
                .count()
        })
    }

    fn running_keys(&self) -> Vec<SchedulingKey> {
        self.running
            .iter()
            .filter_map(|&seq_id| {
                self.requests
                    .get(&seq_id.request_id)
                    .map(|request| SchedulingKey::new(request, seq_id.index))
            })
            .collect()
    }

    fn sequence_mut(&mut self, seq_id: SequenceId) -> Result<&mut Sequence> {
        self.requests
            .get_mut(&seq_id.request_id)
            .and_then(|request| request.sequence_mut(seq_id.index))
            .ok_or(Error::RequestNotFound(seq_id.request_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::request::Priority;

    fn test_config() -> SchedulerConfig {
        SchedulerConfig {
            max_seqs_per_batch: 4,
            max_tokens_per_batch: 64,
            ..Default::default()
        }
    }

    #[test]
    fn test_scheduler_creation() {
        let scheduler = Scheduler::new(test_config(), 16, 100);
        assert_eq!(scheduler.num_waiting(), 0);
        assert_eq!(scheduler.num_running(), 0);
        assert!(!scheduler.has_unfinished_requests());
    }

    #[test]
    fn test_add_request_rejects_duplicates_and_empty_prompts() {
        let mut scheduler = Scheduler::new(test_config(), 16, 100);
        scheduler.add_request(Request::new(1, vec![1, 2])).unwrap();

        assert!(scheduler.add_request(Request::new(1, vec![3])).is_err());
        assert!(scheduler.add_request(Request::new(2, vec![])).is_err());
        assert_eq!(scheduler.num_waiting(), 1);
    }

    #[test]
    fn test_max_seqs_cap() {
        let mut scheduler = Scheduler::new(test_config(), 16, 100);
        for id in 0..6 {
            scheduler.add_request(Request::new(id, vec![1, 2, 3])).unwrap();
        }

        let outputs = scheduler.schedule().unwrap();
        assert_eq!(outputs.batch.len(), 4);
        assert_eq!(scheduler.num_waiting(), 2);
    }

    #[test]
    fn test_token_budget_allows_oversized_first_prompt() {
        let config = SchedulerConfig {
            max_tokens_per_batch: 8,
            ..test_config()
        };
        let mut scheduler = Scheduler::new(config, 16, 100);
        scheduler.add_request(Request::new(1, (0..20).collect())).unwrap();
        scheduler.add_request(Request::new(2, vec![1, 2])).unwrap();

        // The long prompt runs alone, the short one waits for budget
        let outputs = scheduler.schedule().unwrap();
        assert_eq!(outputs.batch.len(), 1);
        assert_eq!(outputs.batch.entries[0].token_ids.len(), 20);
        assert_eq!(scheduler.num_waiting(), 1);
    }

    #[test]
    fn test_batch_entry_layout() {
        let mut scheduler = Scheduler::new(test_config(), 16, 100);
        scheduler.add_request(Request::new(1, (0..20).collect())).unwrap();

        let outputs = scheduler.schedule().unwrap();
        let entry = &outputs.batch.entries[0];
        assert_eq!(entry.start_pos, 0);
        assert_eq!(entry.block_ids.len(), 2);
        assert_eq!(entry.slot_mapping.len(), 20);
        assert_eq!(entry.slot_mapping[16], entry.block_ids[1] * 16);

        let seq_id = entry.seq_id;
        scheduler.commit_step(seq_id, &[99]).unwrap();

        // Decode step only feeds the sampled token
        let outputs = scheduler.schedule().unwrap();
        let entry = &outputs.batch.entries[0];
        assert_eq!(entry.token_ids, vec![99]);
        assert_eq!(entry.start_pos, 20);
        assert_eq!(entry.slot_mapping.len(), 1);
    }

    #[test]
    fn test_cancel_is_reaped_at_next_tick() {
        let mut scheduler = Scheduler::new(test_config(), 16, 10);
        scheduler.add_request(Request::new(1, vec![1, 2, 3])).unwrap();
        scheduler.schedule().unwrap();
        assert_eq!(scheduler.block_manager().num_free_blocks(), 9);

        scheduler.cancel_request(1).unwrap();
        let outputs = scheduler.schedule().unwrap();

        assert!(outputs.batch.is_empty());
        assert_eq!(outputs.finished.len(), 1);
        let request = &outputs.finished[0];
        assert_eq!(
            request.sequence(0).unwrap().status(),
            ScheduleStatus::Cancelled
        );
        assert_eq!(scheduler.block_manager().num_free_blocks(), 10);
        assert!(!scheduler.has_unfinished_requests());
    }

    #[test]
    fn test_growth_preempts_worst_running() {
        let mut scheduler = Scheduler::new(test_config(), 16, 2);
        let high = Request::new(1, (0..16).collect()).with_priority(Priority::High);
        let low = Request::new(2, (0..16).collect()).with_priority(Priority::Low);
        scheduler.add_request(high).unwrap();
        scheduler.add_request(low).unwrap();

        let outputs = scheduler.schedule().unwrap();
        assert_eq!(outputs.batch.len(), 2);

        // Both now need a second block; only the high priority one keeps running
        scheduler.commit_step(SequenceId::new(1, 0), &[7]).unwrap();
        scheduler.commit_step(SequenceId::new(2, 0), &[7]).unwrap();
        let outputs = scheduler.schedule().unwrap();

        assert_eq!(outputs.preempted, vec![SequenceId::new(2, 0)]);
        assert_eq!(outputs.batch.len(), 1);
        assert_eq!(scheduler.num_preempted(), 1);
        assert_eq!(
            scheduler.get_sequence(SequenceId::new(1, 0)).unwrap().block_table().num_blocks(),
            2
        );
    }

    #[test]
    fn test_commit_step_finishes_on_max_tokens() {
        let mut scheduler = Scheduler::new(test_config(), 16, 10);
        let params = SamplingParams::default().max_tokens(2);
        scheduler
            .add_request(Request::new(1, vec![1, 2]).with_sampling_params(params))
            .unwrap();
        scheduler.schedule().unwrap();

        let seq_id = SequenceId::new(1, 0);
        assert_eq!(scheduler.commit_step(seq_id, &[5]).unwrap(), None);
        assert_eq!(
            scheduler.commit_step(seq_id, &[6]).unwrap(),
            Some(FinishReason::Length)
        );
        assert_eq!(scheduler.num_running(), 0);

        let finished = scheduler.take_finished();
        assert_eq!(finished.len(), 1);
        assert_eq!(scheduler.block_manager().num_free_blocks(), 10);
    }

    #[test]
    fn test_speculative_lookahead_reserved() {
        let config = SchedulerConfig {
            num_speculative_tokens: 4,
            ..test_config()
        };
        let mut scheduler = Scheduler::new(config, 16, 10);
        scheduler.add_request(Request::new(1, (0..14).collect())).unwrap();

        let outputs = scheduler.schedule().unwrap();
        let entry = &outputs.batch.entries[0];
        // 14 tokens + 4 lookahead slots -> 2 blocks
        assert_eq!(entry.block_ids.len(), 2);
        assert_eq!(entry.slot_mapping.len(), 18);
        assert_eq!(entry.num_draft_tokens, 4);
    }
}
