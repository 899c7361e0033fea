//! Requests: a prompt plus everything needed to turn it into completions.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::SamplingParams;
use crate::core::block::hash_token_block;
use crate::core::sequence::{FinishReason, Sequence, SequenceId};
use crate::error::{Error, Result};

/// Unique identifier for a request.
pub type RequestId = u64;

/// Priority of a request.
///
/// Lower discriminants are served first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High = 0,
    #[default]
    Medium = 1,
    Low = 2,
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Self::High),
            "medium" | "normal" | "default" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            other => Err(Error::InvalidArgument(format!("unknown priority {other:?}"))),
        }
    }
}

/// Shared flag marking a request as cancelled.
///
/// Set from any thread; the scheduler only acts on it at tick boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Conditions that end a sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoppingCriteria {
    /// Maximum number of generated tokens.
    pub max_tokens: usize,
    /// Maximum prompt + generated tokens (0 = unlimited).
    pub max_context_len: usize,
    pub eos_token_id: Option<u32>,
    pub ignore_eos: bool,
    pub stop_token_ids: HashSet<u32>,
    /// Token sequences that end generation when the output ends with them.
    pub stop_sequences: Vec<Vec<u32>>,
}

impl StoppingCriteria {
    /// Build criteria from sampling parameters.
    ///
    /// `stop_sequences` are the tokenized forms of `params.stop`.
    pub fn from_sampling_params(
        params: &SamplingParams,
        eos_token_id: Option<u32>,
        stop_sequences: Vec<Vec<u32>>,
    ) -> Self {
        Self {
            max_tokens: params.max_tokens,
            max_context_len: 0,
            eos_token_id,
            ignore_eos: params.ignore_eos,
            stop_token_ids: params.stop_token_ids.iter().copied().collect(),
            stop_sequences: stop_sequences.into_iter().filter(|s| !s.is_empty()).collect(),
        }
    }

    /// Check whether `seq` should stop after its latest token.
    pub fn check(&self, seq: &Sequence) -> Option<FinishReason> {
        let output = seq.output_token_ids();
        let last = *output.last()?;

        if !self.ignore_eos && self.eos_token_id == Some(last) {
            return Some(FinishReason::Stop);
        }
        if self.stop_token_ids.contains(&last) {
            return Some(FinishReason::Stop);
        }
        if self.stop_sequences.iter().any(|stop| output.ends_with(stop)) {
            return Some(FinishReason::Stop);
        }
        if output.len() >= self.max_tokens {
            return Some(FinishReason::Length);
        }
        if self.max_context_len > 0 && seq.len() >= self.max_context_len {
            return Some(FinishReason::Length);
        }
        None
    }
}

/// Token counts reported with a finished request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub num_prompt_tokens: usize,
    pub num_generated_tokens: usize,
    pub num_total_tokens: usize,
}

/// A unit of user work: one prompt, `n` sequences generating completions.
///
/// # Example
///
/// ```
/// use nano_serve::core::request::{Priority, Request};
///
/// let request = Request::new(7, vec![1, 2, 3]).with_priority(Priority::High);
/// assert_eq!(request.id(), 7);
/// assert_eq!(request.num_prompt_tokens(), 3);
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    id: RequestId,
    created_time: Instant,
    /// Submission order; tie-break for requests created at the same instant.
    arrival: u64,
    prompt_tokens: Vec<u32>,
    /// Chained hashes of the full prompt blocks.
    prompt_block_hashes: Vec<u64>,
    priority: Priority,
    sampling_params: SamplingParams,
    stopping_criteria: StoppingCriteria,
    stream: bool,
    echo: bool,
    sequences: Vec<Sequence>,
    cancellation: CancellationFlag,
    /// Why the request was failed, when it was.
    status_message: Option<String>,
}

impl Request {
    /// Create a request with default parameters.
    pub fn new(id: RequestId, prompt_tokens: Vec<u32>) -> Self {
        let sampling_params = SamplingParams::default();
        let stopping_criteria = StoppingCriteria::from_sampling_params(&sampling_params, None, Vec::new());
        Self {
            id,
            created_time: Instant::now(),
            arrival: 0,
            prompt_tokens,
            prompt_block_hashes: Vec::new(),
            priority: Priority::default(),
            sampling_params,
            stopping_criteria,
            stream: false,
            echo: false,
            sequences: Vec::new(),
            cancellation: CancellationFlag::new(),
            status_message: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_created_time(mut self, created_time: Instant) -> Self {
        self.created_time = created_time;
        self
    }

    /// Set sampling parameters; stopping limits follow `max_tokens`,
    /// `stop_token_ids` and `ignore_eos`.
    pub fn with_sampling_params(mut self, params: SamplingParams) -> Self {
        self.stopping_criteria.max_tokens = params.max_tokens;
        self.stopping_criteria.ignore_eos = params.ignore_eos;
        self.stopping_criteria.stop_token_ids = params.stop_token_ids.iter().copied().collect();
        self.echo = params.echo;
        self.sampling_params = params;
        self
    }

    pub fn with_stopping_criteria(mut self, criteria: StoppingCriteria) -> Self {
        self.stopping_criteria = criteria;
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationFlag) -> Self {
        self.cancellation = cancellation;
        self
    }

    // ========== Getters ==========

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn created_time(&self) -> Instant {
        self.created_time
    }

    pub fn arrival(&self) -> u64 {
        self.arrival
    }

    pub fn prompt_tokens(&self) -> &[u32] {
        &self.prompt_tokens
    }

    pub fn num_prompt_tokens(&self) -> usize {
        self.prompt_tokens.len()
    }

    pub fn prompt_block_hashes(&self) -> &[u64] {
        &self.prompt_block_hashes
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn sampling_params(&self) -> &SamplingParams {
        &self.sampling_params
    }

    pub fn stopping_criteria(&self) -> &StoppingCriteria {
        &self.stopping_criteria
    }

    pub fn stream(&self) -> bool {
        self.stream
    }

    pub fn echo(&self) -> bool {
        self.echo
    }

    pub fn cancellation(&self) -> &CancellationFlag {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn sequences(&self) -> &[Sequence] {
        &self.sequences
    }

    pub fn sequence(&self, index: usize) -> Option<&Sequence> {
        self.sequences.get(index)
    }

    pub fn sequence_mut(&mut self, index: usize) -> Option<&mut Sequence> {
        self.sequences.get_mut(index)
    }

    pub(crate) fn sequences_mut(&mut self) -> &mut [Sequence] {
        &mut self.sequences
    }

    /// Message attached when the request was failed.
    pub fn status_message(&self) -> Option<&str> {
        self.status_message.as_deref()
    }

    /// Ids of every sequence of this request.
    pub fn sequence_ids(&self) -> impl Iterator<Item = SequenceId> + '_ {
        (0..self.sequences.len()).map(move |index| SequenceId::new(self.id, index))
    }

    /// A request is finished once every sequence reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.sequences.iter().all(Sequence::is_finished)
    }

    /// Token counts derived from the current sequence state.
    pub fn statistics(&self) -> Statistics {
        let num_prompt_tokens = self.prompt_tokens.len();
        let num_generated_tokens = self.sequences.iter().map(Sequence::num_output_tokens).sum();
        Statistics {
            num_prompt_tokens,
            num_generated_tokens,
            num_total_tokens: num_prompt_tokens + num_generated_tokens,
        }
    }

    // ========== Scheduler hooks ==========

    pub(crate) fn set_status_message(&mut self, message: impl Into<String>) {
        self.status_message.get_or_insert_with(|| message.into());
    }

    /// Append the tokens accepted for sequence `index`, checking the stopping
    /// criteria after each one.
    pub(crate) fn commit_step(
        &mut self,
        index: usize,
        accepted: &[u32],
    ) -> Result<Option<FinishReason>> {
        let criteria = &self.stopping_criteria;
        let seq = self
            .sequences
            .get_mut(index)
            .ok_or(Error::RequestNotFound(self.id))?;
        Ok(seq.commit_step(accepted, |seq| criteria.check(seq)))
    }

    /// Create one sequence per requested completion and, when asked, hash the
    /// full prompt blocks. Sequences are only created once.
    pub(crate) fn prepare(&mut self, arrival: u64, block_size: usize, hash_prompt: bool) {
        self.arrival = arrival;
        if self.sequences.is_empty() {
            let n = self.sampling_params.n.max(1);
            self.sequences = (0..n)
                .map(|index| Sequence::new(index, self.prompt_tokens.clone(), block_size))
                .collect();
        }
        if hash_prompt && self.prompt_block_hashes.is_empty() {
            let mut parent = None;
            self.prompt_block_hashes = self
                .prompt_tokens
                .chunks_exact(block_size)
                .map(|block| {
                    let hash = hash_token_block(block, parent);
                    parent = Some(hash);
                    hash
                })
                .collect();
        }
    }
}
