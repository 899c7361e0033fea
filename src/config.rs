//! Configuration types for nano-serve.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::block::{BLOCK_SIZE_GRANULARITY, DEFAULT_BLOCK_SIZE};
use crate::error::{Error, Result};
use crate::speculative::SpeculativeConfig;

/// Handler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerOptions {
    /// Slots per KV cache block; must be a multiple of 16.
    pub block_size: usize,
    /// KV cache budget in bytes.
    pub max_cache_size: u64,
    /// Fraction of `max_cache_size` the block pool may use.
    pub max_memory_utilization: f64,
    /// Enable prefix caching.
    pub enable_prefix_cache: bool,
    /// Maximum number of tokens processed per step.
    pub max_tokens_per_batch: usize,
    /// Maximum number of sequences per step.
    pub max_seqs_per_batch: usize,
    /// Let a waiting request preempt running requests of a lower priority class.
    pub enable_priority_preemption: bool,
    /// Speculative decoding settings.
    pub speculative: SpeculativeConfig,
    /// Worker threads running user callbacks.
    pub num_callback_threads: usize,
    /// Outputs buffered per callback worker before the loop blocks.
    pub callback_queue_capacity: usize,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            max_cache_size: 10 * 1024 * 1024 * 1024,
            max_memory_utilization: 0.9,
            enable_prefix_cache: true,
            max_tokens_per_batch: 256,
            max_seqs_per_batch: 64,
            enable_priority_preemption: true,
            speculative: SpeculativeConfig::default(),
            num_callback_threads: 4,
            callback_queue_capacity: 1024,
        }
    }
}

impl HandlerOptions {
    /// Load options from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let options: Self = serde_json::from_str(&content)?;
        options.validate()?;
        Ok(options)
    }

    /// Check the options for values the handler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || self.block_size % BLOCK_SIZE_GRANULARITY != 0 {
            return Err(Error::Config(format!(
                "block_size must be a positive multiple of {BLOCK_SIZE_GRANULARITY}, got {}",
                self.block_size
            )));
        }
        if !(self.max_memory_utilization > 0.0 && self.max_memory_utilization <= 1.0) {
            return Err(Error::Config(format!(
                "max_memory_utilization must be in (0, 1], got {}",
                self.max_memory_utilization
            )));
        }
        if self.max_tokens_per_batch == 0 || self.max_seqs_per_batch == 0 {
            return Err(Error::Config(
                "max_tokens_per_batch and max_seqs_per_batch must be non-zero".to_string(),
            ));
        }
        if self.num_callback_threads == 0 || self.callback_queue_capacity == 0 {
            return Err(Error::Config(
                "callback pool needs at least one thread and a non-zero queue".to_string(),
            ));
        }
        Ok(())
    }

    /// Number of blocks the cache budget affords at `bytes_per_token`.
    pub fn num_blocks(&self, bytes_per_token: u64) -> usize {
        let bytes_per_block = bytes_per_token.saturating_mul(self.block_size as u64);
        if bytes_per_block == 0 {
            return 0;
        }
        let budget = (self.max_cache_size as f64 * self.max_memory_utilization) as u64;
        (budget / bytes_per_block) as usize
    }

    /// Scheduler configuration derived from these options.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_seqs_per_batch: self.max_seqs_per_batch,
            max_tokens_per_batch: self.max_tokens_per_batch,
            num_speculative_tokens: self.speculative.num_speculative_tokens,
            enable_prefix_cache: self.enable_prefix_cache,
            enable_priority_preemption: self.enable_priority_preemption,
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of sequences to schedule per iteration.
    pub max_seqs_per_batch: usize,
    /// Maximum tokens to process per iteration.
    pub max_tokens_per_batch: usize,
    /// Draft tokens verified per sequence per step.
    pub num_speculative_tokens: usize,
    /// Reuse cached prompt blocks across requests.
    pub enable_prefix_cache: bool,
    /// Let a waiting request preempt running requests of a lower priority class.
    pub enable_priority_preemption: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_seqs_per_batch: 64,
            max_tokens_per_batch: 256,
            num_speculative_tokens: 0,
            enable_prefix_cache: false,
            enable_priority_preemption: true,
        }
    }
}

/// Per-request sampling and stopping parameters.
///
/// The sampling values are opaque to the scheduler and only passed through
/// to the model executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// Number of completions to generate.
    pub n: usize,
    /// Maximum tokens to generate per completion.
    pub max_tokens: usize,
    /// Temperature for sampling (1.0 = no change).
    pub temperature: f32,
    /// Top-p (nucleus) sampling (1.0 = disabled).
    pub top_p: f32,
    /// Top-k sampling (-1 = disabled).
    pub top_k: i64,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
    pub repetition_penalty: f32,
    /// Stop strings; tokenized when the request is created.
    pub stop: Vec<String>,
    /// Token ids that end a completion.
    pub stop_token_ids: Vec<u32>,
    /// Keep generating past the end-of-sequence token.
    pub ignore_eos: bool,
    pub skip_special_tokens: bool,
    /// Prepend the prompt text to the output.
    pub echo: bool,
    /// Seed for the executor's sampler.
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            n: 1,
            max_tokens: 16,
            temperature: 0.7,
            top_p: 1.0,
            top_k: -1,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            repetition_penalty: 1.0,
            stop: Vec::new(),
            stop_token_ids: Vec::new(),
            ignore_eos: false,
            skip_special_tokens: true,
            echo: false,
            seed: None,
        }
    }
}

impl SamplingParams {
    /// Set the maximum tokens to generate.
    pub fn max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set the number of completions.
    pub fn n(mut self, n: usize) -> Self {
        self.n = n;
        self
    }

    /// Set the temperature for sampling.
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Add a stop string.
    pub fn stop(mut self, stop: impl Into<String>) -> Self {
        self.stop.push(stop.into());
        self
    }

    /// Ignore the end-of-sequence token.
    pub fn ignore_eos(mut self, ignore_eos: bool) -> Self {
        self.ignore_eos = ignore_eos;
        self
    }

    /// Prepend the prompt text to the output.
    pub fn echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Reject parameter combinations no request can be built from.
    pub fn validate(&self) -> Result<()> {
        if self.n == 0 {
            return Err(Error::InvalidArgument("n must be at least 1".to_string()));
        }
        if self.max_tokens == 0 {
            return Err(Error::InvalidArgument(
                "max_tokens must be at least 1".to_string(),
            ));
        }
        if self.temperature < 0.0 {
            return Err(Error::InvalidArgument(format!(
                "temperature must be non-negative, got {}",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(Error::InvalidArgument(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_are_valid() {
        let options = HandlerOptions::default();
        assert!(options.validate().is_ok());
        assert_eq!(options.block_size, 16);
        assert_eq!(options.max_seqs_per_batch, 64);
        assert_eq!(options.max_tokens_per_batch, 256);
    }

    #[test]
    fn test_block_size_granularity() {
        let options = HandlerOptions {
            block_size: 24,
            ..Default::default()
        };
        assert!(matches!(options.validate(), Err(Error::Config(_))));

        let options = HandlerOptions {
            block_size: 32,
            ..Default::default()
        };
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_num_blocks_from_budget() {
        let options = HandlerOptions {
            block_size: 16,
            max_cache_size: 1000 * 16 * 64,
            max_memory_utilization: 0.5,
            ..Default::default()
        };
        // 64 bytes per token, 1024 bytes per block, half of 1000 blocks
        assert_eq!(options.num_blocks(64), 500);
        assert_eq!(options.num_blocks(0), 0);
    }

    #[test]
    fn test_options_from_partial_json() {
        let options: HandlerOptions =
            serde_json::from_str(r#"{"block_size": 32, "speculative": {"num_speculative_tokens": 2}}"#)
                .unwrap();
        assert_eq!(options.block_size, 32);
        assert_eq!(options.speculative.num_speculative_tokens, 2);
        assert_eq!(options.max_seqs_per_batch, 64);
    }

    #[test]
    fn test_sampling_params_validation() {
        assert!(SamplingParams::default().validate().is_ok());
        assert!(SamplingParams::default().n(0).validate().is_err());
        assert!(SamplingParams::default().max_tokens(0).validate().is_err());
        assert!(SamplingParams::default().temperature(-1.0).validate().is_err());
    }
}
