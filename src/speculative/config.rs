//! Speculative decoding configuration.

use serde::{Deserialize, Serialize};

/// Configuration for speculative decoding.
///
/// A draft executor proposes K tokens per sequence, and the target executor
/// verifies all of them in the same step. The scheduler reserves K slots of
/// lookahead per running sequence so the verification never runs out of
/// blocks mid-step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeculativeConfig {
    /// Number of tokens to speculate per iteration (K).
    /// Higher values can improve throughput if acceptance rate is high,
    /// but reserve more KV cache per sequence. 0 disables speculation.
    pub num_speculative_tokens: usize,
}

impl SpeculativeConfig {
    /// Set the number of speculative tokens.
    pub fn num_tokens(mut self, k: usize) -> Self {
        self.num_speculative_tokens = k;
        self
    }

    /// Whether draft tokens are proposed at all.
    pub fn is_enabled(&self) -> bool {
        self.num_speculative_tokens > 0
    }
}
