//! Synthetic tokenizer and executors.
//!
//! Lets the serving core run end to end without a model: the tokenizer maps
//! bytes to token ids, and the executors "generate" a cycling lowercase
//! alphabet with a configurable chance of ending each step with EOS.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::engine::executor::{DraftExecutor, ModelExecutor, StepOutput};
use crate::engine::tokenizer::{ChatTemplate, Message, Tokenizer};
use crate::error::{Error, Result};
use crate::scheduler::{Batch, BatchEntry};
use crate::speculative::greedy_accept;

/// End-of-sequence id of [`ByteTokenizer`].
pub const BYTE_EOS_TOKEN_ID: u32 = 256;

/// One token per UTF-8 byte, plus an EOS token.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    pub fn new() -> Self {
        Self
    }
}

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.bytes().map(u32::from).collect())
    }

    fn decode(&self, token_ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        let mut bytes = Vec::with_capacity(token_ids.len());
        for &token_id in token_ids {
            match u8::try_from(token_id) {
                Ok(byte) => bytes.push(byte),
                Err(_) if token_id == BYTE_EOS_TOKEN_ID => {
                    if !skip_special_tokens {
                        bytes.extend_from_slice(b"</s>");
                    }
                }
                Err(_) => {
                    return Err(Error::Tokenization(format!("unknown token id {token_id}")));
                }
            }
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn eos_token_id(&self) -> Option<u32> {
        Some(BYTE_EOS_TOKEN_ID)
    }
}

/// `<|role|>` headed chat layout ending with an open assistant turn.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleChatTemplate;

impl ChatTemplate for SimpleChatTemplate {
    fn apply(&self, messages: &[Message]) -> Result<String> {
        if messages.is_empty() {
            return Err(Error::InvalidArgument("no messages".to_string()));
        }
        let mut prompt = String::new();
        for message in messages {
            prompt.push_str(&format!("<|{}|>\n{}\n", message.role, message.content));
        }
        prompt.push_str("<|assistant|>\n");
        Ok(prompt)
    }
}

/// Token the synthetic target model picks after `prev`.
fn next_token(prev: u32) -> u32 {
    u32::from(b'a') + prev.wrapping_add(1) % 26
}

/// Pseudo-random stand-in for the target model.
pub struct SyntheticExecutor {
    rng: StdRng,
    eos_probability: f64,
    bytes_per_token: u64,
    /// Slots in the allocated cache.
    num_slots: Option<usize>,
}

impl SyntheticExecutor {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            eos_probability: 0.0,
            bytes_per_token: 4096,
            num_slots: None,
        }
    }

    /// Chance that a sampled token is EOS.
    pub fn with_eos_probability(mut self, probability: f64) -> Self {
        self.eos_probability = probability.clamp(0.0, 1.0);
        self
    }

    pub fn with_bytes_per_token(mut self, bytes_per_token: u64) -> Self {
        self.bytes_per_token = bytes_per_token;
        self
    }

    fn sample(&mut self, prev: u32) -> u32 {
        if self.eos_probability > 0.0 && self.rng.gen_bool(self.eos_probability) {
            BYTE_EOS_TOKEN_ID
        } else {
            next_token(prev)
        }
    }

    fn check_slots(&self, entry: &BatchEntry, num_slots: usize) -> Result<()> {
        let needed = entry.num_tokens();
        if entry.slot_mapping.len() < needed {
            return Err(Error::Executor(format!(
                "sequence {} maps {} slots for {} tokens",
                entry.seq_id,
                entry.slot_mapping.len(),
                needed
            )));
        }
        if let Some(&slot) = entry.slot_mapping.iter().find(|&&slot| slot >= num_slots) {
            return Err(Error::Executor(format!(
                "sequence {} maps slot {slot} outside the cache",
                entry.seq_id
            )));
        }
        Ok(())
    }
}

impl ModelExecutor for SyntheticExecutor {
    fn kv_cache_bytes_per_token(&self) -> u64 {
        self.bytes_per_token
    }

    fn allocate_kv_cache(&mut self, num_blocks: usize, block_size: usize) -> Result<()> {
        self.num_slots = Some(num_blocks * block_size);
        Ok(())
    }

    fn execute(&mut self, batch: &Batch) -> Result<Vec<StepOutput>> {
        let num_slots = self
            .num_slots
            .ok_or_else(|| Error::Executor("KV cache not allocated".to_string()))?;

        let mut outputs = Vec::with_capacity(batch.len());
        for entry in batch.iter() {
            self.check_slots(entry, num_slots)?;
            let last = entry
                .token_ids
                .last()
                .copied()
                .ok_or_else(|| Error::Executor(format!("sequence {} has no input", entry.seq_id)))?;

            // Target choice after the last input and after every draft
            let mut targets = Vec::with_capacity(entry.draft_token_ids.len() + 1);
            targets.push(self.sample(last));
            for &draft in &entry.draft_token_ids {
                targets.push(self.sample(draft));
            }
            outputs.push(StepOutput::new(
                entry.seq_id,
                greedy_accept(&entry.draft_token_ids, &targets),
            ));
        }
        Ok(outputs)
    }
}

/// Draft model that agrees with [`SyntheticExecutor`] most of the time.
pub struct SyntheticDraft {
    rng: StdRng,
    miss_probability: f64,
}

impl SyntheticDraft {
    pub fn new(seed: u64, miss_probability: f64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            miss_probability: miss_probability.clamp(0.0, 1.0),
        }
    }
}

impl DraftExecutor for SyntheticDraft {
    fn propose(&mut self, batch: &Batch, num_tokens: usize) -> Result<Vec<Vec<u32>>> {
        Ok(batch
            .iter()
            .map(|entry| {
                let mut prev = entry.token_ids.last().copied().unwrap_or(0);
                (0..num_tokens.min(entry.num_draft_tokens))
                    .map(|_| {
                        let mut token = next_token(prev);
                        if self.miss_probability > 0.0 && self.rng.gen_bool(self.miss_probability) {
                            token = u32::from(b'A') + self.rng.gen_range(0..26);
                        }
                        prev = token;
                        token
                    })
                    .collect()
            })
            .collect())
    }
}
