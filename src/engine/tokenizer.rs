//! Tokenizer and chat template interfaces.
//!
//! Both are external collaborators: the handler only needs to turn text into
//! token ids and back, and to flatten chat messages into a prompt.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Text <-> token id conversion.
pub trait Tokenizer: Send + Sync {
    /// Encode text into token ids.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode token ids into text.
    fn decode(&self, token_ids: &[u32], skip_special_tokens: bool) -> Result<String>;

    /// End-of-sequence token, if the vocabulary has one.
    fn eos_token_id(&self) -> Option<u32>;
}

/// One chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

/// Formats a conversation into a single prompt.
pub trait ChatTemplate: Send + Sync {
    fn apply(&self, messages: &[Message]) -> Result<String>;
}
