//! Speculative decoding.
//!
//! The scheduler reserves lookahead capacity so a draft executor can propose
//! K tokens per sequence and the target executor can verify them in a single
//! step. Rejected drafts only rewind the sequence's KV cursor; the blocks
//! granted for the step are kept.
//!
//! ## Example
//!
//! ```text
//! Draft (K=4):     [prompt] -> t1 -> t2 -> t3 -> t4
//! Target verify:   [last, t1, t2, t3, t4] -> choices for all 5 positions
//! Acceptance:      Accept t1, t2, reject t3, take target's t3'
//! Committed:       t1, t2, t3'   (KV cursor now ends after t2)
//! ```

pub mod config;
pub mod verify;

pub use config::SpeculativeConfig;
pub use verify::{greedy_accept, AcceptanceStats};
