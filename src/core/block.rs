//! Block handles and block tables for the paged KV cache.
//!
//! The KV cache tensor is allocated once, outside this crate, and carved into
//! `total_blocks` fixed-size blocks. Everything here deals in block *ids*; a
//! block never carries content of its own, only the slot range it denotes.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Handle of one KV cache block.
pub type BlockId = usize;

/// Default block size (tokens per block).
pub const DEFAULT_BLOCK_SIZE: usize = 16;

/// Block sizes must be a multiple of this many slots.
pub const BLOCK_SIZE_GRANULARITY: usize = 16;

/// Compute a cumulative hash for a block of tokens including its prefix chain.
///
/// The parent block's hash is folded in, so two blocks holding the same tokens
/// behind different prefixes never collide.
///
/// # Example
///
/// ```
/// use nano_serve::core::block::hash_token_block;
///
/// let tokens = [1u32, 2, 3, 4];
/// let hash1 = hash_token_block(&tokens, None);
/// let hash2 = hash_token_block(&tokens, Some(hash1));
///
/// // Same tokens but different prefix chain -> different hash
/// assert_ne!(hash1, hash2);
/// ```
pub fn hash_token_block(token_ids: &[u32], parent_hash: Option<u64>) -> u64 {
    let mut hasher = DefaultHasher::new();
    parent_hash.hash(&mut hasher);
    token_ids.hash(&mut hasher);
    hasher.finish()
}

/// Bookkeeping for one allocated block.
///
/// Owned by the [`BlockManager`](super::block_manager::BlockManager); the
/// reference count tracks how many sequences currently hold the block.
#[derive(Debug, Clone)]
pub struct Block {
    block_id: BlockId,
    ref_count: usize,
    /// Set once the block is published in the prefix cache.
    prefix_hash: Option<u64>,
    /// Logical clock of the last acquire or release, for LRU reclamation.
    last_access: u64,
}

impl Block {
    /// Create bookkeeping for a freshly allocated block held by one sequence.
    pub fn new(block_id: BlockId, now: u64) -> Self {
        Self {
            block_id,
            ref_count: 1,
            prefix_hash: None,
            last_access: now,
        }
    }

    /// Get the block ID.
    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    /// Get the current reference count.
    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    /// Get the prefix hash, if published.
    pub fn prefix_hash(&self) -> Option<u64> {
        self.prefix_hash
    }

    /// Logical time of the last acquire/release.
    pub fn last_access(&self) -> u64 {
        self.last_access
    }

    pub(crate) fn set_prefix_hash(&mut self, hash: u64) {
        self.prefix_hash = Some(hash);
    }

    pub(crate) fn clear_prefix_hash(&mut self) {
        self.prefix_hash = None;
    }

    pub(crate) fn acquire(&mut self, now: u64) -> usize {
        self.ref_count += 1;
        self.last_access = now;
        self.ref_count
    }

    /// Drop one reference and return the remaining count.
    pub(crate) fn release(&mut self, now: u64) -> usize {
        self.ref_count = self.ref_count.saturating_sub(1);
        self.last_access = now;
        self.ref_count
    }
}

/// Maps a sequence's logical positions to physical block IDs.
///
/// Token at position `p` is stored in:
/// - Logical block: `p / block_size`
/// - Slot within block: `p % block_size`
/// - Physical block: `block_ids[p / block_size]`
///
/// # Example
///
/// ```
/// use nano_serve::core::block::BlockTable;
///
/// let mut table = BlockTable::new(16);
/// table.append_block(5);   // Tokens 0-15
/// table.append_block(12);  // Tokens 16-31
/// table.append_block(3);   // Tokens 32-47
///
/// // Token 20 -> logical block 1 -> physical block 12
/// assert_eq!(table.get_block_id(1), Some(12));
/// assert_eq!(table.slot(20), Some(12 * 16 + 4));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockTable {
    block_ids: Vec<BlockId>,
    block_size: usize,
}

impl BlockTable {
    /// Create a new empty block table.
    pub fn new(block_size: usize) -> Self {
        Self {
            block_ids: Vec::new(),
            block_size,
        }
    }

    /// Get the block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Physical block for a logical block index.
    pub fn get_block_id(&self, logical_block_idx: usize) -> Option<BlockId> {
        self.block_ids.get(logical_block_idx).copied()
    }

    /// Add a new physical block to the end of the table.
    pub fn append_block(&mut self, block_id: BlockId) {
        self.block_ids.push(block_id);
    }

    /// Append several physical blocks in order.
    pub fn extend(&mut self, block_ids: impl IntoIterator<Item = BlockId>) {
        self.block_ids.extend(block_ids);
    }

    /// Number of blocks in the table.
    pub fn num_blocks(&self) -> usize {
        self.block_ids.len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.block_ids.is_empty()
    }

    /// Number of token slots the table can hold.
    pub fn capacity(&self) -> usize {
        self.block_ids.len() * self.block_size
    }

    /// All physical block IDs in logical order.
    pub fn block_ids(&self) -> &[BlockId] {
        &self.block_ids
    }

    /// Global slot index for token position `pos`.
    pub fn slot(&self, pos: usize) -> Option<usize> {
        self.get_block_id(pos / self.block_size)
            .map(|block| block * self.block_size + pos % self.block_size)
    }

    /// Global slot indices for the token positions in `positions`.
    ///
    /// Global slot = `block_id * block_size + slot_within_block`. Positions
    /// beyond the table's capacity are skipped.
    pub fn slot_mapping(&self, positions: std::ops::Range<usize>) -> Vec<usize> {
        positions.filter_map(|pos| self.slot(pos)).collect()
    }

    /// Remove all blocks, handing them back to the caller.
    pub fn take(&mut self) -> Vec<BlockId> {
        std::mem::take(&mut self.block_ids)
    }
}

/// Compute number of blocks needed for a sequence of given length.
///
/// # Example
///
/// ```
/// use nano_serve::core::block::compute_num_blocks;
///
/// assert_eq!(compute_num_blocks(35, 16), 3);  // 35 tokens -> 3 blocks
/// assert_eq!(compute_num_blocks(32, 16), 2);  // 32 tokens -> 2 blocks exactly
/// assert_eq!(compute_num_blocks(0, 16), 0);   // 0 tokens -> 0 blocks
/// ```
pub fn compute_num_blocks(seq_len: usize, block_size: usize) -> usize {
    seq_len.div_ceil(block_size)
}
