//! Free-list allocator for KV cache block ids.
//!
//! The physical memory behind the blocks is allocated once at startup by the
//! model executor. This allocator only hands out and takes back the integer
//! ids; it has no notion of requests, priorities or block content.
//!
//! ## Example
//!
//! ```
//! use nano_serve::core::block_allocator::BlockAllocator;
//!
//! let mut allocator = BlockAllocator::new(4, 16);
//! let blocks = allocator.allocate_many(2).unwrap();
//! assert_eq!(allocator.free_block_count(), 2);
//!
//! for block in blocks {
//!     allocator.free(block).unwrap();
//! }
//! assert_eq!(allocator.free_block_count(), 4);
//! ```

use crate::core::block::BlockId;
use crate::error::{Error, Result};

/// Fixed pool of `total_blocks` block ids.
///
/// Not thread safe: the scheduler owning it serializes all access on the
/// handler's loop thread.
#[derive(Debug)]
pub struct BlockAllocator {
    /// Free block IDs; popped from the back (LIFO for cache locality).
    free_blocks: Vec<BlockId>,
    /// `allocated[id]` is true while `id` is handed out.
    allocated: Vec<bool>,
    /// Number of slots per block.
    block_size: usize,
}

impl BlockAllocator {
    /// Create an allocator with every block free.
    ///
    /// Block 0 is handed out first.
    pub fn new(total_blocks: usize, block_size: usize) -> Self {
        Self {
            free_blocks: (0..total_blocks).rev().collect(),
            allocated: vec![false; total_blocks],
            block_size,
        }
    }

    /// Number of slots per block.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Total number of blocks managed.
    pub fn total_blocks(&self) -> usize {
        self.allocated.len()
    }

    /// Number of blocks currently free.
    pub fn free_block_count(&self) -> usize {
        self.free_blocks.len()
    }

    /// Whether `block_id` is currently handed out.
    pub fn is_allocated(&self, block_id: BlockId) -> bool {
        self.allocated.get(block_id).copied().unwrap_or(false)
    }

    /// Allocate a single block.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the free list is empty.
    pub fn allocate(&mut self) -> Result<BlockId> {
        let block_id = self.free_blocks.pop().ok_or(Error::OutOfMemory {
            requested: 1,
            available: 0,
        })?;
        self.allocated[block_id] = true;
        Ok(block_id)
    }

    /// Allocate `n` blocks at once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if fewer than `n` blocks are free; the
    /// free list is left untouched in that case.
    pub fn allocate_many(&mut self, n: usize) -> Result<Vec<BlockId>> {
        let available = self.free_blocks.len();
        if n > available {
            return Err(Error::OutOfMemory {
                requested: n,
                available,
            });
        }

        let block_ids: Vec<BlockId> = self.free_blocks.drain(available - n..).rev().collect();
        for &block_id in &block_ids {
            self.allocated[block_id] = true;
        }
        Ok(block_ids)
    }

    /// Return a block to the free list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidBlock`] if `block_id` is out of range or
    /// already free. Either case means the caller's bookkeeping is corrupt.
    pub fn free(&mut self, block_id: BlockId) -> Result<()> {
        match self.allocated.get_mut(block_id) {
            Some(allocated) if *allocated => {
                *allocated = false;
                self.free_blocks.push(block_id);
                Ok(())
            }
            _ => Err(Error::InvalidBlock(block_id)),
        }
    }

    /// Return every block to the free list.
    pub fn reset(&mut self) {
        let total = self.allocated.len();
        self.free_blocks = (0..total).rev().collect();
        self.allocated.iter_mut().for_each(|slot| *slot = false);
    }
}
