//! Block manager for the paged KV cache.
//!
//! The BlockManager sits on top of the [`BlockAllocator`] and adds what the
//! raw id pool does not know about: reference counts for blocks shared between
//! sequences, and the prefix cache that keeps fully populated prompt blocks
//! alive after their owners are gone.
//!
//! ## Block lifecycle
//!
//! ```text
//!   allocate()          release() to 0, uncached
//!   free ───────► held ─────────────────────────► free
//!                  │ ▲
//!   release() to 0 │ │ allocate_cached() hit
//!   with a hash    ▼ │
//!               evictable ──────────────────────► free
//!                      reclaimed LRU-first under pressure
//! ```
//!
//! ## Example
//!
//! ```
//! use nano_serve::core::block::hash_token_block;
//! use nano_serve::core::block_manager::BlockManager;
//!
//! let mut manager = BlockManager::new(8, 16, true);
//! let hash = hash_token_block(&[7u32; 16], None);
//!
//! let (blocks, hits) = manager.allocate_cached(&[hash], 2).unwrap();
//! assert_eq!(hits, 0);
//! manager.register_block(blocks[0], hash);
//!
//! // A second sequence with the same first block shares it
//! let (shared, hits) = manager.allocate_cached(&[hash], 2).unwrap();
//! assert_eq!(hits, 1);
//! assert_eq!(shared[0], blocks[0]);
//! assert_eq!(manager.ref_count(blocks[0]), Some(2));
//! ```

use std::collections::{BTreeMap, HashMap};

use crate::core::block::{Block, BlockId};
use crate::core::block_allocator::BlockAllocator;
use crate::error::{Error, Result};

/// Reference-counted block pool with an optional prefix cache.
#[derive(Debug)]
pub struct BlockManager {
    allocator: BlockAllocator,
    /// Every block not on the allocator's free list, evictable ones included.
    blocks: HashMap<BlockId, Block>,
    /// Prefix hash -> block_id mapping for prefix caching.
    prefix_cache: HashMap<u64, BlockId>,
    /// Cached blocks nobody references, keyed by last access (oldest first).
    evictable: BTreeMap<u64, BlockId>,
    enable_prefix_cache: bool,
    /// Logical clock; bumped on every acquire and release.
    clock: u64,
}

impl BlockManager {
    /// Create a new block manager with the specified capacity.
    ///
    /// ```
    /// use nano_serve::core::block_manager::BlockManager;
    ///
    /// let manager = BlockManager::new(1024, 16, false);
    /// assert_eq!(manager.num_free_blocks(), 1024);
    /// ```
    pub fn new(total_blocks: usize, block_size: usize, enable_prefix_cache: bool) -> Self {
        Self {
            allocator: BlockAllocator::new(total_blocks, block_size),
            blocks: HashMap::with_capacity(total_blocks),
            prefix_cache: HashMap::new(),
            evictable: BTreeMap::new(),
            enable_prefix_cache,
            clock: 0,
        }
    }

    /// Get the block size.
    pub fn block_size(&self) -> usize {
        self.allocator.block_size()
    }

    /// Get the total number of blocks.
    pub fn total_blocks(&self) -> usize {
        self.allocator.total_blocks()
    }

    /// Whether full prompt blocks are published for reuse.
    pub fn prefix_cache_enabled(&self) -> bool {
        self.enable_prefix_cache
    }

    /// Blocks an allocation can draw on: free ones plus evictable cached ones.
    pub fn num_free_blocks(&self) -> usize {
        self.allocator.free_block_count() + self.evictable.len()
    }

    /// Blocks referenced by at least one sequence.
    pub fn num_used_blocks(&self) -> usize {
        self.blocks.len() - self.evictable.len()
    }

    /// Cached blocks nobody references.
    pub fn num_evictable_blocks(&self) -> usize {
        self.evictable.len()
    }

    /// Number of published prefix hashes.
    pub fn num_cached_blocks(&self) -> usize {
        self.prefix_cache.len()
    }

    /// Check if a specific number of blocks can be allocated.
    pub fn can_allocate(&self, num_blocks: usize) -> bool {
        self.num_free_blocks() >= num_blocks
    }

    /// Get a reference to a block's bookkeeping.
    pub fn get_block(&self, block_id: BlockId) -> Option<&Block> {
        self.blocks.get(&block_id)
    }

    /// Reference count of an allocated block.
    pub fn ref_count(&self, block_id: BlockId) -> Option<usize> {
        self.blocks.get(&block_id).map(Block::ref_count)
    }

    /// Check if a prefix hash is in the cache.
    pub fn is_prefix_cached(&self, prefix_hash: u64) -> bool {
        self.prefix_cache.contains_key(&prefix_hash)
    }

    /// Allocate `num_blocks` private blocks.
    ///
    /// Evictable cached blocks are reclaimed least-recently-used first when
    /// the free list alone is too short.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if free plus evictable blocks cannot
    /// cover the request. Nothing is reclaimed in that case.
    pub fn allocate(&mut self, num_blocks: usize) -> Result<Vec<BlockId>> {
        let available = self.num_free_blocks();
        if num_blocks > available {
            return Err(Error::OutOfMemory {
                requested: num_blocks,
                available,
            });
        }

        while self.allocator.free_block_count() < num_blocks {
            self.evict_one()?;
        }

        let block_ids = self.allocator.allocate_many(num_blocks)?;
        let now = self.tick();
        for &block_id in &block_ids {
            self.blocks.insert(block_id, Block::new(block_id, now));
        }
        Ok(block_ids)
    }

    /// Allocate `num_blocks` blocks, reusing cached ones for the leading
    /// prefix hashes.
    ///
    /// Walks `prefix_hashes` in order, taking a shared reference on each
    /// cached block until the first miss; the rest of the `num_blocks` are
    /// allocated fresh. Returns the block ids in logical order and how many
    /// leading blocks were cache hits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the fresh part cannot be allocated.
    /// No reference is taken in that case.
    pub fn allocate_cached(
        &mut self,
        prefix_hashes: &[u64],
        num_blocks: usize,
    ) -> Result<(Vec<BlockId>, usize)> {
        let hits: Vec<BlockId> = if self.enable_prefix_cache {
            prefix_hashes
                .iter()
                .take(num_blocks)
                .map_while(|hash| self.prefix_cache.get(hash).copied())
                .collect()
        } else {
            Vec::new()
        };

        let revived = hits
            .iter()
            .filter(|id| self.ref_count(**id) == Some(0))
            .count();
        let fresh = num_blocks - hits.len();
        let available = self.num_free_blocks() - revived;
        if fresh > available {
            return Err(Error::OutOfMemory {
                requested: fresh,
                available,
            });
        }

        for &block_id in &hits {
            self.acquire(block_id)?;
        }
        let mut block_ids = hits;
        let num_hits = block_ids.len();
        block_ids.extend(self.allocate(fresh)?);
        Ok((block_ids, num_hits))
    }

    /// Take an additional reference on an allocated block.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidBlock`] if the block is not allocated.
    pub fn acquire(&mut self, block_id: BlockId) -> Result<usize> {
        let now = self.tick();
        let block = self
            .blocks
            .get_mut(&block_id)
            .ok_or(Error::InvalidBlock(block_id))?;
        if block.ref_count() == 0 {
            self.evictable.remove(&block.last_access());
        }
        Ok(block.acquire(now))
    }

    /// Drop one reference on a block.
    ///
    /// At zero references a published block becomes evictable and an
    /// unpublished one goes straight back to the allocator.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidBlock`] if the block is not held by anyone.
    pub fn release(&mut self, block_id: BlockId) -> Result<()> {
        let now = self.tick();
        let block = match self.blocks.get_mut(&block_id) {
            Some(block) if block.ref_count() > 0 => block,
            _ => return Err(Error::InvalidBlock(block_id)),
        };

        if block.release(now) > 0 {
            return Ok(());
        }

        if block.prefix_hash().is_some() {
            self.evictable.insert(now, block_id);
            return Ok(());
        }

        self.blocks.remove(&block_id);
        self.allocator.free(block_id)
    }

    /// Release every block in `block_ids`.
    pub fn release_many(&mut self, block_ids: &[BlockId]) -> Result<()> {
        block_ids.iter().try_for_each(|&id| self.release(id))
    }

    /// Publish a fully computed block under `prefix_hash`.
    ///
    /// Returns `false` when caching is disabled, the block already carries a
    /// hash, or another block is already published under the same hash (the
    /// block then stays private).
    pub fn register_block(&mut self, block_id: BlockId, prefix_hash: u64) -> bool {
        if !self.enable_prefix_cache || self.prefix_cache.contains_key(&prefix_hash) {
            return false;
        }
        match self.blocks.get_mut(&block_id) {
            Some(block) if block.prefix_hash().is_none() => {
                block.set_prefix_hash(prefix_hash);
                self.prefix_cache.insert(prefix_hash, block_id);
                true
            }
            _ => false,
        }
    }

    /// Drop every evictable block and forget all published hashes.
    pub fn clear_prefix_cache(&mut self) -> Result<()> {
        while !self.evictable.is_empty() {
            self.evict_one()?;
        }
        // Held blocks stay private from now on.
        for block in self.blocks.values_mut() {
            block.clear_prefix_hash();
        }
        self.prefix_cache.clear();
        Ok(())
    }

    /// Reset the block manager to initial state.
    ///
    /// All blocks are freed and returned to the free list.
    pub fn reset(&mut self) {
        self.blocks.clear();
        self.prefix_cache.clear();
        self.evictable.clear();
        self.allocator.reset();
    }

    /// Reclaim the least recently used evictable block.
    fn evict_one(&mut self) -> Result<()> {
        let Some((_, block_id)) = self.evictable.pop_first() else {
            return Ok(());
        };
        if let Some(block) = self.blocks.remove(&block_id) {
            if let Some(hash) = block.prefix_hash() {
                if self.prefix_cache.get(&hash) == Some(&block_id) {
                    self.prefix_cache.remove(&hash);
                }
            }
        }
        self.allocator.free(block_id)
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}
