//! Integration tests for BlockManager.

use nano_serve::core::block::hash_token_block;
use nano_serve::core::block_manager::BlockManager;
use nano_serve::Error;
use proptest::prelude::*;

fn prompt_hashes(tokens: &[u32], block_size: usize) -> Vec<u64> {
    let mut parent = None;
    tokens
        .chunks_exact(block_size)
        .map(|block| {
            let hash = hash_token_block(block, parent);
            parent = Some(hash);
            hash
        })
        .collect()
}

#[test]
fn test_block_manager_creation() {
    let manager = BlockManager::new(100, 16, false);
    assert_eq!(manager.total_blocks(), 100);
    assert_eq!(manager.block_size(), 16);
    assert_eq!(manager.num_free_blocks(), 100);
    assert_eq!(manager.num_used_blocks(), 0);
    assert!(!manager.prefix_cache_enabled());
}

#[test]
fn test_allocate_and_release() {
    let mut manager = BlockManager::new(10, 16, false);

    let blocks = manager.allocate(3).unwrap();
    assert_eq!(manager.num_free_blocks(), 7);
    assert_eq!(manager.num_used_blocks(), 3);
    assert_eq!(manager.ref_count(blocks[0]), Some(1));

    manager.release_many(&blocks).unwrap();
    assert_eq!(manager.num_free_blocks(), 10);
    assert!(manager.get_block(blocks[0]).is_none());
}

#[test]
fn test_out_of_memory_leaves_pool_untouched() {
    let mut manager = BlockManager::new(4, 16, false);
    manager.allocate(3).unwrap();

    let err = manager.allocate(2).unwrap_err();
    assert!(matches!(
        err,
        Error::OutOfMemory {
            requested: 2,
            available: 1
        }
    ));
    assert_eq!(manager.num_free_blocks(), 1);
}

#[test]
fn test_release_unheld_block_is_invalid() {
    let mut manager = BlockManager::new(4, 16, false);
    let blocks = manager.allocate(1).unwrap();
    manager.release(blocks[0]).unwrap();

    let err = manager.release(blocks[0]).unwrap_err();
    assert!(err.is_fatal());
}

#[test]
fn test_shared_prefix_is_reused() {
    let mut manager = BlockManager::new(8, 16, true);
    let tokens: Vec<u32> = (0..40).collect();
    let hashes = prompt_hashes(&tokens, 16);
    assert_eq!(hashes.len(), 2);

    let (first, hits) = manager.allocate_cached(&hashes, 3).unwrap();
    assert_eq!(hits, 0);
    for (&block_id, &hash) in first.iter().zip(&hashes) {
        assert!(manager.register_block(block_id, hash));
    }
    assert_eq!(manager.num_cached_blocks(), 2);

    let (second, hits) = manager.allocate_cached(&hashes, 3).unwrap();
    assert_eq!(hits, 2);
    assert_eq!(&second[..2], &first[..2]);
    assert_ne!(second[2], first[2]);
    assert_eq!(manager.ref_count(first[0]), Some(2));
    assert_eq!(manager.num_used_blocks(), 4);
}

#[test]
fn test_released_cached_blocks_are_evictable_then_revived() {
    let mut manager = BlockManager::new(4, 16, true);
    let hash = hash_token_block(&[1; 16], None);

    let (blocks, _) = manager.allocate_cached(&[hash], 2).unwrap();
    manager.register_block(blocks[0], hash);
    manager.release_many(&blocks).unwrap();

    // The published block stays cached, the private one is freed
    assert_eq!(manager.num_evictable_blocks(), 1);
    assert_eq!(manager.num_used_blocks(), 0);
    assert_eq!(manager.num_free_blocks(), 4);
    assert!(manager.is_prefix_cached(hash));

    let (revived, hits) = manager.allocate_cached(&[hash], 1).unwrap();
    assert_eq!(hits, 1);
    assert_eq!(revived[0], blocks[0]);
    assert_eq!(manager.num_evictable_blocks(), 0);
    assert_eq!(manager.ref_count(blocks[0]), Some(1));
}

#[test]
fn test_pressure_reclaims_lru_cached_block() {
    let mut manager = BlockManager::new(2, 16, true);
    let old = hash_token_block(&[1; 16], None);
    let new = hash_token_block(&[2; 16], None);

    let a = manager.allocate(1).unwrap()[0];
    manager.register_block(a, old);
    let b = manager.allocate(1).unwrap()[0];
    manager.register_block(b, new);
    manager.release(a).unwrap();
    manager.release(b).unwrap();
    assert_eq!(manager.num_evictable_blocks(), 2);

    // One fresh block takes the least recently released one
    let fresh = manager.allocate(1).unwrap();
    assert_eq!(fresh, vec![a]);
    assert!(!manager.is_prefix_cached(old));
    assert!(manager.is_prefix_cached(new));
}

#[test]
fn test_register_duplicate_hash_keeps_block_private() {
    let mut manager = BlockManager::new(4, 16, true);
    let hash = hash_token_block(&[3; 16], None);
    let blocks = manager.allocate(2).unwrap();

    assert!(manager.register_block(blocks[0], hash));
    assert!(!manager.register_block(blocks[1], hash));

    manager.release(blocks[1]).unwrap();
    assert_eq!(manager.num_evictable_blocks(), 0);
    assert_eq!(manager.num_free_blocks(), 3);
}

#[test]
fn test_prefix_cache_disabled() {
    let mut manager = BlockManager::new(4, 16, false);
    let hash = hash_token_block(&[4; 16], None);
    let (blocks, _) = manager.allocate_cached(&[hash], 1).unwrap();

    assert!(!manager.register_block(blocks[0], hash));
    let (_, hits) = manager.allocate_cached(&[hash], 1).unwrap();
    assert_eq!(hits, 0);
}

#[test]
fn test_clear_prefix_cache() {
    let mut manager = BlockManager::new(4, 16, true);
    let hash = hash_token_block(&[5; 16], None);
    let blocks = manager.allocate(1).unwrap();
    manager.register_block(blocks[0], hash);
    manager.release(blocks[0]).unwrap();

    manager.clear_prefix_cache().unwrap();
    assert_eq!(manager.num_evictable_blocks(), 0);
    assert_eq!(manager.num_cached_blocks(), 0);
    assert_eq!(manager.num_free_blocks(), 4);
}

#[test]
fn test_clear_prefix_cache_forgets_held_blocks() {
    let mut manager = BlockManager::new(2, 16, true);
    let hash = hash_token_block(&[6; 16], None);

    let a = manager.allocate(1).unwrap()[0];
    assert!(manager.register_block(a, hash));
    manager.clear_prefix_cache().unwrap();
    assert!(manager.get_block(a).unwrap().prefix_hash().is_none());

    // A newer block takes over the hash while `a` is still held
    let b = manager.allocate(1).unwrap()[0];
    assert!(manager.register_block(b, hash));
    manager.release(b).unwrap();

    // `a` is private now, so it goes straight back to the free list
    manager.release(a).unwrap();
    assert_eq!(manager.num_evictable_blocks(), 1);
    assert_eq!(manager.allocate(1).unwrap(), vec![a]);
    assert!(manager.is_prefix_cached(hash));
    assert_eq!(manager.get_block(b).unwrap().prefix_hash(), Some(hash));
}

#[derive(Debug, Clone)]
enum Op {
    Allocate { prompt: u8, blocks: usize },
    Register(usize),
    Release(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..3, 1usize..4).prop_map(|(prompt, blocks)| Op::Allocate { prompt, blocks }),
        (0usize..64).prop_map(Op::Register),
        (0usize..64).prop_map(Op::Release),
    ]
}

proptest! {
    #[test]
    fn test_block_accounting_is_conserved(ops in prop::collection::vec(op(), 1..80)) {
        let total = 12;
        let mut manager = BlockManager::new(total, 16, true);
        // Block tables of live "sequences", with the hashes of their prompts
        let mut tables: Vec<(Vec<usize>, Vec<u64>)> = Vec::new();

        for op in ops {
            match op {
                Op::Allocate { prompt, blocks } => {
                    let tokens = vec![u32::from(prompt); 16 * blocks];
                    let hashes: Vec<u64> = prompt_hashes(&tokens, 16);
                    if let Ok((ids, hits)) = manager.allocate_cached(&hashes, blocks) {
                        prop_assert!(hits <= blocks);
                        prop_assert_eq!(ids.len(), blocks);
                        tables.push((ids, hashes));
                    }
                }
                Op::Register(pick) => {
                    if !tables.is_empty() {
                        let (ids, hashes) = &tables[pick % tables.len()];
                        for (&id, &hash) in ids.iter().zip(hashes) {
                            manager.register_block(id, hash);
                        }
                    }
                }
                Op::Release(pick) => {
                    if !tables.is_empty() {
                        let (ids, _) = tables.swap_remove(pick % tables.len());
                        prop_assert!(manager.release_many(&ids).is_ok());
                    }
                }
            }

            let held: std::collections::HashSet<usize> =
                tables.iter().flat_map(|(ids, _)| ids.iter().copied()).collect();
            prop_assert_eq!(manager.num_used_blocks(), held.len());
            prop_assert_eq!(manager.num_free_blocks() + manager.num_used_blocks(), total);
            for &id in &held {
                let refs = tables
                    .iter()
                    .map(|(ids, _)| ids.iter().filter(|&&b| b == id).count())
                    .sum::<usize>();
                prop_assert_eq!(manager.ref_count(id), Some(refs));
            }
        }
    }
}
