//! Integration tests for BlockAllocator.

use std::collections::HashSet;

use nano_serve::core::block_allocator::BlockAllocator;
use nano_serve::Error;
use proptest::prelude::*;

#[test]
fn test_allocator_creation() {
    let allocator = BlockAllocator::new(8, 16);
    assert_eq!(allocator.total_blocks(), 8);
    assert_eq!(allocator.block_size(), 16);
    assert_eq!(allocator.free_block_count(), 8);
}

#[test]
fn test_allocate_and_free() {
    let mut allocator = BlockAllocator::new(4, 16);

    let block_id = allocator.allocate().unwrap();
    assert!(allocator.is_allocated(block_id));
    assert_eq!(allocator.free_block_count(), 3);

    allocator.free(block_id).unwrap();
    assert!(!allocator.is_allocated(block_id));
    assert_eq!(allocator.free_block_count(), 4);
}

#[test]
fn test_allocate_many_is_all_or_nothing() {
    let mut allocator = BlockAllocator::new(4, 16);
    let blocks = allocator.allocate_many(3).unwrap();
    assert_eq!(blocks.len(), 3);

    let err = allocator.allocate_many(2).unwrap_err();
    assert!(matches!(
        err,
        Error::OutOfMemory {
            requested: 2,
            available: 1
        }
    ));
    assert_eq!(allocator.free_block_count(), 1);
}

#[test]
fn test_allocate_zero_blocks() {
    let mut allocator = BlockAllocator::new(0, 16);
    assert!(allocator.allocate_many(0).unwrap().is_empty());
    assert!(allocator.allocate().is_err());
}

#[test]
fn test_double_free_is_rejected() {
    let mut allocator = BlockAllocator::new(4, 16);
    let block_id = allocator.allocate().unwrap();
    allocator.free(block_id).unwrap();

    assert!(matches!(allocator.free(block_id), Err(Error::InvalidBlock(id)) if id == block_id));
    assert!(matches!(allocator.free(99), Err(Error::InvalidBlock(99))));
    assert_eq!(allocator.free_block_count(), 4);
}

#[test]
fn test_reset() {
    let mut allocator = BlockAllocator::new(4, 16);
    allocator.allocate_many(4).unwrap();
    allocator.reset();
    assert_eq!(allocator.free_block_count(), 4);
    assert!(allocator.allocate_many(4).is_ok());
}

#[derive(Debug, Clone)]
enum Op {
    Allocate(usize),
    Free(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![(0usize..4).prop_map(Op::Allocate), (0usize..64).prop_map(Op::Free)]
}

proptest! {
    #[test]
    fn test_free_plus_held_is_total(ops in prop::collection::vec(op(), 1..64)) {
        let total = 16;
        let mut allocator = BlockAllocator::new(total, 16);
        let mut held: Vec<usize> = Vec::new();

        for op in ops {
            match op {
                Op::Allocate(n) => {
                    if let Ok(blocks) = allocator.allocate_many(n) {
                        held.extend(blocks);
                    }
                }
                Op::Free(pick) => {
                    if !held.is_empty() {
                        let block_id = held.swap_remove(pick % held.len());
                        prop_assert!(allocator.free(block_id).is_ok());
                    }
                }
            }

            let unique: HashSet<_> = held.iter().copied().collect();
            prop_assert_eq!(unique.len(), held.len());
            prop_assert_eq!(allocator.free_block_count() + held.len(), total);
        }
    }
}
