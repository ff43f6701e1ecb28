//! The committing transaction, as far as space allocation is concerned.

use crate::alloc::BlockRange;
use crate::layout::BlockNumber;
use std::collections::{BTreeMap, BTreeSet};

/// Blocks a transaction allocated and freed, plus the metadata blocks it must
/// overwrite in place when it commits.
///
/// Freeing a block allocated by the same atom cancels the allocation, and
/// reallocating a block from the delete set cancels the free, so the two sets
/// are always disjoint.
#[derive(Debug, Default)]
pub struct Atom {
    allocated: BTreeSet<BlockNumber>,
    delete_set: BTreeSet<BlockNumber>,
    overwrite: BTreeMap<BlockNumber, Vec<u8>>,
}

impl Atom {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_allocated(&mut self, range: BlockRange) {
        for blocknr in range.blocks() {
            if !self.delete_set.remove(&blocknr) {
                self.allocated.insert(blocknr);
            }
        }
    }

    pub fn record_freed(&mut self, range: BlockRange) {
        for blocknr in range.blocks() {
            if !self.allocated.remove(&blocknr) {
                self.delete_set.insert(blocknr);
            }
        }
    }

    pub fn allocated(&self) -> impl Iterator<Item = BlockNumber> + '_ {
        self.allocated.iter().copied()
    }

    pub fn delete_set(&self) -> impl Iterator<Item = BlockNumber> + '_ {
        self.delete_set.iter().copied()
    }

    pub fn allocated_count(&self) -> u64 {
        self.allocated.len() as u64
    }

    pub fn freed_count(&self) -> u64 {
        self.delete_set.len() as u64
    }

    /// Queues `data` to be written over `blocknr` at commit. A later capture
    /// of the same block replaces the earlier one.
    pub fn capture(&mut self, blocknr: BlockNumber, data: Vec<u8>) {
        self.overwrite.insert(blocknr, data);
    }

    pub fn overwrite_set(&self) -> &BTreeMap<BlockNumber, Vec<u8>> {
        &self.overwrite
    }

    pub fn into_overwrite_set(self) -> BTreeMap<BlockNumber, Vec<u8>> {
        self.overwrite
    }
}
