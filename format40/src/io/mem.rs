use super::block::{out_of_range, short_buffer, BlockStorage};
use crate::layout::BlockNumber;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Sparse in-memory block device. Blocks never written read back as zeroes.
pub struct MemBlockDevice {
    block_size: usize,
    block_count: u64,
    blocks: Mutex<HashMap<BlockNumber, Vec<u8>>>,
}

impl MemBlockDevice {
    pub fn new(block_size: usize, block_count: u64) -> Self {
        Self {
            block_size,
            block_count,
            blocks: Mutex::new(HashMap::new()),
        }
    }

    /// Number of blocks that have been written at least once.
    pub fn written_blocks(&self) -> usize {
        self.blocks.lock().len()
    }
}

impl BlockStorage for MemBlockDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_block(&self, blocknr: BlockNumber, buf: &mut [u8]) -> std::io::Result<()> {
        if blocknr >= self.block_count {
            return Err(out_of_range(blocknr, self.block_count));
        }
        if buf.len() < self.block_size {
            return Err(short_buffer(buf.len(), self.block_size));
        }
        let blocks = self.blocks.lock();
        match blocks.get(&blocknr) {
            Some(data) => buf[..self.block_size].copy_from_slice(data),
            None => buf[..self.block_size].fill(0),
        }
        Ok(())
    }

    fn write_block(&self, blocknr: BlockNumber, buf: &[u8]) -> std::io::Result<()> {
        if blocknr >= self.block_count {
            return Err(out_of_range(blocknr, self.block_count));
        }
        let max = buf.len().min(self.block_size);
        let mut blocks = self.blocks.lock();
        let block = blocks
            .entry(blocknr)
            .or_insert_with(|| vec![0; self.block_size]);
        block[..max].copy_from_slice(&buf[..max]);
        Ok(())
    }

    fn sync_disk(&self) -> std::io::Result<()> {
        Ok(())
    }
}
