//! Volume geometry and the fixed block layout.
//!
//! # Layout
//! ==============================================================================
//! | reserved | Master | Super | Bitmap 0 | J.Header | J.Footer | Status | Root |
//! ==============================================================================
//!
//! The master super block lives at byte offset 65536 regardless of block size;
//! everything after it follows at fixed block offsets. Group `g >= 1` keeps its
//! bitmap in the first block of the group. Every item but the master may be
//! relocated by the disk map.

use crate::error::{F40Error, Result};

/// The block number to access ranging from 0 (the first block) to n - 1 (the last
/// block) where n is number of blocks available.
pub type BlockNumber = u64;

/// Byte offset of the master super block.
pub const MASTER_OFFSET: u64 = 65536;
/// Size of the checksum trailing every bitmap block.
pub const CHECKSUM_SIZE: usize = 4;
pub const MIN_BLOCK_SIZE: usize = 512;
pub const MAX_BLOCK_SIZE: usize = 65536;
pub const MAX_TREE_HEIGHT: u16 = 8;

/// Key format recorded in the super descriptor flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFormat {
    Short,
    Large,
}

impl Default for KeyFormat {
    fn default() -> Self {
        KeyFormat::Large
    }
}

/// Block size, block count and the derived group size of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    block_size: usize,
    block_count: u64,
    bits_per_group: u64,
}

impl Geometry {
    pub fn new(block_size: usize, block_count: u64) -> Result<Self> {
        if !block_size.is_power_of_two()
            || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
        {
            return Err(F40Error::InvalidRequest(format!(
                "unsupported block size {}",
                block_size
            )));
        }
        if block_count == 0 {
            return Err(F40Error::InvalidRequest(
                "volume has no blocks".to_string(),
            ));
        }
        Ok(Self {
            block_size,
            block_count,
            bits_per_group: ((block_size - CHECKSUM_SIZE) * 8) as u64,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    /// Number of blocks tracked by one bitmap block.
    pub fn bits_per_group(&self) -> u64 {
        self.bits_per_group
    }

    /// Number of bytes of bitmap payload in one bitmap block.
    pub fn payload_len(&self) -> usize {
        self.block_size - CHECKSUM_SIZE
    }

    pub fn groups(&self) -> u32 {
        ((self.block_count + self.bits_per_group - 1) / self.bits_per_group) as u32
    }

    pub fn group_of(&self, blocknr: BlockNumber) -> u32 {
        (blocknr / self.bits_per_group) as u32
    }

    pub fn offset_of(&self, blocknr: BlockNumber) -> u32 {
        (blocknr % self.bits_per_group) as u32
    }

    pub fn block_of(&self, group: u32, offset: u32) -> BlockNumber {
        group as u64 * self.bits_per_group + offset as u64
    }

    /// Number of addressable blocks in `group`. Only the last group can be
    /// shorter than `bits_per_group`.
    pub fn group_len(&self, group: u32) -> u32 {
        let start = group as u64 * self.bits_per_group;
        if start >= self.block_count {
            return 0;
        }
        (self.block_count - start).min(self.bits_per_group) as u32
    }

    /// Checks that `[start, start + len)` lies inside the volume.
    pub fn check_range(&self, start: BlockNumber, len: u64) -> Result<()> {
        if len == 0 {
            return Err(F40Error::InvalidRequest("empty block range".to_string()));
        }
        match start.checked_add(len) {
            Some(end) if end <= self.block_count => Ok(()),
            _ => Err(F40Error::InvalidRequest(format!(
                "range {}+{} exceeds {} blocks",
                start, len, self.block_count
            ))),
        }
    }
}

/// Default locations of the critical metadata blocks for a block size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedLayout {
    pub master: BlockNumber,
    pub format: BlockNumber,
    pub first_bitmap: BlockNumber,
    pub journal_header: BlockNumber,
    pub journal_footer: BlockNumber,
    pub status: BlockNumber,
    pub root: BlockNumber,
}

impl FixedLayout {
    pub fn for_block_size(block_size: usize) -> Self {
        let master = MASTER_OFFSET / block_size as u64;
        Self {
            master,
            format: master + 1,
            first_bitmap: master + 2,
            journal_header: master + 3,
            journal_footer: master + 4,
            status: master + 5,
            root: master + 6,
        }
    }

    /// First block not claimed by the fixed layout.
    pub fn first_free(&self) -> BlockNumber {
        self.root + 1
    }

    /// Default bitmap block for `group`.
    pub fn bitmap_block(&self, geometry: &Geometry, group: u32) -> BlockNumber {
        if group == 0 {
            self.first_bitmap
        } else {
            geometry.block_of(group, 0)
        }
    }
}
