use crate::error::{F40Error, Result};
use crate::layout::{BlockNumber, KeyFormat, MAX_TREE_HEIGHT};
use zerocopy::byteorder::{LittleEndian, U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

pub const MASTER_MAGIC: &[u8; 16] = b"ReIsEr4\0\0\0\0\0\0\0\0\0";
pub const FORMAT40_MAGIC: &[u8; 16] = b"ReIsEr40FoRmAt\0\0";
/// Disk plugin id of the format40 layout in the master super block.
pub const FORMAT40_ID: u16 = 0;

/// Super descriptor flag: keys are in the large (four component) format.
pub const FLAG_LARGE_KEYS: u64 = 1 << 0;

#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes)]
struct RawMaster {
    magic: [u8; 16],
    disk_plugin_id: U16<LittleEndian>,
    _reserved: U16<LittleEndian>,
    block_size: U32<LittleEndian>,
    uuid: [u8; 16],
    label: [u8; 16],
    diskmap: U64<LittleEndian>,
}

/// The block at byte offset 65536 identifying the volume and its layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterSuper {
    pub format_id: u16,
    pub block_size: usize,
    pub uuid: [u8; 16],
    pub label: [u8; 16],
    /// First block of the disk map, if the volume has one.
    pub diskmap: Option<BlockNumber>,
}

impl MasterSuper {
    pub fn new(block_size: usize) -> Self {
        Self {
            format_id: FORMAT40_ID,
            block_size,
            uuid: [0; 16],
            label: [0; 16],
            diskmap: None,
        }
    }

    /// Reads the master super block from the head of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let raw = RawMaster::read_from_prefix(buf).ok_or_else(|| {
            F40Error::NotAReiserVolume("master super block is truncated".to_string())
        })?;
        if &raw.magic != MASTER_MAGIC {
            return Err(F40Error::NotAReiserVolume(
                "master super block magic not found".to_string(),
            ));
        }
        let diskmap = raw.diskmap.get();
        Ok(Self {
            format_id: raw.disk_plugin_id.get(),
            block_size: raw.block_size.get() as usize,
            uuid: raw.uuid,
            label: raw.label,
            diskmap: if diskmap == 0 { None } else { Some(diskmap) },
        })
    }

    /// Serializes into a zero padded buffer of `block_size` bytes.
    pub fn serialize(&self) -> Vec<u8> {
        let raw = RawMaster {
            magic: *MASTER_MAGIC,
            disk_plugin_id: U16::new(self.format_id),
            _reserved: U16::new(0),
            block_size: U32::new(self.block_size as u32),
            uuid: self.uuid,
            label: self.label,
            diskmap: U64::new(self.diskmap.unwrap_or(0)),
        };
        padded(raw.as_bytes(), self.block_size)
    }
}

#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes)]
struct RawSuper {
    magic: [u8; 16],
    block_count: U64<LittleEndian>,
    free_blocks: U64<LittleEndian>,
    root_block: U64<LittleEndian>,
    oid: U64<LittleEndian>,
    file_count: U64<LittleEndian>,
    flushes: U64<LittleEndian>,
    mkfs_id: U32<LittleEndian>,
    tree_height: U16<LittleEndian>,
    formatting_policy: U16<LittleEndian>,
    flags: U64<LittleEndian>,
}

/// The format40 super descriptor.
///
/// Keeps the size of the volume, the committed free block count and the
/// entry points the tree and the object id allocator are built from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SuperDescriptor {
    pub block_count: u64,
    pub free_blocks: u64,
    pub root_block: BlockNumber,
    /// Next free object id.
    pub oid: u64,
    pub file_count: u64,
    /// Number of times the super block has been written.
    pub flushes: u64,
    pub mkfs_id: u32,
    pub tree_height: u16,
    pub formatting_policy: u16,
    pub flags: u64,
}

impl SuperDescriptor {
    /// Reads a super descriptor from the head of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let raw = RawSuper::read_from_prefix(buf).ok_or_else(|| {
            F40Error::NotAReiserVolume("super block is truncated".to_string())
        })?;
        if &raw.magic != FORMAT40_MAGIC {
            return Err(F40Error::NotAReiserVolume(
                "format40 magic not found".to_string(),
            ));
        }
        Ok(Self {
            block_count: raw.block_count.get(),
            free_blocks: raw.free_blocks.get(),
            root_block: raw.root_block.get(),
            oid: raw.oid.get(),
            file_count: raw.file_count.get(),
            flushes: raw.flushes.get(),
            mkfs_id: raw.mkfs_id.get(),
            tree_height: raw.tree_height.get(),
            formatting_policy: raw.formatting_policy.get(),
            flags: raw.flags.get(),
        })
    }

    /// Serializes into a zero padded buffer of `block_size` bytes. All integers
    /// are little endian.
    pub fn serialize(&self, block_size: usize) -> Vec<u8> {
        padded(self.to_raw().as_bytes(), block_size)
    }

    /// Overwrites the head of `block` with the descriptor. Bytes past the
    /// descriptor are left as they are.
    pub fn write_into(&self, block: &mut [u8]) -> Result<()> {
        self.to_raw().write_to_prefix(block).ok_or_else(|| {
            F40Error::InvalidRequest(format!(
                "{} byte buffer cannot hold a super descriptor",
                block.len()
            ))
        })
    }

    fn to_raw(&self) -> RawSuper {
        RawSuper {
            magic: *FORMAT40_MAGIC,
            block_count: U64::new(self.block_count),
            free_blocks: U64::new(self.free_blocks),
            root_block: U64::new(self.root_block),
            oid: U64::new(self.oid),
            file_count: U64::new(self.file_count),
            flushes: U64::new(self.flushes),
            mkfs_id: U32::new(self.mkfs_id),
            tree_height: U16::new(self.tree_height),
            formatting_policy: U16::new(self.formatting_policy),
            flags: U64::new(self.flags),
        }
    }

    pub fn key_format(&self) -> KeyFormat {
        if self.flags & FLAG_LARGE_KEYS != 0 {
            KeyFormat::Large
        } else {
            KeyFormat::Short
        }
    }

    pub fn set_key_format(&mut self, format: KeyFormat) {
        match format {
            KeyFormat::Large => self.flags |= FLAG_LARGE_KEYS,
            KeyFormat::Short => self.flags &= !FLAG_LARGE_KEYS,
        }
    }

    pub fn used_blocks(&self) -> Result<u64> {
        self.block_count.checked_sub(self.free_blocks).ok_or_else(|| {
            F40Error::SuperCorrupt(format!(
                "{} free blocks on a volume of {}",
                self.free_blocks, self.block_count
            ))
        })
    }

    /// Sanity checks against the device the descriptor was read from.
    pub fn validate(&self, device_blocks: u64) -> Result<()> {
        if self.block_count == 0 || self.block_count > device_blocks {
            return Err(F40Error::SuperCorrupt(format!(
                "block count {} does not fit a device of {} blocks",
                self.block_count, device_blocks
            )));
        }
        self.used_blocks()?;
        if self.root_block >= self.block_count {
            return Err(F40Error::SuperCorrupt(format!(
                "root block {} lies outside the volume",
                self.root_block
            )));
        }
        if self.tree_height == 0 || self.tree_height > MAX_TREE_HEIGHT {
            return Err(F40Error::SuperCorrupt(format!(
                "tree height {} out of range",
                self.tree_height
            )));
        }
        Ok(())
    }
}

fn padded(bytes: &[u8], block_size: usize) -> Vec<u8> {
    let mut buf = vec![0u8; block_size.max(bytes.len())];
    buf[..bytes.len()].copy_from_slice(bytes);
    buf
}
