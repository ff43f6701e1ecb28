//! Lays out a fresh format40 volume.

use crate::alloc::{seal, Bitmap};
use crate::diskmap::{self, DiskMapEntry, FixmapLabel};
use crate::error::{F40Error, Result};
use crate::io::BlockStorage;
use crate::layout::{BlockNumber, FixedLayout, Geometry, KeyFormat};
use crate::sb::{MasterSuper, SuperDescriptor};
use crate::status;
use log::{debug, info};
use std::collections::BTreeSet;

/// First object id handed out on a fresh volume.
pub const FIRST_OID: u64 = 0x10000;

#[derive(Debug, Clone, Default)]
pub struct FormatOptions {
    /// Defaults to the whole device.
    pub block_count: Option<u64>,
    pub label: String,
    pub uuid: [u8; 16],
    pub mkfs_id: u32,
    pub key_format: KeyFormat,
    /// `(item, parameter, new block)`; parameter is the group for bitmaps.
    pub relocations: Vec<(FixmapLabel, u32, BlockNumber)>,
    /// Where to put the disk map when there are relocations. Defaults to the
    /// first block past the fixed layout.
    pub diskmap_block: Option<BlockNumber>,
}

impl FormatOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_block_count(mut self, blocks: u64) -> Self {
        self.block_count = Some(blocks);
        self
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = label.to_string();
        self
    }

    pub fn with_uuid(mut self, uuid: [u8; 16]) -> Self {
        self.uuid = uuid;
        self
    }

    pub fn with_mkfs_id(mut self, id: u32) -> Self {
        self.mkfs_id = id;
        self
    }

    pub fn with_key_format(mut self, keys: KeyFormat) -> Self {
        self.key_format = keys;
        self
    }

    pub fn relocate(mut self, label: FixmapLabel, parameter: u32, blocknr: BlockNumber) -> Self {
        self.relocations.push((label, parameter, blocknr));
        self
    }

    pub fn with_diskmap_block(mut self, blocknr: BlockNumber) -> Self {
        self.diskmap_block = Some(blocknr);
        self
    }
}

/// Writes an empty volume onto `dev` and returns its super descriptor.
///
/// Every block of the fixed layout, every group bitmap block, relocated
/// blocks and the disk map are marked used. The master super block is written
/// last, so an interrupted format leaves no mountable volume behind.
pub fn format(dev: &dyn BlockStorage, opts: &FormatOptions) -> Result<SuperDescriptor> {
    let block_size = dev.block_size();
    let block_count = opts.block_count.unwrap_or_else(|| dev.block_count());
    if block_count > dev.block_count() {
        return Err(F40Error::InvalidRequest(format!(
            "{} blocks requested on a device of {}",
            block_count,
            dev.block_count()
        )));
    }
    let geometry = Geometry::new(block_size, block_count)?;
    let layout = FixedLayout::for_block_size(block_size);
    if block_count <= layout.first_free() + 1 {
        return Err(F40Error::InvalidRequest(format!(
            "{} blocks leave no room past the fixed layout ending at block {}",
            block_count,
            layout.first_free()
        )));
    }
    if opts.label.len() > 16 {
        return Err(F40Error::InvalidRequest(format!(
            "label {:?} is longer than 16 bytes",
            opts.label
        )));
    }

    let mut busy: BTreeSet<BlockNumber> = (0..layout.first_free()).collect();
    let mut claim = |blocknr: BlockNumber, what: &str| {
        if blocknr >= block_count || !busy.insert(blocknr) {
            return Err(F40Error::InvalidRequest(format!(
                "{} cannot go to block {}",
                what, blocknr
            )));
        }
        Ok(())
    };

    let mut entries = Vec::with_capacity(opts.relocations.len());
    for &(label, parameter, blocknr) in &opts.relocations {
        let valid = match label {
            FixmapLabel::Master => false,
            FixmapLabel::Bitmap => parameter < geometry.groups(),
            _ => parameter == 0,
        };
        if !valid {
            return Err(F40Error::InvalidRequest(format!(
                "{:?}/{} cannot be relocated",
                label, parameter
            )));
        }
        claim(blocknr, &format!("{:?}/{}", label, parameter))?;
        entries.push(DiskMapEntry::new(label, parameter, blocknr));
    }
    let relocated = |label: FixmapLabel, parameter: u32, default: BlockNumber| {
        opts.relocations
            .iter()
            .find(|&&(l, p, _)| l == label && p == parameter)
            .map_or(default, |&(_, _, blocknr)| blocknr)
    };

    let mut bitmap_blocks = Vec::with_capacity(geometry.groups() as usize);
    for group in 0..geometry.groups() {
        let default = layout.bitmap_block(&geometry, group);
        let blocknr = relocated(FixmapLabel::Bitmap, group, default);
        if group > 0 && blocknr == default {
            claim(blocknr, &format!("bitmap of group {}", group))?;
        }
        bitmap_blocks.push(blocknr);
    }

    let diskmap_block = if entries.is_empty() {
        None
    } else {
        let blocknr = opts.diskmap_block.unwrap_or_else(|| layout.first_free());
        claim(blocknr, "disk map")?;
        Some(blocknr)
    };

    let format_block = relocated(FixmapLabel::Format, 0, layout.format);
    let status_block = relocated(FixmapLabel::Status, 0, layout.status);
    let header = relocated(FixmapLabel::JournalHeader, 0, layout.journal_header);
    let footer = relocated(FixmapLabel::JournalFooter, 0, layout.journal_footer);

    for (group, &blocknr) in bitmap_blocks.iter().enumerate() {
        let group = group as u32;
        let start = geometry.block_of(group, 0);
        let end = start + geometry.group_len(group) as u64;
        let mut payload = Bitmap::new(geometry.payload_len());
        for &used in busy.range(start..end) {
            payload.set_reserved(geometry.offset_of(used));
        }
        dev.write_block(blocknr, &seal(&payload, block_size))?;
        debug!("group {}: bitmap at block {}", group, blocknr);
    }

    let zeroes = vec![0u8; block_size];
    dev.write_block(header, &zeroes)?;
    dev.write_block(footer, &zeroes)?;
    dev.write_block(layout.root, &zeroes)?;
    status::write_initial(dev, status_block)?;
    if let Some(blocknr) = diskmap_block {
        diskmap::write_table(dev, &[blocknr], &entries)?;
    }

    let mut sb = SuperDescriptor {
        block_count,
        free_blocks: block_count - busy.len() as u64,
        root_block: layout.root,
        oid: FIRST_OID,
        file_count: 0,
        flushes: 0,
        mkfs_id: opts.mkfs_id,
        tree_height: 1,
        formatting_policy: 0,
        flags: 0,
    };
    sb.set_key_format(opts.key_format);
    dev.write_block(format_block, &sb.serialize(block_size))?;

    let mut master = MasterSuper::new(block_size);
    master.uuid = opts.uuid;
    master.label[..opts.label.len()].copy_from_slice(opts.label.as_bytes());
    master.diskmap = diskmap_block;
    dev.sync_disk()?;
    dev.write_block(layout.master, &master.serialize())?;
    dev.sync_disk()?;

    info!(
        "formatted {} blocks of {} bytes in {} groups, {} free",
        block_count,
        block_size,
        geometry.groups(),
        sb.free_blocks
    );
    Ok(sb)
}
