//! The disk map: an optional on-disk table relocating critical metadata
//! blocks away from their fixed defaults.
//!
//! A table block starts with a 16 byte magic followed by as many
//! `(label, parameter, value)` entries as fit in the block. Entries are sorted
//! ascending by `(label, parameter)` across the whole chain. A `NEXT` sentinel
//! continues the table in the block named by its value, an `END` sentinel
//! terminates it.

use crate::error::{F40Error, Result};
use crate::io::BlockStorage;
use crate::layout::BlockNumber;
use log::debug;
use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::Arc;
use zerocopy::byteorder::{LittleEndian, I32, I64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

pub const DISKMAP_MAGIC: &[u8; 16] = b"R4diskmap\0\0\0\0\0\0\0";

const NEXT_LABEL: i32 = -1;
const END_LABEL: i32 = -2;
const HEADER_SIZE: usize = 16;
const ENTRY_SIZE: usize = std::mem::size_of::<RawEntry>();

/// Items the disk map may relocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i32)]
pub enum FixmapLabel {
    Master = 1,
    Format = 2,
    JournalHeader = 3,
    JournalFooter = 4,
    Status = 5,
    /// Parameter is the group number.
    Bitmap = 6,
}

#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy)]
struct RawEntry {
    label: I32<LittleEndian>,
    parameter: I32<LittleEndian>,
    value: I64<LittleEndian>,
}

/// One relocation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskMapEntry {
    pub label: i32,
    pub parameter: i32,
    pub value: BlockNumber,
}

impl DiskMapEntry {
    pub fn new(label: FixmapLabel, parameter: u32, value: BlockNumber) -> Self {
        Self {
            label: label as i32,
            parameter: parameter as i32,
            value,
        }
    }

    fn key(&self) -> (i32, i32) {
        (self.label, self.parameter)
    }

    fn to_raw(self) -> RawEntry {
        RawEntry {
            label: I32::new(self.label),
            parameter: I32::new(self.parameter),
            value: I64::new(self.value as i64),
        }
    }
}

/// Number of entry slots in one table block.
pub fn entries_per_block(block_size: usize) -> usize {
    (block_size - HEADER_SIZE) / ENTRY_SIZE
}

/// Resolves relocated block numbers through the disk map, if one is
/// configured.
#[derive(Clone)]
pub struct DiskLocator {
    dev: Arc<dyn BlockStorage>,
    table: Option<BlockNumber>,
}

impl std::fmt::Debug for DiskLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskLocator")
            .field("table", &self.table)
            .finish()
    }
}

impl DiskLocator {
    /// A locator without a table; every lookup misses.
    pub fn without_table(dev: Arc<dyn BlockStorage>) -> Self {
        Self { dev, table: None }
    }

    pub fn with_table(dev: Arc<dyn BlockStorage>, table: BlockNumber) -> Self {
        Self {
            dev,
            table: Some(table),
        }
    }

    pub fn table(&self) -> Option<BlockNumber> {
        self.table
    }

    /// Returns the relocated block for `(label, parameter)`, or `None` when the
    /// table has no such entry (or there is no table).
    pub fn lookup(&self, label: FixmapLabel, parameter: u32) -> Result<Option<BlockNumber>> {
        let target = (label as i32, parameter as i32);
        let found = self.scan(|entry| {
            if entry.key() == target {
                ControlFlow::Break(Some(entry.value))
            } else if entry.key() > target {
                ControlFlow::Break(None)
            } else {
                ControlFlow::Continue(())
            }
        })?;
        if let Some(value) = found {
            debug!(
                "disk map relocates {:?}/{} to block {}",
                label, parameter, value
            );
        }
        Ok(found)
    }

    /// Like [`DiskLocator::lookup`], falling back to the fixed `default`.
    pub fn resolve(
        &self,
        label: FixmapLabel,
        parameter: u32,
        default: BlockNumber,
    ) -> Result<BlockNumber> {
        Ok(self.lookup(label, parameter)?.unwrap_or(default))
    }

    /// Every entry of the table in chain order.
    pub fn entries(&self) -> Result<Vec<DiskMapEntry>> {
        let mut all = Vec::new();
        self.scan(|entry| {
            all.push(entry);
            ControlFlow::<Option<BlockNumber>>::Continue(())
        })?;
        Ok(all)
    }

    /// Walks the chain feeding entries to `visit` until it breaks, an end
    /// sentinel is met or the last block runs out of entries.
    fn scan<F>(&self, mut visit: F) -> Result<Option<BlockNumber>>
    where
        F: FnMut(DiskMapEntry) -> ControlFlow<Option<BlockNumber>>,
    {
        let mut blocknr = match self.table {
            Some(blocknr) => blocknr,
            None => return Ok(None),
        };
        let mut visited = HashSet::new();
        let mut previous: Option<(i32, i32)> = None;

        'chain: loop {
            if blocknr >= self.dev.block_count() {
                return Err(corrupt(blocknr, "chain points outside the device"));
            }
            if !visited.insert(blocknr) {
                return Err(corrupt(blocknr, "chain loops back on itself"));
            }
            let buf = self.dev.read_vec(blocknr)?;
            if &buf[..HEADER_SIZE] != DISKMAP_MAGIC {
                return Err(corrupt(blocknr, "bad magic"));
            }
            debug!("reading disk map block {}", blocknr);

            for slot in buf[HEADER_SIZE..].chunks_exact(ENTRY_SIZE) {
                let raw = RawEntry::read_from(slot)
                    .ok_or_else(|| corrupt(blocknr, "truncated entry"))?;
                let label = raw.label.get();
                let value = raw.value.get();
                match label {
                    NEXT_LABEL => {
                        blocknr = u64::try_from(value)
                            .map_err(|_| corrupt(blocknr, "negative continuation block"))?;
                        continue 'chain;
                    }
                    END_LABEL => return Ok(None),
                    _ => {}
                }
                let entry = DiskMapEntry {
                    label,
                    parameter: raw.parameter.get(),
                    value: u64::try_from(value)
                        .map_err(|_| corrupt(blocknr, "negative block number"))?,
                };
                if let Some(prev) = previous {
                    if entry.key() <= prev {
                        return Err(corrupt(blocknr, "entries are not in ascending order"));
                    }
                }
                previous = Some(entry.key());
                if let ControlFlow::Break(found) = visit(entry) {
                    return Ok(found);
                }
            }
            return Ok(None);
        }
    }
}

fn corrupt(block: BlockNumber, detail: &str) -> F40Error {
    F40Error::ConfigCorrupt {
        block,
        detail: detail.to_string(),
    }
}

/// Lays out `entries` as a sorted table chained across `blocks`.
///
/// Every block but the last reserves its final slot for the continuation
/// sentinel. Unused blocks at the end of `blocks` are left untouched.
pub fn write_table(
    dev: &dyn BlockStorage,
    blocks: &[BlockNumber],
    entries: &[DiskMapEntry],
) -> Result<()> {
    let mut sorted = entries.to_vec();
    sorted.sort_by_key(|e| e.key());
    if sorted.windows(2).any(|w| w[0].key() == w[1].key()) {
        return Err(F40Error::InvalidRequest(
            "duplicate disk map entry".to_string(),
        ));
    }
    if blocks.is_empty() {
        return Err(F40Error::InvalidRequest(
            "disk map needs at least one block".to_string(),
        ));
    }

    let per_block = entries_per_block(dev.block_size());
    let mut remaining = &sorted[..];
    for (i, &blocknr) in blocks.iter().enumerate() {
        let is_last = i + 1 == blocks.len();
        let fits_here = remaining.len() <= per_block;
        let take = if fits_here {
            remaining.len()
        } else {
            per_block - 1
        };
        if !fits_here && is_last {
            return Err(F40Error::InvalidRequest(format!(
                "{} disk map entries do not fit into {} blocks",
                sorted.len(),
                blocks.len()
            )));
        }

        let mut buf = vec![0u8; dev.block_size()];
        buf[..HEADER_SIZE].copy_from_slice(DISKMAP_MAGIC);
        let mut slots = buf[HEADER_SIZE..].chunks_exact_mut(ENTRY_SIZE);
        for (entry, slot) in remaining[..take].iter().zip(&mut slots) {
            slot.copy_from_slice(entry.to_raw().as_bytes());
        }
        let sentinel = if fits_here {
            (END_LABEL, 0)
        } else {
            (NEXT_LABEL, blocks[i + 1] as i64)
        };
        if let Some(slot) = slots.next() {
            let raw = RawEntry {
                label: I32::new(sentinel.0),
                parameter: I32::new(0),
                value: I64::new(sentinel.1),
            };
            slot.copy_from_slice(raw.as_bytes());
        }
        dev.write_block(blocknr, &buf)?;
        debug!("wrote disk map block {} with {} entries", blocknr, take);

        remaining = &remaining[take..];
        if fits_here {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemBlockDevice;

    fn device() -> Arc<dyn BlockStorage> {
        Arc::new(MemBlockDevice::new(512, 256))
    }

    #[test]
    fn lookup_without_table_misses() {
        let locator = DiskLocator::without_table(device());
        assert_eq!(locator.lookup(FixmapLabel::Format, 0).unwrap(), None);
        assert_eq!(locator.resolve(FixmapLabel::Status, 0, 21).unwrap(), 21);
    }

    #[test]
    fn present_entry_overrides_default() {
        let dev = device();
        write_table(
            &*dev,
            &[200],
            &[
                DiskMapEntry::new(FixmapLabel::Status, 0, 150),
                DiskMapEntry::new(FixmapLabel::Format, 0, 140),
            ],
        )
        .unwrap();
        let locator = DiskLocator::with_table(dev, 200);

        assert_eq!(locator.lookup(FixmapLabel::Format, 0).unwrap(), Some(140));
        assert_eq!(locator.resolve(FixmapLabel::Status, 0, 133).unwrap(), 150);
        assert_eq!(locator.lookup(FixmapLabel::Master, 0).unwrap(), None);
        assert_eq!(locator.lookup(FixmapLabel::Bitmap, 1).unwrap(), None);
    }

    #[test]
    fn lookup_follows_continuation_blocks() {
        let dev = device();
        let per_block = entries_per_block(512) as u32;
        let entries: Vec<_> = (0..per_block * 2)
            .map(|g| DiskMapEntry::new(FixmapLabel::Bitmap, g, 1000 + g as u64))
            .collect();
        write_table(&*dev, &[10, 30, 20], &entries).unwrap();
        let locator = DiskLocator::with_table(dev, 10);

        assert_eq!(locator.lookup(FixmapLabel::Bitmap, 0).unwrap(), Some(1000));
        let last = per_block * 2 - 1;
        assert_eq!(
            locator.lookup(FixmapLabel::Bitmap, last).unwrap(),
            Some(1000 + last as u64)
        );
        assert_eq!(locator.entries().unwrap(), entries);
    }

    #[test]
    fn bad_magic_is_config_corrupt() {
        let dev = device();
        dev.write_block(5, &[0xEE; 512]).unwrap();
        let locator = DiskLocator::with_table(dev, 5);
        match locator.lookup(FixmapLabel::Format, 0) {
            Err(F40Error::ConfigCorrupt { block: 5, .. }) => (),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn bad_magic_in_chained_block_is_config_corrupt() {
        let dev = device();
        let per_block = entries_per_block(512) as u32;
        let entries: Vec<_> = (0..per_block + 1)
            .map(|g| DiskMapEntry::new(FixmapLabel::Bitmap, g, 500 + g as u64))
            .collect();
        write_table(&*dev, &[10, 11], &entries).unwrap();
        dev.write_block(11, &[0; 512]).unwrap();
        let locator = DiskLocator::with_table(dev, 10);

        assert_eq!(locator.lookup(FixmapLabel::Bitmap, 0).unwrap(), Some(500));
        assert!(matches!(
            locator.lookup(FixmapLabel::Bitmap, per_block),
            Err(F40Error::ConfigCorrupt { block: 11, .. })
        ));
    }

    #[test]
    fn looping_chain_is_detected() {
        let dev = device();
        let mut buf = vec![0u8; 512];
        buf[..16].copy_from_slice(DISKMAP_MAGIC);
        let raw = RawEntry {
            label: I32::new(NEXT_LABEL),
            parameter: I32::new(0),
            value: I64::new(7),
        };
        buf[16..32].copy_from_slice(raw.as_bytes());
        dev.write_block(7, &buf).unwrap();

        let locator = DiskLocator::with_table(dev, 7);
        assert!(matches!(
            locator.lookup(FixmapLabel::Format, 0),
            Err(F40Error::ConfigCorrupt { .. })
        ));
    }

    #[test]
    fn unsorted_entries_are_rejected() {
        let dev = device();
        let mut buf = vec![0u8; 512];
        buf[..16].copy_from_slice(DISKMAP_MAGIC);
        let first = DiskMapEntry::new(FixmapLabel::Status, 0, 40).to_raw();
        let second = DiskMapEntry::new(FixmapLabel::Format, 0, 41).to_raw();
        buf[16..32].copy_from_slice(first.as_bytes());
        buf[32..48].copy_from_slice(second.as_bytes());
        let end = RawEntry {
            label: I32::new(END_LABEL),
            parameter: I32::new(0),
            value: I64::new(0),
        };
        buf[48..64].copy_from_slice(end.as_bytes());
        dev.write_block(3, &buf).unwrap();

        let locator = DiskLocator::with_table(dev, 3);
        assert!(locator.lookup(FixmapLabel::Status, 1).is_err());
    }

    #[test]
    fn table_that_does_not_fit_is_rejected() {
        let dev = device();
        let entries: Vec<_> = (0..entries_per_block(512) as u32 + 1)
            .map(|g| DiskMapEntry::new(FixmapLabel::Bitmap, g, g as u64))
            .collect();
        assert!(write_table(&*dev, &[10], &entries).is_err());
    }
}
