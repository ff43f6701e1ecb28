//! Bitmap space allocator.
//!
//! Every group of `bits_per_group` blocks is tracked by one bitmap block. In
//! memory each group keeps two copies of it:
//!
//! * the **working** bitmap, changed by every allocation and deallocation and
//!   not durable until the transaction commits;
//! * the **commit** bitmap, the last durable state, changed only by
//!   [`BitmapAllocator::pre_commit`] which promotes the blocks a transaction
//!   allocated and applies its delete set.
//!
//! Both copies are equal right after a group is loaded. Only the commit copy
//! is ever written back, so a crash before commit leaves the on-disk bitmap
//! describing the last committed state.
//!
//! Bit 0 of group 0 is a canary: it is always used, so a group 0 bitmap with
//! the bit clear is known to be garbage.

mod bitmap;

pub use bitmap::{
    search_backward, search_forward, seal, stored_checksum, verify_checksum, write_checksum,
    Bitmap, State,
};

use crate::diskmap::{DiskLocator, FixmapLabel};
use crate::error::{F40Error, Result};
use crate::io::BlockStorage;
use crate::layout::{BlockNumber, FixedLayout, Geometry};
use crate::txn::Atom;
use log::{debug, error};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// A contiguous run of blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRange {
    pub start: BlockNumber,
    pub len: u64,
}

impl BlockRange {
    pub fn new(start: BlockNumber, len: u64) -> Self {
        Self { start, len }
    }

    /// One past the last block.
    pub fn end(&self) -> BlockNumber {
        self.start + self.len
    }

    pub fn blocks(&self) -> std::ops::Range<BlockNumber> {
        self.start..self.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Search upwards from the hint.
    Forward,
    /// Search downwards from the hint, filling from the end of the device.
    Backward,
}

/// Parameters of one allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocRequest {
    pub hint: BlockNumber,
    pub min_len: u32,
    pub max_len: u32,
    /// How many blocks away from the hint the search may go. Zero means
    /// anywhere, wrapping around the end of the device.
    pub max_distance: u64,
    pub direction: Direction,
}

impl AllocRequest {
    /// A single block at or after `hint`.
    pub fn forward(hint: BlockNumber) -> Self {
        Self {
            hint,
            min_len: 1,
            max_len: 1,
            max_distance: 0,
            direction: Direction::Forward,
        }
    }

    /// A single block at or before `hint`.
    pub fn backward(hint: BlockNumber) -> Self {
        Self {
            direction: Direction::Backward,
            ..Self::forward(hint)
        }
    }

    pub fn with_len(mut self, min_len: u32, max_len: u32) -> Self {
        self.min_len = min_len;
        self.max_len = max_len;
        self
    }

    pub fn with_max_distance(mut self, max_distance: u64) -> Self {
        self.max_distance = max_distance;
        self
    }
}

/// Groups whose commit bitmap changed in a pre-commit, with the block each
/// bitmap is written to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TouchedSet {
    groups: BTreeMap<u32, BlockNumber>,
}

impl TouchedSet {
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn contains(&self, group: u32) -> bool {
        self.groups.contains_key(&group)
    }

    /// `(group, bitmap block)` pairs in group order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, BlockNumber)> + '_ {
        self.groups.iter().map(|(&g, &b)| (g, b))
    }
}

/// Free block tallies. `free` follows the working bitmaps, `committed_free`
/// the commit bitmaps and is what the super block records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpaceCounters {
    pub free: u64,
    pub committed_free: u64,
}

/// Copy of one group's state, for tests and consistency checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSnapshot {
    pub working: Vec<u8>,
    pub commit: Vec<u8>,
    pub checksum: u32,
    pub first_zero: u32,
}

/// Both bitmaps of a loaded group.
struct GroupBitmaps {
    working: Bitmap,
    commit: Bitmap,
    checksum: u32,
    /// Every bit below this one is known to be used in the working bitmap.
    first_zero: u32,
}

/// Allocation state of one group, `None` until loaded.
struct BitmapNode {
    group: u32,
    state: Mutex<Option<GroupBitmaps>>,
}

pub struct BitmapAllocator {
    dev: Arc<dyn BlockStorage>,
    geometry: Geometry,
    layout: FixedLayout,
    locator: DiskLocator,
    nodes: Vec<BitmapNode>,
    counters: Mutex<SpaceCounters>,
    metadata: Mutex<Option<Arc<BTreeSet<BlockNumber>>>>,
}

impl std::fmt::Debug for BitmapAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitmapAllocator")
            .field("geometry", &self.geometry)
            .field("groups", &self.nodes.len())
            .field("counters", &*self.counters.lock())
            .finish()
    }
}

impl BitmapAllocator {
    /// Sets up one unloaded node per group. `committed_free` is the free
    /// block count recorded in the super block.
    pub fn new(
        dev: Arc<dyn BlockStorage>,
        geometry: Geometry,
        locator: DiskLocator,
        committed_free: u64,
    ) -> Self {
        let nodes = (0..geometry.groups())
            .map(|group| BitmapNode {
                group,
                state: Mutex::new(None),
            })
            .collect();
        Self {
            layout: FixedLayout::for_block_size(geometry.block_size()),
            dev,
            geometry,
            locator,
            nodes,
            counters: Mutex::new(SpaceCounters {
                free: committed_free,
                committed_free,
            }),
            metadata: Mutex::new(None),
        }
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn counters(&self) -> SpaceCounters {
        *self.counters.lock()
    }

    /// Free blocks according to the working bitmaps.
    pub fn free_blocks(&self) -> u64 {
        self.counters.lock().free
    }

    /// Free blocks according to the commit bitmaps.
    pub fn committed_free_blocks(&self) -> u64 {
        self.counters.lock().committed_free
    }

    /// The block holding the bitmap of `group`, after disk map relocation.
    pub fn bitmap_block(&self, group: u32) -> Result<BlockNumber> {
        self.locator.resolve(
            FixmapLabel::Bitmap,
            group,
            self.layout.bitmap_block(&self.geometry, group),
        )
    }

    /// Blocks that may never be freed: the canary, the fixed super, journal
    /// and status blocks, the disk map head and every group's bitmap block,
    /// all after relocation. Built on first use.
    fn metadata_blocks(&self) -> Result<Arc<BTreeSet<BlockNumber>>> {
        let mut cached = self.metadata.lock();
        if let Some(blocks) = cached.as_ref() {
            return Ok(blocks.clone());
        }

        let relocated: BTreeMap<(i32, i32), BlockNumber> = self
            .locator
            .entries()?
            .into_iter()
            .map(|entry| ((entry.label, entry.parameter), entry.value))
            .collect();
        let resolve = |label: FixmapLabel, parameter: u32, default: BlockNumber| {
            relocated
                .get(&(label as i32, parameter as i32))
                .copied()
                .unwrap_or(default)
        };

        let layout = &self.layout;
        let mut blocks: BTreeSet<BlockNumber> = [
            0,
            layout.master,
            resolve(FixmapLabel::Format, 0, layout.format),
            resolve(FixmapLabel::JournalHeader, 0, layout.journal_header),
            resolve(FixmapLabel::JournalFooter, 0, layout.journal_footer),
            resolve(FixmapLabel::Status, 0, layout.status),
        ]
        .into_iter()
        .collect();
        blocks.extend(self.locator.table());
        for group in 0..self.geometry.groups() {
            blocks.insert(resolve(
                FixmapLabel::Bitmap,
                group,
                layout.bitmap_block(&self.geometry, group),
            ));
        }

        let blocks = Arc::new(blocks);
        *cached = Some(blocks.clone());
        Ok(blocks)
    }

    /// Loads and verifies the bitmap of `group` unless it is already loaded.
    pub fn load(&self, group: u32) -> Result<()> {
        let node = self.node(group)?;
        let mut state = node.state.lock();
        self.ensure_loaded(node.group, &mut state)?;
        Ok(())
    }

    /// Loads every group, failing on the first corrupt one.
    pub fn load_all(&self) -> Result<()> {
        for node in &self.nodes {
            let mut state = node.state.lock();
            self.ensure_loaded(node.group, &mut state)?;
        }
        debug!("preloaded {} bitmap groups", self.nodes.len());
        Ok(())
    }

    /// Recounts the free blocks of every commit bitmap, loading groups as
    /// needed. Should agree with [`BitmapAllocator::committed_free_blocks`].
    pub fn count_committed_free(&self) -> Result<u64> {
        let mut free = 0;
        for node in &self.nodes {
            let glen = self.geometry.group_len(node.group);
            let mut state = node.state.lock();
            let bitmaps = self.ensure_loaded(node.group, &mut state)?;
            let mut bit = 0;
            while let Some(zero) = bitmaps.commit.find_next(bit, glen, false) {
                let end = bitmaps.commit.find_next(zero, glen, true).unwrap_or(glen);
                free += (end - zero) as u64;
                bit = end;
            }
        }
        Ok(free)
    }

    fn node(&self, group: u32) -> Result<&BitmapNode> {
        self.nodes.get(group as usize).ok_or_else(|| {
            F40Error::InvalidRequest(format!(
                "group {} outside the {} groups of the volume",
                group,
                self.nodes.len()
            ))
        })
    }

    fn ensure_loaded<'a>(
        &self,
        group: u32,
        slot: &'a mut Option<GroupBitmaps>,
    ) -> Result<&'a mut GroupBitmaps> {
        let loaded = match slot.take() {
            Some(loaded) => loaded,
            None => self.read_group(group)?,
        };
        Ok(slot.insert(loaded))
    }

    fn read_group(&self, group: u32) -> Result<GroupBitmaps> {
        let blocknr = self.bitmap_block(group)?;
        let block = self.dev.read_vec(blocknr)?;
        let block = &block[..self.geometry.block_size()];
        if !verify_checksum(block) {
            error!("bitmap of group {} at block {}: checksum mismatch", group, blocknr);
            return Err(F40Error::BitmapCorrupt {
                group,
                detail: format!("checksum mismatch in block {}", blocknr),
            });
        }
        let commit = Bitmap::parse(&block[..self.geometry.payload_len()]);
        if group == 0 && commit.get(0) == State::Free {
            error!("bitmap of group 0 at block {}: canary bit clear", blocknr);
            return Err(F40Error::BitmapCorrupt {
                group,
                detail: "canary bit is clear".to_string(),
            });
        }

        debug!("loaded bitmap of group {} from block {}", group, blocknr);
        Ok(GroupBitmaps {
            working: commit.clone(),
            commit,
            checksum: stored_checksum(block),
            first_zero: 0,
        })
    }

    fn validate(&self, req: &AllocRequest) -> Result<()> {
        if req.min_len == 0 || req.min_len > req.max_len {
            return Err(F40Error::InvalidRequest(format!(
                "bad length range {}..={}",
                req.min_len, req.max_len
            )));
        }
        if req.max_len as u64 > self.geometry.bits_per_group() {
            return Err(F40Error::InvalidRequest(format!(
                "{} blocks exceed the {} a group can hold",
                req.max_len,
                self.geometry.bits_per_group()
            )));
        }
        if req.hint >= self.geometry.block_count() {
            return Err(F40Error::InvalidRequest(format!(
                "hint {} outside the volume",
                req.hint
            )));
        }
        Ok(())
    }

    /// Finds a free run of `min_len..=max_len` blocks near the hint and marks
    /// it used in the working bitmap.
    ///
    /// Runs never cross a group boundary. Fails with `OutOfSpace` when no
    /// group in reach has a long enough run.
    pub fn allocate(&self, req: &AllocRequest) -> Result<BlockRange> {
        self.validate(req)?;
        let found = match req.direction {
            Direction::Forward => self.allocate_forward(req)?,
            Direction::Backward => self.allocate_backward(req)?,
        };
        match found {
            Some(range) => {
                let mut counters = self.counters.lock();
                counters.free = counters.free.saturating_sub(range.len);
                Ok(range)
            }
            None => Err(F40Error::OutOfSpace),
        }
    }

    fn allocate_forward(&self, req: &AllocRequest) -> Result<Option<BlockRange>> {
        let geo = &self.geometry;
        let limit = if req.max_distance == 0 {
            geo.block_count()
        } else {
            geo.block_count().min(req.hint.saturating_add(req.max_distance))
        };
        let first = geo.group_of(req.hint);
        let last = geo.group_of(limit - 1);

        for group in first..=last {
            let start = if group == first { geo.offset_of(req.hint) } else { 0 };
            let end = if group == last {
                geo.offset_of(limit - 1) + 1
            } else {
                geo.group_len(group)
            };
            if let Some(range) = self.allocate_in_group(group, start, end, req)? {
                return Ok(Some(range));
            }
        }

        if req.max_distance == 0 && req.hint > 0 {
            for group in 0..=first {
                if let Some(range) = self.allocate_in_group(group, 0, geo.group_len(group), req)? {
                    return Ok(Some(range));
                }
            }
        }
        Ok(None)
    }

    fn allocate_backward(&self, req: &AllocRequest) -> Result<Option<BlockRange>> {
        let geo = &self.geometry;
        let low = if req.max_distance == 0 {
            0
        } else {
            (req.hint + 1).saturating_sub(req.max_distance)
        };
        let first = geo.group_of(req.hint);
        let last = geo.group_of(low);

        for group in (last..=first).rev() {
            let start = if group == last { geo.offset_of(low) } else { 0 };
            let end = if group == first {
                geo.offset_of(req.hint) + 1
            } else {
                geo.group_len(group)
            };
            if let Some(range) = self.allocate_in_group(group, start, end, req)? {
                return Ok(Some(range));
            }
        }

        if req.max_distance == 0 && req.hint + 1 < geo.block_count() {
            for group in (first..geo.groups()).rev() {
                if let Some(range) = self.allocate_in_group(group, 0, geo.group_len(group), req)? {
                    return Ok(Some(range));
                }
            }
        }
        Ok(None)
    }

    /// Searches `[start, end)` of one group and marks the run it finds. The
    /// group lock is held from the search through the marking.
    fn allocate_in_group(
        &self,
        group: u32,
        start: u32,
        end: u32,
        req: &AllocRequest,
    ) -> Result<Option<BlockRange>> {
        if start >= end {
            return Ok(None);
        }
        let glen = self.geometry.group_len(group);
        let mut state = self.nodes[group as usize].state.lock();
        let node = self.ensure_loaded(group, &mut state)?;

        // Everything below the first zero bit is used; advance the hint past
        // whatever became used since it was last set.
        node.first_zero = node
            .working
            .find_next(node.first_zero, glen, false)
            .unwrap_or(glen);
        let from = start.max(node.first_zero);
        let found = match req.direction {
            Direction::Forward => search_forward(&node.working, from, end, req.min_len, req.max_len),
            Direction::Backward => {
                search_backward(&node.working, from, end, req.min_len, req.max_len)
            }
        };
        let (offset, len) = match found {
            Some(found) => found,
            None => return Ok(None),
        };

        node.working.set_range(offset, offset + len);
        if offset <= node.first_zero && node.first_zero < offset + len {
            node.first_zero = offset + len;
        }
        let range = BlockRange::new(self.geometry.block_of(group, offset), len as u64);
        debug!("allocated {:?} in group {}", range, group);
        Ok(Some(range))
    }

    /// Splits a range into `(group, start offset, end offset)` pieces.
    fn segments(&self, range: BlockRange) -> Vec<(u32, u32, u32)> {
        let geo = &self.geometry;
        let mut pieces = Vec::new();
        let mut blocknr = range.start;
        while blocknr < range.end() {
            let group = geo.group_of(blocknr);
            let start = geo.offset_of(blocknr);
            let group_end = geo.block_of(group, 0) + geo.bits_per_group();
            let end_block = range.end().min(group_end);
            pieces.push((group, start, start + (end_block - blocknr) as u32));
            blocknr = end_block;
        }
        pieces
    }

    /// Marks a used range free in the working bitmap. The blocks are
    /// available to the very next allocation.
    pub fn deallocate(&self, range: BlockRange) -> Result<()> {
        self.geometry.check_range(range.start, range.len)?;
        if let Some(blocknr) = self.metadata_blocks()?.range(range.blocks()).next() {
            return Err(F40Error::InvalidRequest(format!(
                "{:?} covers block {}, which holds volume metadata",
                range, blocknr
            )));
        }

        // Lock every group the range spans, in ascending order, so the range
        // is checked and freed as a whole.
        let segments = self.segments(range);
        let mut guards = Vec::with_capacity(segments.len());
        for &(group, start, end) in &segments {
            let mut state = self.nodes[group as usize].state.lock();
            if !self
                .ensure_loaded(group, &mut state)?
                .working
                .is_range(start, end, true)
            {
                return Err(F40Error::InvalidRequest(format!(
                    "blocks of {:?} in group {} are not allocated",
                    range, group
                )));
            }
            guards.push(state);
        }
        for (state, &(_, start, end)) in guards.iter_mut().zip(&segments) {
            if let Some(node) = state.as_mut() {
                node.working.clear_range(start, end);
                node.first_zero = node.first_zero.min(start);
            }
        }
        drop(guards);

        self.counters.lock().free += range.len;
        debug!("freed {:?}", range);
        Ok(())
    }

    /// Promotes the atom's allocations into the commit bitmaps and applies
    /// its delete set.
    ///
    /// Every group whose commit bitmap changed gets its checksum recomputed
    /// and its bitmap block captured into the atom's overwrite set. The
    /// committed free count moves by `freed - allocated`.
    ///
    /// Nothing changes unless every touched group loads: the groups are
    /// locked in ascending order and the tally checked before any commit
    /// bit moves.
    pub fn pre_commit(&self, atom: &mut Atom) -> Result<TouchedSet> {
        let geo = self.geometry;
        let mut per_group: BTreeMap<u32, (Vec<u32>, Vec<u32>)> = BTreeMap::new();
        for blocknr in atom.allocated() {
            check_commit_block(&geo, blocknr)?;
            per_group
                .entry(geo.group_of(blocknr))
                .or_default()
                .0
                .push(geo.offset_of(blocknr));
        }
        if atom.delete_set().next().is_some() {
            let metadata = self.metadata_blocks()?;
            for blocknr in atom.delete_set() {
                check_commit_block(&geo, blocknr)?;
                if metadata.contains(&blocknr) {
                    return Err(F40Error::InvalidRequest(format!(
                        "block {} holds volume metadata",
                        blocknr
                    )));
                }
                per_group
                    .entry(geo.group_of(blocknr))
                    .or_default()
                    .1
                    .push(geo.offset_of(blocknr));
            }
        }

        let mut locked = Vec::with_capacity(per_group.len());
        for (group, offsets) in per_group {
            let blocknr = self.bitmap_block(group)?;
            let mut state = self.nodes[group as usize].state.lock();
            self.ensure_loaded(group, &mut state)?;
            locked.push((group, blocknr, offsets, state));
        }

        let mut counters = self.counters.lock();
        let committed_free = (counters.committed_free + atom.freed_count())
            .checked_sub(atom.allocated_count())
            .ok_or_else(|| {
                F40Error::InvalidRequest(
                    "transaction allocated more blocks than were free".to_string(),
                )
            })?;

        let mut touched = TouchedSet::default();
        for (group, blocknr, (allocated, freed), mut state) in locked {
            let node = match state.as_mut() {
                Some(node) => node,
                None => continue,
            };
            for &offset in &freed {
                node.commit.set_free(offset);
            }
            for &offset in &allocated {
                debug_assert_eq!(node.working.get(offset), State::Used);
                node.commit.set_reserved(offset);
            }
            let block = seal(&node.commit, geo.block_size());
            node.checksum = stored_checksum(&block);
            drop(state);

            atom.capture(blocknr, block);
            touched.groups.insert(group, blocknr);
        }
        counters.committed_free = committed_free;
        debug!(
            "pre-commit touched {} groups, committed free now {}",
            touched.len(),
            counters.committed_free
        );
        Ok(touched)
    }

    /// Whether every block of `range` is free (`expect_free`) or used in the
    /// working bitmaps.
    #[cfg(debug_assertions)]
    pub fn check_range(&self, range: BlockRange, expect_free: bool) -> Result<bool> {
        self.geometry.check_range(range.start, range.len)?;
        for (group, start, end) in self.segments(range) {
            let mut state = self.nodes[group as usize].state.lock();
            let node = self.ensure_loaded(group, &mut state)?;
            if !node.working.is_range(start, end, !expect_free) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    #[cfg(debug_assertions)]
    pub fn snapshot(&self, group: u32) -> Result<GroupSnapshot> {
        let node = self.node(group)?;
        let mut state = node.state.lock();
        let node = self.ensure_loaded(group, &mut state)?;
        Ok(GroupSnapshot {
            working: node.working.serialize().to_vec(),
            commit: node.commit.serialize().to_vec(),
            checksum: node.checksum,
            first_zero: node.first_zero,
        })
    }

    /// Drops every loaded bitmap. Uncommitted working state is lost.
    pub fn destroy(self) {
        let loaded = self
            .nodes
            .iter()
            .filter(|node| node.state.lock().is_some())
            .count();
        debug!("releasing allocator with {} loaded groups", loaded);
    }
}

fn check_commit_block(geo: &Geometry, blocknr: BlockNumber) -> Result<()> {
    if blocknr == 0 || blocknr >= geo.block_count() {
        return Err(F40Error::InvalidRequest(format!(
            "block {} cannot change state at commit",
            blocknr
        )));
    }
    Ok(())
}
