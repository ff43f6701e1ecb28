//! Mounting a format40 volume.
//!
//! A mount is a fixed sequence of [`Stage`]s. Completed stages are kept on a
//! stack; when a later stage fails the stack is unwound, undoing whatever the
//! completed stages set up, most recent first. Unmount unwinds the same stack.

use crate::alloc::{AllocRequest, BitmapAllocator, BlockRange, TouchedSet};
use crate::collab::Collaborators;
use crate::diskmap::{DiskLocator, FixmapLabel};
use crate::error::{F40Error, Result};
use crate::io::BlockStorage;
use crate::layout::{BlockNumber, FixedLayout, Geometry};
use crate::options::MountOptions;
use crate::sb::{MasterSuper, SuperDescriptor, FORMAT40_ID};
use crate::stage::Stage;
use crate::status::{mount_decision, StatusBlock, StatusCode, StatusDecision};
use crate::txn::Atom;
use log::{debug, error, info, warn};
use std::sync::Arc;
use thiserror::Error;

/// A failed mount.
#[derive(Debug, Error)]
#[error("mount failed at stage {stage}: {source}")]
pub struct MountError {
    pub stage: Stage,
    pub source: F40Error,
    /// Stages whose setup was undone, in the order it happened.
    pub unwound: Vec<Stage>,
}

impl MountError {
    pub fn is_retryable(&self) -> bool {
        self.source.is_retryable()
    }
}

/// Blocks holding the critical metadata, after disk map relocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Locations {
    pub master: BlockNumber,
    pub format: BlockNumber,
    pub journal_header: BlockNumber,
    pub journal_footer: BlockNumber,
    pub status: BlockNumber,
}

impl Locations {
    fn resolve(locator: &DiskLocator, layout: &FixedLayout) -> Result<Self> {
        Ok(Self {
            master: layout.master,
            format: locator.resolve(FixmapLabel::Format, 0, layout.format)?,
            journal_header: locator.resolve(
                FixmapLabel::JournalHeader,
                0,
                layout.journal_header,
            )?,
            journal_footer: locator.resolve(
                FixmapLabel::JournalFooter,
                0,
                layout.journal_footer,
            )?,
            status: locator.resolve(FixmapLabel::Status, 0, layout.status)?,
        })
    }
}

/// In-memory image of the format super block. The descriptor is packed into
/// it at commit, leaving the rest of the block as found on disk.
struct SuperPin {
    blocknr: BlockNumber,
    image: Vec<u8>,
}

impl SuperPin {
    fn pin(dev: &dyn BlockStorage, blocknr: BlockNumber) -> Result<Self> {
        let image = dev.read_vec(blocknr)?;
        debug!("pinned super block {}", blocknr);
        Ok(Self { blocknr, image })
    }

    fn pack(&self, sb: &SuperDescriptor) -> Result<Vec<u8>> {
        let mut image = self.image.clone();
        sb.write_into(&mut image)?;
        Ok(image)
    }

    fn unpin(self) {
        debug!("unpinned super block {}", self.blocknr);
    }
}

fn read_super(dev: &dyn BlockStorage, blocknr: BlockNumber) -> Result<SuperDescriptor> {
    SuperDescriptor::parse(&dev.read_vec(blocknr)?)
}

/// Results of a completed mount sequence.
struct Ready {
    master: MasterSuper,
    locations: Locations,
    geometry: Geometry,
    sb: SuperDescriptor,
    decision: StatusDecision,
    used_blocks: u64,
}

/// A mount in progress, or an unmount: the completed stages and whatever
/// they hold that must be released.
struct Mounting {
    dev: Arc<dyn BlockStorage>,
    options: MountOptions,
    collab: Collaborators,
    done: Vec<Stage>,
    status: Option<StatusBlock>,
    allocator: Option<BitmapAllocator>,
    pin: Option<SuperPin>,
}

type StageResult<T> = std::result::Result<T, (Stage, F40Error)>;

impl Mounting {
    fn step<T, F>(&mut self, stage: Stage, run: F) -> StageResult<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        debug!("mount stage {}", stage);
        let out = run(self).map_err(|e| (stage, e))?;
        self.done.push(stage);
        Ok(out)
    }

    fn run(&mut self) -> StageResult<Ready> {
        let (master, locator, locations) = self.step(Stage::Locate, |m| m.locate())?;
        let boot = self.step(Stage::ReadSuper, |m| read_super(&*m.dev, locations.format))?;
        debug!("bootstrap descriptor: {} blocks", boot.block_count);

        self.step(Stage::JournalInfo, |m| {
            m.collab
                .journal
                .init_journal_info(locations.journal_header, locations.journal_footer)
        })?;
        self.step(Stage::Eflush, |m| m.collab.eflush.init())?;
        let decision = self.step(Stage::Status, |m| {
            let status = StatusBlock::init(m.dev.clone(), locations.status)?;
            let (code, extended) = status.query();
            let decision = mount_decision(code);
            if decision != StatusDecision::Proceed {
                warn!(
                    "volume status {:?} ({:#x}): {:?}, last message {:?}",
                    code,
                    extended,
                    decision,
                    status.record().message
                );
            }
            m.status = Some(status);
            Ok(decision)
        })?;
        self.step(Stage::Replay, |m| m.collab.journal.replay(&*m.dev))?;

        let mut sb = self.step(Stage::ReloadSuper, |m| {
            let sb = read_super(&*m.dev, locations.format)?;
            sb.validate(m.dev.block_count())?;
            Ok(sb)
        })?;
        self.step(Stage::KeyCheck, |m| {
            let requested = m.options.key_format;
            if sb.key_format() != requested {
                return Err(F40Error::KeyFormatMismatch {
                    on_disk: sb.key_format(),
                    requested,
                });
            }
            m.collab.tree.open(requested)
        })?;
        self.step(Stage::OidInit, |m| m.collab.oids.init(sb.oid, sb.file_count))?;
        self.step(Stage::TreeInit, |m| {
            m.collab.tree.init(sb.root_block, sb.tree_height)
        })?;
        self.step(Stage::RecoverFields, |m| {
            m.collab.journal.recover_super_fields(&mut sb)?;
            sb.validate(m.dev.block_count())
        })?;
        let used_blocks = self.step(Stage::UsedBlocks, |_| sb.used_blocks())?;

        let geometry = self.step(Stage::SpaceInit, |m| {
            let geometry = Geometry::new(m.dev.block_size(), sb.block_count)?;
            let allocator =
                BitmapAllocator::new(m.dev.clone(), geometry, locator.clone(), sb.free_blocks);
            if m.options.preload_bitmaps {
                allocator.load_all()?;
            }
            m.allocator = Some(allocator);
            Ok(geometry)
        })?;
        self.step(Stage::PinSuper, |m| {
            m.pin = Some(SuperPin::pin(&*m.dev, locations.format)?);
            Ok(())
        })?;

        Ok(Ready {
            master,
            locations,
            geometry,
            sb,
            decision,
            used_blocks,
        })
    }

    fn locate(&self) -> Result<(MasterSuper, DiskLocator, Locations)> {
        let block_size = self.dev.block_size();
        let layout = FixedLayout::for_block_size(block_size);
        let master = MasterSuper::parse(&self.dev.read_vec(layout.master)?)?;
        if master.format_id != FORMAT40_ID {
            return Err(F40Error::NotAReiserVolume(format!(
                "unsupported disk format {}",
                master.format_id
            )));
        }
        if master.block_size != block_size {
            return Err(F40Error::NotAReiserVolume(format!(
                "volume block size {} differs from device block size {}",
                master.block_size, block_size
            )));
        }

        let locator = match self.options.diskmap.or(master.diskmap) {
            Some(table) => DiskLocator::with_table(self.dev.clone(), table),
            None => DiskLocator::without_table(self.dev.clone()),
        };
        let locations = Locations::resolve(&locator, &layout)?;
        debug!("{:?} via {:?}", locations, locator);
        Ok((master, locator, locations))
    }

    /// Undoes every completed stage, most recent first. A failing undo is
    /// logged and does not stop the rest.
    fn unwind(&mut self) -> Vec<Stage> {
        let mut unwound = Vec::new();
        while let Some(stage) = self.done.pop() {
            let undone = match stage {
                Stage::JournalInfo => self.collab.journal.done_journal_info(),
                Stage::Eflush => self.collab.eflush.done(),
                Stage::Status => {
                    if let Some(status) = self.status.take() {
                        status.finish();
                    }
                    Ok(())
                }
                Stage::KeyCheck => self.collab.tree.done(),
                Stage::SpaceInit => {
                    if let Some(allocator) = self.allocator.take() {
                        allocator.destroy();
                    }
                    Ok(())
                }
                Stage::PinSuper => {
                    if let Some(pin) = self.pin.take() {
                        pin.unpin();
                    }
                    Ok(())
                }
                Stage::Locate
                | Stage::ReadSuper
                | Stage::Replay
                | Stage::ReloadSuper
                | Stage::OidInit
                | Stage::TreeInit
                | Stage::RecoverFields
                | Stage::UsedBlocks => continue,
            };
            if let Err(e) = undone {
                warn!("undoing stage {} failed: {}", stage, e);
            }
            debug!("undid stage {}", stage);
            unwound.push(stage);
        }
        unwound
    }
}

/// Entry point for mounting format40 volumes.
pub struct Format40;

impl Format40 {
    /// Runs the mount sequence on `dev`. On failure every completed stage is
    /// undone before the error is returned.
    pub fn mount(
        dev: Arc<dyn BlockStorage>,
        options: MountOptions,
        collab: Collaborators,
    ) -> std::result::Result<MountedVolume, MountError> {
        let mut m = Mounting {
            dev,
            options,
            collab,
            done: Vec::new(),
            status: None,
            allocator: None,
            pin: None,
        };
        let ready = match m.run() {
            Ok(ready) => ready,
            Err((stage, source)) => {
                error!("mount failed at stage {}: {}", stage, source);
                let unwound = m.unwind();
                return Err(MountError {
                    stage,
                    source,
                    unwound,
                });
            }
        };

        let (status, allocator, pin) = match (m.status, m.allocator, m.pin) {
            (Some(status), Some(allocator), Some(pin)) => (status, allocator, pin),
            _ => unreachable!("mount completed without its resources"),
        };
        info!(
            "mounted format40 volume: {} blocks of {}, {} used, {}",
            ready.sb.block_count,
            ready.geometry.block_size(),
            ready.used_blocks,
            if m.options.read_only { "read-only" } else { "read-write" }
        );
        Ok(MountedVolume {
            dev: m.dev,
            options: m.options,
            master: ready.master,
            locations: ready.locations,
            geometry: ready.geometry,
            sb: ready.sb,
            decision: ready.decision,
            used_blocks: ready.used_blocks,
            status,
            allocator,
            pin,
            collab: m.collab,
            done: m.done,
            commit_failed: false,
        })
    }
}

/// A mounted volume: the super descriptor, the space allocator, the status
/// block and the collaborators that were brought up for it.
pub struct MountedVolume {
    dev: Arc<dyn BlockStorage>,
    options: MountOptions,
    master: MasterSuper,
    locations: Locations,
    geometry: Geometry,
    sb: SuperDescriptor,
    decision: StatusDecision,
    used_blocks: u64,
    status: StatusBlock,
    allocator: BitmapAllocator,
    pin: SuperPin,
    collab: Collaborators,
    done: Vec<Stage>,
    commit_failed: bool,
}

impl MountedVolume {
    pub fn is_read_only(&self) -> bool {
        self.options.read_only
    }

    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    pub fn master(&self) -> &MasterSuper {
        &self.master
    }

    pub fn locations(&self) -> &Locations {
        &self.locations
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// The descriptor as read at mount (and updated by commits).
    pub fn super_descriptor(&self) -> &SuperDescriptor {
        &self.sb
    }

    /// Blocks in use when the volume was mounted.
    pub fn used_blocks(&self) -> u64 {
        self.used_blocks
    }

    /// What the status block recorded at mount suggests. Not enforced.
    pub fn status_decision(&self) -> StatusDecision {
        self.decision
    }

    pub fn status(&self) -> &StatusBlock {
        &self.status
    }

    pub fn allocator(&self) -> &BitmapAllocator {
        &self.allocator
    }

    fn writable(&self) -> Result<()> {
        if self.options.read_only {
            return Err(F40Error::InvalidRequest(
                "volume is mounted read-only".to_string(),
            ));
        }
        Ok(())
    }

    /// Records a new volume status. Returns at once; the write happens in the
    /// background.
    #[track_caller]
    pub fn report(&self, status: StatusCode, extended: u64, message: &str) {
        self.status.write(status, extended, message);
    }

    /// Marks the volume according to an error that hit it. Errors that say
    /// nothing about the medium are ignored.
    #[track_caller]
    pub fn record_error(&self, err: &F40Error) {
        let code = match err {
            F40Error::Io(_) => StatusCode::IoError,
            F40Error::ConfigCorrupt { .. }
            | F40Error::BitmapCorrupt { .. }
            | F40Error::SuperCorrupt(_)
            | F40Error::StatusCorrupt { .. } => StatusCode::Corrupted,
            _ => return,
        };
        self.status.write(code, err.errno() as u64, &err.to_string());
    }

    fn noted(&self, err: F40Error) -> F40Error {
        self.record_error(&err);
        err
    }

    /// Allocates blocks for `atom`.
    pub fn allocate(&self, atom: &mut Atom, req: &AllocRequest) -> Result<BlockRange> {
        self.writable()?;
        let range = self.allocator.allocate(req).map_err(|e| self.noted(e))?;
        atom.record_allocated(range);
        Ok(range)
    }

    /// Frees blocks on behalf of `atom`. They are reusable right away and
    /// free on disk once the atom commits.
    pub fn free(&self, atom: &mut Atom, range: BlockRange) -> Result<()> {
        self.writable()?;
        self.allocator.deallocate(range).map_err(|e| self.noted(e))?;
        atom.record_freed(range);
        Ok(())
    }

    pub fn allocate_oid(&mut self) -> Result<u64> {
        self.writable()?;
        self.collab.oids.allocate()
    }

    /// Whether a commit failed after its bitmaps were promoted in memory. Such
    /// a volume no longer packs or commits; remount it to continue from what
    /// reached the disk.
    pub fn has_failed_commit(&self) -> bool {
        self.commit_failed
    }

    fn intact(&self) -> Result<()> {
        if self.commit_failed {
            return Err(F40Error::InvalidRequest(
                "an earlier commit did not reach the disk".to_string(),
            ));
        }
        Ok(())
    }

    /// The format super block as it would be written now.
    ///
    /// The free block count is the committed one: blocks allocated by
    /// transactions that have not committed yet are still free on disk.
    pub fn pack(&self) -> Result<Vec<u8>> {
        self.intact()?;
        self.pack_descriptor(self.sb.clone())
    }

    fn pack_descriptor(&self, mut sb: SuperDescriptor) -> Result<Vec<u8>> {
        sb.free_blocks = self.allocator.committed_free_blocks();
        sb.root_block = self.collab.tree.root();
        sb.tree_height = self.collab.tree.height();
        sb.oid = self.collab.oids.next_oid();
        sb.file_count = self.collab.oids.file_count();
        self.pin.pack(&sb)
    }

    /// Promotes the atom's allocations into the commit bitmaps and captures
    /// the touched bitmap blocks and the super block into its overwrite set.
    pub fn pre_commit(&self, atom: &mut Atom) -> Result<TouchedSet> {
        self.writable()?;
        self.intact()?;
        let touched = self.allocator.pre_commit(atom).map_err(|e| self.noted(e))?;
        atom.capture(self.locations.format, self.pack()?);
        Ok(touched)
    }

    /// Pre-commits `atom` and writes its overwrite set through the
    /// transaction manager.
    ///
    /// If anything fails once the commit bitmaps have moved, the volume is
    /// marked (see [`MountedVolume::has_failed_commit`]) so the unwritten
    /// tally never reaches the super block.
    pub fn commit(&mut self, mut atom: Atom) -> Result<TouchedSet> {
        self.writable()?;
        self.intact()?;
        let touched = self.allocator.pre_commit(&mut atom).map_err(|e| self.noted(e))?;

        let mut sb = self.sb.clone();
        sb.flushes += 1;
        if let Err(e) = self.write_through(atom, &sb) {
            self.commit_failed = true;
            error!("commit failed, volume state is ahead of the disk: {}", e);
            self.record_error(&e);
            return Err(e);
        }
        self.sb.flushes = sb.flushes;
        self.sb.free_blocks = self.allocator.committed_free_blocks();
        debug!("committed {} bitmap groups", touched.len());
        Ok(touched)
    }

    fn write_through(&mut self, mut atom: Atom, sb: &SuperDescriptor) -> Result<()> {
        atom.capture(self.locations.format, self.pack_descriptor(sb.clone())?);
        for (blocknr, data) in atom.into_overwrite_set() {
            self.collab.txn.capture(blocknr, data)?;
        }
        self.collab.txn.force_commit_all()
    }

    fn flush_super(&mut self) -> Result<()> {
        self.intact()?;
        let mut sb = self.sb.clone();
        sb.flushes += 1;
        self.write_through(Atom::new(), &sb)?;
        self.sb.flushes = sb.flushes;
        Ok(())
    }

    /// Writes the super block back (unless read-only) and undoes every mount
    /// stage. Returns the stages undone, in order.
    ///
    /// A failed final commit is logged; the unmount goes on regardless.
    pub fn unmount(mut self) -> Vec<Stage> {
        if !self.options.read_only {
            if let Err(e) = self.flush_super() {
                warn!("forced commit at unmount failed: {}", e);
            }
        }
        let MountedVolume {
            dev,
            options,
            status,
            allocator,
            pin,
            collab,
            done,
            ..
        } = self;
        let mut m = Mounting {
            dev,
            options,
            collab,
            done,
            status: Some(status),
            allocator: Some(allocator),
            pin: Some(pin),
        };
        let unwound = m.unwind();
        info!("unmounted format40 volume");
        unwound
    }
}
