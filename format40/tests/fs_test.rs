use format40::alloc::{verify_checksum, AllocRequest, BlockRange};
use format40::collab::{
    Collaborators, CounterOids, DirectCommit, EmergencyFlush, Journal, OidAllocator, SimpleTree,
    TreeHandle, TxnManager,
};
use format40::diskmap::FixmapLabel;
use format40::io::{BlockStorage, FileBlockEmulator, FileBlockEmulatorBuilder, MemBlockDevice};
use format40::mkfs::{self, FormatOptions};
use format40::sb::SuperDescriptor;
use format40::status::{StatusCode, StatusDecision};
use format40::txn::Atom;
use format40::{
    BlockNumber, F40Error, Format40, KeyFormat, MountError, MountOptions, MountedVolume, Stage,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tempfile::NamedTempFile;

const BLOCK_COUNT: u64 = 12_000;
/// Blocks 0..=134 plus the bitmaps of groups 1 and 2.
const FRESH_FREE: u64 = BLOCK_COUNT - 135 - 2;
const FORMAT_BLOCK: BlockNumber = 129;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn formatted(opts: &FormatOptions) -> Arc<dyn BlockStorage> {
    init();
    let dev: Arc<dyn BlockStorage> = Arc::new(MemBlockDevice::new(512, BLOCK_COUNT));
    mkfs::format(&*dev, opts).unwrap();
    dev
}

fn mount(dev: &Arc<dyn BlockStorage>, options: MountOptions) -> Result<MountedVolume, MountError> {
    Format40::mount(dev.clone(), options, Collaborators::standalone(dev.clone()))
}

fn on_disk_super(dev: &Arc<dyn BlockStorage>) -> SuperDescriptor {
    SuperDescriptor::parse(&dev.read_vec(FORMAT_BLOCK).unwrap()).unwrap()
}

#[derive(Clone, Default)]
struct Events(Arc<Mutex<Vec<&'static str>>>);

impl Events {
    fn push(&self, event: &'static str) {
        self.0.lock().push(event);
    }

    fn take(&self) -> Vec<&'static str> {
        std::mem::take(&mut *self.0.lock())
    }
}

#[derive(Clone, Copy, Default)]
struct Faults {
    oid_init: bool,
    journal_done: bool,
    commit: bool,
}

struct RecordingJournal {
    events: Events,
    faults: Faults,
}

impl Journal for RecordingJournal {
    fn init_journal_info(&mut self, _header: BlockNumber, _footer: BlockNumber) -> format40::Result<()> {
        self.events.push("journal init");
        Ok(())
    }

    fn done_journal_info(&mut self) -> format40::Result<()> {
        self.events.push("journal done");
        if self.faults.journal_done {
            return Err(F40Error::collaborator("journal", "injected"));
        }
        Ok(())
    }

    fn replay(&mut self, _dev: &dyn BlockStorage) -> format40::Result<()> {
        self.events.push("replay");
        Ok(())
    }

    fn recover_super_fields(&mut self, _sb: &mut SuperDescriptor) -> format40::Result<()> {
        self.events.push("recover");
        Ok(())
    }
}

struct RecordingFlush(Events);

impl EmergencyFlush for RecordingFlush {
    fn init(&mut self) -> format40::Result<()> {
        self.0.push("eflush init");
        Ok(())
    }

    fn done(&mut self) -> format40::Result<()> {
        self.0.push("eflush done");
        Ok(())
    }
}

struct RecordingTree {
    events: Events,
    inner: SimpleTree,
}

impl TreeHandle for RecordingTree {
    fn open(&mut self, keys: KeyFormat) -> format40::Result<()> {
        self.events.push("tree open");
        self.inner.open(keys)
    }

    fn init(&mut self, root: BlockNumber, height: u16) -> format40::Result<()> {
        self.events.push("tree init");
        self.inner.init(root, height)
    }

    fn done(&mut self) -> format40::Result<()> {
        self.events.push("tree done");
        self.inner.done()
    }

    fn root(&self) -> BlockNumber {
        self.inner.root()
    }

    fn height(&self) -> u16 {
        self.inner.height()
    }
}

struct RecordingOids {
    events: Events,
    faults: Faults,
    inner: CounterOids,
}

impl OidAllocator for RecordingOids {
    fn init(&mut self, next_oid: u64, file_count: u64) -> format40::Result<()> {
        self.events.push("oid init");
        if self.faults.oid_init {
            return Err(F40Error::collaborator("oid allocator", "injected"));
        }
        self.inner.init(next_oid, file_count)
    }

    fn allocate(&mut self) -> format40::Result<u64> {
        self.inner.allocate()
    }

    fn next_oid(&self) -> u64 {
        self.inner.next_oid()
    }

    fn file_count(&self) -> u64 {
        self.inner.file_count()
    }
}

struct FlakyTxn {
    inner: DirectCommit,
    faults: Faults,
}

impl TxnManager for FlakyTxn {
    fn capture(&mut self, blocknr: BlockNumber, data: Vec<u8>) -> format40::Result<()> {
        self.inner.capture(blocknr, data)
    }

    fn force_commit_all(&mut self) -> format40::Result<()> {
        if self.faults.commit {
            return Err(F40Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected",
            )));
        }
        self.inner.force_commit_all()
    }
}

fn recording(dev: &Arc<dyn BlockStorage>, events: &Events, faults: Faults) -> Collaborators {
    Collaborators {
        journal: Box::new(RecordingJournal {
            events: events.clone(),
            faults,
        }),
        eflush: Box::new(RecordingFlush(events.clone())),
        tree: Box::new(RecordingTree {
            events: events.clone(),
            inner: SimpleTree::default(),
        }),
        oids: Box::new(RecordingOids {
            events: events.clone(),
            faults,
            inner: CounterOids::default(),
        }),
        txn: Box::new(FlakyTxn {
            inner: DirectCommit::new(dev.clone()),
            faults,
        }),
    }
}

#[test]
fn failed_oid_init_unwinds_in_reverse_order() {
    let dev = formatted(&FormatOptions::new());
    let events = Events::default();
    let faults = Faults {
        oid_init: true,
        ..Faults::default()
    };

    let err = Format40::mount(dev.clone(), MountOptions::new(), recording(&dev, &events, faults))
        .err()
        .unwrap();
    assert_eq!(err.stage, Stage::OidInit);
    assert_eq!(
        err.unwound,
        vec![Stage::KeyCheck, Stage::Status, Stage::Eflush, Stage::JournalInfo]
    );
    assert_eq!(
        events.take(),
        vec![
            "journal init",
            "eflush init",
            "replay",
            "tree open",
            "oid init",
            "tree done",
            "eflush done",
            "journal done",
        ]
    );
}

#[test]
fn failing_rollback_does_not_stop_the_unwind() {
    let dev = formatted(&FormatOptions::new());
    let events = Events::default();
    let faults = Faults {
        oid_init: true,
        journal_done: true,
        ..Faults::default()
    };

    let err = Format40::mount(dev.clone(), MountOptions::new(), recording(&dev, &events, faults))
        .err()
        .unwrap();
    assert!(matches!(err.source, F40Error::Collaborator { component: "oid allocator", .. }));
    assert_eq!(err.unwound.last(), Some(&Stage::JournalInfo));
    assert_eq!(events.take().last(), Some(&"journal done"));
}

#[test]
fn every_stage_runs_once_on_a_clean_mount() {
    let dev = formatted(&FormatOptions::new());
    let events = Events::default();
    let volume =
        Format40::mount(dev.clone(), MountOptions::new(), recording(&dev, &events, Faults::default()))
            .unwrap();
    assert_eq!(
        events.take(),
        vec!["journal init", "eflush init", "replay", "tree open", "oid init", "tree init", "recover"]
    );

    volume.unmount();
    assert_eq!(events.take(), vec!["tree done", "eflush done", "journal done"]);
}

#[test]
fn failed_commit_at_unmount_is_not_fatal() {
    let dev = formatted(&FormatOptions::new());
    let events = Events::default();
    let faults = Faults {
        commit: true,
        ..Faults::default()
    };
    let volume = Format40::mount(dev.clone(), MountOptions::new(), recording(&dev, &events, faults))
        .unwrap();
    let before = dev.read_vec(FORMAT_BLOCK).unwrap();

    assert_eq!(volume.unmount().len(), 6);
    assert_eq!(dev.read_vec(FORMAT_BLOCK).unwrap(), before);
}

#[test]
fn failed_commit_leaves_disk_and_tally_untouched() {
    let dev = formatted(&FormatOptions::new());
    let events = Events::default();
    let faults = Faults {
        commit: true,
        ..Faults::default()
    };
    let mut volume = Format40::mount(dev.clone(), MountOptions::new(), recording(&dev, &events, faults))
        .unwrap();
    let before = dev.read_vec(FORMAT_BLOCK).unwrap();

    let mut atom = Atom::new();
    volume
        .allocate(&mut atom, &AllocRequest::forward(0).with_len(4, 4))
        .unwrap();
    assert!(matches!(volume.commit(atom), Err(F40Error::Io(_))));

    assert!(volume.has_failed_commit());
    assert_eq!(volume.super_descriptor().flushes, 0);
    assert_eq!(volume.super_descriptor().free_blocks, FRESH_FREE);
    assert_eq!(volume.status().query().0, StatusCode::IoError);
    assert!(matches!(volume.pack(), Err(F40Error::InvalidRequest(_))));
    assert!(matches!(volume.commit(Atom::new()), Err(F40Error::InvalidRequest(_))));
    assert!(matches!(
        volume.pre_commit(&mut Atom::new()),
        Err(F40Error::InvalidRequest(_))
    ));

    volume.unmount();
    assert_eq!(dev.read_vec(FORMAT_BLOCK).unwrap(), before);

    let volume = mount(&dev, MountOptions::new().preload_bitmaps(true)).unwrap();
    assert_eq!(volume.status_decision(), StatusDecision::PreferReadOnly);
    assert_eq!(volume.super_descriptor().free_blocks, FRESH_FREE);
    assert_eq!(volume.allocator().count_committed_free().unwrap(), FRESH_FREE);
    volume.unmount();
}

#[test]
fn metadata_blocks_cannot_be_freed() {
    let dev = formatted(&FormatOptions::new());
    let volume = mount(&dev, MountOptions::new()).unwrap();
    let mut atom = Atom::new();
    for blocknr in [FORMAT_BLOCK, 130, 133, 4064, 8128] {
        assert!(matches!(
            volume.free(&mut atom, BlockRange::new(blocknr, 1)),
            Err(F40Error::InvalidRequest(_))
        ));
    }
    assert_eq!(volume.allocator().free_blocks(), FRESH_FREE);
    assert!(volume.pre_commit(&mut atom).unwrap().is_empty());
    let next = volume
        .allocate(&mut Atom::new(), &AllocRequest::forward(FORMAT_BLOCK))
        .unwrap();
    assert_eq!(next, BlockRange::new(135, 1));
    volume.unmount();
}

#[test]
fn relocated_metadata_is_protected_at_its_new_block() {
    let opts = FormatOptions::new()
        .relocate(FixmapLabel::Status, 0, 700)
        .relocate(FixmapLabel::Bitmap, 1, 800);
    let dev = formatted(&opts);
    let volume = mount(&dev, MountOptions::new()).unwrap();
    let mut atom = Atom::new();
    // The disk map itself sits at the first free block.
    for blocknr in [135, 700, 800] {
        assert!(volume.free(&mut atom, BlockRange::new(blocknr, 1)).is_err());
    }
    volume.unmount();
}

#[test]
fn committed_allocations_survive_remount() {
    let dev = formatted(&FormatOptions::new());
    let mut volume = mount(&dev, MountOptions::new()).unwrap();
    assert_eq!(volume.super_descriptor().free_blocks, FRESH_FREE);

    let mut atom = Atom::new();
    let a = volume
        .allocate(&mut atom, &AllocRequest::forward(0).with_len(8, 8))
        .unwrap();
    let b = volume
        .allocate(&mut atom, &AllocRequest::forward(5000).with_len(1, 16))
        .unwrap();
    assert_eq!(a, BlockRange::new(135, 8));
    assert_eq!(b, BlockRange::new(5000, 16));

    let touched = volume.commit(atom).unwrap();
    assert_eq!(touched.iter().map(|(g, _)| g).collect::<Vec<_>>(), vec![0, 1]);
    assert_eq!(on_disk_super(&dev).free_blocks, FRESH_FREE - 24);

    // Allocated but never committed.
    let lost = volume
        .allocate(&mut Atom::new(), &AllocRequest::forward(0))
        .unwrap();
    assert_eq!(lost, BlockRange::new(143, 1));
    volume.unmount();

    let volume = mount(&dev, MountOptions::new().preload_bitmaps(true)).unwrap();
    let sb = volume.super_descriptor();
    assert_eq!(sb.free_blocks, FRESH_FREE - 24);
    assert_eq!(sb.flushes, 2);
    let alloc = volume.allocator();
    assert!(alloc.check_range(a, false).unwrap());
    assert!(alloc.check_range(b, false).unwrap());
    assert!(alloc.check_range(lost, true).unwrap());
    assert_eq!(alloc.count_committed_free().unwrap(), sb.free_blocks);
    volume.unmount();
}

#[test]
fn freed_blocks_stay_used_on_disk_until_commit() {
    let dev = formatted(&FormatOptions::new());
    let mut volume = mount(&dev, MountOptions::new()).unwrap();
    let mut atom = Atom::new();
    let range = volume
        .allocate(&mut atom, &AllocRequest::forward(300).with_len(4, 4))
        .unwrap();
    volume.commit(atom).unwrap();

    let mut atom = Atom::new();
    volume.free(&mut atom, range).unwrap();
    let reused = volume
        .allocate(&mut Atom::new(), &AllocRequest::forward(300))
        .unwrap();
    assert_eq!(reused.start, range.start);
    assert_eq!(on_disk_super(&dev).free_blocks, FRESH_FREE - 4);

    volume.free(&mut Atom::new(), reused).unwrap();
    volume.commit(atom).unwrap();
    assert_eq!(on_disk_super(&dev).free_blocks, FRESH_FREE);
    volume.unmount();
}

#[test]
fn pack_reports_committed_free_count() {
    let dev = formatted(&FormatOptions::new());
    let volume = mount(&dev, MountOptions::new()).unwrap();
    let mut atom = Atom::new();
    volume
        .allocate(&mut atom, &AllocRequest::backward(BLOCK_COUNT - 1).with_len(10, 10))
        .unwrap();

    assert_eq!(volume.allocator().free_blocks(), FRESH_FREE - 10);
    let packed = SuperDescriptor::parse(&volume.pack().unwrap()).unwrap();
    assert_eq!(packed.free_blocks, FRESH_FREE);

    let touched = volume.pre_commit(&mut atom).unwrap();
    assert_eq!(touched.len(), 1);
    let packed = SuperDescriptor::parse(&volume.pack().unwrap()).unwrap();
    assert_eq!(packed.free_blocks, FRESH_FREE - 10);

    let overwrite = atom.overwrite_set();
    assert!(overwrite.contains_key(&FORMAT_BLOCK));
    assert!(verify_checksum(&overwrite[&8128]));
    volume.unmount();
}

#[test]
fn concurrent_allocations_never_overlap() {
    let dev = formatted(&FormatOptions::new());
    let volume = mount(&dev, MountOptions::new()).unwrap();
    let alloc = volume.allocator();

    let ranges: Vec<BlockRange> = std::thread::scope(|s| {
        let workers: Vec<_> = (0..8u64)
            .map(|t| {
                s.spawn(move || {
                    (0..100)
                        .map(|i| {
                            let req = AllocRequest::forward(200 + t * 1000).with_len(1, 1 + i % 3);
                            alloc.allocate(&req).unwrap()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect()
    });

    let mut seen = HashSet::new();
    let mut total = 0;
    for range in &ranges {
        total += range.len;
        for blocknr in range.blocks() {
            assert!(seen.insert(blocknr), "block {} allocated twice", blocknr);
        }
    }
    assert_eq!(alloc.free_blocks(), FRESH_FREE - total);
    volume.unmount();
}

#[test]
fn relocated_metadata_is_found_through_the_disk_map() {
    let opts = FormatOptions::new()
        .relocate(FixmapLabel::Format, 0, 601)
        .relocate(FixmapLabel::Status, 0, 600)
        .relocate(FixmapLabel::Bitmap, 1, 602)
        .with_diskmap_block(700);
    let dev = formatted(&opts);

    let mut volume = mount(&dev, MountOptions::new()).unwrap();
    assert_eq!(volume.master().diskmap, Some(700));
    assert_eq!(volume.locations().format, 601);
    assert_eq!(volume.locations().status, 600);
    assert_eq!(volume.allocator().bitmap_block(1).unwrap(), 602);

    let mut atom = Atom::new();
    let range = volume
        .allocate(&mut atom, &AllocRequest::forward(4064))
        .unwrap();
    assert_eq!(range, BlockRange::new(4064, 1));
    volume.commit(atom).unwrap();
    assert!(verify_checksum(&dev.read_vec(602).unwrap()));
    volume.unmount();

    let volume = mount(&dev, MountOptions::new()).unwrap();
    assert!(volume.allocator().check_range(range, false).unwrap());
    volume.unmount();
}

#[test]
fn broken_disk_map_fails_the_mount() {
    let dev = formatted(&FormatOptions::new());
    let err = mount(&dev, "diskmap=900".parse().unwrap()).err().unwrap();
    assert_eq!(err.stage, Stage::Locate);
    assert!(matches!(err.source, F40Error::ConfigCorrupt { block: 900, .. }));
    assert!(!err.is_retryable());
}

#[test]
fn corrupt_group_fails_preload_but_not_a_lazy_mount() {
    let dev = formatted(&FormatOptions::new());
    let mut bitmap = dev.read_vec(8128).unwrap();
    bitmap[40] ^= 0x10;
    dev.write_block(8128, &bitmap).unwrap();

    let err = mount(&dev, MountOptions::new().preload_bitmaps(true))
        .err()
        .unwrap();
    assert_eq!(err.stage, Stage::SpaceInit);
    assert!(matches!(err.source, F40Error::BitmapCorrupt { group: 2, .. }));
    assert_eq!(
        err.unwound,
        vec![Stage::KeyCheck, Stage::Status, Stage::Eflush, Stage::JournalInfo]
    );

    let volume = mount(&dev, MountOptions::new()).unwrap();
    let mut atom = Atom::new();
    volume
        .allocate(&mut atom, &AllocRequest::forward(200))
        .unwrap();
    let err = volume
        .allocate(&mut atom, &AllocRequest::forward(9000))
        .unwrap_err();
    assert!(matches!(err, F40Error::BitmapCorrupt { group: 2, .. }));
    assert_eq!(volume.status().query().0, StatusCode::Corrupted);
    volume.unmount();

    let volume = mount(&dev, MountOptions::new()).unwrap();
    assert_eq!(volume.status_decision(), StatusDecision::Warn);
    volume.unmount();
}

#[test]
fn oids_are_persisted_in_the_super_block() {
    let dev = formatted(&FormatOptions::new());
    let mut volume = mount(&dev, MountOptions::new()).unwrap();
    let first = volume.allocate_oid().unwrap();
    assert_eq!(first, mkfs::FIRST_OID);
    volume.allocate_oid().unwrap();
    volume.unmount();

    let sb = on_disk_super(&dev);
    assert_eq!(sb.oid, mkfs::FIRST_OID + 2);
    assert_eq!(sb.file_count, 2);
}

#[test]
fn file_backed_volume_round_trips() {
    init();
    let tf = NamedTempFile::new().unwrap();
    let dev: Arc<dyn BlockStorage> = Arc::new(
        FileBlockEmulatorBuilder::from(tf.reopen().unwrap())
            .with_block_size(4096)
            .with_block_count(2048)
            .build()
            .unwrap(),
    );
    let sb = mkfs::format(&*dev, &FormatOptions::new().with_label("tmp")).unwrap();
    // 0..=22 fixed, one group.
    assert_eq!(sb.free_blocks, 2048 - 23);

    let mut volume = mount(&dev, MountOptions::new()).unwrap();
    let mut atom = Atom::new();
    let range = volume
        .allocate(&mut atom, &AllocRequest::forward(1000).with_len(32, 64))
        .unwrap();
    assert_eq!(range, BlockRange::new(1000, 64));
    volume.commit(atom).unwrap();
    volume.unmount();
    drop(dev);

    let dev: Arc<dyn BlockStorage> = Arc::new(FileBlockEmulator::open(tf.path(), 4096).unwrap());
    assert_eq!(dev.block_count(), 2048);
    let volume = mount(&dev, MountOptions::new()).unwrap();
    assert_eq!(volume.super_descriptor().free_blocks, 2048 - 23 - 64);
    assert!(volume.allocator().check_range(range, false).unwrap());
    volume.unmount();
}
