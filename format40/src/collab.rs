//! Components the mount sequence drives but does not own.
//!
//! A full filesystem plugs its journal, tree and transaction manager in here.
//! The standalone implementations are enough to format, mount and commit an
//! image that has no journal.

use crate::error::{F40Error, Result};
use crate::io::BlockStorage;
use crate::layout::{BlockNumber, KeyFormat};
use crate::sb::SuperDescriptor;
use log::debug;
use std::collections::BTreeMap;
use std::sync::Arc;

pub trait Journal: Send {
    /// Sets up the in-memory journal control structures.
    fn init_journal_info(&mut self, header: BlockNumber, footer: BlockNumber) -> Result<()>;
    fn done_journal_info(&mut self) -> Result<()>;
    /// Replays committed but unapplied transactions. May rewrite the super
    /// descriptor on disk.
    fn replay(&mut self, dev: &dyn BlockStorage) -> Result<()>;
    /// Reconciles descriptor fields the journal tracks on its own.
    fn recover_super_fields(&mut self, sb: &mut SuperDescriptor) -> Result<()>;
}

/// Emergency eviction of dirty pages under memory pressure.
pub trait EmergencyFlush: Send {
    fn init(&mut self) -> Result<()>;
    fn done(&mut self) -> Result<()>;
}

pub trait TreeHandle: Send {
    fn open(&mut self, keys: KeyFormat) -> Result<()>;
    fn init(&mut self, root: BlockNumber, height: u16) -> Result<()>;
    fn done(&mut self) -> Result<()>;
    fn root(&self) -> BlockNumber;
    fn height(&self) -> u16;
}

pub trait OidAllocator: Send {
    fn init(&mut self, next_oid: u64, file_count: u64) -> Result<()>;
    /// Hands out the next object id.
    fn allocate(&mut self) -> Result<u64>;
    fn next_oid(&self) -> u64;
    fn file_count(&self) -> u64;
}

pub trait TxnManager: Send {
    /// Queues a block image to be written when the transaction commits.
    fn capture(&mut self, blocknr: BlockNumber, data: Vec<u8>) -> Result<()>;
    /// Commits everything captured so far and waits for it to be durable.
    fn force_commit_all(&mut self) -> Result<()>;
}

/// Everything a mount needs from the outside.
pub struct Collaborators {
    pub journal: Box<dyn Journal>,
    pub eflush: Box<dyn EmergencyFlush>,
    pub tree: Box<dyn TreeHandle>,
    pub oids: Box<dyn OidAllocator>,
    pub txn: Box<dyn TxnManager>,
}

impl Collaborators {
    /// Journal-less collaborators writing commits straight to `dev`.
    pub fn standalone(dev: Arc<dyn BlockStorage>) -> Self {
        Self {
            journal: Box::new(NoJournal),
            eflush: Box::new(NoFlush),
            tree: Box::new(SimpleTree::default()),
            oids: Box::new(CounterOids::default()),
            txn: Box::new(DirectCommit::new(dev)),
        }
    }
}

/// A journal with nothing to replay.
#[derive(Debug, Default)]
pub struct NoJournal;

impl Journal for NoJournal {
    fn init_journal_info(&mut self, header: BlockNumber, footer: BlockNumber) -> Result<()> {
        debug!("journal header {} footer {} unused", header, footer);
        Ok(())
    }

    fn done_journal_info(&mut self) -> Result<()> {
        Ok(())
    }

    fn replay(&mut self, _dev: &dyn BlockStorage) -> Result<()> {
        Ok(())
    }

    fn recover_super_fields(&mut self, _sb: &mut SuperDescriptor) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct NoFlush;

impl EmergencyFlush for NoFlush {
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn done(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Remembers the root and height it was given.
#[derive(Debug, Default)]
pub struct SimpleTree {
    keys: Option<KeyFormat>,
    root: BlockNumber,
    height: u16,
}

impl SimpleTree {
    pub fn keys(&self) -> Option<KeyFormat> {
        self.keys
    }

    pub fn set_root(&mut self, root: BlockNumber, height: u16) {
        self.root = root;
        self.height = height;
    }
}

impl TreeHandle for SimpleTree {
    fn open(&mut self, keys: KeyFormat) -> Result<()> {
        self.keys = Some(keys);
        Ok(())
    }

    fn init(&mut self, root: BlockNumber, height: u16) -> Result<()> {
        if self.keys.is_none() {
            return Err(F40Error::collaborator("tree", "initialized before open"));
        }
        self.set_root(root, height);
        Ok(())
    }

    fn done(&mut self) -> Result<()> {
        self.keys = None;
        Ok(())
    }

    fn root(&self) -> BlockNumber {
        self.root
    }

    fn height(&self) -> u16 {
        self.height
    }
}

/// Sequential object ids.
#[derive(Debug, Default)]
pub struct CounterOids {
    next: u64,
    files: u64,
}

impl OidAllocator for CounterOids {
    fn init(&mut self, next_oid: u64, file_count: u64) -> Result<()> {
        self.next = next_oid;
        self.files = file_count;
        Ok(())
    }

    fn allocate(&mut self) -> Result<u64> {
        let oid = self.next;
        self.next = oid
            .checked_add(1)
            .ok_or_else(|| F40Error::collaborator("oid allocator", "object ids exhausted"))?;
        self.files += 1;
        Ok(oid)
    }

    fn next_oid(&self) -> u64 {
        self.next
    }

    fn file_count(&self) -> u64 {
        self.files
    }
}

/// Writes captured blocks in place on commit, without a journal.
pub struct DirectCommit {
    dev: Arc<dyn BlockStorage>,
    pending: BTreeMap<BlockNumber, Vec<u8>>,
}

impl DirectCommit {
    pub fn new(dev: Arc<dyn BlockStorage>) -> Self {
        Self {
            dev,
            pending: BTreeMap::new(),
        }
    }
}

impl TxnManager for DirectCommit {
    fn capture(&mut self, blocknr: BlockNumber, data: Vec<u8>) -> Result<()> {
        self.pending.insert(blocknr, data);
        Ok(())
    }

    /// Captured blocks stay queued until every write and the sync succeed,
    /// so a failed commit can be forced again.
    fn force_commit_all(&mut self) -> Result<()> {
        for (&blocknr, data) in &self.pending {
            self.dev.write_block(blocknr, data)?;
        }
        self.dev.sync_disk()?;
        debug!("committed {} blocks in place", self.pending.len());
        self.pending.clear();
        Ok(())
    }
}
