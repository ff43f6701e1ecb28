//! The persisted health record of a volume.
//!
//! The record is read once at mount and cached. Updates go to the cache and
//! are queued for a background writer: callers reporting a failure are often
//! already on an error path and must not block on the device.

use crate::error::{F40Error, Result};
use crate::io::BlockStorage;
use crate::layout::BlockNumber;
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use zerocopy::byteorder::{LittleEndian, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

pub const STATUS_MAGIC: &[u8; 16] = b"ReiSeR4StATusBl\0";
pub const MESSAGE_LEN: usize = 256;
pub const BREADCRUMBS: usize = 10;

const RAW_OK: u64 = 0x0;
const RAW_CORRUPTED: u64 = 0x1;
const RAW_DAMAGED: u64 = 0x2;
const RAW_DESTROYED: u64 = 0x4;
const RAW_IOERROR: u64 = 0x8;
const RAW_KNOWN: u64 = RAW_CORRUPTED | RAW_DAMAGED | RAW_DESTROYED | RAW_IOERROR;

/// Volume health, in ascending severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    Corrupted,
    Damaged,
    Destroyed,
    IoError,
    /// Bits this implementation does not know about.
    Unknown(u64),
}

impl StatusCode {
    /// Decodes a raw status word. When several known bits are set the most
    /// severe one wins.
    pub fn from_raw(raw: u64) -> Self {
        if raw & !RAW_KNOWN != 0 {
            StatusCode::Unknown(raw)
        } else if raw & RAW_IOERROR != 0 {
            StatusCode::IoError
        } else if raw & RAW_DESTROYED != 0 {
            StatusCode::Destroyed
        } else if raw & RAW_DAMAGED != 0 {
            StatusCode::Damaged
        } else if raw & RAW_CORRUPTED != 0 {
            StatusCode::Corrupted
        } else {
            StatusCode::Ok
        }
    }

    pub fn to_raw(self) -> u64 {
        match self {
            StatusCode::Ok => RAW_OK,
            StatusCode::Corrupted => RAW_CORRUPTED,
            StatusCode::Damaged => RAW_DAMAGED,
            StatusCode::Destroyed => RAW_DESTROYED,
            StatusCode::IoError => RAW_IOERROR,
            StatusCode::Unknown(raw) => raw,
        }
    }
}

/// What the recorded status suggests the mounting caller should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusDecision {
    Proceed,
    /// Mount, but warn: the volume was found corrupted before.
    Warn,
    PreferReadOnly,
    Unknown,
}

pub fn mount_decision(code: StatusCode) -> StatusDecision {
    match code {
        StatusCode::Ok => StatusDecision::Proceed,
        StatusCode::Corrupted => StatusDecision::Warn,
        StatusCode::Damaged | StatusCode::Destroyed | StatusCode::IoError => {
            StatusDecision::PreferReadOnly
        }
        StatusCode::Unknown(_) => StatusDecision::Unknown,
    }
}

#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes)]
struct RawStatus {
    magic: [u8; 16],
    status: U64<LittleEndian>,
    extended: U64<LittleEndian>,
    breadcrumbs: [U64<LittleEndian>; BREADCRUMBS],
    message: [u8; MESSAGE_LEN],
}

/// Decoded contents of the status block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatusRecord {
    pub status: u64,
    pub extended: u64,
    /// Call sites of the most recent writes, `line << 32 | column`, newest
    /// first. One location is kept per write, so the slots trace the last
    /// few reports rather than one call stack. Zero slots are empty.
    pub breadcrumbs: [u64; BREADCRUMBS],
    pub message: String,
}

impl StatusRecord {
    fn parse(buf: &[u8], blocknr: BlockNumber) -> Result<Self> {
        let raw = RawStatus::read_from_prefix(buf).ok_or_else(|| F40Error::StatusCorrupt {
            block: blocknr,
            detail: "truncated status block".to_string(),
        })?;
        if &raw.magic != STATUS_MAGIC {
            return Err(F40Error::StatusCorrupt {
                block: blocknr,
                detail: "magic mismatch".to_string(),
            });
        }
        let text_len = raw
            .message
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MESSAGE_LEN);
        let mut breadcrumbs = [0u64; BREADCRUMBS];
        for (slot, raw) in breadcrumbs.iter_mut().zip(raw.breadcrumbs.iter()) {
            *slot = raw.get();
        }
        Ok(Self {
            status: raw.status.get(),
            extended: raw.extended.get(),
            breadcrumbs,
            message: String::from_utf8_lossy(&raw.message[..text_len]).into_owned(),
        })
    }

    fn serialize(&self, block_size: usize) -> Vec<u8> {
        let mut raw = RawStatus::new_zeroed();
        raw.magic = *STATUS_MAGIC;
        raw.status = U64::new(self.status);
        raw.extended = U64::new(self.extended);
        for (slot, crumb) in raw.breadcrumbs.iter_mut().zip(self.breadcrumbs.iter()) {
            *slot = U64::new(*crumb);
        }
        let text = truncate_to_boundary(&self.message, MESSAGE_LEN - 1);
        raw.message[..text.len()].copy_from_slice(text.as_bytes());

        let mut buf = vec![0u8; block_size];
        buf[..std::mem::size_of::<RawStatus>()].copy_from_slice(raw.as_bytes());
        buf
    }
}

fn truncate_to_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Writes a fresh `Ok` record to `blocknr`.
pub fn write_initial(dev: &dyn BlockStorage, blocknr: BlockNumber) -> Result<()> {
    let record = StatusRecord::default();
    dev.write_block(blocknr, &record.serialize(dev.block_size()))?;
    Ok(())
}

struct StatusWriter {
    queue: mpsc::Sender<Vec<u8>>,
    thread: JoinHandle<()>,
}

/// Open handle on a volume's status block.
pub struct StatusBlock {
    blocknr: BlockNumber,
    block_size: usize,
    cache: Mutex<StatusRecord>,
    writer: Mutex<Option<StatusWriter>>,
}

impl StatusBlock {
    /// Reads and validates the status record at `blocknr` and starts the
    /// background writer.
    pub fn init(dev: Arc<dyn BlockStorage>, blocknr: BlockNumber) -> Result<Self> {
        let buf = dev.read_vec(blocknr)?;
        let record = StatusRecord::parse(&buf, blocknr)?;
        debug!(
            "status block {}: status {:#x} extended {:#x}",
            blocknr, record.status, record.extended
        );

        let block_size = dev.block_size();
        let (queue, pending) = mpsc::channel::<Vec<u8>>();
        let thread = std::thread::Builder::new()
            .name("f40-status".to_string())
            .spawn(move || {
                for buf in pending {
                    if let Err(e) = dev.write_block(blocknr, &buf) {
                        warn!("status block {} write failed: {}", blocknr, e);
                    }
                }
            })?;

        Ok(Self {
            blocknr,
            block_size,
            cache: Mutex::new(record),
            writer: Mutex::new(Some(StatusWriter { queue, thread })),
        })
    }

    pub fn blocknr(&self) -> BlockNumber {
        self.blocknr
    }

    /// Decodes the cached status. Does no I/O.
    pub fn query(&self) -> (StatusCode, u64) {
        let cache = self.cache.lock();
        (StatusCode::from_raw(cache.status), cache.extended)
    }

    pub fn record(&self) -> StatusRecord {
        self.cache.lock().clone()
    }

    /// Records a new status and queues it for writing. Never waits for the
    /// device.
    #[track_caller]
    pub fn write(&self, status: StatusCode, extended: u64, message: &str) {
        let caller = std::panic::Location::caller();
        let buf = {
            let mut cache = self.cache.lock();
            cache.status = status.to_raw();
            cache.extended = extended;
            cache.message = truncate_to_boundary(message, MESSAGE_LEN - 1).to_string();
            cache.breadcrumbs.copy_within(..BREADCRUMBS - 1, 1);
            cache.breadcrumbs[0] = ((caller.line() as u64) << 32) | caller.column() as u64;
            cache.serialize(self.block_size)
        };
        debug!(
            "status {:?} ({:#x}) reported from {}:{}",
            status,
            extended,
            caller.file(),
            caller.line()
        );

        match self.writer.lock().as_ref() {
            Some(writer) => {
                if writer.queue.send(buf).is_err() {
                    warn!("status writer for block {} is gone", self.blocknr);
                }
            }
            None => warn!("status block {} written after finish", self.blocknr),
        }
    }

    /// Stops the writer after it drained the queue and releases the device.
    pub fn finish(self) {
        drop(self)
    }

    fn shutdown(&self) {
        if let Some(StatusWriter { queue, thread }) = self.writer.lock().take() {
            drop(queue);
            if thread.join().is_err() {
                warn!("status writer for block {} panicked", self.blocknr);
            }
        }
    }
}

impl Drop for StatusBlock {
    fn drop(&mut self) {
        self.shutdown();
    }
}
