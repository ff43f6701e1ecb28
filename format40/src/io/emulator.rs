use super::block::{out_of_range, short_buffer, BlockStorage};
use crate::layout::BlockNumber;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::prelude::*;
use std::io::{BufWriter, ErrorKind, SeekFrom};
use std::path::Path;

/// 4k is a common block size for file systems. Disks commonly are composed of
/// 512 byte blocks mapping each file system block to 8 hard disk blocks.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Emulates block disk/flash storage in userspace using a file as block storage.
/// This is only meant to be used for file system development and testing.
pub struct FileBlockEmulator {
    /// The file must be a fixed-size file some exact multiple of the size of a block.
    fd: Mutex<File>,
    block_size: usize,
    /// The total number of blocks available in the file store.
    block_count: u64,
}

impl FileBlockEmulator {
    /// Opens an existing image without touching its contents. The block count
    /// is the file length rounded down to whole blocks.
    pub fn open<P: AsRef<Path>>(path: P, block_size: usize) -> std::io::Result<Self> {
        // Return error if the file does not exist rather than create one.
        let fd = OpenOptions::new().read(true).write(true).open(path)?;
        let len = fd.metadata()?.len();
        let block_count = len / block_size as u64;
        if block_count == 0 {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "image is smaller than one block",
            ));
        }
        Ok(FileBlockEmulator {
            fd: Mutex::new(fd),
            block_size,
            block_count,
        })
    }

    /// Returns ownership of the underlying file descriptor to the caller.
    pub fn into_file(self) -> File {
        self.fd.into_inner()
    }
}

impl BlockStorage for FileBlockEmulator {
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
        let mut fd = self.fd.lock();
        fd.seek(SeekFrom::Start(blocknr * self.block_size as u64))?;
        fd.read_exact(&mut buf[..self.block_size])
    }

    /// This method truncates writes that exceed the total block size.
    fn write_block(&self, blocknr: BlockNumber, buf: &[u8]) -> std::io::Result<()> {
        if blocknr >= self.block_count {
            return Err(out_of_range(blocknr, self.block_count));
        }
        let max = buf.len().min(self.block_size);
        let mut fd = self.fd.lock();
        fd.seek(SeekFrom::Start(blocknr * self.block_size as u64))?;
        fd.write_all(&buf[..max])
    }

    fn sync_disk(&self) -> std::io::Result<()> {
        self.fd.lock().sync_all()
    }
}

pub struct FileBlockEmulatorBuilder {
    fd: File,
    block_size: usize,
    block_count: u64,
    clear_medium: bool,
}

impl From<File> for FileBlockEmulatorBuilder {
    fn from(fd: File) -> Self {
        FileBlockEmulatorBuilder {
            fd,
            block_size: DEFAULT_BLOCK_SIZE,
            block_count: 0,
            clear_medium: true,
        }
    }
}

impl FileBlockEmulatorBuilder {
    /// Sets the number of desired blocks in the block store device.
    pub fn with_block_count(mut self, blocks: u64) -> Self {
        self.block_count = blocks;
        self
    }

    /// Sets the size of a single block in bytes.
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Whether `build` zeroes the whole medium. Disable to reopen an image
    /// that was already formatted.
    pub fn clear_medium(mut self, clear: bool) -> Self {
        self.clear_medium = clear;
        self
    }

    /// This builder assumed ownership of the file descriptor used and does
    /// destructive things to prepare the file for use. Additionally, ownership
    /// of the file is transfered to the emulator meaning this builder can only
    /// be used to create one emulator.
    pub fn build(mut self) -> std::io::Result<FileBlockEmulator> {
        if self.block_count == 0 || self.block_size == 0 {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "emulated disk needs a non-zero block size and count",
            ));
        }
        if self.clear_medium {
            self.zero_blocks()?;
        }
        Ok(FileBlockEmulator {
            fd: Mutex::new(self.fd),
            block_size: self.block_size,
            block_count: self.block_count,
        })
    }

    fn zero_blocks(&mut self) -> std::io::Result<()> {
        self.fd.seek(SeekFrom::Start(0))?;
        let zeroes = vec![0x00; self.block_size];
        let mut bfd = BufWriter::new(&self.fd);
        // Zero out the "disk" block, buffering each write to prevent excessive reads.
        for _ in 0..self.block_count {
            bfd.write_all(&zeroes)?;
        }
        bfd.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emulator(blocks: u64) -> FileBlockEmulator {
        let fs_block = tempfile::tempfile().unwrap();
        FileBlockEmulatorBuilder::from(fs_block)
            .with_block_count(blocks)
            .build()
            .expect("failed to allocate file block")
    }

    #[test]
    fn file_emulator_allocates_correct_num_bytes() {
        let disk_emu = emulator(4);
        disk_emu.sync_disk().unwrap();
        assert_eq!(disk_emu.into_file().metadata().unwrap().len(), 4 * 4096);
    }

    #[test]
    fn can_read_and_write_blocks() {
        let disk_emu = emulator(4);

        // Allocate a block with a non-zero character.
        disk_emu.write_block(2, &[0x55; 4096]).unwrap();
        disk_emu.sync_disk().unwrap();

        // Read a different block.
        let mut read_block = vec![0x00; 4096];
        disk_emu.read_block(3, &mut read_block).unwrap();
        assert_eq!(read_block, vec![0x00; 4096]);

        // Read the block with data.
        assert_eq!(disk_emu.read_vec(2).unwrap(), vec![0x55; 4096]);
    }

    #[test]
    fn can_read_and_write_start_and_end_blocks() {
        let disk_emu = emulator(2);

        disk_emu.write_block(0, &[0x11; 4096]).unwrap();
        disk_emu.write_block(1, &[0x22; 4096]).unwrap();
        disk_emu.sync_disk().unwrap();

        assert_eq!(disk_emu.read_vec(0).unwrap(), vec![0x11; 4096]);
        assert_eq!(disk_emu.read_vec(1).unwrap(), vec![0x22; 4096]);
    }

    #[test]
    fn access_beyond_range_returns_error() {
        let disk_emu = emulator(1);
        assert!(disk_emu.write_block(1, &[0x55; 4096]).is_err());
        let mut buf = vec![0; 4096];
        assert!(disk_emu.read_block(1, &mut buf).is_err());
    }

    #[test]
    fn reading_into_short_buffer_fails() {
        let disk_emu = emulator(1);
        let mut buf = vec![0; 512];
        let err = disk_emu.read_block(0, &mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn writing_to_block_with_block_size_lt_max_succeeds() {
        let disk_emu = emulator(1);
        // Fill half the block with meaningful data.
        disk_emu
            .write_block(0, &[0x55; 2048])
            .expect("failed to write block");
        let block = disk_emu.read_vec(0).unwrap();
        assert_eq!(&block[..2048], &[0x55; 2048][..]);
        assert_eq!(&block[2048..], &[0x00; 2048][..]);
    }

    #[test]
    fn reopening_keeps_medium_contents() {
        let disk = tempfile::NamedTempFile::new().unwrap();
        let dev = FileBlockEmulatorBuilder::from(disk.reopen().unwrap())
            .with_block_size(512)
            .with_block_count(8)
            .build()
            .unwrap();
        dev.write_block(7, &[0xAB; 512]).unwrap();
        dev.sync_disk().unwrap();

        let dev = FileBlockEmulator::open(disk.path(), 512).unwrap();
        assert_eq!(dev.block_count(), 8);
        assert_eq!(dev.read_vec(7).unwrap(), vec![0xAB; 512]);
    }
}
