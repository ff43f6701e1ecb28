use crate::layout::BlockNumber;

/// Block-granular access to the medium backing a volume.
///
/// Devices are shared between the allocator, the status writer and the mount
/// sequencer, so every method takes `&self` and implementations provide their
/// own interior locking.
pub trait BlockStorage: Send + Sync {
    /// Size in bytes of every block on this device.
    fn block_size(&self) -> usize;
    /// Total number of blocks available.
    fn block_count(&self) -> u64;
    /// Reads disk block number into provided buffer.
    ///
    /// # Errors
    ///
    /// Attempting to read a block out of range, or into a buffer shorter
    /// than one block, will return an error.
    fn read_block(&self, blocknr: BlockNumber, buf: &mut [u8]) -> std::io::Result<()>;
    /// Writes provided buffer into the specified block number. Buffers longer
    /// than a block are truncated; shorter ones only overwrite the head of
    /// the block.
    ///
    /// # Errors
    ///
    /// Attempting to write a block out of range will return an error.
    fn write_block(&self, blocknr: BlockNumber, buf: &[u8]) -> std::io::Result<()>;
    /// Flush any buffered disk IO from memory. This is useful if it must guaranteed
    /// the disk writes actually occurred, for instance, if being re-read from
    /// disk.
    fn sync_disk(&self) -> std::io::Result<()>;

    /// Reads a block into a freshly allocated buffer.
    fn read_vec(&self, blocknr: BlockNumber) -> std::io::Result<Vec<u8>> {
        let mut buf = vec![0; self.block_size()];
        self.read_block(blocknr, &mut buf)?;
        Ok(buf)
    }
}

pub(crate) fn out_of_range(blocknr: BlockNumber, count: u64) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        format!("block {} out of range ({} blocks)", blocknr, count),
    )
}

pub(crate) fn short_buffer(len: usize, block_size: usize) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        format!(
            "buffer of {} bytes does not contain enough space to read a {} byte block",
            len, block_size
        ),
    )
}
