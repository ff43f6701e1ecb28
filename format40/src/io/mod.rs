mod block;
mod emulator;
mod mem;

pub use block::BlockStorage;
pub use emulator::{FileBlockEmulator, FileBlockEmulatorBuilder, DEFAULT_BLOCK_SIZE};
pub use mem::MemBlockDevice;
