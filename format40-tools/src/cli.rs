use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "f40", about = "Create and examine format40 volume images")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create an image file holding an empty volume
    Format {
        image: PathBuf,

        /// Number of blocks in the image
        #[arg(long, short = 'n', default_value_t = 8192)]
        blocks: u64,

        /// Block size in bytes
        #[arg(long, short, default_value_t = 4096)]
        block_size: usize,

        /// Volume label, at most 16 bytes
        #[arg(long, short, default_value = "")]
        label: String,

        /// Use the short key format
        #[arg(long)]
        short_keys: bool,
    },

    /// Print the master super block, the super descriptor, the status block
    /// and the disk map of an image
    Inspect {
        image: PathBuf,

        /// Block size in bytes
        #[arg(long, short, default_value_t = 4096)]
        block_size: usize,
    },

    /// Mount an image read-only and verify every bitmap against the super block
    Check {
        image: PathBuf,

        /// Block size in bytes
        #[arg(long, short, default_value_t = 4096)]
        block_size: usize,

        /// Extra mount options, e.g. "diskmap=300,keys=short"
        #[arg(long, short, default_value = "")]
        options: String,
    },
}
