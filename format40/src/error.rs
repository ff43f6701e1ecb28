use crate::layout::{BlockNumber, KeyFormat};
use thiserror::Error;

/// Errors raised by the format40 layer.
///
/// Format and configuration errors abort a mount and are not worth retrying.
/// `OutOfSpace` is an ordinary allocation outcome and callers are expected to
/// handle it without treating the volume as unhealthy.
#[derive(Error, Debug)]
pub enum F40Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a format40 volume: {0}")]
    NotAReiserVolume(String),
    #[error("disk map block {block} is corrupt: {detail}")]
    ConfigCorrupt { block: BlockNumber, detail: String },
    #[error("bitmap of group {group} is corrupt: {detail}")]
    BitmapCorrupt { group: u32, detail: String },
    #[error("super block is corrupt: {0}")]
    SuperCorrupt(String),
    #[error("status block {block} is invalid: {detail}")]
    StatusCorrupt { block: BlockNumber, detail: String },
    #[error("key format mismatch: volume uses {on_disk:?} keys, mount requested {requested:?}")]
    KeyFormatMismatch {
        on_disk: KeyFormat,
        requested: KeyFormat,
    },
    #[error("no free space")]
    OutOfSpace,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid option: {0}")]
    InvalidOption(String),
    #[error("{component} failed: {detail}")]
    Collaborator {
        component: &'static str,
        detail: String,
    },
}

pub type Result<T> = std::result::Result<T, F40Error>;

impl F40Error {
    pub fn collaborator(component: &'static str, detail: impl Into<String>) -> Self {
        F40Error::Collaborator {
            component,
            detail: detail.into(),
        }
    }

    /// Format, configuration and corruption errors describe the medium
    /// itself; retrying the same operation against the same device cannot
    /// succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            F40Error::Io(_) | F40Error::OutOfSpace | F40Error::Collaborator { .. } => true,
            F40Error::NotAReiserVolume(_)
            | F40Error::ConfigCorrupt { .. }
            | F40Error::BitmapCorrupt { .. }
            | F40Error::SuperCorrupt(_)
            | F40Error::StatusCorrupt { .. }
            | F40Error::KeyFormatMismatch { .. }
            | F40Error::InvalidRequest(_)
            | F40Error::InvalidOption(_) => false,
        }
    }

    /// The POSIX errno a VFS binding would report for this error.
    pub fn errno(&self) -> i32 {
        const EIO: i32 = 5;
        const EINVAL: i32 = 22;
        const ENOSPC: i32 = 28;
        const EUCLEAN: i32 = 117;
        match self {
            F40Error::Io(_) => EIO,
            F40Error::NotAReiserVolume(_) => EINVAL,
            F40Error::ConfigCorrupt { .. } => EUCLEAN,
            F40Error::BitmapCorrupt { .. } => EUCLEAN,
            F40Error::SuperCorrupt(_) => EUCLEAN,
            F40Error::StatusCorrupt { .. } => EINVAL,
            F40Error::KeyFormatMismatch { .. } => EINVAL,
            F40Error::OutOfSpace => ENOSPC,
            F40Error::InvalidRequest(_) => EINVAL,
            F40Error::InvalidOption(_) => EINVAL,
            F40Error::Collaborator { .. } => EIO,
        }
    }
}
