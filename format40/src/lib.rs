//! Space allocation and mount layer of the format40 disk layout.
//!
//! A volume is a sequence of fixed size blocks split into groups, each group
//! tracked by one checksummed bitmap block. [`Format40::mount`] brings a
//! volume up through an ordered sequence of stages and hands back a
//! [`MountedVolume`] whose [`alloc::BitmapAllocator`] hands out and reclaims
//! block ranges. Allocations become durable only when the transaction that
//! made them commits.

pub mod alloc;
pub mod collab;
pub mod diskmap;
mod error;
mod fs;
pub mod io;
pub mod layout;
pub mod mkfs;
mod options;
pub mod sb;
pub mod stage;
pub mod status;
pub mod txn;

pub use crate::error::{F40Error, Result};
pub use crate::fs::{Format40, Locations, MountError, MountedVolume};
pub use crate::layout::{BlockNumber, KeyFormat};
pub use crate::options::MountOptions;
pub use crate::stage::Stage;
