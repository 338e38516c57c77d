// SPDX-License-Identifier: MIT

//! FAT12/16/32 volume model with a crash-safe write-ahead journal and a
//! cluster-relocation engine (defragmentation, deliberate fragmentation,
//! and structural-fault injection for recovery testing).

// === Core modules ===
pub mod attr;
pub mod bitmap;
pub mod boot;
pub mod catalog;
pub mod dirent;
pub mod errors;
pub mod fat;
pub mod freemap;
pub mod journal;
pub mod volume;

// === Tools on top of the volume ===
pub mod format;
pub mod fragmenter;
pub mod injector;
pub mod relocator;

// === Prelude re-exports (central entrypoint) ===
pub mod prelude {
    pub use crate::attr::FileAttributes;
    pub use crate::boot::BootParams;
    pub use crate::catalog::{Catalog, DirHome, EntryPos, FileId, FileNode, Occupant, ROOT_ID};
    pub use crate::errors::{ChainError, FsError, FsResult, JournalError};
    pub use crate::fat::{FatEntry, FatVariant};
    pub use crate::format::{format_volume, FormatSpec};
    pub use crate::fragmenter::Fragmenter;
    pub use crate::freemap::FreeMap;
    pub use crate::injector::FaultInjector;
    pub use crate::journal::{journal_path_for, Journal, ReplaySummary, TxId};
    pub use crate::relocator::{DefragReport, Defragmenter};
    pub use crate::volume::{OpenOptions, Volume, VolumeInfo};

    pub use dfatio::prelude::*;
}

pub use errors::{FsError, FsResult};
pub use volume::Volume;
