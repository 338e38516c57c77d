// SPDX-License-Identifier: MIT

//! Controlled structural-defect injection, for exercising recovery and
//! repair logic against known-bad images. Everything goes through the
//! volume's public operations; no on-disk knowledge lives here.

use dfatio::BlockIO;

use crate::catalog::{FileId, ROOT_ID};
use crate::errors::{FsError, FsResult};
use crate::fat::FatEntry;
use crate::volume::Volume;

pub struct FaultInjector<'v, IO: BlockIO> {
    vol: &'v mut Volume<IO>,
}

impl<'v, IO: BlockIO> FaultInjector<'v, IO> {
    pub fn new(vol: &'v mut Volume<IO>) -> Self {
        Self { vol }
    }

    /// A fresh fixture file of `clusters` clusters in the root directory,
    /// named FILE, FILE1, FILE2, ... whichever is free first.
    fn fixture_file(&mut self, clusters: usize) -> FsResult<FileId> {
        let body = vec![b'e'; self.vol.params().bytes_per_cluster as usize * clusters];
        let mut tail = 0u32;
        loop {
            let name = if tail == 0 {
                "FILE".to_string()
            } else {
                format!("FILE{tail}")
            };
            match self.vol.create_file(ROOT_ID, &name, &body) {
                Ok(id) => return Ok(id),
                Err(FsError::Exists) => tail += 1,
                Err(e) => return Err(e),
            }
        }
    }

    /// A file whose chain exists in FAT copy `keep` only; every other copy
    /// reads the chain as free.
    pub fn file_in_one_fat(&mut self, keep: u8) -> FsResult<FileId> {
        let id = self.fixture_file(2)?;
        let chain = self.vol.file_chain(id)?;
        for copy in 0..self.vol.params().num_fats {
            if copy == keep {
                continue;
            }
            for &c in &chain {
                self.vol.set_fat_entry_in_copy(copy, c, FatEntry::Free)?;
            }
        }
        Ok(id)
    }

    /// A file whose second cluster is marked bad mid-chain.
    pub fn file_with_bad_cluster(&mut self) -> FsResult<(FileId, u32)> {
        let id = self.fixture_file(2)?;
        let c = self.vol.file_chain(id)?[1];
        self.vol.set_fat_entry(c, FatEntry::Bad)?;
        Ok((id, c))
    }

    /// A file whose head points back at itself.
    pub fn file_with_self_loop(&mut self) -> FsResult<(FileId, u32)> {
        let id = self.fixture_file(2)?;
        let head = self.vol.file_chain(id)?[0];
        self.vol.set_fat_entry(head, FatEntry::Next(head))?;
        Ok((id, head))
    }

    /// Two files whose chains merge at the second file's middle cluster.
    pub fn cross_linked_files(&mut self) -> FsResult<(FileId, FileId, u32)> {
        let a = self.fixture_file(3)?;
        let b = self.fixture_file(3)?;
        let ca = self.vol.file_chain(a)?[1];
        let cb = self.vol.file_chain(b)?[1];
        self.vol.set_fat_entry(ca, FatEntry::Next(cb))?;
        Ok((a, b, cb))
    }

    /// A chained run of `count` clusters no directory entry references.
    pub fn lost_cluster_run(&mut self, count: u32) -> FsResult<u32> {
        let start = self.vol.allocate_contiguous(count).ok_or(FsError::NoSpace)?;
        for i in 0..count {
            let entry = if i + 1 < count {
                FatEntry::Next(start + i + 1)
            } else {
                FatEntry::EndOfChain
            };
            self.vol.set_fat_entry(start + i, entry)?;
        }
        Ok(start)
    }
}
