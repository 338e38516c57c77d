// SPDX-License-Identifier: MIT

//! The cluster-relocation engine.
//!
//! Files are visited parents-first and packed into the lowest contiguous
//! free runs. When no free run is long enough, a displacement pass empties a
//! region at the lowest free cluster: whole owning files are relocated
//! recursively where possible (visited-set cycle guard), single clusters are
//! pushed out piecewise where not. Every cluster hop is its own journal
//! transaction, so the table stays consistent at each commit boundary.

use std::collections::HashSet;

use dfatio::BlockIO;

use crate::catalog::{FileId, ROOT_ID};
use crate::errors::{ChainError, FsError, FsResult};
use crate::fat::{self, FatEntry};
use crate::volume::Volume;

/// Outcome of one defragmentation run.
#[derive(Debug, Default)]
pub struct DefragReport {
    pub files_seen: usize,
    pub files_moved: usize,
    pub clusters_moved: usize,
    pub already_contiguous: usize,
    /// Per-file allocation failures; the pass continues past these.
    pub no_space: Vec<String>,
    /// Files whose chains are damaged and were left untouched.
    pub damaged: Vec<(String, ChainError)>,
}

impl DefragReport {
    pub fn fully_defragmented(&self) -> bool {
        self.no_space.is_empty() && self.damaged.is_empty()
    }
}

pub struct Defragmenter<'v, IO: BlockIO> {
    vol: &'v mut Volume<IO>,
    visited: HashSet<FileId>,
    clusters_moved: usize,
}

impl<'v, IO: BlockIO> Defragmenter<'v, IO> {
    pub fn new(vol: &'v mut Volume<IO>) -> Self {
        Self {
            vol,
            visited: HashSet::new(),
            clusters_moved: 0,
        }
    }

    /// Share of occupied clusters that do not directly follow their
    /// predecessor, as a percentage. The root chain does not count.
    pub fn fragmentation_level(&self) -> f64 {
        let occupied = &self.vol.catalog().occupied;
        let mut total = 0usize;
        let mut misplaced = 0usize;
        for (&c, occ) in occupied {
            if occ.file == ROOT_ID {
                continue;
            }
            total += 1;
            if let Some(p) = occ.prev {
                if c != p + 1 {
                    misplaced += 1;
                }
            }
        }
        if total == 0 {
            0.0
        } else {
            misplaced as f64 * 100.0 / total as f64
        }
    }

    /// Runs the full pass. `NoSpace` is recorded per file; any other error
    /// aborts with everything committed so far still applied.
    pub fn run(&mut self) -> FsResult<DefragReport> {
        let mut report = DefragReport::default();

        // Parents tend to move before children: depth, then starting
        // cluster. The sort is stable, so equal keys keep scan order.
        let mut files: Vec<FileId> = Vec::new();
        for id in self.vol.catalog().ids() {
            if id == ROOT_ID {
                continue;
            }
            let node = self.vol.catalog().node(id);
            if let Some(e) = node.chain_error {
                report.damaged.push((self.vol.catalog().path_of(id), e));
                continue;
            }
            if node.head == 0 {
                continue;
            }
            files.push(id);
        }
        files.sort_by_key(|&id| {
            let n = self.vol.catalog().node(id);
            (n.depth, n.head)
        });

        report.files_seen = files.len();
        for id in files {
            self.visited.insert(id);
            match self.place_file(id, &HashSet::new()) {
                Ok(true) => report.files_moved += 1,
                Ok(false) => report.already_contiguous += 1,
                Err(FsError::NoSpace) => {
                    report.no_space.push(self.vol.catalog().path_of(id))
                }
                Err(e) => return Err(e),
            }
        }
        report.clusters_moved = self.clusters_moved;
        Ok(report)
    }

    /// Makes one file contiguous. Returns whether anything moved.
    fn place_file(&mut self, id: FileId, banned: &HashSet<u32>) -> FsResult<bool> {
        let head = self.vol.catalog().node(id).head;
        if head == 0 {
            return Ok(false);
        }
        let chain = self.vol.read_chain(head)?;
        if fat::is_contiguous(&chain) {
            return Ok(false);
        }
        let len = chain.len() as u32;

        let start = match self.vol.allocate_contiguous_avoiding(len, banned) {
            Some(s) => s,
            None => self.clear_region(id, len, banned)?,
        };

        let head_moved = self.move_into(id, start, banned)?;
        if head_moved && self.vol.catalog().node(id).is_dir {
            self.vol.fix_dot_entries(id)?;
        }
        Ok(true)
    }

    /// Frees a region of `len` clusters for `id`, starting at the lowest
    /// free cluster that admits one, and returns its start.
    fn clear_region(&mut self, id: FileId, len: u32, banned: &HashSet<u32>) -> FsResult<u32> {
        let last = self.vol.params().last_data_cluster();
        let mut region_start = self.vol.lowest_free().ok_or(FsError::NoSpace)?;

        // Slide past regions pinned by bad clusters, the root chain, lost
        // clusters, or an outer displacement frame.
        'search: loop {
            if region_start + len - 1 > last {
                return Err(FsError::NoSpace);
            }
            for c in region_start..region_start + len {
                if self.is_immovable(c, banned) {
                    region_start = self.vol.next_free(c + 1).ok_or(FsError::NoSpace)?;
                    continue 'search;
                }
            }
            break;
        }

        let region = region_start..region_start + len;
        let mut inner_ban: HashSet<u32> = banned.clone();
        inner_ban.extend(region.clone());

        for c in region.clone() {
            if self.vol.is_free(c) {
                continue;
            }
            let occ = self
                .vol
                .occupant(c)
                .ok_or(FsError::Unsupported("Allocated cluster without an owner"))?;
            let owner = occ.file;
            if owner == id {
                // Own clusters inside the region resolve during move_into.
                continue;
            }

            // First choice: relocate the whole owning file, once per pass.
            if self.visited.insert(owner)
                && self.vol.catalog().node(owner).chain_error.is_none()
            {
                match self.place_file(owner, &inner_ban) {
                    Ok(_) => {}
                    Err(FsError::NoSpace) => {}
                    Err(e) => return Err(e),
                }
            }

            // Fallback: push just this cluster out of the region.
            if !self.vol.is_free(c) {
                let owner = self
                    .vol
                    .occupant(c)
                    .ok_or(FsError::Unsupported("Allocated cluster without an owner"))?
                    .file;
                let scratch = self.scratch_free(&inner_ban)?;
                let was_head = self.vol.catalog().node(owner).head == c;
                self.vol.move_cluster(c, scratch)?;
                self.clusters_moved += 1;
                if was_head && self.vol.catalog().node(owner).is_dir {
                    self.vol.fix_dot_entries(owner)?;
                }
            }
        }
        Ok(region_start)
    }

    fn is_immovable(&self, c: u32, banned: &HashSet<u32>) -> bool {
        if banned.contains(&c) {
            return true;
        }
        if matches!(
            self.vol.fat_entry(c),
            FatEntry::Bad | FatEntry::Reserved
        ) {
            return true;
        }
        match self.vol.occupant(c) {
            Some(occ) => occ.file == ROOT_ID,
            // Allocated but reachable from nowhere: a lost cluster.
            None => !self.vol.is_free(c),
        }
    }

    /// Moves the chain of `id` into `start..start + len`, one per-cluster
    /// transaction at a time. Collisions with the file's own not-yet-moved
    /// clusters are broken by a hop through a scratch cluster.
    fn move_into(&mut self, id: FileId, start: u32, banned: &HashSet<u32>) -> FsResult<bool> {
        let head0 = self.vol.catalog().node(id).head;
        let mut chain = self.vol.read_chain(head0)?;
        let len = chain.len() as u32;
        let mut avoid: HashSet<u32> = banned.clone();
        avoid.extend(start..start + len);

        for i in 0..chain.len() {
            let dst = start + i as u32;
            let c = chain[i];
            if c == dst {
                continue;
            }
            if !self.vol.is_free(dst) {
                let occ = self.vol.occupant(dst).ok_or(FsError::NoSpace)?;
                if occ.file != id {
                    return Err(FsError::NoSpace);
                }
                let j = chain
                    .iter()
                    .position(|&x| x == dst)
                    .ok_or(FsError::NoSpace)?;
                let scratch = self.scratch_free(&avoid)?;
                self.vol.move_cluster(dst, scratch)?;
                self.clusters_moved += 1;
                chain[j] = scratch;
            }
            self.vol.move_cluster(c, dst)?;
            self.clusters_moved += 1;
            chain[i] = dst;
        }
        Ok(self.vol.catalog().node(id).head != head0)
    }

    /// Lowest free cluster outside every avoided region.
    fn scratch_free(&self, avoid: &HashSet<u32>) -> FsResult<u32> {
        let mut c = self.vol.lowest_free();
        while let Some(x) = c {
            if !avoid.contains(&x) {
                return Ok(x);
            }
            c = self.vol.next_free(x + 1);
        }
        Err(FsError::NoSpace)
    }
}
