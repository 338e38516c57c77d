// SPDX-License-Identifier: MIT

//! The volume abstraction: one opened FAT image, its geometry, the working
//! FAT copy, the free map, the scanned directory tree, and the journal. All
//! mutation goes through here, and every mutating operation is one journal
//! transaction covering both FAT copies.

use std::collections::HashSet;
use std::ops::Range;
use std::path::{Path, PathBuf};

use dfatio::{BlockIO, FileBlockIO};
use zerocopy::{FromBytes, IntoBytes};

use crate::attr::FileAttributes;
use crate::boot::{BootParams, FsInfoSector, FSINFO_LEAD_SIGNATURE, FSINFO_UNKNOWN, SECTOR_SIZE};
use crate::catalog::{Catalog, DirHome, EntryPos, FileId, FileNode, Occupant, ROOT_ID};
use crate::dirent::{
    self, DirEntryRaw, FatTimestamp, RawEntryKind, DOTDOT_NAME, DOT_NAME, ENTRY_SIZE,
    FIRST_CLUSTER_HI_OFFSET, FIRST_CLUSTER_LO_OFFSET,
};
use crate::errors::{BlockIOError, ChainError, FsError, FsResult};
use crate::fat::{self, FatEntry, FatVariant};
use crate::freemap::FreeMap;
use crate::journal::{journal_path_for, Journal, ReplaySummary, TxId};

/// Options for `open_with` / `mount_with`.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Which FAT copy wins when the copies disagree.
    pub preferred_fat: u8,
    /// Journal location; defaults to `<image>.jrnl`.
    pub journal_path: Option<PathBuf>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            preferred_fat: 0,
            journal_path: None,
        }
    }
}

/// Summary counters for the INFO surface.
#[derive(Debug, Clone)]
pub struct VolumeInfo {
    pub variant: FatVariant,
    pub num_fats: u8,
    pub bytes_per_cluster: u32,
    pub cluster_count: u32,
    pub free_clusters: u32,
    pub file_count: usize,
    pub dir_count: usize,
    pub capacity_bytes: u64,
    pub free_bytes: u64,
    /// Free-cluster hint from the FAT32 FSInfo sector, when present and known.
    pub fsinfo_free_hint: Option<u32>,
}

#[derive(Debug)]
pub struct Volume<IO: BlockIO> {
    io: IO,
    journal: Journal,
    params: BootParams,
    /// Working copy of the authoritative FAT.
    fat: Vec<u8>,
    freemap: FreeMap,
    catalog: Catalog,
    cluster_buf: Vec<u8>,
    replay: ReplaySummary,
    notes: Vec<String>,
    poisoned: bool,
}

impl Volume<FileBlockIO> {
    /// Opens an image file with an exclusive lock and mounts it.
    pub fn open(path: &Path) -> FsResult<Self> {
        Self::open_with(path, OpenOptions::default())
    }

    pub fn open_with(path: &Path, opts: OpenOptions) -> FsResult<Self> {
        let io = FileBlockIO::open(path)?;
        let journal_path = opts
            .journal_path
            .clone()
            .unwrap_or_else(|| journal_path_for(path));
        Self::mount_with(io, journal_path, opts)
    }
}

impl<IO: BlockIO> Volume<IO> {
    pub fn mount(io: IO, journal_path: PathBuf) -> FsResult<Self> {
        Self::mount_with(io, journal_path, OpenOptions::default())
    }

    /// Mount sequence: journal replay, boot parse, FAT load + cross-check,
    /// free-map build, tree scan.
    pub fn mount_with(mut io: IO, journal_path: PathBuf, opts: OpenOptions) -> FsResult<Self> {
        let replay = Journal::replay(&journal_path, &mut io)?;

        let mut sector0 = vec![0u8; SECTOR_SIZE];
        io.read_at(0, &mut sector0)?;
        let params = BootParams::parse(&sector0)?;

        let mut journal = Journal::new(journal_path);
        let mut notes = Vec::new();

        // Load every FAT copy; the preferred one becomes the working table.
        let fat_len = params.fat_size_bytes();
        let mut copies: Vec<Vec<u8>> = Vec::with_capacity(params.num_fats as usize);
        for idx in 0..params.num_fats {
            let mut table = vec![0u8; fat_len];
            io.read_at(params.fat_offset(idx), &mut table)?;
            copies.push(table);
        }
        let preferred = if (opts.preferred_fat as usize) < copies.len() {
            opts.preferred_fat
        } else {
            0
        };
        let fat = copies[preferred as usize].clone();

        let stale: Vec<u8> = (0..params.num_fats)
            .filter(|&idx| copies[idx as usize] != fat)
            .collect();
        if !stale.is_empty() {
            let tx = journal.begin()?;
            for idx in &stale {
                journal.stage(tx, &mut io, params.fat_offset(*idx), &fat)?;
            }
            journal.commit(tx, &mut io)?;
            notes.push(format!(
                "FAT copies disagreed; rewrote {} from copy {}",
                stale.len(),
                preferred
            ));
        }

        let freemap = FreeMap::from_fat(&fat, params.variant, params.cluster_count);
        let cluster_buf = vec![0u8; params.bytes_per_cluster as usize];

        let mut vol = Self {
            io,
            journal,
            params,
            fat,
            freemap,
            catalog: Catalog::new(0),
            cluster_buf,
            replay,
            notes,
            poisoned: false,
        };
        vol.rescan()?;
        Ok(vol)
    }

    // --- Accessors ---

    pub fn params(&self) -> &BootParams {
        &self.params
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn replay_summary(&self) -> ReplaySummary {
        self.replay
    }

    /// Scan findings worth surfacing (FAT rewrites, orphaned name entries).
    pub fn notes(&self) -> &[String] {
        &self.notes
    }

    pub fn free_cluster_count(&self) -> u32 {
        self.freemap.free_count()
    }

    #[inline]
    pub fn is_free(&self, cluster: u32) -> bool {
        self.freemap.is_free(cluster)
    }

    pub fn occupant(&self, cluster: u32) -> Option<Occupant> {
        self.catalog.occupied.get(&cluster).copied()
    }

    pub fn fat_entry(&self, cluster: u32) -> FatEntry {
        fat::read_entry(&self.fat, cluster, self.params.variant)
    }

    fn ensure_usable(&self) -> FsResult<()> {
        if self.poisoned {
            return Err(FsError::IO(BlockIOError::Io(
                "Volume poisoned by an earlier write failure",
            )));
        }
        Ok(())
    }

    // --- Chain walking ---

    /// Walks a chain as far as it is well-formed. Returns the walked prefix
    /// and the defect that stopped the walk, if any.
    pub fn walk_chain(&self, head: u32) -> (Vec<u32>, Option<ChainError>) {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut c = head;
        loop {
            if !self.params.in_data_range(c) {
                return (chain, Some(ChainError::OutOfRange(c)));
            }
            if !seen.insert(c) || chain.len() > self.params.cluster_count as usize {
                return (chain, Some(ChainError::Loop(c)));
            }
            match fat::read_entry(&self.fat, c, self.params.variant) {
                FatEntry::Free | FatEntry::Reserved => {
                    return (chain, Some(ChainError::Broken(c)))
                }
                FatEntry::Bad => return (chain, Some(ChainError::Bad(c))),
                FatEntry::EndOfChain => {
                    chain.push(c);
                    return (chain, None);
                }
                FatEntry::Next(n) => {
                    chain.push(c);
                    c = n;
                }
            }
        }
    }

    /// The full chain from `head`, or the defect that breaks it.
    pub fn read_chain(&self, head: u32) -> FsResult<Vec<u32>> {
        let (chain, err) = self.walk_chain(head);
        match err {
            None => Ok(chain),
            Some(e) => Err(e.into()),
        }
    }

    pub fn file_chain(&self, id: FileId) -> FsResult<Vec<u32>> {
        let head = self.catalog.node(id).head;
        if head == 0 {
            return Ok(Vec::new());
        }
        self.read_chain(head)
    }

    // --- Tree scan ---

    /// Rebuilds the catalog and occupancy map by depth-first traversal from
    /// the root. Chain defects are recorded per node, not raised; only a
    /// defective root chain aborts.
    pub fn rescan(&mut self) -> FsResult<()> {
        let is_fat32 = self.params.variant == FatVariant::Fat32;
        let root_head = if is_fat32 { self.params.root_cluster } else { 0 };
        let mut catalog = Catalog::new(root_head);

        if is_fat32 {
            self.register_chain(&mut catalog, ROOT_ID, root_head);
            if let Some(e) = catalog.node(ROOT_ID).chain_error {
                return Err(e.into());
            }
        }

        let mut stack = vec![ROOT_ID];
        while let Some(dir) = stack.pop() {
            let fixed_root = dir == ROOT_ID && !is_fat32;
            let head = catalog.node(dir).head;
            let depth = catalog.node(dir).depth;
            let slots = self.read_dir_region(fixed_root, head)?;

            let mut lfn_stack: Vec<[u8; ENTRY_SIZE]> = Vec::new();
            for (pos, raw) in slots {
                match dirent::classify(&raw) {
                    RawEntryKind::EndOfDir => break,
                    RawEntryKind::Deleted
                    | RawEntryKind::VolumeLabel
                    | RawEntryKind::Dot => lfn_stack.clear(),
                    RawEntryKind::Lfn => lfn_stack.push(raw),
                    RawEntryKind::Short => {
                        let entry = DirEntryRaw::read_from_bytes(&raw[..])
                            .map_err(|_| FsError::Format("Unreadable directory entry"))?;
                        let name = self.resolve_name(&lfn_stack, &entry);
                        lfn_stack.clear();

                        let head = entry.first_cluster(self.params.variant);
                        let node = FileNode {
                            name,
                            attr: entry.attr,
                            size: entry.file_size,
                            head,
                            is_dir: entry.is_directory(),
                            depth: depth + 1,
                            parent: Some(dir),
                            entry: Some(pos),
                            chain_error: None,
                        };
                        let id = catalog.push(node);
                        if head != 0 {
                            self.register_chain(&mut catalog, id, head);
                        }
                        if catalog.node(id).is_dir
                            && head != 0
                            && catalog.node(id).chain_error.is_none()
                        {
                            stack.push(id);
                        }
                    }
                }
            }
        }

        self.catalog = catalog;
        Ok(())
    }

    fn resolve_name(&mut self, lfn_stack: &[[u8; ENTRY_SIZE]], entry: &DirEntryRaw) -> String {
        let short = dirent::decode_short_name(&entry.name);
        if lfn_stack.is_empty() {
            return short;
        }
        if dirent::lfn_matches_short(lfn_stack, &entry.name) {
            dirent::decode_long_name(lfn_stack).unwrap_or(short)
        } else {
            // Orphaned long-name run: leave it on disk, note it, keep the
            // short name.
            self.notes
                .push(format!("Orphaned long-name entries before '{short}'"));
            short
        }
    }

    /// All 32-byte slots of one directory in on-disk order.
    fn read_dir_region(
        &mut self,
        fixed_root: bool,
        head: u32,
    ) -> FsResult<Vec<(EntryPos, [u8; ENTRY_SIZE])>> {
        let mut slots = Vec::new();
        if fixed_root {
            let mut region =
                vec![0u8; self.params.root_entry_count as usize * ENTRY_SIZE];
            self.io.read_at(self.params.root_dir_offset(), &mut region)?;
            for (i, chunk) in region.chunks_exact(ENTRY_SIZE).enumerate() {
                slots.push((
                    EntryPos {
                        home: DirHome::Root,
                        offset: (i * ENTRY_SIZE) as u32,
                    },
                    chunk.try_into().unwrap(),
                ));
            }
        } else {
            let (chain, _) = self.walk_chain(head);
            let bpc = self.params.bytes_per_cluster as usize;
            let mut data = vec![0u8; bpc];
            for c in chain {
                self.io.read_at(self.params.cluster_offset(c), &mut data)?;
                for (i, chunk) in data.chunks_exact(ENTRY_SIZE).enumerate() {
                    slots.push((
                        EntryPos {
                            home: DirHome::Cluster(c),
                            offset: (i * ENTRY_SIZE) as u32,
                        },
                        chunk.try_into().unwrap(),
                    ));
                }
            }
        }
        Ok(slots)
    }

    /// Walks the chain of `id` and records every cluster's links and owner.
    /// Defects stop the walk and land on the node.
    fn register_chain(&self, catalog: &mut Catalog, id: FileId, head: u32) {
        let mut prev: Option<u32> = None;
        let mut err = None;
        let mut steps = 0usize;
        let mut c = head;

        loop {
            if !self.params.in_data_range(c) {
                err = Some(ChainError::OutOfRange(c));
                break;
            }
            if let Some(other) = catalog.occupied.get(&c) {
                err = Some(if other.file == id {
                    ChainError::Loop(c)
                } else {
                    ChainError::CrossLink(c)
                });
                break;
            }
            steps += 1;
            if steps > self.params.cluster_count as usize {
                err = Some(ChainError::Loop(c));
                break;
            }

            let entry = fat::read_entry(&self.fat, c, self.params.variant);
            match entry {
                FatEntry::Free | FatEntry::Reserved => {
                    err = Some(ChainError::Broken(c));
                    break;
                }
                FatEntry::Bad => {
                    err = Some(ChainError::Bad(c));
                    break;
                }
                FatEntry::Next(_) | FatEntry::EndOfChain => {
                    catalog.occupied.insert(
                        c,
                        Occupant {
                            prev,
                            next: None,
                            file: id,
                        },
                    );
                    if let Some(p) = prev {
                        catalog.occupied.get_mut(&p).unwrap().next = Some(c);
                    }
                    prev = Some(c);
                    match entry {
                        FatEntry::Next(n) => c = n,
                        _ => break,
                    }
                }
            }
        }
        catalog.node_mut(id).chain_error = err;
    }

    // --- Lookup and content ---

    /// Resolves `/dir/sub/file.ext` (either separator, ASCII
    /// case-insensitive) to a node.
    pub fn find_path(&self, path: &str) -> Option<FileId> {
        let mut cur = ROOT_ID;
        for part in path.split(['/', '\\']).filter(|p| !p.is_empty()) {
            cur = self
                .catalog
                .children(cur)
                .into_iter()
                .find(|&id| self.catalog.node(id).name.eq_ignore_ascii_case(part))?;
        }
        Some(cur)
    }

    /// Content of a file, truncated to its recorded size. Directories yield
    /// their raw cluster bytes.
    pub fn read_file(&mut self, id: FileId) -> FsResult<Vec<u8>> {
        let (head, size, is_dir) = {
            let n = self.catalog.node(id);
            (n.head, n.size, n.is_dir)
        };
        if head == 0 {
            return Ok(Vec::new());
        }
        let chain = self.read_chain(head)?;
        let bpc = self.params.bytes_per_cluster as usize;
        let mut out = vec![0u8; chain.len() * bpc];
        for (i, &c) in chain.iter().enumerate() {
            self.io
                .read_at(self.params.cluster_offset(c), &mut out[i * bpc..(i + 1) * bpc])?;
        }
        if !is_dir {
            out.truncate(size as usize);
        }
        Ok(out)
    }

    pub fn info(&mut self) -> FsResult<VolumeInfo> {
        let fsinfo_free_hint = if self.params.variant == FatVariant::Fat32
            && self.params.fsinfo_sector != 0
        {
            let off = self.params.fsinfo_sector as u64 * self.params.bytes_per_sector as u64;
            let mut sec = vec![0u8; SECTOR_SIZE];
            self.io.read_at(off, &mut sec)?;
            let fsinfo = FsInfoSector::read_from_bytes(&sec[..])
                .map_err(|_| FsError::Format("Unreadable FSInfo sector"))?;
            if fsinfo.lead_signature == FSINFO_LEAD_SIGNATURE {
                let count = fsinfo.free_cluster_count;
                (count != FSINFO_UNKNOWN).then_some(count)
            } else {
                None
            }
        } else {
            None
        };

        let free = self.freemap.free_count();
        let bpc = self.params.bytes_per_cluster as u64;
        Ok(VolumeInfo {
            variant: self.params.variant,
            num_fats: self.params.num_fats,
            bytes_per_cluster: self.params.bytes_per_cluster,
            cluster_count: self.params.cluster_count,
            free_clusters: free,
            file_count: self.catalog.file_count(),
            dir_count: self.catalog.dir_count(),
            capacity_bytes: self.params.cluster_count as u64 * bpc,
            free_bytes: free as u64 * bpc,
            fsinfo_free_hint,
        })
    }

    // --- Allocation queries ---

    /// Lowest start of a free run of `len` clusters.
    pub fn allocate_contiguous(&self, len: u32) -> Option<u32> {
        self.freemap.find_run(len, &HashSet::new())
    }

    pub fn allocate_contiguous_avoiding(&self, len: u32, banned: &HashSet<u32>) -> Option<u32> {
        self.freemap.find_run(len, banned)
    }

    pub fn lowest_free(&self) -> Option<u32> {
        self.freemap.first_free(self.params.first_data_cluster())
    }

    /// Lowest free cluster at or after `from`.
    pub fn next_free(&self, from: u32) -> Option<u32> {
        self.freemap.first_free(from)
    }

    pub fn highest_free(&self) -> Option<u32> {
        self.freemap.last_free()
    }

    pub fn first_free_outside(&self, avoid: Range<u32>) -> Option<u32> {
        self.freemap.first_free_outside(avoid)
    }

    // --- Mutations ---

    /// Stages one FAT entry into every copy and mirrors it in the working
    /// table and free map. Must run inside an open transaction.
    fn stage_fat_entry(&mut self, tx: TxId, cluster: u32, entry: FatEntry) -> FsResult<()> {
        fat::write_entry(&mut self.fat, cluster, self.params.variant, entry);
        let (off, len) = self.params.variant.entry_span(cluster);
        let bytes = self.fat[off..off + len].to_vec();
        for copy in 0..self.params.num_fats {
            self.journal
                .stage(tx, &mut self.io, self.params.fat_offset(copy) + off as u64, &bytes)?;
        }
        self.freemap.set_free(cluster, entry.is_free());
        Ok(())
    }

    fn entry_abs_offset(&self, pos: EntryPos) -> u64 {
        match pos.home {
            DirHome::Root => self.params.root_dir_offset() + pos.offset as u64,
            DirHome::Cluster(c) => self.params.cluster_offset(c) + pos.offset as u64,
        }
    }

    /// Stages the starting-cluster halves of the 32-byte entry at `abs`.
    /// The high half exists only on FAT32.
    fn stage_cluster_field(&mut self, tx: TxId, abs: u64, cluster: u32) -> FsResult<()> {
        let lo = (cluster & 0xFFFF) as u16;
        self.journal.stage(
            tx,
            &mut self.io,
            abs + FIRST_CLUSTER_LO_OFFSET as u64,
            &lo.to_le_bytes(),
        )?;
        if self.params.variant == FatVariant::Fat32 {
            let hi = ((cluster >> 16) & 0xFFFF) as u16;
            self.journal.stage(
                tx,
                &mut self.io,
                abs + FIRST_CLUSTER_HI_OFFSET as u64,
                &hi.to_le_bytes(),
            )?;
        }
        Ok(())
    }

    fn stage_head_pointer(&mut self, tx: TxId, id: FileId, new_head: u32) -> FsResult<()> {
        let pos = self
            .catalog
            .node(id)
            .entry
            .ok_or(FsError::Unsupported("The root directory has no entry"))?;
        let abs = self.entry_abs_offset(pos);
        self.stage_cluster_field(tx, abs, new_head)
    }

    /// Staged rewrite of a file's full 32-byte directory entry. Metadata
    /// only; the FAT is untouched, and the starting-cluster halves are the
    /// caller's responsibility to keep consistent.
    pub fn update_dir_entry(&mut self, id: FileId, entry: &DirEntryRaw) -> FsResult<()> {
        self.ensure_usable()?;
        let pos = self
            .catalog
            .node(id)
            .entry
            .ok_or(FsError::Unsupported("The root directory has no entry"))?;
        let abs = self.entry_abs_offset(pos);

        let tx = self.journal.begin()?;
        if let Err(e) = self.journal.stage(tx, &mut self.io, abs, entry.as_bytes()) {
            self.poisoned = true;
            return Err(e.into());
        }
        self.journal.commit(tx, &mut self.io)?;

        let node = self.catalog.node_mut(id);
        node.attr = entry.attr;
        node.size = entry.file_size;
        Ok(())
    }

    /// Relocates the data of one cluster and relinks its chain, atomically:
    /// destination data, both FAT copies, and the predecessor link (or the
    /// directory entry's starting cluster for a chain head) commit together.
    pub fn move_cluster(&mut self, src: u32, dst: u32) -> FsResult<()> {
        self.ensure_usable()?;
        if src == dst {
            return Err(FsError::Unsupported("Cannot move a cluster onto itself"));
        }
        if !self.params.in_data_range(src) {
            return Err(ChainError::OutOfRange(src).into());
        }
        if !self.params.in_data_range(dst) {
            return Err(ChainError::OutOfRange(dst).into());
        }
        let occ = *self
            .catalog
            .occupied
            .get(&src)
            .ok_or(FsError::Unsupported("Source cluster is not part of a chain"))?;
        if occ.file == ROOT_ID {
            return Err(FsError::Unsupported("The root directory is never relocated"));
        }
        if !self.freemap.is_free(dst) {
            return Err(FsError::Unsupported("Destination cluster is not free"));
        }
        let successor = match self.fat_entry(src) {
            e @ (FatEntry::Next(_) | FatEntry::EndOfChain) => e,
            _ => return Err(ChainError::Broken(src).into()),
        };

        if let Err(e) = self.move_cluster_tx(src, dst, occ, successor) {
            self.poisoned = true;
            return Err(e);
        }

        // Mirror the committed state in the in-memory model.
        self.catalog.occupied.remove(&src);
        self.catalog.occupied.insert(dst, occ);
        if let Some(p) = occ.prev {
            self.catalog.occupied.get_mut(&p).unwrap().next = Some(dst);
        }
        if let Some(n) = occ.next {
            self.catalog.occupied.get_mut(&n).unwrap().prev = Some(dst);
        }
        if occ.prev.is_none() {
            self.catalog.node_mut(occ.file).head = dst;
        }
        if self.catalog.node(occ.file).is_dir {
            // Directory data moved; entries stored in it moved with it.
            self.catalog.remap_entry_home(src, dst);
        }
        Ok(())
    }

    fn move_cluster_tx(
        &mut self,
        src: u32,
        dst: u32,
        occ: Occupant,
        successor: FatEntry,
    ) -> FsResult<()> {
        let tx = self.journal.begin()?;

        let src_off = self.params.cluster_offset(src);
        let dst_off = self.params.cluster_offset(dst);
        let mut buf = std::mem::take(&mut self.cluster_buf);
        let read = self.io.read_at(src_off, &mut buf);
        let staged = read.map_err(FsError::from).and_then(|_| {
            self.journal
                .stage(tx, &mut self.io, dst_off, &buf)
                .map_err(FsError::from)
        });
        self.cluster_buf = buf;
        staged?;

        self.stage_fat_entry(tx, dst, successor)?;
        self.stage_fat_entry(tx, src, FatEntry::Free)?;
        match occ.prev {
            Some(p) => self.stage_fat_entry(tx, p, FatEntry::Next(dst))?,
            None => self.stage_head_pointer(tx, occ.file, dst)?,
        }

        self.journal.commit(tx, &mut self.io)?;
        Ok(())
    }

    /// After a directory's head cluster has moved: repoint its own `.` entry
    /// and the `..` entry of every child directory. One transaction.
    pub fn fix_dot_entries(&mut self, dir: FileId) -> FsResult<()> {
        self.ensure_usable()?;
        if dir == ROOT_ID {
            return Err(FsError::Unsupported("The root directory has no dot entries"));
        }
        let (head, is_dir) = {
            let n = self.catalog.node(dir);
            (n.head, n.is_dir)
        };
        if !is_dir {
            return Err(FsError::Unsupported("Not a directory"));
        }
        if head == 0 {
            return Ok(());
        }

        let child_heads: Vec<u32> = self
            .catalog
            .children(dir)
            .into_iter()
            .map(|id| self.catalog.node(id))
            .filter(|n| n.is_dir && n.head != 0)
            .map(|n| n.head)
            .collect();

        let tx = self.journal.begin()?;
        let staged = (|| -> FsResult<()> {
            let own = self.params.cluster_offset(head);
            if self.slot_has_name(own, &DOT_NAME)? {
                self.stage_cluster_field(tx, own, head)?;
            }
            for ch in child_heads {
                let dotdot = self.params.cluster_offset(ch) + ENTRY_SIZE as u64;
                if self.slot_has_name(dotdot, &DOTDOT_NAME)? {
                    self.stage_cluster_field(tx, dotdot, head)?;
                }
            }
            Ok(())
        })();
        match staged {
            Ok(()) => {
                self.journal.commit(tx, &mut self.io)?;
                Ok(())
            }
            Err(e) => {
                self.poisoned = true;
                Err(e)
            }
        }
    }

    fn slot_has_name(&mut self, abs: u64, name: &[u8; 11]) -> FsResult<bool> {
        let mut raw = [0u8; 11];
        self.io.read_at(abs, &mut raw)?;
        Ok(&raw == name)
    }

    // --- Raw FAT surface (fault injection, repairs) ---

    /// Journaled write of one entry into every FAT copy. Deliberately does
    /// not touch the catalog; callers corrupting the volume on purpose must
    /// rescan or remount before traversing again.
    pub fn set_fat_entry(&mut self, cluster: u32, entry: FatEntry) -> FsResult<()> {
        self.ensure_usable()?;
        if !self.params.in_data_range(cluster) {
            return Err(ChainError::OutOfRange(cluster).into());
        }
        let tx = self.journal.begin()?;
        match self.stage_fat_entry(tx, cluster, entry) {
            Ok(()) => {
                self.journal.commit(tx, &mut self.io)?;
                Ok(())
            }
            Err(e) => {
                self.poisoned = true;
                Err(e)
            }
        }
    }

    /// Journaled write of one entry into a single FAT copy, leaving the
    /// others alone. Exists for the fault injector's table-divergence mode.
    pub fn set_fat_entry_in_copy(
        &mut self,
        copy: u8,
        cluster: u32,
        entry: FatEntry,
    ) -> FsResult<()> {
        self.ensure_usable()?;
        if copy >= self.params.num_fats {
            return Err(FsError::Unsupported("No such FAT copy"));
        }
        if !self.params.in_data_range(cluster) {
            return Err(ChainError::OutOfRange(cluster).into());
        }

        let mut table = vec![0u8; self.params.fat_size_bytes()];
        self.io.read_at(self.params.fat_offset(copy), &mut table)?;
        fat::write_entry(&mut table, cluster, self.params.variant, entry);
        let (off, len) = self.params.variant.entry_span(cluster);

        let tx = self.journal.begin()?;
        let staged = self.journal.stage(
            tx,
            &mut self.io,
            self.params.fat_offset(copy) + off as u64,
            &table[off..off + len],
        );
        if let Err(e) = staged {
            self.poisoned = true;
            return Err(e.into());
        }
        self.journal.commit(tx, &mut self.io)?;

        if copy == 0 {
            self.fat[off..off + len].copy_from_slice(&table[off..off + len]);
            self.freemap.set_free(cluster, entry.is_free());
        }
        Ok(())
    }

    // --- File creation (8.3 names, used by fixtures and fault injection) ---

    pub fn create_file(&mut self, parent: FileId, name: &str, contents: &[u8]) -> FsResult<FileId> {
        self.create_node(parent, name, Some(contents))
    }

    pub fn create_dir(&mut self, parent: FileId, name: &str) -> FsResult<FileId> {
        self.create_node(parent, name, None)
    }

    fn create_node(
        &mut self,
        parent: FileId,
        name: &str,
        contents: Option<&[u8]>,
    ) -> FsResult<FileId> {
        self.ensure_usable()?;
        if !self.catalog.node(parent).is_dir {
            return Err(FsError::Unsupported("Parent is not a directory"));
        }
        let short = dirent::encode_short_name(name)
            .ok_or(FsError::Unsupported("Name does not fit the 8.3 form"))?;
        let exists = self
            .catalog
            .children(parent)
            .into_iter()
            .any(|id| self.catalog.node(id).name.eq_ignore_ascii_case(name));
        if exists {
            return Err(FsError::Exists);
        }

        let is_dir = contents.is_none();
        let data = contents.unwrap_or(&[]);
        let bpc = self.params.bytes_per_cluster as usize;
        let need = if is_dir {
            1
        } else {
            data.len().div_ceil(bpc)
        };

        let (slot, extend) = self.find_entry_slot(parent)?;

        // Pick the clusters up front; nothing is written if space runs out.
        let mut clusters = Vec::with_capacity(need);
        let mut from = self.params.first_data_cluster();
        for _ in 0..need {
            let mut c = self.freemap.first_free(from).ok_or(FsError::NoSpace)?;
            if let Some((_, fresh)) = extend {
                while c == fresh {
                    c = self.freemap.first_free(c + 1).ok_or(FsError::NoSpace)?;
                }
            }
            clusters.push(c);
            from = c + 1;
        }
        let head = clusters.first().copied().unwrap_or(0);

        let parent_head = if parent == ROOT_ID {
            // `..` of a directory directly under the root stores cluster 0.
            0
        } else {
            self.catalog.node(parent).head
        };
        let attr = if is_dir {
            FileAttributes::DIRECTORY.bits()
        } else {
            FileAttributes::ARCHIVE.bits()
        };
        let entry = DirEntryRaw::new(short, attr, head, data.len() as u32, FatTimestamp::now());

        let tx = self.journal.begin()?;
        let staged = (|| -> FsResult<()> {
            // Directory extension first, so the slot's cluster is valid.
            if let Some((last, fresh)) = extend {
                self.journal.stage(
                    tx,
                    &mut self.io,
                    self.params.cluster_offset(fresh),
                    &vec![0u8; bpc],
                )?;
                self.stage_fat_entry(tx, last, FatEntry::Next(fresh))?;
                self.stage_fat_entry(tx, fresh, FatEntry::EndOfChain)?;
            }

            // Data clusters and their chain.
            for (i, &c) in clusters.iter().enumerate() {
                let mut chunk = vec![0u8; bpc];
                if is_dir {
                    self.init_dir_cluster(&mut chunk, head, parent_head);
                } else {
                    let lo = i * bpc;
                    let hi = ((i + 1) * bpc).min(data.len());
                    if lo < data.len() {
                        chunk[..hi - lo].copy_from_slice(&data[lo..hi]);
                    }
                }
                self.journal
                    .stage(tx, &mut self.io, self.params.cluster_offset(c), &chunk)?;
                let next = match clusters.get(i + 1) {
                    Some(&n) => FatEntry::Next(n),
                    None => FatEntry::EndOfChain,
                };
                self.stage_fat_entry(tx, c, next)?;
            }

            // The directory entry itself.
            let abs = self.entry_abs_offset(slot);
            self.journal.stage(tx, &mut self.io, abs, entry.as_bytes())?;
            Ok(())
        })();
        match staged {
            Ok(()) => self.journal.commit(tx, &mut self.io)?,
            Err(e) => {
                self.poisoned = true;
                return Err(e);
            }
        }

        // Extend the in-memory model.
        if let Some((last, fresh)) = extend {
            self.catalog.occupied.insert(
                fresh,
                Occupant {
                    prev: Some(last),
                    next: None,
                    file: parent,
                },
            );
            if let Some(o) = self.catalog.occupied.get_mut(&last) {
                o.next = Some(fresh);
            }
        }
        let depth = self.catalog.node(parent).depth + 1;
        let id = self.catalog.push(FileNode {
            name: name.to_ascii_lowercase(),
            attr,
            size: data.len() as u32,
            head,
            is_dir,
            depth,
            parent: Some(parent),
            entry: Some(slot),
            chain_error: None,
        });
        for (i, &c) in clusters.iter().enumerate() {
            self.catalog.occupied.insert(
                c,
                Occupant {
                    prev: (i > 0).then(|| clusters[i - 1]),
                    next: clusters.get(i + 1).copied(),
                    file: id,
                },
            );
        }
        Ok(id)
    }

    fn init_dir_cluster(&self, chunk: &mut [u8], own: u32, parent_head: u32) {
        let stamp = FatTimestamp::now();
        let dot = DirEntryRaw::new(DOT_NAME, FileAttributes::DIRECTORY.bits(), own, 0, stamp);
        let dotdot = DirEntryRaw::new(
            DOTDOT_NAME,
            FileAttributes::DIRECTORY.bits(),
            parent_head,
            0,
            stamp,
        );
        chunk[..ENTRY_SIZE].copy_from_slice(dot.as_bytes());
        chunk[ENTRY_SIZE..2 * ENTRY_SIZE].copy_from_slice(dotdot.as_bytes());
    }

    /// First reusable slot in a directory. May schedule a chain extension:
    /// returns `(slot, Some((last_cluster, fresh_cluster)))` when the
    /// directory needs one more cluster to hold the entry.
    fn find_entry_slot(&mut self, parent: FileId) -> FsResult<(EntryPos, Option<(u32, u32)>)> {
        let is_fat32 = self.params.variant == FatVariant::Fat32;
        let fixed_root = parent == ROOT_ID && !is_fat32;
        let head = self.catalog.node(parent).head;

        for (pos, raw) in self.read_dir_region(fixed_root, head)? {
            match dirent::classify(&raw) {
                RawEntryKind::Deleted | RawEntryKind::EndOfDir => return Ok((pos, None)),
                _ => {}
            }
        }

        if fixed_root {
            return Err(FsError::NoSpace);
        }

        // Directory full: extend its chain by one cluster.
        let chain = self.read_chain(head)?;
        let last = *chain.last().expect("directory chain cannot be empty");
        let fresh = self
            .freemap
            .first_free(self.params.first_data_cluster())
            .ok_or(FsError::NoSpace)?;
        Ok((
            EntryPos {
                home: DirHome::Cluster(fresh),
                offset: 0,
            },
            Some((last, fresh)),
        ))
    }

    /// Clean shutdown: removes the journal, flushes the image, and hands the
    /// IO handle back (tests reuse memory-backed buffers through this).
    pub fn close(self) -> FsResult<IO> {
        let Volume {
            mut io, journal, ..
        } = self;
        journal.close()?;
        io.flush()?;
        Ok(io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{format_volume, FormatSpec};
    use dfatio::MemBlockIO;
    use tempfile::tempdir;

    fn fat16_image() -> Vec<u8> {
        let spec = FormatSpec::with_cluster_count(8000);
        let mut img = vec![0u8; spec.image_len() as usize];
        let mut io = MemBlockIO::new(&mut img);
        format_volume(&mut io, &spec).unwrap();
        img
    }

    #[test]
    fn test_mount_empty_volume() {
        let dir = tempdir().unwrap();
        let mut img = fat16_image();
        let io = MemBlockIO::new(&mut img);
        let mut vol = Volume::mount(io, dir.path().join("img.jrnl")).unwrap();

        let info = vol.info().unwrap();
        assert_eq!(info.variant, FatVariant::Fat16);
        assert_eq!(info.file_count, 0);
        assert_eq!(info.dir_count, 0);
        assert_eq!(info.free_clusters, 8000);
        vol.close().unwrap();
    }

    #[test]
    fn test_create_and_read_back() {
        let dir = tempdir().unwrap();
        let mut img = fat16_image();
        let io = MemBlockIO::new(&mut img);
        let mut vol = Volume::mount(io, dir.path().join("img.jrnl")).unwrap();

        let body = vec![0x5Au8; 1300];
        let id = vol.create_file(ROOT_ID, "file_a.txt", &body).unwrap();
        assert_eq!(vol.read_file(id).unwrap(), body);

        let chain = vol.file_chain(id).unwrap();
        assert_eq!(chain.len(), 3); // 1300 bytes over 512-byte clusters

        // Remount over the same bytes: the file must still be there.
        let io = vol.close().unwrap();
        let mut vol = Volume::mount(io, dir.path().join("img.jrnl")).unwrap();
        let id = vol.find_path("/file_a.txt").unwrap();
        assert_eq!(vol.read_file(id).unwrap(), body);
    }

    #[test]
    fn test_create_dir_with_dot_entries() {
        let dir = tempdir().unwrap();
        let mut img = fat16_image();
        let io = MemBlockIO::new(&mut img);
        let mut vol = Volume::mount(io, dir.path().join("img.jrnl")).unwrap();

        let sub = vol.create_dir(ROOT_ID, "subdir").unwrap();
        let inner = vol.create_file(sub, "inner.txt", b"payload").unwrap();

        let head = vol.catalog().node(sub).head;
        let data = vol.read_file(sub).unwrap();
        assert_eq!(&data[0..11], &DOT_NAME);
        assert_eq!(&data[32..43], &DOTDOT_NAME);
        // '.' points at the directory itself, '..' at the root (0).
        assert_eq!(
            u16::from_le_bytes([data[26], data[27]]) as u32,
            head
        );
        assert_eq!(u16::from_le_bytes([data[58], data[59]]), 0);

        let io = vol.close().unwrap();
        let mut vol = Volume::mount(io, dir.path().join("img.jrnl")).unwrap();
        assert_eq!(vol.find_path("/subdir/inner.txt"), Some(FileId(2)));
        let _ = inner;
        assert_eq!(vol.info().unwrap().dir_count, 1);
    }

    #[test]
    fn test_duplicate_create_rejected() {
        let dir = tempdir().unwrap();
        let mut img = fat16_image();
        let io = MemBlockIO::new(&mut img);
        let mut vol = Volume::mount(io, dir.path().join("img.jrnl")).unwrap();

        vol.create_file(ROOT_ID, "a.txt", b"x").unwrap();
        assert_eq!(
            vol.create_file(ROOT_ID, "A.TXT", b"y"),
            Err(FsError::Exists)
        );
    }

    #[test]
    fn test_move_cluster_relinks_chain_and_entry() {
        let dir = tempdir().unwrap();
        let mut img = fat16_image();
        let io = MemBlockIO::new(&mut img);
        let mut vol = Volume::mount(io, dir.path().join("img.jrnl")).unwrap();

        let body: Vec<u8> = (0..1536u32).map(|i| i as u8).collect();
        let id = vol.create_file(ROOT_ID, "move.bin", &body).unwrap();
        let chain = vol.file_chain(id).unwrap();
        assert_eq!(chain, vec![2, 3, 4]);

        // Move the middle cluster far away.
        vol.move_cluster(3, 100).unwrap();
        assert_eq!(vol.file_chain(id).unwrap(), vec![2, 100, 4]);
        assert_eq!(vol.read_file(id).unwrap(), body);
        assert!(vol.is_free(3));

        // Move the head: the directory entry must follow.
        vol.move_cluster(2, 200).unwrap();
        assert_eq!(vol.file_chain(id).unwrap(), vec![200, 100, 4]);

        let io = vol.close().unwrap();
        let mut vol = Volume::mount(io, dir.path().join("img.jrnl")).unwrap();
        let id = vol.find_path("/move.bin").unwrap();
        assert_eq!(vol.catalog().node(id).head, 200);
        assert_eq!(vol.read_file(id).unwrap(), body);
    }

    #[test]
    fn test_fat_copies_stay_in_sync() {
        let dir = tempdir().unwrap();
        let mut img = fat16_image();
        let io = MemBlockIO::new(&mut img);
        let mut vol = Volume::mount(io, dir.path().join("img.jrnl")).unwrap();

        let id = vol.create_file(ROOT_ID, "sync.bin", &[7u8; 2000]).unwrap();
        vol.move_cluster(vol.catalog().node(id).head, 50).unwrap();
        let params = vol.params().clone();
        let mut io = vol.close().unwrap();

        let len = params.fat_size_bytes();
        let mut fat0 = vec![0u8; len];
        let mut fat1 = vec![0u8; len];
        io.read_at(params.fat_offset(0), &mut fat0).unwrap();
        io.read_at(params.fat_offset(1), &mut fat1).unwrap();
        assert_eq!(fat0, fat1);
    }

    #[test]
    fn test_mismatched_fat_copies_repaired_on_mount() {
        let dir = tempdir().unwrap();
        let mut img = fat16_image();

        // Create a file, then vandalize its entries in copy 1 only.
        let io = MemBlockIO::new(&mut img);
        let mut vol = Volume::mount(io, dir.path().join("img.jrnl")).unwrap();
        let id = vol.create_file(ROOT_ID, "twin.bin", &[1u8; 600]).unwrap();
        let chain = vol.file_chain(id).unwrap();
        for &c in &chain {
            vol.set_fat_entry_in_copy(1, c, FatEntry::Free).unwrap();
        }
        let io = vol.close().unwrap();

        // Copy 0 preferred: the file survives and copy 1 is rewritten.
        let mut vol = Volume::mount(io, dir.path().join("img.jrnl")).unwrap();
        assert!(!vol.notes().is_empty());
        assert!(vol.find_path("/twin.bin").is_some());
        let params = vol.params().clone();
        let mut io = vol.close().unwrap();
        let len = params.fat_size_bytes();
        let mut fat0 = vec![0u8; len];
        let mut fat1 = vec![0u8; len];
        io.read_at(params.fat_offset(0), &mut fat0).unwrap();
        io.read_at(params.fat_offset(1), &mut fat1).unwrap();
        assert_eq!(fat0, fat1);
    }

    #[test]
    fn test_preferred_fat_copy_selects_winner() {
        let dir = tempdir().unwrap();
        let mut img = fat16_image();

        let io = MemBlockIO::new(&mut img);
        let mut vol = Volume::mount(io, dir.path().join("img.jrnl")).unwrap();
        let id = vol.create_file(ROOT_ID, "gone.bin", &[1u8; 600]).unwrap();
        let chain = vol.file_chain(id).unwrap();
        for &c in &chain {
            vol.set_fat_entry_in_copy(1, c, FatEntry::Free).unwrap();
        }
        let io = vol.close().unwrap();

        // Copy 1 preferred: the file's chain reads as free, so its chain is
        // recorded broken.
        let opts = OpenOptions {
            preferred_fat: 1,
            ..Default::default()
        };
        let vol = Volume::mount_with(io, dir.path().join("img.jrnl"), opts).unwrap();
        let id = vol.find_path("/gone.bin").unwrap();
        assert!(matches!(
            vol.catalog().node(id).chain_error,
            Some(ChainError::Broken(_))
        ));
    }

    #[test]
    fn test_chain_defects_detected_on_scan() {
        let dir = tempdir().unwrap();
        let mut img = fat16_image();
        let io = MemBlockIO::new(&mut img);
        let mut vol = Volume::mount(io, dir.path().join("img.jrnl")).unwrap();

        let a = vol.create_file(ROOT_ID, "loop.bin", &[1u8; 1100]).unwrap();
        let head = vol.catalog().node(a).head;
        vol.set_fat_entry(head, FatEntry::Next(head)).unwrap();

        let io = vol.close().unwrap();
        let vol = Volume::mount(io, dir.path().join("img.jrnl")).unwrap();
        let id = vol.find_path("/loop.bin").unwrap();
        assert!(matches!(
            vol.catalog().node(id).chain_error,
            Some(ChainError::Loop(_))
        ));
    }

    #[test]
    fn test_update_dir_entry_rewrites_metadata() {
        let dir = tempdir().unwrap();
        let mut img = fat16_image();
        let io = MemBlockIO::new(&mut img);
        let mut vol = Volume::mount(io, dir.path().join("img.jrnl")).unwrap();

        let id = vol.create_file(ROOT_ID, "meta.txt", b"abc").unwrap();
        let head = vol.catalog().node(id).head;

        let short = dirent::encode_short_name("meta.txt").unwrap();
        let attr = (FileAttributes::ARCHIVE | FileAttributes::HIDDEN).bits();
        let entry = DirEntryRaw::new(short, attr, head, 3, FatTimestamp::now());
        vol.update_dir_entry(id, &entry).unwrap();
        assert_eq!(vol.catalog().node(id).attr, attr);

        let io = vol.close().unwrap();
        let mut vol = Volume::mount(io, dir.path().join("img.jrnl")).unwrap();
        let id = vol.find_path("/meta.txt").unwrap();
        assert!(FileAttributes::is_hidden(vol.catalog().node(id).attr));
        assert_eq!(vol.read_file(id).unwrap(), b"abc");
    }

    #[test]
    fn test_zero_length_file_has_no_chain() {
        let dir = tempdir().unwrap();
        let mut img = fat16_image();
        let io = MemBlockIO::new(&mut img);
        let mut vol = Volume::mount(io, dir.path().join("img.jrnl")).unwrap();

        let id = vol.create_file(ROOT_ID, "empty.txt", b"").unwrap();
        assert_eq!(vol.catalog().node(id).head, 0);
        assert_eq!(vol.file_chain(id).unwrap(), Vec::<u32>::new());
        assert_eq!(vol.read_file(id).unwrap(), Vec::<u8>::new());
    }
}
