// SPDX-License-Identifier: MIT

//! Deliberate fragmentation: the inverse of the relocation engine, used to
//! produce test inputs. Adjacent links are broken by moving the later
//! cluster to the far end of the free space; heads stay put, so directory
//! entries and dot entries never need fixing here.

use dfatio::BlockIO;

use crate::catalog::{FileId, ROOT_ID};
use crate::errors::FsResult;
use crate::volume::Volume;

pub struct Fragmenter<'v, IO: BlockIO> {
    vol: &'v mut Volume<IO>,
}

impl<'v, IO: BlockIO> Fragmenter<'v, IO> {
    pub fn new(vol: &'v mut Volume<IO>) -> Self {
        Self { vol }
    }

    /// Scatters every file until no two consecutive chain links are
    /// adjacent (or free space runs out). Returns clusters moved.
    pub fn run(&mut self) -> FsResult<usize> {
        let mut files: Vec<FileId> = self
            .vol
            .catalog()
            .ids()
            .filter(|&id| {
                let n = self.vol.catalog().node(id);
                id != ROOT_ID && n.head != 0 && n.chain_error.is_none()
            })
            .collect();
        files.sort_by_key(|&id| self.vol.catalog().node(id).head);

        let mut moved = 0usize;
        for id in files {
            moved += self.scatter_file(id)?;
        }
        Ok(moved)
    }

    fn scatter_file(&mut self, id: FileId) -> FsResult<usize> {
        let mut moved = 0usize;
        // Each hop breaks one adjacency; the bound keeps pathological free
        // maps from cycling forever.
        let mut budget = self.vol.file_chain(id)?.len() * 8;

        loop {
            let chain = self.vol.file_chain(id)?;
            let Some(i) = (1..chain.len()).find(|&i| chain[i] == chain[i - 1] + 1) else {
                break;
            };
            if budget == 0 {
                break;
            }
            budget -= 1;

            let prev = chain[i - 1];
            let dst = match self.vol.highest_free() {
                Some(d) if d != prev + 1 => d,
                _ => match self.vol.lowest_free() {
                    Some(d) if d != prev + 1 && d != chain[i] => d,
                    _ => break,
                },
            };
            self.vol.move_cluster(chain[i], dst)?;
            moved += 1;
        }
        Ok(moved)
    }
}
