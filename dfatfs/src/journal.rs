// SPDX-License-Identifier: MIT

//! Write-ahead journal for crash-safe image mutation.
//!
//! Record layout (all integers little-endian):
//!
//! ```text
//! seq: u64 | offset: u64 | len: u32 | old[len] | new[len] | crc32: u32 | flag: u8
//! ```
//!
//! `flag` 0 marks a staged write, 1 a commit marker (with `len` 0). A
//! transaction is the run of staged records up to its commit marker.
//!
//! Ordering per transaction: log write -> log flush -> data write -> data
//! flush -> log truncate. A crash at any point leaves the image either fully
//! pre- or fully post-transaction once replay has run.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use dfatio::BlockIO;

use crate::errors::{BlockIOError, JournalError, JournalResult};

const FLAG_STAGED: u8 = 0;
const FLAG_COMMIT: u8 = 1;

/// seq + offset + len
const RECORD_HEADER: usize = 8 + 8 + 4;
/// crc + flag
const RECORD_TRAILER: usize = 4 + 1;

/// Sibling journal file for an image path (`disk.img` -> `disk.img.jrnl`).
pub fn journal_path_for(image: &Path) -> PathBuf {
    let mut name = image.as_os_str().to_os_string();
    name.push(".jrnl");
    PathBuf::from(name)
}

/// Identifier of an open transaction. `stage`, `commit` and `abort` only
/// accept the id handed out by the `begin` that opened the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxId(u64);

#[derive(Debug)]
struct StagedWrite {
    offset: u64,
    data: Vec<u8>,
}

/// What `replay` found in a leftover journal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Committed transactions that were re-applied to the image.
    pub replayed: usize,
    /// Trailing staged records without a commit marker, discarded.
    pub discarded: usize,
}

/// Append-only log of pending byte-range writes.
///
/// The log file is created lazily on the first transaction, so read-only
/// runs never leave a journal behind.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    file: Option<File>,
    next_seq: u64,
    staged: Vec<StagedWrite>,
    open_tx: Option<u64>,
}

impl Journal {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            file: None,
            next_seq: 0,
            staged: Vec::new(),
            open_tx: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replays a leftover journal against the image, then removes it.
    ///
    /// Committed transactions are re-applied (their `new` bytes win);
    /// trailing uncommitted records are discarded. A checksum failure aborts
    /// before anything touches the image.
    pub fn replay<IO: BlockIO>(path: &Path, io: &mut IO) -> JournalResult<ReplaySummary> {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ReplaySummary::default())
            }
            Err(_) => return Err(JournalError::IO(BlockIOError::Io("journal read failed"))),
        };

        // Phase 1: parse everything up front. The image stays untouched if
        // any fully-written record fails its checksum.
        let mut committed: Vec<(u64, Vec<u8>)> = Vec::new();
        let mut pending: Vec<(u64, Vec<u8>)> = Vec::new();
        let mut replayed = 0usize;
        let mut discarded = 0usize;

        let mut pos = 0usize;
        while bytes.len() - pos >= RECORD_HEADER + RECORD_TRAILER {
            let len = u32::from_le_bytes(bytes[pos + 16..pos + 20].try_into().unwrap()) as usize;
            let total = RECORD_HEADER + 2 * len + RECORD_TRAILER;
            if bytes.len() - pos < total {
                // Torn tail record.
                discarded += 1;
                break;
            }

            let body = &bytes[pos..pos + RECORD_HEADER + 2 * len];
            let stored_crc = u32::from_le_bytes(
                bytes[pos + RECORD_HEADER + 2 * len..pos + RECORD_HEADER + 2 * len + 4]
                    .try_into()
                    .unwrap(),
            );
            if crc32fast::hash(body) != stored_crc {
                return Err(JournalError::Corrupt("Journal record checksum mismatch"));
            }

            let offset = u64::from_le_bytes(bytes[pos + 8..pos + 16].try_into().unwrap());
            let flag = bytes[pos + total - 1];
            match flag {
                FLAG_COMMIT => {
                    replayed += usize::from(!pending.is_empty());
                    committed.append(&mut pending);
                }
                FLAG_STAGED => {
                    let new_start = pos + RECORD_HEADER + len;
                    pending.push((offset, bytes[new_start..new_start + len].to_vec()));
                }
                _ => return Err(JournalError::Corrupt("Unknown journal record flag")),
            }
            pos += total;
        }
        if bytes.len() > pos && discarded == 0 {
            // Short trailing fragment, not even a full header.
            discarded += 1;
        }
        discarded += pending.len();

        // Phase 2: apply the committed writes, flush, drop the log.
        if !committed.is_empty() {
            for (offset, data) in &committed {
                io.write_at(*offset, data)?;
            }
            io.flush()?;
        }
        std::fs::remove_file(path)
            .map_err(|_| JournalError::IO(BlockIOError::Io("journal remove failed")))?;

        Ok(ReplaySummary {
            replayed,
            discarded,
        })
    }

    fn file(&mut self) -> JournalResult<&mut File> {
        if self.file.is_none() {
            let f = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&self.path)
                .map_err(|_| JournalError::IO(BlockIOError::Io("journal create failed")))?;
            self.file = Some(f);
        }
        Ok(self.file.as_mut().unwrap())
    }

    /// Opens a transaction and hands out its id.
    pub fn begin(&mut self) -> JournalResult<TxId> {
        if self.open_tx.is_some() {
            return Err(JournalError::Corrupt("Nested journal transaction"));
        }
        let id = self.next_seq;
        self.open_tx = Some(id);
        Ok(TxId(id))
    }

    /// `tx` must name the transaction currently open.
    fn guard(&self, tx: TxId) -> JournalResult<()> {
        if self.open_tx != Some(tx.0) {
            return Err(JournalError::Corrupt("Stale journal transaction id"));
        }
        Ok(())
    }

    /// Appends a record for a pending write of `new` at `offset`. The current
    /// image contents at that range are captured as the `old` side. Staged
    /// writes are not yet visible on the image.
    pub fn stage<IO: BlockIO>(
        &mut self,
        tx: TxId,
        io: &mut IO,
        offset: u64,
        new: &[u8],
    ) -> JournalResult<()> {
        self.guard(tx)?;
        let mut old = vec![0u8; new.len()];
        io.read_at(offset, &mut old)?;

        self.append_record(offset, &old, new, FLAG_STAGED)?;
        self.staged.push(StagedWrite {
            offset,
            data: new.to_vec(),
        });
        Ok(())
    }

    /// Commit point: marker -> log flush -> image writes -> image flush ->
    /// log truncate.
    pub fn commit<IO: BlockIO>(&mut self, tx: TxId, io: &mut IO) -> JournalResult<()> {
        self.guard(tx)?;
        self.append_record(0, &[], &[], FLAG_COMMIT)?;
        let file = self.file()?;
        file.sync_data()
            .map_err(|_| JournalError::IO(BlockIOError::Io("journal sync failed")))?;

        for w in &self.staged {
            io.write_at(w.offset, &w.data)?;
        }
        io.flush()?;

        let file = self.file()?;
        file.set_len(0)
            .and_then(|_| file.seek(SeekFrom::Start(0)).map(|_| ()))
            .and_then(|_| file.sync_data())
            .map_err(|_| JournalError::IO(BlockIOError::Io("journal truncate failed")))?;

        self.staged.clear();
        self.open_tx = None;
        Ok(())
    }

    /// Discards the open transaction; its records die with the truncate.
    pub fn abort(&mut self, tx: TxId) -> JournalResult<()> {
        self.guard(tx)?;
        let file = self.file()?;
        file.set_len(0)
            .and_then(|_| file.seek(SeekFrom::Start(0)).map(|_| ()))
            .map_err(|_| JournalError::IO(BlockIOError::Io("journal truncate failed")))?;
        self.staged.clear();
        self.open_tx = None;
        Ok(())
    }

    /// Clean shutdown: any still-open transaction is abandoned, then the log
    /// file is removed.
    pub fn close(mut self) -> JournalResult<()> {
        if let Some(id) = self.open_tx {
            self.abort(TxId(id))?;
        }
        if self.file.take().is_some() {
            std::fs::remove_file(&self.path)
                .map_err(|_| JournalError::IO(BlockIOError::Io("journal remove failed")))?;
        }
        Ok(())
    }

    fn append_record(
        &mut self,
        offset: u64,
        old: &[u8],
        new: &[u8],
        flag: u8,
    ) -> JournalResult<()> {
        debug_assert_eq!(old.len(), new.len());
        let seq = self.next_seq;
        self.next_seq += 1;

        let mut rec = Vec::with_capacity(RECORD_HEADER + old.len() + new.len() + RECORD_TRAILER);
        rec.extend_from_slice(&seq.to_le_bytes());
        rec.extend_from_slice(&offset.to_le_bytes());
        rec.extend_from_slice(&(new.len() as u32).to_le_bytes());
        rec.extend_from_slice(old);
        rec.extend_from_slice(new);
        let crc = crc32fast::hash(&rec);
        rec.extend_from_slice(&crc.to_le_bytes());
        rec.push(flag);

        let file = self.file()?;
        file.write_all(&rec)
            .map_err(|_| JournalError::IO(BlockIOError::Io("journal append failed")))?;
        Ok(())
    }
}
