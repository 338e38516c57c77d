// SPDX-License-Identifier: MIT

use std::fs::{File, OpenOptions};
use std::io::{Error, Read, Seek, SeekFrom, Write};
use std::path::Path;

use fs2::FileExt;

use crate::{BlockIO, BlockIOError, BlockIOResult, BlockIOSetLen};

/// File-backed `BlockIO` over a disk image.
///
/// Holds an exclusive advisory lock for its whole lifetime; a second opener
/// gets `BlockIOError::Busy`. `flush` is durable (`sync_data`), which is what
/// the journal protocol relies on.
#[derive(Debug)]
pub struct FileBlockIO {
    file: File,
    base: u64,
}

impl FileBlockIO {
    pub fn open(path: &Path) -> BlockIOResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        file.try_lock_exclusive()
            .map_err(|_| BlockIOError::Busy)?;
        Ok(Self { file, base: 0 })
    }

    /// Creates (or truncates) an image file of `len` bytes.
    pub fn create(path: &Path, len: u64) -> BlockIOResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.try_lock_exclusive()
            .map_err(|_| BlockIOError::Busy)?;
        file.set_len(len)?;
        Ok(Self { file, base: 0 })
    }

    pub fn len(&self) -> BlockIOResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn is_empty(&self) -> BlockIOResult<bool> {
        Ok(self.len()? == 0)
    }
}

impl BlockIO for FileBlockIO {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> BlockIOResult {
        self.file.seek(SeekFrom::Start(self.base + offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> BlockIOResult {
        self.file.seek(SeekFrom::Start(self.base + offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn flush(&mut self) -> BlockIOResult {
        self.file.sync_data()?;
        Ok(())
    }

    fn set_base(&mut self, base: u64) -> u64 {
        self.base = base;
        base
    }

    fn base(&self) -> u64 {
        self.base
    }
}

impl BlockIOSetLen for FileBlockIO {
    fn set_len(&mut self, len: u64) -> BlockIOResult {
        self.file.set_len(self.base + len)?;
        self.flush()?;
        Ok(())
    }
}

impl From<Error> for BlockIOError {
    #[cold]
    #[inline(never)]
    fn from(e: Error) -> Self {
        // Leak the string to produce a 'static str. Acceptable for error mapping.
        let leaked_str: &'static str = Box::leak(e.to_string().into_boxed_str());
        BlockIOError::Io(leaked_str)
    }
}
