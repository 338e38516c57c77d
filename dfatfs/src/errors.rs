// SPDX-License-Identifier: MIT

use core::fmt;

pub use dfatio::error::{BlockIOError, BlockIOResult};

/// A defect found while following a cluster chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainError {
    /// The chain revisits a cluster (self-loop or longer cycle).
    Loop(u32),
    /// An entry points outside the data region.
    OutOfRange(u32),
    /// A cluster in the chain is marked bad.
    Bad(u32),
    /// A free or reserved entry was reached before end-of-chain.
    Broken(u32),
    /// The chain runs into a cluster already owned by another file.
    CrossLink(u32),
}

impl ChainError {
    pub fn msg(&self) -> &'static str {
        match self {
            ChainError::Loop(_) => "Loop in cluster chain",
            ChainError::OutOfRange(_) => "Chain entry outside the data region",
            ChainError::Bad(_) => "Bad cluster inside chain",
            ChainError::Broken(_) => "Chain interrupted by a free entry",
            ChainError::CrossLink(_) => "Chain crosses into another file",
        }
    }

    pub fn cluster(&self) -> u32 {
        match *self {
            ChainError::Loop(c)
            | ChainError::OutOfRange(c)
            | ChainError::Bad(c)
            | ChainError::Broken(c)
            | ChainError::CrossLink(c) => c,
        }
    }
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (cluster {})", self.msg(), self.cluster())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalError {
    IO(BlockIOError),
    /// Replay failed a checksum; the image must not be touched further.
    Corrupt(&'static str),
}

impl JournalError {
    pub fn msg(&self) -> &'static str {
        match self {
            JournalError::IO(_) => "Journal IO error",
            JournalError::Corrupt(msg) => msg,
        }
    }

    pub fn source(&self) -> Option<FsError> {
        match self {
            JournalError::IO(e) => Some(FsError::IO(*e)),
            _ => None,
        }
    }
}

/// Top-level error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    IO(BlockIOError),
    /// The image is not a valid FAT volume.
    Format(&'static str),
    Chain(ChainError),
    Journal(JournalError),
    /// No contiguous allocation possible and displacement exhausted alternatives.
    NoSpace,
    NotFound,
    Exists,
    Unsupported(&'static str),
}

// === impl From ===

impl From<BlockIOError> for FsError {
    fn from(e: BlockIOError) -> Self {
        FsError::IO(e)
    }
}

impl From<ChainError> for FsError {
    fn from(e: ChainError) -> Self {
        FsError::Chain(e)
    }
}

impl From<JournalError> for FsError {
    fn from(e: JournalError) -> Self {
        FsError::Journal(e)
    }
}

impl From<BlockIOError> for JournalError {
    fn from(e: BlockIOError) -> Self {
        JournalError::IO(e)
    }
}

pub type FsResult<T = ()> = Result<T, FsError>;
pub type JournalResult<T = ()> = Result<T, JournalError>;

impl FsError {
    pub fn msg(&self) -> &'static str {
        match self {
            FsError::IO(e) => e.msg(),
            FsError::Format(msg) => msg,
            FsError::Chain(e) => e.msg(),
            FsError::Journal(e) => e.msg(),
            FsError::NoSpace => "No space for a contiguous allocation",
            FsError::NotFound => "No such file or directory",
            FsError::Exists => "File already exists",
            FsError::Unsupported(msg) => msg,
        }
    }

    pub fn source(&self) -> Option<FsError> {
        match self {
            FsError::Journal(e) => e.source(),
            _ => None,
        }
    }

    /// The image itself is damaged and needs manual attention.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            FsError::Format(_) | FsError::Chain(_) | FsError::Journal(JournalError::Corrupt(_))
        )
    }

    pub fn is_io(&self) -> bool {
        matches!(self, FsError::IO(_) | FsError::Journal(JournalError::IO(_)))
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let FsError::Chain(e) = self {
            return write!(f, "{e}");
        }
        write!(f, "{}", self.msg())?;
        let mut current = self.source();
        while let Some(src) = current {
            write!(f, "\n  caused by: {}", src.msg())?;
            current = src.source();
        }
        Ok(())
    }
}

impl std::error::Error for FsError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_chain_display() {
        let low = BlockIOError::OutOfBounds;
        let jrn = JournalError::IO(low);
        let top = FsError::Journal(jrn);

        let text = format!("{top}");
        assert!(text.contains("caused by"));
        assert!(text.contains("Out of bounds"));
    }

    #[test]
    fn test_corruption_classification() {
        assert!(FsError::Format("bad signature").is_corruption());
        assert!(FsError::Chain(ChainError::Loop(5)).is_corruption());
        assert!(!FsError::NoSpace.is_corruption());
        assert!(FsError::IO(BlockIOError::Busy).is_io());
    }
}
