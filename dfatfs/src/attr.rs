// SPDX-License-Identifier: MIT

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileAttributes: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN    = 0x02;
        const SYSTEM    = 0x04;
        const VOLUME_ID = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE   = 0x20;
        const LFN       = 0x0F;
    }
}

impl FileAttributes {
    #[inline]
    pub fn is_directory(raw: u8) -> bool {
        raw & Self::DIRECTORY.bits() != 0
    }

    #[inline]
    pub fn is_volume_label(raw: u8) -> bool {
        raw & Self::LFN.bits() != Self::LFN.bits() && raw & Self::VOLUME_ID.bits() != 0
    }

    #[inline]
    pub fn is_lfn(raw: u8) -> bool {
        raw & Self::LFN.bits() == Self::LFN.bits() && raw & 0x30 == 0
    }

    #[inline]
    pub fn is_hidden(raw: u8) -> bool {
        raw & Self::HIDDEN.bits() != 0
    }
}
