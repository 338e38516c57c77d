// SPDX-License-Identifier: MIT

//! Directory-entry codec: 32-byte short entries, long-name entries, names,
//! the rotate-right checksum binding them, and FAT timestamps.

use time::OffsetDateTime;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::attr::FileAttributes;
use crate::fat::FatVariant;

pub const ENTRY_SIZE: usize = 32;
pub const ENTRY_DELETED: u8 = 0xE5;
pub const ENTRY_END_OF_DIR: u8 = 0x00;

pub const DOT_NAME: [u8; 11] = *b".          ";
pub const DOTDOT_NAME: [u8; 11] = *b"..         ";

/// Byte offsets of the starting-cluster halves inside a 32-byte entry.
pub const FIRST_CLUSTER_HI_OFFSET: u32 = 20;
pub const FIRST_CLUSTER_LO_OFFSET: u32 = 26;

/// Short (8.3) directory entry, bit-exact on-disk layout.
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Copy, Clone, Debug)]
#[repr(C, packed)]
pub struct DirEntryRaw {
    pub name: [u8; 11],
    pub attr: u8,
    pub nt_reserved: u8,
    pub creation_time_tenth: u8,
    pub creation_time: u16,
    pub creation_date: u16,
    pub access_date: u16,
    pub first_cluster_high: u16,
    pub write_time: u16,
    pub write_date: u16,
    pub first_cluster_low: u16,
    pub file_size: u32,
}

impl DirEntryRaw {
    pub fn new(name: [u8; 11], attr: u8, cluster: u32, size: u32, stamp: FatTimestamp) -> Self {
        Self {
            name,
            attr,
            nt_reserved: 0,
            creation_time_tenth: stamp.tenth,
            creation_time: stamp.time,
            creation_date: stamp.date,
            access_date: stamp.date,
            first_cluster_high: ((cluster >> 16) & 0xFFFF) as u16,
            write_time: stamp.time,
            write_date: stamp.date,
            first_cluster_low: (cluster & 0xFFFF) as u16,
            file_size: size,
        }
    }

    /// Starting cluster. The high half only exists on FAT32; on FAT12/16 the
    /// field holds unrelated data and must be ignored.
    pub fn first_cluster(&self, variant: FatVariant) -> u32 {
        match variant {
            FatVariant::Fat32 => {
                ((self.first_cluster_high as u32) << 16) | (self.first_cluster_low as u32)
            }
            _ => self.first_cluster_low as u32,
        }
    }

    pub fn is_directory(&self) -> bool {
        FileAttributes::is_directory(self.attr)
    }
}

/// Long-name entry (attr 0x0F), 13 UTF-16 units per piece.
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Copy, Clone, Debug)]
#[repr(C, packed)]
pub struct LfnEntryRaw {
    pub order: u8,
    pub name1: [u16; 5],
    pub attr: u8,
    pub type_field: u8,
    pub checksum: u8,
    pub name2: [u16; 6],
    pub zero: u16,
    pub name3: [u16; 2],
}

impl LfnEntryRaw {
    pub fn extract_utf16(&self) -> [u16; 13] {
        let mut out = [0xFFFFu16; 13];
        let name1 = self.name1;
        let name2 = self.name2;
        let name3 = self.name3;
        out[0..5].copy_from_slice(&name1);
        out[5..11].copy_from_slice(&name2);
        out[11..13].copy_from_slice(&name3);
        out
    }
}

/// What a raw 32-byte slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEntryKind {
    /// 0x00 lead byte: this and everything after it is unused.
    EndOfDir,
    /// 0xE5 lead byte.
    Deleted,
    Lfn,
    VolumeLabel,
    /// `.` or `..`
    Dot,
    Short,
}

pub fn classify(raw: &[u8; ENTRY_SIZE]) -> RawEntryKind {
    match raw[0] {
        ENTRY_END_OF_DIR => RawEntryKind::EndOfDir,
        ENTRY_DELETED => RawEntryKind::Deleted,
        _ => {
            let attr = raw[11];
            if FileAttributes::is_lfn(attr) {
                RawEntryKind::Lfn
            } else if FileAttributes::is_volume_label(attr) {
                RawEntryKind::VolumeLabel
            } else if raw[0..11] == DOT_NAME || raw[0..11] == DOTDOT_NAME {
                RawEntryKind::Dot
            } else {
                RawEntryKind::Short
            }
        }
    }
}

/// Rolling rotate-right checksum of the 11-byte short name, as used by every
/// long-name entry that precedes it.
pub fn short_name_checksum(name: &[u8; 11]) -> u8 {
    let mut sum: u8 = 0;
    for &b in name {
        sum = sum.rotate_right(1).wrapping_add(b);
    }
    sum
}

/// Decode an 8.3 name to lower-case `name.ext` form.
pub fn decode_short_name(sfn: &[u8; 11]) -> String {
    let (name_raw, ext_raw) = sfn.split_at(8);

    let mut name: String = name_raw
        .iter()
        .take_while(|&&c| c != b' ')
        .map(|&c| (c as char).to_ascii_lowercase())
        .collect();

    let ext: String = ext_raw
        .iter()
        .take_while(|&&c| c != b' ')
        .map(|&c| (c as char).to_ascii_lowercase())
        .collect();

    if !ext.is_empty() {
        name.push('.');
        name.push_str(&ext);
    }
    name
}

/// Encode a name into 8.3 form. Returns `None` when the name does not fit
/// (too long, spaces, non-ASCII); callers creating files use plain 8.3 names.
pub fn encode_short_name(name: &str) -> Option<[u8; 11]> {
    let mut raw = [b' '; 11];

    let (base, ext) = match name.rsplit_once('.') {
        Some((b, e)) => (b, e),
        None => (name, ""),
    };
    if base.is_empty() || base.len() > 8 || ext.len() > 3 {
        return None;
    }

    for (i, ch) in base.bytes().enumerate() {
        let up = ch.to_ascii_uppercase();
        if !is_valid_sfn_char(up) {
            return None;
        }
        raw[i] = up;
    }
    for (i, ch) in ext.bytes().enumerate() {
        let up = ch.to_ascii_uppercase();
        if !is_valid_sfn_char(up) {
            return None;
        }
        raw[8 + i] = up;
    }

    Some(raw)
}

/// Allowed characters in SFN (after uppercase):
/// A-Z, 0-9 and !$%'-_@~`^#&(){}.
#[inline(always)]
fn is_valid_sfn_char(b: u8) -> bool {
    matches!(b,
        b'A'..=b'Z' | b'0'..=b'9' |
        b'!' | b'$' | b'%' | b'\'' | b'-' | b'_' | b'@' | b'~' | b'`' |
        b'^' | b'#' | b'&' | b'(' | b')' | b'{' | b'}'
    )
}

/// Assemble a long name from the LFN slots as they appear on disk
/// (last piece first). Returns `None` on malformed UTF-16.
pub fn decode_long_name(lfn_stack: &[[u8; ENTRY_SIZE]]) -> Option<String> {
    let mut units: Vec<u16> = Vec::with_capacity(lfn_stack.len() * 13);
    for raw in lfn_stack.iter().rev() {
        let entry = LfnEntryRaw::read_from_bytes(raw.as_slice()).ok()?;
        for &c in &entry.extract_utf16() {
            if c == 0x0000 || c == 0xFFFF {
                break;
            }
            units.push(c);
        }
    }
    String::from_utf16(&units).ok()
}

/// Checks the LFN run against the short entry that follows it.
pub fn lfn_matches_short(lfn_stack: &[[u8; ENTRY_SIZE]], short_name: &[u8; 11]) -> bool {
    let expected = short_name_checksum(short_name);
    lfn_stack.iter().all(|raw| raw[13] == expected)
}

/// FAT-encoded date/time pair plus the 10 ms resolution byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatTimestamp {
    pub date: u16,
    pub time: u16,
    pub tenth: u8,
}

impl FatTimestamp {
    pub fn now() -> Self {
        Self::from_datetime(OffsetDateTime::now_utc())
    }

    pub fn from_datetime(ts: OffsetDateTime) -> Self {
        let year = ts.year().clamp(1980, 2107);
        let month = ts.month() as u16;
        let day = ts.day() as u16;

        let hour = ts.hour() as u16;
        let minute = ts.minute() as u16;
        let second = ts.second() as u16;

        let date = ((year - 1980) as u16) << 9 | (month << 5) | day;
        let time = (hour << 11) | (minute << 5) | (second / 2);
        let tenth = (ts.millisecond() / 10) as u8;

        Self { date, time, tenth }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;
    use zerocopy::IntoBytes;

    #[test]
    fn test_struct_sizes() {
        assert_eq!(core::mem::size_of::<DirEntryRaw>(), ENTRY_SIZE);
        assert_eq!(core::mem::size_of::<LfnEntryRaw>(), ENTRY_SIZE);
    }

    #[test]
    fn test_entry_roundtrip() {
        let stamp = FatTimestamp::from_datetime(datetime!(2024-06-15 12:30:42 UTC));
        let e = DirEntryRaw::new(*b"FILE_A  TXT", 0x20, 0x0005_0010, 1234, stamp);
        let bytes = e.as_bytes().to_vec();
        let back = DirEntryRaw::read_from_bytes(&bytes[..]).unwrap();

        assert_eq!(back.first_cluster(FatVariant::Fat32), 0x0005_0010);
        assert_eq!(back.first_cluster(FatVariant::Fat16), 0x0010);
        let size = back.file_size;
        assert_eq!(size, 1234);
        assert!(!back.is_directory());
    }

    #[test]
    fn test_classify() {
        let mut raw = [0u8; ENTRY_SIZE];
        assert_eq!(classify(&raw), RawEntryKind::EndOfDir);

        raw[0] = ENTRY_DELETED;
        assert_eq!(classify(&raw), RawEntryKind::Deleted);

        raw[0] = b'A';
        raw[11] = 0x0F;
        assert_eq!(classify(&raw), RawEntryKind::Lfn);

        raw[11] = 0x08;
        assert_eq!(classify(&raw), RawEntryKind::VolumeLabel);

        raw[0..11].copy_from_slice(&DOT_NAME);
        raw[11] = 0x10;
        assert_eq!(classify(&raw), RawEntryKind::Dot);

        raw[0..11].copy_from_slice(b"FILE_A  TXT");
        raw[11] = 0x20;
        assert_eq!(classify(&raw), RawEntryKind::Short);
    }

    #[test]
    fn test_short_name_codec() {
        let raw = encode_short_name("file_a.txt").unwrap();
        assert_eq!(&raw, b"FILE_A  TXT");
        assert_eq!(decode_short_name(&raw), "file_a.txt");

        assert_eq!(decode_short_name(b"NOEXT      "), "noext");
        assert!(encode_short_name("too_long_name.txt").is_none());
        assert!(encode_short_name("has space.txt").is_none());
        assert!(encode_short_name("").is_none());
    }

    #[test]
    fn test_checksum_reference_value() {
        // Reference value computed from the algorithm in the FAT specification.
        let mut sum: u8 = 0;
        for &b in b"FILE_A  TXT" {
            sum = ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(b);
        }
        assert_eq!(short_name_checksum(b"FILE_A  TXT"), sum);
    }

    #[test]
    fn test_lfn_decode_and_checksum_match() {
        // Build two LFN slots for "long_example.dat" by hand (13 + 3 units).
        let short = encode_short_name("LONG_E~1.DAT").unwrap();
        let chk = short_name_checksum(&short);
        let units: Vec<u16> = "long_example.dat".encode_utf16().collect();

        let make_slot = |order: u8, last: bool, chunk: &[u16]| -> [u8; ENTRY_SIZE] {
            let mut padded = [0xFFFFu16; 13];
            padded[..chunk.len()].copy_from_slice(chunk);
            if chunk.len() < 13 {
                padded[chunk.len()] = 0;
            }
            let e = LfnEntryRaw {
                order: if last { order | 0x40 } else { order },
                name1: padded[0..5].try_into().unwrap(),
                attr: 0x0F,
                type_field: 0,
                checksum: chk,
                name2: padded[5..11].try_into().unwrap(),
                zero: 0,
                name3: padded[11..13].try_into().unwrap(),
            };
            e.as_bytes().try_into().unwrap()
        };

        // Disk order: last piece first.
        let stack = vec![make_slot(2, true, &units[13..]), make_slot(1, false, &units[..13])];

        assert!(lfn_matches_short(&stack, &short));
        assert_eq!(decode_long_name(&stack).unwrap(), "long_example.dat");

        let mut broken = stack.clone();
        broken[0][13] ^= 0xFF;
        assert!(!lfn_matches_short(&broken, &short));
    }

    #[test]
    fn test_timestamp_encoding() {
        let ts = FatTimestamp::from_datetime(datetime!(1994-03-07 10:15:30 UTC));
        assert_eq!(ts.date >> 9, 1994 - 1980);
        assert_eq!((ts.date >> 5) & 0x0F, 3);
        assert_eq!(ts.date & 0x1F, 7);
        assert_eq!(ts.time >> 11, 10);
        assert_eq!((ts.time >> 5) & 0x3F, 15);
        assert_eq!(ts.time & 0x1F, 15);
    }
}
