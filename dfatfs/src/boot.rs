// SPDX-License-Identifier: MIT

//! Boot-sector parsing and derived volume geometry.
//!
//! The boot sector is split the way the on-disk format splits it: a BPB part
//! shared by all variants, then an extension that differs between FAT12/16
//! and FAT32. All fields little-endian, layouts bit-exact to the Microsoft
//! FAT specification.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::errors::{FsError, FsResult};
use crate::fat::{FatVariant, FIRST_DATA_CLUSTER};

pub const SECTOR_SIZE: usize = 512;
pub const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];
pub const BOOT_SIGNATURE_OFFSET: usize = 510;

/// BPB fields common to FAT12, FAT16 and FAT32 (first 36 bytes of sector 0).
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Copy, Clone, Debug)]
#[repr(C, packed)]
pub struct BpbCommon {
    pub jump_boot: [u8; 3],
    pub oem_name: [u8; 8],
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub num_fats: u8,
    pub root_entry_count: u16,
    pub total_sectors_16: u16,
    pub media: u8,
    pub fat_size_16: u16,
    pub sectors_per_track: u16,
    pub num_heads: u16,
    pub hidden_sectors: u32,
    pub total_sectors_32: u32,
}

/// Extended BPB of FAT12/FAT16 volumes (bytes 36..62).
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Copy, Clone, Debug)]
#[repr(C, packed)]
pub struct ExtBpb16 {
    pub drive_number: u8,
    pub reserved1: u8,
    pub boot_signature: u8,
    pub volume_id: u32,
    pub volume_label: [u8; 11],
    pub fs_type: [u8; 8],
}

/// Extended BPB of FAT32 volumes (bytes 36..90).
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Copy, Clone, Debug)]
#[repr(C, packed)]
pub struct ExtBpb32 {
    pub fat_size_32: u32,
    pub ext_flags: u16,
    pub fs_version: u16,
    pub root_cluster: u32,
    pub fsinfo_sector: u16,
    pub backup_boot_sector: u16,
    pub reserved: [u8; 12],
    pub drive_number: u8,
    pub reserved1: u8,
    pub boot_signature: u8,
    pub volume_id: u32,
    pub volume_label: [u8; 11],
    pub fs_type: [u8; 8],
}

/// FAT32 FSInfo sector.
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Copy, Clone, Debug)]
#[repr(C, packed)]
pub struct FsInfoSector {
    pub lead_signature: [u8; 4],
    pub reserved1: [u8; 480],
    pub struct_signature: [u8; 4],
    pub free_cluster_count: u32,
    pub next_free_cluster: u32,
    pub reserved2: [u8; 12],
    pub trail_signature: [u8; 4],
}

pub const FSINFO_LEAD_SIGNATURE: [u8; 4] = *b"RRaA";
pub const FSINFO_STRUCT_SIGNATURE: [u8; 4] = *b"rrAa";
pub const FSINFO_TRAIL_SIGNATURE: [u8; 4] = [0x00, 0x00, 0x55, 0xAA];
pub const FSINFO_UNKNOWN: u32 = 0xFFFF_FFFF;

/// Geometry extracted once from sector 0. Immutable for the life of a run.
#[derive(Debug, Clone)]
pub struct BootParams {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub num_fats: u8,
    pub root_entry_count: u16,
    pub total_sectors: u64,
    pub fat_size_sectors: u32,
    pub variant: FatVariant,
    /// Head of the root directory chain; 0 on FAT12/16.
    pub root_cluster: u32,
    /// FSInfo sector number; 0 on FAT12/16.
    pub fsinfo_sector: u16,
    pub volume_id: u32,
    pub volume_label: [u8; 11],

    // Derived, cached at parse time.
    pub bytes_per_cluster: u32,
    pub root_dir_sectors: u32,
    pub first_data_sector: u64,
    pub cluster_count: u32,
}

impl BootParams {
    /// Parses and validates sector 0.
    pub fn parse(sector0: &[u8]) -> FsResult<Self> {
        if sector0.len() < SECTOR_SIZE {
            return Err(FsError::Format("Boot sector shorter than 512 bytes"));
        }
        if sector0[BOOT_SIGNATURE_OFFSET..BOOT_SIGNATURE_OFFSET + 2] != BOOT_SIGNATURE {
            return Err(FsError::Format("Missing 0xAA55 boot signature"));
        }

        let common = BpbCommon::read_from_bytes(&sector0[..36])
            .map_err(|_| FsError::Format("Unreadable BPB"))?;

        let bps = common.bytes_per_sector;
        if !matches!(bps, 512 | 1024 | 2048 | 4096) {
            return Err(FsError::Format("Invalid bytes-per-sector"));
        }
        let spc = common.sectors_per_cluster;
        if spc == 0 || !spc.is_power_of_two() {
            return Err(FsError::Format("Sectors-per-cluster not a power of two"));
        }
        if common.num_fats == 0 {
            return Err(FsError::Format("Volume declares zero FATs"));
        }
        if common.reserved_sectors == 0 {
            return Err(FsError::Format("Volume declares zero reserved sectors"));
        }

        let root_entry_count = common.root_entry_count;
        let root_dir_sectors =
            ((root_entry_count as u32 * 32) + (bps as u32 - 1)) / bps as u32;

        let ext32 = ExtBpb32::read_from_bytes(&sector0[36..90])
            .map_err(|_| FsError::Format("Unreadable extended BPB"))?;
        let ext16 = ExtBpb16::read_from_bytes(&sector0[36..62])
            .map_err(|_| FsError::Format("Unreadable extended BPB"))?;

        let fat_size_sectors = if common.fat_size_16 != 0 {
            common.fat_size_16 as u32
        } else {
            ext32.fat_size_32
        };
        if fat_size_sectors == 0 {
            return Err(FsError::Format("Volume declares zero sectors per FAT"));
        }

        let total_sectors = if common.total_sectors_16 != 0 {
            common.total_sectors_16 as u64
        } else {
            common.total_sectors_32 as u64
        };

        let first_data_sector = common.reserved_sectors as u64
            + common.num_fats as u64 * fat_size_sectors as u64
            + root_dir_sectors as u64;
        if total_sectors <= first_data_sector {
            return Err(FsError::Format("No data region after system sectors"));
        }
        let data_sectors = total_sectors - first_data_sector;
        let cluster_count = (data_sectors / spc as u64) as u32;
        if cluster_count == 0 {
            return Err(FsError::Format("Volume has no data clusters"));
        }

        let variant = FatVariant::from_cluster_count(cluster_count);

        let (root_cluster, fsinfo_sector, volume_id, volume_label) = match variant {
            FatVariant::Fat32 => {
                if root_entry_count != 0 {
                    return Err(FsError::Format("FAT32 volume with fixed root entries"));
                }
                (
                    ext32.root_cluster,
                    ext32.fsinfo_sector,
                    ext32.volume_id,
                    ext32.volume_label,
                )
            }
            _ => {
                if root_entry_count == 0 {
                    return Err(FsError::Format("FAT12/16 volume without root entries"));
                }
                (0, 0, ext16.volume_id, ext16.volume_label)
            }
        };

        Ok(Self {
            bytes_per_sector: bps,
            sectors_per_cluster: spc,
            reserved_sectors: common.reserved_sectors,
            num_fats: common.num_fats,
            root_entry_count,
            total_sectors,
            fat_size_sectors,
            variant,
            root_cluster,
            fsinfo_sector,
            volume_id,
            volume_label,
            bytes_per_cluster: bps as u32 * spc as u32,
            root_dir_sectors,
            first_data_sector,
            cluster_count,
        })
    }

    // --- Region offsets (bytes from the start of the volume) ---

    #[inline]
    pub fn fat_size_bytes(&self) -> usize {
        self.fat_size_sectors as usize * self.bytes_per_sector as usize
    }

    /// Start of FAT copy `index`.
    #[inline]
    pub fn fat_offset(&self, index: u8) -> u64 {
        self.reserved_sectors as u64 * self.bytes_per_sector as u64
            + index as u64 * self.fat_size_bytes() as u64
    }

    /// Start of the fixed root-directory region (FAT12/16).
    #[inline]
    pub fn root_dir_offset(&self) -> u64 {
        self.fat_offset(self.num_fats)
    }

    /// Start of the data of cluster `n` (n >= 2).
    #[inline]
    pub fn cluster_offset(&self, n: u32) -> u64 {
        debug_assert!(n >= FIRST_DATA_CLUSTER);
        (self.first_data_sector
            + (n - FIRST_DATA_CLUSTER) as u64 * self.sectors_per_cluster as u64)
            * self.bytes_per_sector as u64
    }

    #[inline]
    pub fn first_data_cluster(&self) -> u32 {
        FIRST_DATA_CLUSTER
    }

    #[inline]
    pub fn last_data_cluster(&self) -> u32 {
        FIRST_DATA_CLUSTER + self.cluster_count - 1
    }

    #[inline]
    pub fn in_data_range(&self, c: u32) -> bool {
        (self.first_data_cluster()..=self.last_data_cluster()).contains(&c)
    }

    /// FAT entries that actually exist in the table (clusters + 2 reserved).
    #[inline]
    pub fn fat_entries(&self) -> u32 {
        self.cluster_count + FIRST_DATA_CLUSTER
    }

    pub fn label_string(&self) -> String {
        String::from_utf8_lossy(&self.volume_label)
            .trim_end()
            .to_string()
    }
}
