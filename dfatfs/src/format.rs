// SPDX-License-Identifier: MIT

//! Blank-volume formatter.
//!
//! Prepares a minimal valid FAT12/16/32 volume: boot sector (plus FSInfo and
//! backup boot on FAT32), reserved FAT entries in every copy, and an empty
//! root directory. Geometry is derived from the requested data-cluster count
//! so fixtures land exactly in the variant they ask for.

use dfatio::{BlockIO, BlockIOExt};
use zerocopy::IntoBytes;

use crate::boot::{
    BootParams, BpbCommon, ExtBpb16, ExtBpb32, FsInfoSector, BOOT_SIGNATURE, SECTOR_SIZE,
    FSINFO_LEAD_SIGNATURE, FSINFO_STRUCT_SIGNATURE, FSINFO_TRAIL_SIGNATURE, FSINFO_UNKNOWN,
};
use crate::errors::FsResult;
use crate::fat::{self, FatEntry, FatVariant, FIRST_DATA_CLUSTER};

pub const MEDIA_DESCRIPTOR: u8 = 0xF8;
pub const OEM_NAME: [u8; 8] = *b"MSWIN4.1";
pub const FAT32_ROOT_CLUSTER: u32 = 2;
pub const FAT32_FSINFO_SECTOR: u16 = 1;
pub const FAT32_BACKUP_BOOT_SECTOR: u16 = 6;

#[derive(Debug, Clone)]
pub struct FormatSpec {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub num_fats: u8,
    /// Data clusters; decides the FAT variant.
    pub cluster_count: u32,
    pub volume_label: [u8; 11],
    pub volume_id: u32,
}

impl FormatSpec {
    pub fn with_cluster_count(cluster_count: u32) -> Self {
        Self {
            bytes_per_sector: 512,
            sectors_per_cluster: 1,
            num_fats: 2,
            cluster_count,
            volume_label: *b"NO NAME    ",
            volume_id: 0x1234_5678,
        }
    }

    pub fn variant(&self) -> FatVariant {
        FatVariant::from_cluster_count(self.cluster_count)
    }

    pub fn reserved_sectors(&self) -> u16 {
        match self.variant() {
            FatVariant::Fat32 => 32,
            _ => 1,
        }
    }

    pub fn root_entry_count(&self) -> u16 {
        match self.variant() {
            FatVariant::Fat32 => 0,
            _ => 512,
        }
    }

    fn root_dir_sectors(&self) -> u32 {
        (self.root_entry_count() as u32 * 32).div_ceil(self.bytes_per_sector as u32)
    }

    pub fn fat_size_sectors(&self) -> u32 {
        let bytes = self
            .variant()
            .table_bytes(self.cluster_count + FIRST_DATA_CLUSTER);
        (bytes as u32).div_ceil(self.bytes_per_sector as u32)
    }

    pub fn total_sectors(&self) -> u64 {
        self.reserved_sectors() as u64
            + self.num_fats as u64 * self.fat_size_sectors() as u64
            + self.root_dir_sectors() as u64
            + self.cluster_count as u64 * self.sectors_per_cluster as u64
    }

    pub fn image_len(&self) -> u64 {
        self.total_sectors() * self.bytes_per_sector as u64
    }
}

/// Writes a blank volume and returns its parsed parameters.
pub fn format_volume<IO: BlockIO>(io: &mut IO, spec: &FormatSpec) -> FsResult<BootParams> {
    let variant = spec.variant();

    write_boot_region(io, spec)?;
    write_fat_region(io, spec)?;

    // Empty root directory.
    match variant {
        FatVariant::Fat32 => {
            let root_off = data_offset(spec, FAT32_ROOT_CLUSTER);
            io.zero_fill(
                root_off,
                spec.bytes_per_sector as usize * spec.sectors_per_cluster as usize,
            )?;
        }
        _ => {
            let root_off = (spec.reserved_sectors() as u64
                + spec.num_fats as u64 * spec.fat_size_sectors() as u64)
                * spec.bytes_per_sector as u64;
            io.zero_fill(
                root_off,
                spec.root_dir_sectors() as usize * spec.bytes_per_sector as usize,
            )?;
        }
    }
    io.flush()?;

    let mut sector0 = vec![0u8; SECTOR_SIZE];
    io.read_at(0, &mut sector0)?;
    BootParams::parse(&sector0)
}

fn data_offset(spec: &FormatSpec, cluster: u32) -> u64 {
    let first_data_sector = spec.reserved_sectors() as u64
        + spec.num_fats as u64 * spec.fat_size_sectors() as u64
        + (spec.root_entry_count() as u64 * 32).div_ceil(spec.bytes_per_sector as u64);
    (first_data_sector + (cluster - FIRST_DATA_CLUSTER) as u64 * spec.sectors_per_cluster as u64)
        * spec.bytes_per_sector as u64
}

fn write_boot_region<IO: BlockIO>(io: &mut IO, spec: &FormatSpec) -> FsResult<()> {
    let variant = spec.variant();
    let is_fat32 = variant == FatVariant::Fat32;
    let total = spec.total_sectors();

    let common = BpbCommon {
        jump_boot: [0xEB, 0x58, 0x90],
        oem_name: OEM_NAME,
        bytes_per_sector: spec.bytes_per_sector,
        sectors_per_cluster: spec.sectors_per_cluster,
        reserved_sectors: spec.reserved_sectors(),
        num_fats: spec.num_fats,
        root_entry_count: spec.root_entry_count(),
        total_sectors_16: if !is_fat32 && total <= u16::MAX as u64 {
            total as u16
        } else {
            0
        },
        media: MEDIA_DESCRIPTOR,
        fat_size_16: if is_fat32 {
            0
        } else {
            spec.fat_size_sectors() as u16
        },
        sectors_per_track: 63,
        num_heads: 255,
        hidden_sectors: 0,
        total_sectors_32: if !is_fat32 && total <= u16::MAX as u64 {
            0
        } else {
            total as u32
        },
    };

    let mut sector0 = vec![0u8; SECTOR_SIZE];
    sector0[..36].copy_from_slice(common.as_bytes());

    if is_fat32 {
        let ext = ExtBpb32 {
            fat_size_32: spec.fat_size_sectors(),
            ext_flags: 0,
            fs_version: 0,
            root_cluster: FAT32_ROOT_CLUSTER,
            fsinfo_sector: FAT32_FSINFO_SECTOR,
            backup_boot_sector: FAT32_BACKUP_BOOT_SECTOR,
            reserved: [0u8; 12],
            drive_number: 0x80,
            reserved1: 0,
            boot_signature: 0x29,
            volume_id: spec.volume_id,
            volume_label: spec.volume_label,
            fs_type: *b"FAT32   ",
        };
        sector0[36..90].copy_from_slice(ext.as_bytes());
    } else {
        let ext = ExtBpb16 {
            drive_number: 0x80,
            reserved1: 0,
            boot_signature: 0x29,
            volume_id: spec.volume_id,
            volume_label: spec.volume_label,
            fs_type: match variant {
                FatVariant::Fat12 => *b"FAT12   ",
                _ => *b"FAT16   ",
            },
        };
        sector0[36..62].copy_from_slice(ext.as_bytes());
    }
    sector0[510..512].copy_from_slice(&BOOT_SIGNATURE);

    io.write_at(0, &sector0)?;

    if is_fat32 {
        io.write_at(
            FAT32_BACKUP_BOOT_SECTOR as u64 * spec.bytes_per_sector as u64,
            &sector0,
        )?;

        let fsinfo = FsInfoSector {
            lead_signature: FSINFO_LEAD_SIGNATURE,
            reserved1: [0u8; 480],
            struct_signature: FSINFO_STRUCT_SIGNATURE,
            free_cluster_count: FSINFO_UNKNOWN,
            next_free_cluster: FAT32_ROOT_CLUSTER + 1,
            reserved2: [0u8; 12],
            trail_signature: FSINFO_TRAIL_SIGNATURE,
        };
        io.write_at(
            FAT32_FSINFO_SECTOR as u64 * spec.bytes_per_sector as u64,
            fsinfo.as_bytes(),
        )?;
    }
    Ok(())
}

fn write_fat_region<IO: BlockIO>(io: &mut IO, spec: &FormatSpec) -> FsResult<()> {
    let variant = spec.variant();
    let table_len = spec.fat_size_sectors() as usize * spec.bytes_per_sector as usize;
    let mut table = vec![0u8; table_len];

    // FAT[0] carries the media descriptor, FAT[1] the end-of-chain fill.
    fat::write_raw(
        &mut table,
        0,
        variant,
        (variant.mask() & !0xFF) | MEDIA_DESCRIPTOR as u32,
    );
    fat::write_raw(&mut table, 1, variant, variant.eoc());

    if variant == FatVariant::Fat32 {
        fat::write_entry(&mut table, FAT32_ROOT_CLUSTER, variant, FatEntry::EndOfChain);
    }

    let fat_base = spec.reserved_sectors() as u64 * spec.bytes_per_sector as u64;
    for copy in 0..spec.num_fats {
        io.write_at(fat_base + copy as u64 * table_len as u64, &table)?;
    }
    Ok(())
}
