//! NTFS Volume Boot Record (VBR) decoding and validation.
//!
//! `parse_boot_sector` applies the checks in a fixed order and reports the
//! first failing field; `diagnose_boot_sector` runs all of them and collects
//! every failing category so the orchestrator can pick a recovery strategy.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::image::SECTOR_SIZE;

pub const DEFAULT_RECORD_SIZE: u32 = 1024;
pub const BOOT_SIGNATURE: u16 = 0xAA55;

const OEM_ID: &str = "NTFS";
const VALID_SECTOR_SIZES: [u16; 4] = [512, 1024, 2048, 4096];

/// Immutable snapshot of the boot sector fields, computed once per session.
#[derive(Debug, Clone, Serialize)]
pub struct BootSectorInfo {
    pub oem_id: String,
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub bytes_per_cluster: u32,
    pub total_sectors: u64,
    pub mft_lcn: i64,
    pub mft_mirr_lcn: i64,
    pub clusters_per_file_record: i8,
    pub bytes_per_file_record: u32,
    pub boot_signature: u16,
}

impl BootSectorInfo {
    /// Saturating: a corrupt LCN must yield an out-of-range offset, not an
    /// arithmetic panic.
    pub fn mft_byte_offset(&self) -> u64 {
        (self.mft_lcn.max(0) as u64).saturating_mul(self.bytes_per_cluster as u64)
    }

    pub fn volume_bytes(&self) -> u64 {
        self.total_sectors.saturating_mul(self.bytes_per_sector as u64)
    }

    /// Record size for scanning. A corrupt boot sector must not poison the
    /// scan, so implausible values fall back to the 1024-byte default.
    pub fn record_size_or_default(&self) -> u32 {
        if (256..=65536).contains(&self.bytes_per_file_record) {
            self.bytes_per_file_record
        } else {
            DEFAULT_RECORD_SIZE
        }
    }
}

/// One variant per failing check, so callers can classify the corruption.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BootSectorError {
    #[error("boot sector is {0} bytes, need at least 512")]
    TooShort(usize),
    #[error("OEM id {0:?} is not \"NTFS\"")]
    BadOemId(String),
    #[error("bytes per sector is {0}, not one of 512/1024/2048/4096")]
    BadBytesPerSector(u16),
    #[error("sectors per cluster is zero")]
    ZeroSectorsPerCluster,
    #[error("boot signature is 0x{0:04X}, expected 0xAA55")]
    BadBootSignature(u16),
    #[error("total sector count is zero")]
    ZeroTotalSectors,
    #[error("MFT LCN {0} is not a positive cluster number")]
    BadMftLcn(i64),
    #[error("MFT at byte {offset} lies outside the {volume_bytes}-byte volume")]
    MftOutOfRange { offset: u64, volume_bytes: u64 },
}

/// The four non-exclusive diagnostic categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    PartitionDescription,
    VolumeParameters,
    ClusterTable,
    VbrSignature,
}

impl BootSectorError {
    pub fn category(&self) -> IssueCategory {
        match self {
            BootSectorError::TooShort(_)
            | BootSectorError::BadOemId(_)
            | BootSectorError::ZeroTotalSectors => IssueCategory::PartitionDescription,
            BootSectorError::BadBytesPerSector(_) | BootSectorError::ZeroSectorsPerCluster => {
                IssueCategory::VolumeParameters
            }
            BootSectorError::BadMftLcn(_) | BootSectorError::MftOutOfRange { .. } => {
                IssueCategory::ClusterTable
            }
            BootSectorError::BadBootSignature(_) => IssueCategory::VbrSignature,
        }
    }
}

/// Decode the raw fields without judging them. Fails only on a short buffer.
pub fn decode_boot_sector(sector: &[u8]) -> Result<BootSectorInfo, BootSectorError> {
    if sector.len() < SECTOR_SIZE {
        return Err(BootSectorError::TooShort(sector.len()));
    }

    let oem_id = String::from_utf8_lossy(&sector[3..11])
        .trim_end()
        .to_string();

    let mut cursor = Cursor::new(sector);
    cursor.set_position(0x0B);
    let bytes_per_sector = cursor.read_u16::<LittleEndian>().unwrap_or(0);
    cursor.set_position(0x0D);
    let sectors_per_cluster = cursor.read_u8().unwrap_or(0);
    cursor.set_position(0x28);
    let total_sectors = cursor.read_u64::<LittleEndian>().unwrap_or(0);
    cursor.set_position(0x30);
    let mft_lcn = cursor.read_i64::<LittleEndian>().unwrap_or(0);
    cursor.set_position(0x38);
    let mft_mirr_lcn = cursor.read_i64::<LittleEndian>().unwrap_or(0);
    cursor.set_position(0x40);
    let clusters_per_file_record = cursor.read_i8().unwrap_or(0);
    cursor.set_position(0x1FE);
    let boot_signature = cursor.read_u16::<LittleEndian>().unwrap_or(0);

    let bytes_per_cluster = bytes_per_sector as u32 * sectors_per_cluster as u32;
    let bytes_per_file_record = if clusters_per_file_record > 0 {
        clusters_per_file_record as u32 * bytes_per_cluster
    } else {
        1u32.checked_shl(clusters_per_file_record.unsigned_abs() as u32)
            .unwrap_or(0)
    };

    Ok(BootSectorInfo {
        oem_id,
        bytes_per_sector,
        sectors_per_cluster,
        bytes_per_cluster,
        total_sectors,
        mft_lcn,
        mft_mirr_lcn,
        clusters_per_file_record,
        bytes_per_file_record,
        boot_signature,
    })
}

/// Validate a decoded boot sector, reporting the first failing field.
pub fn validate(info: &BootSectorInfo) -> Result<(), BootSectorError> {
    if info.oem_id != OEM_ID {
        return Err(BootSectorError::BadOemId(info.oem_id.clone()));
    }
    if !VALID_SECTOR_SIZES.contains(&info.bytes_per_sector) {
        return Err(BootSectorError::BadBytesPerSector(info.bytes_per_sector));
    }
    if info.sectors_per_cluster == 0 {
        return Err(BootSectorError::ZeroSectorsPerCluster);
    }
    if info.boot_signature != BOOT_SIGNATURE {
        return Err(BootSectorError::BadBootSignature(info.boot_signature));
    }
    if info.total_sectors == 0 {
        return Err(BootSectorError::ZeroTotalSectors);
    }
    // The absolute MFT LCN is unsigned on a healthy volume; only run-list
    // deltas may be negative.
    if info.mft_lcn <= 0 {
        return Err(BootSectorError::BadMftLcn(info.mft_lcn));
    }
    let offset = info.mft_byte_offset();
    let volume_bytes = info.volume_bytes();
    let record_end = offset.checked_add(info.record_size_or_default() as u64);
    if record_end.map_or(true, |end| end > volume_bytes) {
        return Err(BootSectorError::MftOutOfRange {
            offset,
            volume_bytes,
        });
    }
    Ok(())
}

/// Decode and validate in one step.
pub fn parse_boot_sector(sector: &[u8]) -> Result<BootSectorInfo, BootSectorError> {
    let info = decode_boot_sector(sector)?;
    validate(&info)?;
    Ok(info)
}

/// Run every check and collect all failing categories. Returns the decoded
/// fields alongside, even when they are broken.
pub fn diagnose_boot_sector(
    sector: &[u8],
) -> (Vec<IssueCategory>, Option<BootSectorInfo>) {
    let info = match decode_boot_sector(sector) {
        Ok(info) => info,
        Err(_) => {
            return (vec![IssueCategory::VbrSignature], None);
        }
    };

    let mut issues = Vec::new();
    if info.oem_id != OEM_ID || info.total_sectors == 0 {
        issues.push(IssueCategory::PartitionDescription);
    }
    if !VALID_SECTOR_SIZES.contains(&info.bytes_per_sector) || info.sectors_per_cluster == 0 {
        issues.push(IssueCategory::VolumeParameters);
    }
    if info.mft_lcn <= 0 || info.mft_lcn as u64 > info.total_sectors {
        issues.push(IssueCategory::ClusterTable);
    }
    if info.boot_signature != BOOT_SIGNATURE {
        issues.push(IssueCategory::VbrSignature);
    }
    (issues, Some(info))
}

/// Test builder for a healthy 512-byte NTFS boot sector.
#[cfg(test)]
pub(crate) fn sample_sector() -> Vec<u8> {
    let mut s = vec![0u8; 512];
    s[3..11].copy_from_slice(b"NTFS    ");
    s[0x0B..0x0D].copy_from_slice(&512u16.to_le_bytes());
    s[0x0D] = 8;
    s[0x28..0x30].copy_from_slice(&1000u64.to_le_bytes());
    s[0x30..0x38].copy_from_slice(&4u64.to_le_bytes());
    s[0x38..0x40].copy_from_slice(&5u64.to_le_bytes());
    s[0x40] = (-10i8) as u8; // 2^10 = 1024-byte records
    s[0x1FE] = 0x55;
    s[0x1FF] = 0xAA;
    s
}
