//! MBR partition table parsing and reconstruction.
//!
//! Diagnosis only needs `find_ntfs_partition`; the rebuild path sweeps the
//! image for NTFS boot sectors, proposes partition entries from them, and
//! can write a fresh MBR into a copy of the image.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use log::{debug, info};
use serde::Serialize;

use crate::boot_sector::{parse_boot_sector, BootSectorInfo, DEFAULT_RECORD_SIZE};
use crate::error::{RescueError, Result};
use crate::image::{DiskImage, SECTOR_SIZE};

pub const PARTITION_TABLE_OFFSET: usize = 0x1BE;
pub const PARTITION_ENTRY_SIZE: usize = 16;
pub const PARTITION_TYPE_NTFS: u8 = 0x07;

const MBR_SIGNATURE: [u8; 2] = [0x55, 0xAA];
const COPY_CHUNK: usize = 4 * 1024 * 1024;

/// One 16-byte slot of the MBR partition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PartitionEntry {
    pub boot_flag: u8,
    pub partition_type: u8,
    pub start_lba: u32,
    pub sector_count: u32,
}

impl PartitionEntry {
    fn decode(raw: &[u8]) -> PartitionEntry {
        PartitionEntry {
            boot_flag: raw[0],
            partition_type: raw[4],
            start_lba: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
            sector_count: u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]),
        }
    }

    pub fn byte_offset(&self) -> u64 {
        self.start_lba as u64 * SECTOR_SIZE as u64
    }
}

pub fn mbr_signature_ok(sector: &[u8]) -> bool {
    sector.len() >= SECTOR_SIZE && sector[510..512] == MBR_SIGNATURE
}

/// All four table slots, populated or not.
pub fn parse_partition_table(sector: &[u8]) -> Vec<PartitionEntry> {
    let mut entries = Vec::with_capacity(4);
    if sector.len() < SECTOR_SIZE {
        return entries;
    }
    for i in 0..4 {
        let at = PARTITION_TABLE_OFFSET + i * PARTITION_ENTRY_SIZE;
        entries.push(PartitionEntry::decode(&sector[at..at + PARTITION_ENTRY_SIZE]));
    }
    entries
}

/// First entry typed 0x07. When none exists the caller falls back to
/// treating offset 0 as a raw, unpartitioned NTFS volume.
pub fn find_ntfs_partition(sector: &[u8]) -> Option<PartitionEntry> {
    parse_partition_table(sector)
        .into_iter()
        .find(|e| e.partition_type == PARTITION_TYPE_NTFS)
}

/// Sanity of a boot-sector candidate found by the image sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSanity {
    Ok,
    MftOutOfRange,
    NoMft,
}

/// A plausible NTFS boot sector found at some LBA of the image.
#[derive(Debug, Clone, Serialize)]
pub struct BootCandidate {
    pub boot_lba: u64,
    pub info: BootSectorInfo,
    pub sanity: CandidateSanity,
}

/// Partition entry proposed from a boot-sector candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProposedPartition {
    pub start_lba: u64,
    pub sector_count: u64,
    pub partition_type: u8,
}

/// Sector-by-sector sweep for NTFS boot sectors. Bounded by `max_sectors`
/// when given; candidates keep their parse result and a sanity verdict.
pub fn scan_for_boot_sectors(
    image: &mut DiskImage,
    max_sectors: Option<u64>,
) -> Result<Vec<BootCandidate>> {
    let image_len = image.len();
    let total = image.total_sectors();
    let limit = max_sectors.map_or(total, |m| m.min(total));
    info!("sweeping {limit} of {total} sectors for NTFS boot sectors");

    let mut candidates = Vec::new();
    let mut lba = 0u64;
    while lba < limit {
        // Bounded read of many sectors at once; the OEM tag test is cheap.
        let span = ((limit - lba) as usize).min(COPY_CHUNK / SECTOR_SIZE);
        let chunk = image.read_at(lba * SECTOR_SIZE as u64, span * SECTOR_SIZE)?;
        for (i, sector) in chunk.chunks_exact(SECTOR_SIZE).enumerate() {
            if &sector[3..11] != b"NTFS    " {
                continue;
            }
            let at = lba + i as u64;
            if let Ok(info) = parse_boot_sector(sector) {
                let sanity = if info.mft_lcn < 0 {
                    CandidateSanity::NoMft
                } else if info
                    .mft_byte_offset()
                    .checked_add(DEFAULT_RECORD_SIZE as u64)
                    .map_or(false, |end| end < image_len)
                {
                    CandidateSanity::Ok
                } else {
                    CandidateSanity::MftOutOfRange
                };
                debug!("NTFS boot sector at LBA {at} ({sanity:?})");
                candidates.push(BootCandidate {
                    boot_lba: at,
                    info,
                    sanity,
                });
            }
        }
        lba += span as u64;
    }
    Ok(candidates)
}

/// Turn boot-sector candidates into partition proposals. A candidate whose
/// own sector count is zero extends to the end of the image.
pub fn propose_partitions(
    candidates: &[BootCandidate],
    image_sectors: u64,
) -> Vec<ProposedPartition> {
    candidates
        .iter()
        .map(|c| {
            let sector_count = if c.info.total_sectors > 0 {
                c.info.total_sectors
            } else {
                image_sectors - c.boot_lba
            };
            ProposedPartition {
                start_lba: c.boot_lba,
                sector_count,
                partition_type: PARTITION_TYPE_NTFS,
            }
        })
        .collect()
}

/// Construct a fresh 512-byte MBR: boot flag on the first entry only, CHS
/// fields filled with LBA-compatible placeholders, terminal 0x55AA.
pub fn build_mbr(proposals: &[ProposedPartition]) -> [u8; SECTOR_SIZE] {
    let mut mbr = [0u8; SECTOR_SIZE];
    for (i, p) in proposals.iter().take(4).enumerate() {
        let at = PARTITION_TABLE_OFFSET + i * PARTITION_ENTRY_SIZE;
        let entry = &mut mbr[at..at + PARTITION_ENTRY_SIZE];
        entry[0] = if i == 0 { 0x80 } else { 0x00 };
        entry[1] = 0x01; // CHS start: head 1, sector 1, cylinder 0
        entry[2] = 0x01;
        entry[3] = 0x00;
        entry[4] = p.partition_type;
        entry[5] = 0xFE; // CHS end: maximal LBA-compatible values
        entry[6] = 0xFF;
        entry[7] = 0xFF;
        entry[8..12].copy_from_slice(&((p.start_lba & 0xFFFF_FFFF) as u32).to_le_bytes());
        entry[12..16].copy_from_slice(&((p.sector_count & 0xFFFF_FFFF) as u32).to_le_bytes());
    }
    mbr[510..512].copy_from_slice(&MBR_SIGNATURE);
    mbr
}

/// Copy `source` to `destination`, replacing sector 0 with an MBR built
/// from the first (lowest-LBA) proposal.
pub fn rebuild_image(
    source: &Path,
    destination: &Path,
    proposals: &[ProposedPartition],
) -> Result<()> {
    if proposals.is_empty() {
        return Err(RescueError::Precondition(
            "no partition proposals to write".into(),
        ));
    }
    let mut input = File::open(source)?;
    let mut output = File::create(destination)?;

    let mut first_sector = [0u8; SECTOR_SIZE];
    let got = input.read(&mut first_sector)?;
    if got < SECTOR_SIZE {
        return Err(RescueError::Corruption(format!(
            "source image holds {got} bytes, shorter than one sector"
        )));
    }
    output.write_all(&build_mbr(&proposals[..1]))?;

    let mut buffer = vec![0u8; COPY_CHUNK];
    loop {
        let n = input.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        output.write_all(&buffer[..n])?;
    }
    output.flush()?;
    info!("rebuilt image written to {}", destination.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot_sector::sample_sector;
    use crate::image::testing::{temp_image, temp_path};

    #[test]
    fn built_mbr_round_trips_through_the_parser() {
        let proposals = [
            ProposedPartition {
                start_lba: 128,
                sector_count: 4096,
                partition_type: PARTITION_TYPE_NTFS,
            },
            ProposedPartition {
                start_lba: 8192,
                sector_count: 100,
                partition_type: 0x0C,
            },
        ];
        let mbr = build_mbr(&proposals);
        assert!(mbr_signature_ok(&mbr));

        let found = find_ntfs_partition(&mbr).unwrap();
        assert_eq!(found.start_lba, 128);
        assert_eq!(found.sector_count, 4096);
        assert_eq!(found.boot_flag, 0x80);
        assert_eq!(found.byte_offset(), 128 * 512);

        let table = parse_partition_table(&mbr);
        assert_eq!(table[1].boot_flag, 0x00);
        assert_eq!(table[1].partition_type, 0x0C);
        assert_eq!(table[2].partition_type, 0x00);
    }

    #[test]
    fn no_ntfs_entry_yields_none() {
        let mbr = build_mbr(&[ProposedPartition {
            start_lba: 1,
            sector_count: 1,
            partition_type: 0x0C,
        }]);
        assert!(find_ntfs_partition(&mbr).is_none());
    }

    #[test]
    fn sweep_finds_a_planted_boot_sector() {
        let mut bytes = vec![0u8; 16 * 512];
        bytes[3 * 512..4 * 512].copy_from_slice(&sample_sector());
        let path = temp_image("partition_sweep", &bytes);
        let mut img = DiskImage::open(&path).unwrap();
        let candidates = scan_for_boot_sectors(&mut img, None).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].boot_lba, 3);
        // 16 KiB MFT offset + one record does not fit in a 8 KiB image tail.
        assert_eq!(candidates[0].sanity, CandidateSanity::MftOutOfRange);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn proposals_fall_back_to_image_end_for_zero_length() {
        let mut info_sector = sample_sector();
        info_sector[0x28..0x30].copy_from_slice(&0u64.to_le_bytes());
        let candidate = BootCandidate {
            boot_lba: 10,
            info: crate::boot_sector::decode_boot_sector(&info_sector).unwrap(),
            sanity: CandidateSanity::Ok,
        };
        let proposals = propose_partitions(&[candidate], 100);
        assert_eq!(proposals[0].start_lba, 10);
        assert_eq!(proposals[0].sector_count, 90);
    }

    #[test]
    fn rebuild_replaces_sector_zero_and_keeps_the_rest() {
        let mut bytes = vec![0x11u8; 4 * 512];
        bytes[512..1024].fill(0x22);
        let source = temp_image("rebuild_src", &bytes);
        let destination = temp_path("rebuild_dst");
        let proposals = [ProposedPartition {
            start_lba: 1,
            sector_count: 3,
            partition_type: PARTITION_TYPE_NTFS,
        }];
        rebuild_image(&source, &destination, &proposals).unwrap();

        let out = std::fs::read(&destination).unwrap();
        assert_eq!(out.len(), bytes.len());
        assert!(mbr_signature_ok(&out[..512]));
        assert_eq!(find_ntfs_partition(&out[..512]).unwrap().start_lba, 1);
        assert_eq!(&out[512..1024], &bytes[512..1024]);
        std::fs::remove_file(&source).unwrap();
        std::fs::remove_file(&destination).unwrap();
    }
}
