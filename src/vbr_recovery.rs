//! Primary VBR repair from the volume's backup boot sector.
//!
//! NTFS keeps a copy of the boot sector in the volume's last sector. When
//! the primary is damaged the backup can be written over it, restoring the
//! geometry every later stage depends on. The write is destructive, so it is
//! gated on an explicit operator confirmation whenever the backup itself
//! looks suspect.

use log::{info, warn};
use serde::Serialize;

use crate::boot_sector::BOOT_SIGNATURE;
use crate::error::{RescueError, Result};
use crate::image::{DiskImage, SECTOR_SIZE};
use crate::partition::parse_partition_table;

/// Asks the operator before a risky step. Injected so the engine never
/// talks to a console itself.
pub trait ConfirmPolicy {
    fn confirm(&mut self, prompt: &str) -> bool;
}

/// Fixed answer, for unattended runs and tests.
pub struct Assume(pub bool);

impl ConfirmPolicy for Assume {
    fn confirm(&mut self, _prompt: &str) -> bool {
        self.0
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct VbrRecoveryOutcome {
    pub primary_offset: u64,
    pub backup_offset: u64,
    pub backup_signature_ok: bool,
}

/// Overwrite the primary VBR with the volume's backup boot sector.
///
/// The partition geometry comes from the first MBR entry; `backup_verified`
/// asserts that the operator has confirmed a backup exists at the expected
/// location (last sector of the partition).
pub fn recover_vbr(
    image: &mut DiskImage,
    backup_verified: bool,
    confirm: &mut dyn ConfirmPolicy,
) -> Result<VbrRecoveryOutcome> {
    if !backup_verified {
        return Err(RescueError::Precondition(
            "backup boot sector has not been verified".into(),
        ));
    }

    let mbr = image.read_sector(0)?;
    if mbr.len() < SECTOR_SIZE {
        return Err(RescueError::short_read("MBR sector", mbr.len(), SECTOR_SIZE));
    }
    let entries = parse_partition_table(&mbr);
    let entry = entries[0];
    if entry.start_lba == 0 || entry.sector_count == 0 {
        return Err(RescueError::Precondition(format!(
            "first MBR entry does not describe a partition (lba {}, {} sectors)",
            entry.start_lba, entry.sector_count
        )));
    }

    let primary_offset = entry.byte_offset();
    let backup_offset =
        (entry.start_lba as u64 + entry.sector_count as u64 - 1) * SECTOR_SIZE as u64;

    let backup = image.read_at(backup_offset, SECTOR_SIZE)?;
    if backup.len() < SECTOR_SIZE {
        return Err(RescueError::short_read(
            "backup boot sector",
            backup.len(),
            SECTOR_SIZE,
        ));
    }

    let backup_signature_ok =
        u16::from_le_bytes([backup[510], backup[511]]) == BOOT_SIGNATURE;
    if !backup_signature_ok {
        warn!("backup boot sector at offset {backup_offset} lacks the 0xAA55 signature");
        if !confirm.confirm("backup boot sector looks invalid; write it over the primary anyway?")
        {
            return Err(RescueError::Aborted);
        }
    }

    image.write_at(primary_offset, &backup)?;
    info!("primary VBR at offset {primary_offset} restored from backup at {backup_offset}");

    Ok(VbrRecoveryOutcome {
        primary_offset,
        backup_offset,
        backup_signature_ok,
    })
}
