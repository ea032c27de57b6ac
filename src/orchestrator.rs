//! End-to-end rescue session.
//!
//! A session diagnoses the volume, picks a strategy from the findings,
//! optionally restores the primary VBR from its backup, then sweeps the whole
//! image for MFT records and reconstructs deleted files. The sweep never
//! trusts the MFT pointer, so it works even when the boot sector geometry is
//! partly or wholly garbage.

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

use log::{info, warn};
use rayon::prelude::*;
use serde::Serialize;

use crate::boot_sector::{diagnose_boot_sector, BootSectorInfo, IssueCategory, DEFAULT_RECORD_SIZE};
use crate::cluster_reader::read_runs;
use crate::error::{RescueError, Result};
use crate::file_carver;
use crate::image::DiskImage;
use crate::mft_record::{parse_record, validate_record, DataAttribute, ParsedRecord, RECORD_SIGNATURE};
use crate::partition::{find_ntfs_partition, mbr_signature_ok};
use crate::report::{write_offset_list, RecoveredFileReport, RecoveryStatus, ScanReport};
use crate::scanner::{SignatureScanner, DEFAULT_CHUNK_SIZE};
use crate::vbr_recovery::{recover_vbr, ConfirmPolicy, VbrRecoveryOutcome};

/// Cluster size assumed when the boot sector cannot supply one.
const DEFAULT_CLUSTER_BYTES: u64 = 4096;

const OFFSET_LIST_NAME: &str = "record_offsets.txt";

#[derive(Debug, Clone)]
pub struct RescueConfig {
    /// Directory recovered files and the offset list are written into.
    pub output_dir: PathBuf,
    pub chunk_size: usize,
    /// Scan a healthy volume without asking first.
    pub scan_when_healthy: bool,
    /// Keep the raw signature-hit offsets next to the recovered files.
    pub keep_offset_list: bool,
    /// Operator's assertion that the backup VBR location was verified.
    pub backup_verified: bool,
}

impl Default for RescueConfig {
    fn default() -> Self {
        RescueConfig {
            output_dir: PathBuf::from("recovered"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            scan_when_healthy: false,
            keep_offset_list: false,
            backup_verified: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RescuePhase {
    Diagnosing,
    StrategySelected,
    VbrRecovering,
    FileScanning,
    Reporting,
    Done,
}

fn advance(phase: &mut RescuePhase, next: RescuePhase) {
    *phase = next;
    info!("phase: {next:?}");
}

/// What the boot-sector and partition-table checks found.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnosis {
    pub issues: Vec<IssueCategory>,
    pub mbr_signature_ok: bool,
    /// Byte offset of the NTFS volume inside the image; 0 for an
    /// unpartitioned volume image.
    pub partition_offset: u64,
    pub boot: Option<BootSectorInfo>,
}

impl Diagnosis {
    pub fn healthy(&self) -> bool {
        self.issues.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RescueStrategy {
    /// Restore the VBR from backup, then scan.
    RepairAndScan,
    /// Nothing to repair; scanning is optional.
    ScanOnly,
}

#[derive(Debug, Serialize)]
pub struct RescueOutcome {
    pub diagnosis: Diagnosis,
    pub strategy: RescueStrategy,
    pub vbr: Option<VbrRecoveryOutcome>,
    pub report: Option<ScanReport>,
}

/// Inspect sector 0 and, when it holds an MBR, the first NTFS partition's
/// boot sector. A clean VBR directly at offset 0 wins: volume images are
/// more common here than whole-disk images.
pub fn diagnose(image: &mut DiskImage) -> Result<Diagnosis> {
    if image.is_empty() {
        return Err(RescueError::Precondition("image holds no data".into()));
    }
    let sector0 = image.read_sector(0)?;
    let mbr_ok = mbr_signature_ok(&sector0);
    let (issues, boot) = diagnose_boot_sector(&sector0);
    if issues.is_empty() {
        return Ok(Diagnosis {
            issues,
            mbr_signature_ok: mbr_ok,
            partition_offset: 0,
            boot,
        });
    }

    if let Some(entry) = find_ntfs_partition(&sector0) {
        let vbr = image.read_sector(entry.start_lba as u64)?;
        let (issues, boot) = diagnose_boot_sector(&vbr);
        return Ok(Diagnosis {
            issues,
            mbr_signature_ok: mbr_ok,
            partition_offset: entry.byte_offset(),
            boot,
        });
    }

    Ok(Diagnosis {
        issues,
        mbr_signature_ok: mbr_ok,
        partition_offset: 0,
        boot,
    })
}

pub fn select_strategy(diagnosis: &Diagnosis) -> RescueStrategy {
    if diagnosis.healthy() {
        RescueStrategy::ScanOnly
    } else {
        RescueStrategy::RepairAndScan
    }
}

/// Full session: diagnose, repair when warranted, scan, reconstruct.
///
/// A failed VBR repair is reported and the scan still runs: the sweep does
/// not need a valid boot sector. An operator abort stops everything.
pub fn run(
    image: &mut DiskImage,
    config: &RescueConfig,
    confirm: &mut dyn ConfirmPolicy,
) -> Result<RescueOutcome> {
    let mut phase = RescuePhase::Diagnosing;
    info!("phase: {phase:?}");
    let diagnosis = diagnose(image)?;
    info!(
        "diagnosis: {} issue(s), volume at byte {}",
        diagnosis.issues.len(),
        diagnosis.partition_offset
    );

    advance(&mut phase, RescuePhase::StrategySelected);
    let strategy = select_strategy(&diagnosis);
    info!("strategy: {strategy:?}");

    let mut vbr = None;
    if strategy == RescueStrategy::RepairAndScan {
        advance(&mut phase, RescuePhase::VbrRecovering);
        match recover_vbr(image, config.backup_verified, confirm) {
            Ok(outcome) => vbr = Some(outcome),
            Err(RescueError::Aborted) => return Err(RescueError::Aborted),
            Err(e) => warn!("VBR recovery failed, scanning anyway: {e}"),
        }
    }

    let scan = match strategy {
        RescueStrategy::RepairAndScan => true,
        RescueStrategy::ScanOnly => {
            config.scan_when_healthy
                || confirm.confirm("volume looks healthy; scan for deleted files anyway?")
        }
    };

    let report = if scan {
        advance(&mut phase, RescuePhase::FileScanning);
        // A successful repair may have fixed the geometry; re-read it.
        let current = if vbr.is_some() {
            diagnose(image)?
        } else {
            diagnosis.clone()
        };
        let mut report = scan_and_recover(image, &current, config)?;
        report.issues = diagnosis.issues.clone();
        Some(report)
    } else {
        info!("scan declined, stopping after diagnosis");
        None
    };

    advance(&mut phase, RescuePhase::Reporting);
    let outcome = RescueOutcome {
        diagnosis,
        strategy,
        vbr,
        report,
    };
    advance(&mut phase, RescuePhase::Done);
    Ok(outcome)
}

/// Sweep the image for `"FILE"` records and write every deleted file's
/// content under `config.output_dir`.
pub fn scan_and_recover(
    image: &mut DiskImage,
    diagnosis: &Diagnosis,
    config: &RescueConfig,
) -> Result<ScanReport> {
    let (bytes_per_cluster, record_size) = match &diagnosis.boot {
        Some(info) if info.bytes_per_cluster > 0 => (
            info.bytes_per_cluster as u64,
            info.record_size_or_default() as usize,
        ),
        _ => {
            warn!(
                "boot geometry unusable, assuming {DEFAULT_CLUSTER_BYTES}-byte clusters and \
                 {DEFAULT_RECORD_SIZE}-byte records"
            );
            (DEFAULT_CLUSTER_BYTES, DEFAULT_RECORD_SIZE as usize)
        }
    };
    let partition_base = diagnosis.partition_offset;
    fs::create_dir_all(&config.output_dir)?;

    let mut offsets = Vec::new();
    {
        let scanner = SignatureScanner::new(image, RECORD_SIGNATURE, config.chunk_size);
        for hit in scanner {
            offsets.push(hit?);
        }
    }
    info!("signature sweep found {} hit(s)", offsets.len());
    if config.keep_offset_list {
        write_offset_list(&config.output_dir.join(OFFSET_LIST_NAME), &offsets)?;
    }

    let mut report = ScanReport::new(image.path(), diagnosis.issues.clone());
    report.records_found = offsets.len();

    let mut candidates: Vec<ParsedRecord> = Vec::new();
    for &offset in &offsets {
        // A bad sector under one hit must not end the sweep.
        let record = match image.read_at(offset, record_size) {
            Ok(record) => record,
            Err(e) => {
                warn!("record-sized read at 0x{offset:X} failed: {e}");
                report.read_failures += 1;
                continue;
            }
        };
        if !validate_record(&record) {
            continue;
        }
        report.records_valid += 1;
        let parsed = parse_record(&record, offset);
        if !parsed.is_in_use && !parsed.is_directory && parsed.data.is_some() {
            candidates.push(parsed);
        }
    }
    report.candidates = candidates.len();
    info!(
        "{} valid record(s), {} deleted-file candidate(s)",
        report.records_valid, report.candidates
    );

    // Reconstruction is read-only and independent per candidate, so it runs
    // on the thread pool; each worker opens its own handle on the image.
    let base: &DiskImage = image;
    let contents: Vec<std::result::Result<(Vec<u8>, bool), String>> = candidates
        .par_iter()
        .map_init(
            || base.reopen_read_only(),
            |handle, candidate| {
                let handle = handle.as_mut().map_err(|e| e.to_string())?;
                Ok(reconstruct(handle, candidate, bytes_per_cluster, partition_base))
            },
        )
        .collect();

    let mut used_names = HashSet::new();
    for (candidate, content) in candidates.iter().zip(contents) {
        let entry = match content {
            Err(e) => {
                warn!(
                    "record at 0x{:X}: could not open image for reconstruction: {e}",
                    candidate.source_offset
                );
                report.count(RecoveryStatus::Failed);
                RecoveredFileReport {
                    record_offset: candidate.source_offset,
                    file_name: String::new(),
                    output_path: None,
                    size: 0,
                    status: RecoveryStatus::Failed,
                    detected_type: None,
                }
            }
            Ok((bytes, complete)) => {
                let detected = file_carver::identify(&bytes);
                let base = candidate
                    .file_name
                    .as_deref()
                    .and_then(sanitize_name)
                    .unwrap_or_else(|| {
                        format!(
                            "record_{:08x}.{}",
                            candidate.source_offset,
                            detected.map_or("bin", |sig| sig.extension)
                        )
                    });
                let name = uniquify(base, candidate.source_offset, &mut used_names);

                let (status, output_path) = if bytes.is_empty() {
                    (RecoveryStatus::Empty, None)
                } else {
                    let path = config.output_dir.join(&name);
                    match fs::write(&path, &bytes) {
                        Ok(()) => {
                            let status = if complete {
                                RecoveryStatus::Recovered
                            } else {
                                RecoveryStatus::Partial
                            };
                            (status, Some(path))
                        }
                        Err(e) => {
                            warn!("failed to write {name}: {e}");
                            (RecoveryStatus::Failed, None)
                        }
                    }
                };
                report.count(status);
                RecoveredFileReport {
                    record_offset: candidate.source_offset,
                    file_name: name,
                    output_path,
                    size: bytes.len() as u64,
                    status,
                    detected_type: detected.map(|sig| sig.name.to_string()),
                }
            }
        };
        report.files.push(entry);
    }

    info!(
        "recovered {} file(s), {} partial, {} failed",
        report.recovered, report.partial, report.failed
    );
    Ok(report)
}

fn reconstruct(
    image: &mut DiskImage,
    candidate: &ParsedRecord,
    bytes_per_cluster: u64,
    partition_base: u64,
) -> (Vec<u8>, bool) {
    match candidate.data.as_ref() {
        Some(DataAttribute::Resident(bytes)) => (bytes.clone(), true),
        Some(DataAttribute::NonResident { runs, truncated }) => {
            let outcome = read_runs(image, runs, bytes_per_cluster, partition_base);
            let complete = outcome.complete() && !truncated;
            (outcome.bytes, complete)
        }
        None => (Vec::new(), true),
    }
}

/// Keep alphanumerics, dot, underscore and dash; everything else becomes an
/// underscore. A name with nothing but substitutions left is rejected.
fn sanitize_name(name: &str) -> Option<String> {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('.');
    if trimmed.chars().all(|c| c == '_') {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// On a name collision the record's source offset is spliced in before the
/// extension, so every candidate gets its own output file.
fn uniquify(name: String, offset: u64, used: &mut HashSet<String>) -> String {
    if used.insert(name.clone()) {
        return name;
    }
    let unique = match name.rfind('.') {
        Some(dot) => format!("{}_{:x}{}", &name[..dot], offset, &name[dot..]),
        None => format!("{name}_{offset:x}"),
    };
    used.insert(unique.clone());
    unique
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot_sector::sample_sector;
    use crate::image::testing::{temp_image, temp_path};
    use crate::mft_record::builder::{empty_record, record_with_resident_data, record_with_run_list};
    use crate::partition::{build_mbr, ProposedPartition, PARTITION_TYPE_NTFS};
    use crate::vbr_recovery::Assume;

    const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0x46];

    fn config_for(tag: &str) -> RescueConfig {
        RescueConfig {
            output_dir: temp_path(tag),
            scan_when_healthy: true,
            keep_offset_list: true,
            ..RescueConfig::default()
        }
    }

    fn cleanup(config: &RescueConfig) {
        let _ = fs::remove_dir_all(&config.output_dir);
    }

    #[test]
    fn strategy_follows_the_diagnosis() {
        let healthy = Diagnosis {
            issues: vec![],
            mbr_signature_ok: false,
            partition_offset: 0,
            boot: None,
        };
        assert_eq!(select_strategy(&healthy), RescueStrategy::ScanOnly);

        let broken = Diagnosis {
            issues: vec![IssueCategory::VbrSignature],
            ..healthy
        };
        assert_eq!(select_strategy(&broken), RescueStrategy::RepairAndScan);
    }

    #[test]
    fn diagnose_follows_the_partition_table() {
        // No VBR at 0; MBR points at a clean boot sector on LBA 2.
        let mut bytes = vec![0u8; 8 * 512];
        bytes[..512].copy_from_slice(&build_mbr(&[ProposedPartition {
            start_lba: 2,
            sector_count: 6,
            partition_type: PARTITION_TYPE_NTFS,
        }]));
        bytes[2 * 512..3 * 512].copy_from_slice(&sample_sector());
        let path = temp_image("orch_diag_mbr", &bytes);
        let mut img = DiskImage::open(&path).unwrap();

        let d = diagnose(&mut img).unwrap();
        assert!(d.healthy());
        assert!(d.mbr_signature_ok);
        assert_eq!(d.partition_offset, 1024);
        assert_eq!(d.boot.unwrap().bytes_per_cluster, 4096);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn full_run_recovers_deleted_files_and_skips_live_ones() {
        let mut bytes = vec![0u8; 32 * 1024];
        bytes[..512].copy_from_slice(&sample_sector());
        bytes[4096..5120].copy_from_slice(&record_with_resident_data("photo.jpg", JPEG, 0));
        bytes[8192..9216].copy_from_slice(&record_with_resident_data("busy.txt", b"x", 1));
        // Deleted non-resident file: one run at LCN 5 (bytes 20480..24576).
        bytes[12288..13312]
            .copy_from_slice(&record_with_run_list("big.bin", &[0x11, 0x01, 0x05, 0x00], 0));
        bytes[20480..24576].fill(0x5A);
        let path = temp_image("orch_full_run", &bytes);
        let mut img = DiskImage::open(&path).unwrap();
        let config = config_for("orch_full_out");

        let outcome = run(&mut img, &config, &mut Assume(false)).unwrap();
        assert_eq!(outcome.strategy, RescueStrategy::ScanOnly);
        assert!(outcome.vbr.is_none());

        let report = outcome.report.unwrap();
        assert_eq!(report.records_found, 3);
        assert_eq!(report.records_valid, 3);
        assert_eq!(report.read_failures, 0);
        assert_eq!(report.candidates, 2);
        assert_eq!(report.recovered, 2);
        assert_eq!(report.failed, 0);

        let photo = fs::read(config.output_dir.join("photo.jpg")).unwrap();
        assert_eq!(photo, JPEG);
        let big = fs::read(config.output_dir.join("big.bin")).unwrap();
        assert_eq!(big, vec![0x5A; 4096]);
        assert!(!config.output_dir.join("busy.txt").exists());

        let jpeg_entry = report
            .files
            .iter()
            .find(|f| f.file_name == "photo.jpg")
            .unwrap();
        assert_eq!(jpeg_entry.detected_type.as_deref(), Some("JPEG image"));
        assert_eq!(jpeg_entry.status, RecoveryStatus::Recovered);

        let offsets = fs::read_to_string(config.output_dir.join(OFFSET_LIST_NAME)).unwrap();
        assert_eq!(offsets, "4096\n8192\n12288\n");
        cleanup(&config);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn broken_boot_sector_still_scans_after_failed_repair() {
        let mut boot = sample_sector();
        boot[0x1FE] = 0;
        boot[0x1FF] = 0;
        let mut bytes = vec![0u8; 16 * 1024];
        bytes[..512].copy_from_slice(&boot);
        bytes[4096..5120].copy_from_slice(&record_with_resident_data("notes.txt", b"remember", 0));
        let path = temp_image("orch_broken_boot", &bytes);
        let mut img = DiskImage::open(&path).unwrap();
        let config = config_for("orch_broken_out");

        // backup_verified stays false, so the repair fails its precondition
        // and the session falls through to scanning.
        let outcome = run(&mut img, &config, &mut Assume(true)).unwrap();
        assert_eq!(outcome.strategy, RescueStrategy::RepairAndScan);
        assert!(outcome.vbr.is_none());
        assert_eq!(outcome.diagnosis.issues, vec![IssueCategory::VbrSignature]);

        let report = outcome.report.unwrap();
        assert_eq!(report.issues, vec![IssueCategory::VbrSignature]);
        assert_eq!(report.recovered, 1);
        assert_eq!(
            fs::read(config.output_dir.join("notes.txt")).unwrap(),
            b"remember"
        );
        cleanup(&config);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn healthy_volume_scan_can_be_declined() {
        let mut bytes = vec![0u8; 8 * 1024];
        bytes[..512].copy_from_slice(&sample_sector());
        bytes[4096..5120].copy_from_slice(&record_with_resident_data("a.txt", b"a", 0));
        let path = temp_image("orch_declined", &bytes);
        let mut img = DiskImage::open(&path).unwrap();
        let config = RescueConfig {
            output_dir: temp_path("orch_declined_out"),
            ..RescueConfig::default()
        };

        let outcome = run(&mut img, &config, &mut Assume(false)).unwrap();
        assert!(outcome.report.is_none());
        assert!(!config.output_dir.exists());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn nameless_candidates_get_carved_extensions() {
        let mut bytes = vec![0u8; 8 * 1024];
        bytes[..512].copy_from_slice(&sample_sector());
        let mut record = record_with_resident_data("x", JPEG, 0);
        // Blank out the name length (and the UTF-16LE "x" after it) so the
        // record parses without a usable name.
        let pos = record
            .windows(4)
            .position(|w| w == [0x01, 0x00, b'x', 0x00])
            .unwrap();
        record[pos] = 0;
        record[pos + 2] = 0;
        bytes[4096..5120].copy_from_slice(&record);
        let path = temp_image("orch_nameless", &bytes);
        let mut img = DiskImage::open(&path).unwrap();
        let config = config_for("orch_nameless_out");

        let outcome = run(&mut img, &config, &mut Assume(false)).unwrap();
        let report = outcome.report.unwrap();
        assert_eq!(report.files.len(), 1);
        assert_eq!(report.files[0].file_name, "record_00001000.jpg");
        assert_eq!(
            fs::read(config.output_dir.join("record_00001000.jpg")).unwrap(),
            JPEG
        );
        cleanup(&config);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn empty_records_are_not_candidates() {
        let mut bytes = vec![0u8; 8 * 1024];
        bytes[..512].copy_from_slice(&sample_sector());
        bytes[4096..5120].copy_from_slice(&empty_record(0));
        let path = temp_image("orch_empty", &bytes);
        let mut img = DiskImage::open(&path).unwrap();
        let config = config_for("orch_empty_out");

        let outcome = run(&mut img, &config, &mut Assume(false)).unwrap();
        let report = outcome.report.unwrap();
        assert_eq!(report.records_valid, 1);
        assert_eq!(report.candidates, 0);
        assert!(report.files.is_empty());
        cleanup(&config);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn sanitizer_keeps_only_the_allowed_characters() {
        assert_eq!(sanitize_name("a/b\\c.txt").as_deref(), Some("a_b_c.txt"));
        assert_eq!(sanitize_name("my file.txt").as_deref(), Some("my_file.txt"));
        assert_eq!(sanitize_name("..").as_deref(), None);
        assert_eq!(sanitize_name("   ").as_deref(), None);
        assert_eq!(sanitize_name("résumé.pdf").as_deref(), Some("résumé.pdf"));
    }

    #[test]
    fn colliding_names_are_disambiguated_by_offset() {
        let mut used = HashSet::new();
        assert_eq!(uniquify("a.txt".into(), 0x1000, &mut used), "a.txt");
        assert_eq!(uniquify("a.txt".into(), 0x2000, &mut used), "a_2000.txt");
        assert_eq!(uniquify("raw".into(), 0x2fff, &mut used), "raw");
        assert_eq!(uniquify("raw".into(), 0x3000, &mut used), "raw_3000");
    }
}
