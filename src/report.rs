//! JSON report types for diagnosis and scan results.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;

use crate::boot_sector::IssueCategory;
use crate::error::Result;
use crate::partition::ProposedPartition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    /// Full content written to disk.
    Recovered,
    /// Content written, but some runs were unreadable or the run list was cut.
    Partial,
    /// The record carried a data attribute with no recoverable bytes.
    Empty,
    /// Reconstruction or the output write failed outright.
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveredFileReport {
    pub record_offset: u64,
    pub file_name: String,
    pub output_path: Option<PathBuf>,
    pub size: u64,
    pub status: RecoveryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detected_type: Option<String>,
}

/// Full result of a scan-and-recover pass, serialized for the operator.
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub image: PathBuf,
    pub generated_at: String,
    pub issues: Vec<IssueCategory>,
    pub records_found: usize,
    pub records_valid: usize,
    /// Signature hits whose record-sized read failed; the scan continues
    /// past them.
    pub read_failures: usize,
    pub candidates: usize,
    pub recovered: usize,
    pub partial: usize,
    pub failed: usize,
    pub files: Vec<RecoveredFileReport>,
}

impl ScanReport {
    pub fn new(image: &Path, issues: Vec<IssueCategory>) -> Self {
        ScanReport {
            image: image.to_path_buf(),
            generated_at: Utc::now().to_rfc3339(),
            issues,
            records_found: 0,
            records_valid: 0,
            read_failures: 0,
            candidates: 0,
            recovered: 0,
            partial: 0,
            failed: 0,
            files: Vec::new(),
        }
    }

    pub fn count(&mut self, status: RecoveryStatus) {
        match status {
            RecoveryStatus::Recovered => self.recovered += 1,
            RecoveryStatus::Partial => self.partial += 1,
            RecoveryStatus::Empty => {}
            RecoveryStatus::Failed => self.failed += 1,
        }
    }
}

/// Proposed partition-table rewrite, for the rebuild command.
#[derive(Debug, Clone, Serialize)]
pub struct RebuildReport {
    pub image: PathBuf,
    pub generated_at: String,
    pub candidates_found: usize,
    pub proposals: Vec<ProposedPartition>,
    pub applied_to: Option<PathBuf>,
}

pub fn write_json_report<T: Serialize>(path: &Path, report: &T) -> Result<()> {
    let file = File::create(path)?;
    let mut out = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut out, report)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

/// One decimal offset per line, for feeding hits back into other tools.
pub fn write_offset_list(path: &Path, offsets: &[u64]) -> Result<()> {
    let file = File::create(path)?;
    let mut out = BufWriter::new(file);
    for offset in offsets {
        writeln!(out, "{offset}")?;
    }
    out.flush()?;
    Ok(())
}
