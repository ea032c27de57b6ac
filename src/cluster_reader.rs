//! Translate decoded cluster runs into byte content.
//!
//! Sparse runs become zero bytes without touching the image. A run with an
//! invalid LCN, or one whose read fails, is skipped with a warning: partial
//! recovery is preferred over total failure.

use log::warn;

use crate::data_runs::DataRun;
use crate::image::DiskImage;

/// Upper bound on one run's byte size; a corrupt run list must not drive
/// an unbounded allocation.
const RUN_BYTE_LIMIT: u64 = 1 << 30;

/// Upper bound on the reconstructed content of one candidate, across all of
/// its runs.
const CANDIDATE_BYTE_LIMIT: u64 = 4 << 30;

#[derive(Debug)]
pub struct RunReadOutcome {
    pub bytes: Vec<u8>,
    /// Runs skipped for an invalid LCN, an oversized count, or a failed read.
    pub skipped_runs: usize,
}

impl RunReadOutcome {
    pub fn complete(&self) -> bool {
        self.skipped_runs == 0
    }
}

/// Concatenate the content of `runs`, in run order.
pub fn read_runs(
    image: &mut DiskImage,
    runs: &[DataRun],
    bytes_per_cluster: u64,
    partition_base: u64,
) -> RunReadOutcome {
    read_runs_bounded(
        image,
        runs,
        bytes_per_cluster,
        partition_base,
        RUN_BYTE_LIMIT,
        CANDIDATE_BYTE_LIMIT,
    )
}

fn read_runs_bounded(
    image: &mut DiskImage,
    runs: &[DataRun],
    bytes_per_cluster: u64,
    partition_base: u64,
    run_limit: u64,
    total_limit: u64,
) -> RunReadOutcome {
    let mut bytes = Vec::new();
    let mut skipped_runs = 0usize;

    for run in runs {
        let run_bytes = run.cluster_count.saturating_mul(bytes_per_cluster);
        if run_bytes > run_limit {
            warn!(
                "skipping run of {} clusters: {} bytes exceeds the per-run limit",
                run.cluster_count, run_bytes
            );
            skipped_runs += 1;
            continue;
        }
        if bytes.len() as u64 + run_bytes > total_limit {
            warn!(
                "skipping run of {} bytes: candidate already holds {} bytes",
                run_bytes,
                bytes.len()
            );
            skipped_runs += 1;
            continue;
        }

        if run.sparse {
            bytes.resize(bytes.len() + run_bytes as usize, 0);
            continue;
        }

        if run.lcn <= 0 {
            warn!("skipping run with invalid LCN {}", run.lcn);
            skipped_runs += 1;
            continue;
        }

        let offset = match (run.lcn as u64)
            .checked_mul(bytes_per_cluster)
            .and_then(|at| at.checked_add(partition_base))
        {
            Some(offset) => offset,
            None => {
                warn!("skipping run at LCN {}: byte offset overflows", run.lcn);
                skipped_runs += 1;
                continue;
            }
        };
        match image.read_at(offset, run_bytes as usize) {
            Ok(chunk) => {
                if (chunk.len() as u64) < run_bytes {
                    warn!(
                        "run at LCN {} ends past the image: got {} of {} bytes",
                        run.lcn,
                        chunk.len(),
                        run_bytes
                    );
                }
                bytes.extend_from_slice(&chunk);
            }
            Err(e) => {
                warn!("failed to read run at LCN {}: {e}", run.lcn);
                skipped_runs += 1;
            }
        }
    }

    RunReadOutcome {
        bytes,
        skipped_runs,
    }
}
