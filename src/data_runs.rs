//! Decoder for the NTFS run-list encoding of non-resident attributes.
//!
//! Each run starts with a header byte: the low nibble is the byte width of
//! the cluster count, the high nibble the byte width of the signed LCN
//! delta. A zero header terminates the list; a zero delta width marks a
//! sparse run. Deltas are little-endian two's-complement and accumulate
//! into an absolute LCN.

use serde::Serialize;
use thiserror::Error;

/// One decoded cluster run. `lcn` is the cumulative logical cluster number;
/// a sparse run contributes `cluster_count` clusters of zero content and
/// must not be read from disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DataRun {
    pub lcn: i64,
    pub cluster_count: u64,
    pub sparse: bool,
}

/// A field would read past the supplied slice (or a header nibble is
/// nonsensical). Carries the runs decoded before the fault so the caller
/// can downgrade to a warning and keep partial results.
#[derive(Debug, Error)]
#[error("run list corrupt at byte {offset}: {reason}")]
pub struct RunListError {
    pub offset: usize,
    pub reason: &'static str,
    pub decoded: Vec<DataRun>,
}

/// Decode an entire run-list slice in one pass. Terminates on a zero header
/// byte or on exhausting the slice; fails fast on truncation.
pub fn decode_run_list(bytes: &[u8]) -> Result<Vec<DataRun>, RunListError> {
    let mut runs = Vec::new();
    let mut pos = 0usize;
    let mut lcn = 0i64;

    let fault = |pos: usize, reason: &'static str, runs: &Vec<DataRun>| RunListError {
        offset: pos,
        reason,
        decoded: runs.clone(),
    };

    while pos < bytes.len() {
        let header = bytes[pos];
        if header == 0 {
            break;
        }
        let count_width = (header & 0x0F) as usize;
        let delta_width = (header >> 4) as usize;
        if count_width == 0 || count_width > 8 {
            return Err(fault(pos, "invalid cluster-count width", &runs));
        }
        if delta_width > 8 {
            return Err(fault(pos, "invalid LCN-delta width", &runs));
        }
        pos += 1;

        if pos + count_width > bytes.len() {
            return Err(fault(pos, "cluster count truncated", &runs));
        }
        let cluster_count = read_le_u64(&bytes[pos..pos + count_width]);
        pos += count_width;
        if cluster_count == 0 {
            return Err(fault(pos, "zero-length run", &runs));
        }

        let sparse = delta_width == 0;
        if !sparse {
            if pos + delta_width > bytes.len() {
                return Err(fault(pos, "LCN delta truncated", &runs));
            }
            lcn += read_le_i64(&bytes[pos..pos + delta_width]);
            pos += delta_width;
        }

        runs.push(DataRun {
            lcn,
            cluster_count,
            sparse,
        });
    }

    Ok(runs)
}

fn read_le_u64(field: &[u8]) -> u64 {
    let mut value = 0u64;
    for (i, b) in field.iter().enumerate() {
        value |= (*b as u64) << (8 * i);
    }
    value
}

/// Little-endian read with sign extension from the declared byte width.
fn read_le_i64(field: &[u8]) -> i64 {
    let raw = read_le_u64(field);
    let shift = 64 - 8 * field.len() as u32;
    ((raw << shift) as i64) >> shift
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_sparse_and_negative_delta() {
        // (count=2, delta=+5), sparse(count=1), (count=3, delta=-5), end.
        let encoded = [0x11, 0x02, 0x05, 0x01, 0x01, 0x11, 0x03, 0xFB, 0x00];
        let runs = decode_run_list(&encoded).unwrap();
        assert_eq!(
            runs,
            vec![
                DataRun { lcn: 5, cluster_count: 2, sparse: false },
                DataRun { lcn: 5, cluster_count: 1, sparse: true },
                DataRun { lcn: 0, cluster_count: 3, sparse: false },
            ]
        );
    }

    #[test]
    fn multi_byte_fields_are_little_endian() {
        // count = 0x0201 over two bytes, delta = 0x0403 over two bytes.
        let encoded = [0x22, 0x01, 0x02, 0x03, 0x04, 0x00];
        let runs = decode_run_list(&encoded).unwrap();
        assert_eq!(runs, vec![DataRun { lcn: 0x0403, cluster_count: 0x0201, sparse: false }]);
    }

    #[test]
    fn exhausting_the_slice_terminates_cleanly() {
        let encoded = [0x11, 0x02, 0x05];
        let runs = decode_run_list(&encoded).unwrap();
        assert_eq!(runs.len(), 1);
    }

    #[test]
    fn truncated_delta_fails_and_keeps_partial_results() {
        // First run is complete, second declares a 2-byte delta but only
        // one byte remains.
        let encoded = [0x11, 0x02, 0x05, 0x21, 0x01, 0xFF];
        let err = decode_run_list(&encoded).unwrap_err();
        assert_eq!(err.reason, "LCN delta truncated");
        assert_eq!(
            err.decoded,
            vec![DataRun { lcn: 5, cluster_count: 2, sparse: false }]
        );
    }

    #[test]
    fn zero_count_width_is_rejected() {
        let encoded = [0x10, 0x05];
        let err = decode_run_list(&encoded).unwrap_err();
        assert_eq!(err.reason, "invalid cluster-count width");
        assert!(err.decoded.is_empty());
    }

    #[test]
    fn empty_slice_decodes_to_nothing() {
        assert!(decode_run_list(&[]).unwrap().is_empty());
    }
}
