//! Signature-based full-image scanner.
//!
//! Streams the image in bounded chunks and yields the absolute byte offset
//! of every occurrence of a fixed signature, with no assumption that hits
//! are record-aligned. The last `len(signature) - 1` bytes of each chunk are
//! carried into the next search buffer so matches spanning a chunk boundary
//! are not missed. This is what decouples record discovery from a possibly
//! corrupted MFT pointer.

use std::collections::VecDeque;
use std::io;

use log::debug;

use crate::image::DiskImage;

pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

const PROGRESS_INTERVAL: u64 = 256 * 1024 * 1024;

/// Lazy, finite, forward-only sequence of absolute signature offsets.
pub struct SignatureScanner<'a> {
    image: &'a mut DiskImage,
    signature: Vec<u8>,
    chunk_size: usize,
    next_offset: u64,
    carry: Vec<u8>,
    pending: VecDeque<u64>,
    done: bool,
    last_progress: u64,
}

impl<'a> SignatureScanner<'a> {
    pub fn new(image: &'a mut DiskImage, signature: &[u8], chunk_size: usize) -> Self {
        assert!(!signature.is_empty());
        // A chunk must be able to hold at least one full match.
        let chunk_size = chunk_size.max(signature.len());
        SignatureScanner {
            image,
            signature: signature.to_vec(),
            chunk_size,
            next_offset: 0,
            carry: Vec::new(),
            pending: VecDeque::new(),
            done: false,
            last_progress: 0,
        }
    }

    /// Read the next chunk and queue every match in carry + chunk.
    fn fill(&mut self) -> io::Result<()> {
        let chunk = self.image.read_at(self.next_offset, self.chunk_size)?;
        if chunk.is_empty() {
            self.done = true;
            return Ok(());
        }

        let mut buffer = std::mem::take(&mut self.carry);
        let base = self.next_offset - buffer.len() as u64;
        buffer.extend_from_slice(&chunk);

        // Overlapping occurrences are all reported; the search resumes one
        // byte past each match.
        let mut start = 0usize;
        while start + self.signature.len() <= buffer.len() {
            match buffer[start..]
                .windows(self.signature.len())
                .position(|w| w == self.signature.as_slice())
            {
                Some(rel) => {
                    let at = start + rel;
                    self.pending.push_back(base + at as u64);
                    start = at + 1;
                }
                None => break,
            }
        }

        self.next_offset += chunk.len() as u64;
        if chunk.len() < self.chunk_size {
            self.done = true;
        } else {
            let keep = self.signature.len() - 1;
            self.carry = buffer[buffer.len() - keep..].to_vec();
        }

        if self.next_offset - self.last_progress >= PROGRESS_INTERVAL {
            debug!("scanned {} MiB", self.next_offset / (1024 * 1024));
            self.last_progress = self.next_offset;
        }
        Ok(())
    }
}

impl Iterator for SignatureScanner<'_> {
    type Item = io::Result<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(offset) = self.pending.pop_front() {
                return Some(Ok(offset));
            }
            if self.done {
                return None;
            }
            if let Err(e) = self.fill() {
                self.done = true;
                return Some(Err(e));
            }
        }
    }
}
