//! Random-access byte reader/writer over a disk image or raw device.
//!
//! This is the sole I/O boundary of the crate: every other module receives
//! bytes from a `DiskImage` and never opens files on its own. Read-only
//! handles may be cloned freely for parallel scanning; the writable handle
//! used for structural repairs must be exclusive.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const SECTOR_SIZE: usize = 512;

/// Positioned access to a raw image file or device node.
pub struct DiskImage {
    path: PathBuf,
    file: File,
    len: u64,
    writable: bool,
}

impl DiskImage {
    /// Open read-only, for diagnosis and scanning.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Self::from_file(path, file, false)
    }

    /// Open read-write, for structural repairs (VBR overwrite, MBR rebuild).
    pub fn open_rw(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::from_file(path, file, true)
    }

    fn from_file(path: &Path, mut file: File, writable: bool) -> io::Result<Self> {
        // Device nodes report zero metadata length; seek to the end instead.
        let mut len = file.metadata()?.len();
        if len == 0 {
            len = file.seek(SeekFrom::End(0))?;
        }
        Ok(DiskImage {
            path: path.to_path_buf(),
            file,
            len,
            writable,
        })
    }

    /// A fresh read-only handle on the same image, for worker threads.
    pub fn reopen_read_only(&self) -> io::Result<Self> {
        Self::open(&self.path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn total_sectors(&self) -> u64 {
        self.len / SECTOR_SIZE as u64
    }

    /// Read up to `count` bytes at `offset`. The result is shorter than
    /// `count` only at end of image.
    pub fn read_at(&mut self, offset: u64, count: usize) -> io::Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; count];
        let mut filled = 0;
        while filled < count {
            let n = self.file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Read one 512-byte sector by LBA.
    pub fn read_sector(&mut self, lba: u64) -> io::Result<Vec<u8>> {
        self.read_at(lba * SECTOR_SIZE as u64, SECTOR_SIZE)
    }

    /// Write `data` verbatim at `offset` and flush.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        if !self.writable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "image was opened read-only",
            ));
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        self.file.flush()?;
        if offset + data.len() as u64 > self.len {
            self.len = offset + data.len() as u64;
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::temp_image;
    use super::*;

    #[test]
    fn read_at_is_positioned_and_truncates_at_eof() {
        let path = temp_image("image_read", &[1, 2, 3, 4, 5, 6, 7, 8]);
        let mut img = DiskImage::open(&path).unwrap();
        assert_eq!(img.len(), 8);
        assert_eq!(img.read_at(2, 3).unwrap(), vec![3, 4, 5]);
        assert_eq!(img.read_at(6, 10).unwrap(), vec![7, 8]);
        assert_eq!(img.read_at(100, 4).unwrap(), Vec::<u8>::new());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn write_requires_writable_handle() {
        let path = temp_image("image_ro", &[0u8; 16]);
        let mut img = DiskImage::open(&path).unwrap();
        let err = img.write_at(0, &[0xFF]).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::PermissionDenied);

        let mut rw = DiskImage::open_rw(&path).unwrap();
        rw.write_at(4, &[0xAB, 0xCD]).unwrap();
        let mut again = DiskImage::open(&path).unwrap();
        assert_eq!(again.read_at(4, 2).unwrap(), vec![0xAB, 0xCD]);
        std::fs::remove_file(&path).unwrap();
    }
}
