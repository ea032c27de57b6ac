//! Error taxonomy for the rescue engine.
//!
//! I/O failures are fatal for the operation in progress; format failures are
//! classified into diagnostic categories and drive strategy selection;
//! corruption errors are downgraded to warnings by consumers that can keep
//! partial results.

use thiserror::Error;

use crate::boot_sector::BootSectorError;

pub type Result<T> = std::result::Result<T, RescueError>;

#[derive(Debug, Error)]
pub enum RescueError {
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("format error: {0}")]
    Format(#[from] BootSectorError),

    #[error("corrupt structure: {0}")]
    Corruption(String),

    #[error("precondition not met: {0}")]
    Precondition(String),

    #[error("aborted by operator")]
    Aborted,
}

impl RescueError {
    /// Short-read helper for sectors that must be complete.
    pub fn short_read(what: &str, got: usize, want: usize) -> Self {
        RescueError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("{what}: read {got} of {want} bytes"),
        ))
    }
}
