use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

/// Linux errno values reported back to the device's caller.
pub mod errno {
    pub const EPERM: i32 = 1;
    pub const EIO: i32 = 5;
    pub const EINVAL: i32 = 22;
}

/// Unified error type for backing storage operations.
///
/// [`StorageError::WriteFenced`] is not a malfunction: it is the denial surfaced to the device's
/// caller while fault mode is active.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("open {}: {source}", path.display())]
    Open { path: PathBuf, source: io::Error },

    #[error("stat {}: {source}", path.display())]
    Stat { path: PathBuf, source: io::Error },

    #[error("write denied: device is read-only")]
    WriteFenced,

    #[error("integer overflow while computing byte offsets: offset={offset} len={len}")]
    OffsetOverflow { offset: u64, len: usize },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    /// The errno a block-device caller should observe for this failure.
    pub fn errno(&self) -> i32 {
        match self {
            StorageError::WriteFenced => errno::EPERM,
            StorageError::OffsetOverflow { .. } => errno::EINVAL,
            StorageError::Io(err) => err.raw_os_error().unwrap_or(errno::EIO),
            StorageError::Open { source, .. } | StorageError::Stat { source, .. } => {
                source.raw_os_error().unwrap_or(errno::EIO)
            }
        }
    }

    pub fn is_permission_denied(&self) -> bool {
        match self {
            StorageError::WriteFenced => true,
            StorageError::Io(err) => err.kind() == io::ErrorKind::PermissionDenied,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_fenced_maps_to_eperm() {
        let err = StorageError::WriteFenced;
        assert_eq!(err.errno(), errno::EPERM);
        assert!(err.is_permission_denied());
    }

    #[test]
    fn io_errors_keep_their_os_code() {
        let err = StorageError::from(io::Error::from_raw_os_error(28));
        assert_eq!(err.errno(), 28);

        let err = StorageError::from(io::Error::new(io::ErrorKind::Other, "boom"));
        assert_eq!(err.errno(), errno::EIO);
        assert!(!err.is_permission_denied());
    }

    #[test]
    fn open_error_mentions_path() {
        let err = StorageError::Open {
            path: PathBuf::from("/nonexistent/disk.img"),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert!(err.to_string().starts_with("open /nonexistent/disk.img: "));
    }
}
