use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::{BlockBackend, Result, StorageError};

/// A regular file opened read-write to back one virtual device.
///
/// The size is captured once at open time and stays fixed for the lifetime of the device. The
/// file handle is closed when the store is dropped.
#[derive(Debug)]
pub struct BackingStore {
    path: PathBuf,
    size_bytes: u64,
    file: File,
}

impl BackingStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| StorageError::Open {
                path: path.clone(),
                source,
            })?;
        let size_bytes = file
            .metadata()
            .map_err(|source| StorageError::Stat {
                path: path.clone(),
                source,
            })?
            .len();

        tracing::debug!(path = %path.display(), size_bytes, "opened backing store");
        Ok(Self {
            path,
            size_bytes,
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }
}

impl Drop for BackingStore {
    fn drop(&mut self) {
        tracing::debug!(path = %self.path.display(), "closing backing store");
    }
}

#[cfg(unix)]
impl BlockBackend for BackingStore {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        std::os::unix::fs::FileExt::read_exact_at(&self.file, buf, offset)?;
        Ok(buf.len())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        std::os::unix::fs::FileExt::write_all_at(&self.file, buf, offset)?;
        Ok(buf.len())
    }

    fn flush(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(windows)]
impl BlockBackend for BackingStore {
    fn read_at(&self, mut buf: &mut [u8], mut offset: u64) -> Result<usize> {
        use std::os::windows::fs::FileExt;

        let len = buf.len();
        while !buf.is_empty() {
            match self.file.seek_read(buf, offset)? {
                0 => return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into()),
                n => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
            }
        }
        Ok(len)
    }

    fn write_at(&self, mut buf: &[u8], mut offset: u64) -> Result<usize> {
        use std::os::windows::fs::FileExt;

        let len = buf.len();
        while !buf.is_empty() {
            match self.file.seek_write(buf, offset)? {
                0 => return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into()),
                n => {
                    buf = &buf[n..];
                    offset += n as u64;
                }
            }
        }
        Ok(len)
    }

    fn flush(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}
