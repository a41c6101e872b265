use std::io;
use std::sync::{Arc, Mutex};

use crate::{Result, StorageError};

/// Positional read/write contract used by the device transport.
///
/// Both methods take `&self`: the transport may have several requests in flight against the
/// same backend. A successful call always transfers the whole buffer.
pub trait BlockBackend: Send + Sync {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize>;

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

impl<B: BlockBackend + ?Sized> BlockBackend for Arc<B> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        (**self).read_at(buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        (**self).write_at(buf, offset)
    }

    fn flush(&self) -> Result<()> {
        (**self).flush()
    }
}

impl<B: BlockBackend + ?Sized> BlockBackend for Box<B> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        (**self).read_at(buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        (**self).write_at(buf, offset)
    }

    fn flush(&self) -> Result<()> {
        (**self).flush()
    }
}

/// Fixed-size in-memory backend.
#[derive(Debug, Default)]
pub struct MemBackend {
    data: Mutex<Vec<u8>>,
}

impl MemBackend {
    pub fn with_len(len: usize) -> Self {
        Self::from_vec(vec![0; len])
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data),
        }
    }

    pub fn len(&self) -> u64 {
        self.lock().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        // Poisoning leaves the bytes intact.
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn checked_range(offset: u64, len: usize, capacity: usize) -> Result<std::ops::Range<usize>> {
    let start = usize::try_from(offset).map_err(|_| StorageError::OffsetOverflow { offset, len })?;
    let end = start
        .checked_add(len)
        .ok_or(StorageError::OffsetOverflow { offset, len })?;
    if end > capacity {
        return Err(StorageError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("access past end: offset={offset} len={len} capacity={capacity}"),
        )));
    }
    Ok(start..end)
}

impl BlockBackend for MemBackend {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let data = self.lock();
        let range = checked_range(offset, buf.len(), data.len())?;
        buf.copy_from_slice(&data[range]);
        Ok(buf.len())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        let mut data = self.lock();
        let range = checked_range(offset, buf.len(), data.len())?;
        data[range].copy_from_slice(buf);
        Ok(buf.len())
    }
}
