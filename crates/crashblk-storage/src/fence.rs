use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::{BlockBackend, Result, StorageError};

/// Effective write mode of a [`WriteFencedBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultMode {
    ReadWrite,
    ReadOnly,
}

impl FaultMode {
    fn from_fenced(fenced: bool) -> Self {
        if fenced {
            FaultMode::ReadOnly
        } else {
            FaultMode::ReadWrite
        }
    }
}

impl fmt::Display for FaultMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FaultMode::ReadWrite => "read-write",
            FaultMode::ReadOnly => "read-only",
        })
    }
}

/// Counters collected by a [`WriteFencedBackend`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FenceStats {
    pub reads: u64,
    pub writes: u64,
    pub denied_writes: u64,
    pub toggles: u64,
}

#[derive(Default)]
struct Counters {
    reads: AtomicU64,
    writes: AtomicU64,
    denied_writes: AtomicU64,
    toggles: AtomicU64,
}

/// Backend wrapper that can reject every write to simulate an abrupt storage failure.
///
/// The fault flag is a single [`AtomicBool`]; [`WriteFencedBackend::toggle`] may run on a
/// signal-handling task while any number of reads and writes are in flight on I/O threads. A write
/// observes either the pre- or the post-toggle mode, never anything else.
///
/// While fenced, writes fail with [`StorageError::WriteFenced`] before reaching the inner backend.
/// Reads are never fenced.
pub struct WriteFencedBackend<B> {
    inner: B,
    fenced: AtomicBool,
    counters: Counters,
}

impl<B: BlockBackend> WriteFencedBackend<B> {
    /// Wraps `inner` in read-write mode.
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            fenced: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    pub fn mode(&self) -> FaultMode {
        FaultMode::from_fenced(self.is_fenced())
    }

    pub fn is_fenced(&self) -> bool {
        self.fenced.load(Ordering::Acquire)
    }

    /// Flips between read-write and read-only. Never blocks.
    pub fn toggle(&self) {
        let was_fenced = self.fenced.fetch_xor(true, Ordering::AcqRel);
        self.counters.toggles.fetch_add(1, Ordering::Relaxed);
        let mode = FaultMode::from_fenced(!was_fenced);
        tracing::info!(%mode, "fault toggle received, device is {mode}");
    }

    pub fn stats(&self) -> FenceStats {
        FenceStats {
            reads: self.counters.reads.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            denied_writes: self.counters.denied_writes.load(Ordering::Relaxed),
            toggles: self.counters.toggles.load(Ordering::Relaxed),
        }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    pub fn into_inner(self) -> B {
        self.inner
    }
}

impl<B: BlockBackend> BlockBackend for WriteFencedBackend<B> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let n = self.inner.read_at(buf, offset)?;
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        Ok(n)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        if self.is_fenced() {
            self.counters.denied_writes.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(offset, len = buf.len(), "write denied while read-only");
            return Err(StorageError::WriteFenced);
        }
        let n = self.inner.write_at(buf, offset)?;
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        Ok(n)
    }

    /// Passthrough. A flush carries no payload, so it is allowed while fenced.
    fn flush(&self) -> Result<()> {
        self.inner.flush()
    }
}

impl<B> fmt::Debug for WriteFencedBackend<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteFencedBackend")
            .field("fenced", &self.fenced.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemBackend;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[test]
    fn starts_read_write() {
        let backend = WriteFencedBackend::new(MemBackend::with_len(512));
        assert_eq!(backend.mode(), FaultMode::ReadWrite);
        assert_eq!(backend.write_at(&[1u8; 512], 0).unwrap(), 512);
    }

    #[test]
    fn fenced_write_leaves_inner_untouched() {
        let backend = WriteFencedBackend::new(MemBackend::from_vec(vec![0xAA; 64]));
        backend.toggle();

        let err = backend.write_at(&[0x55; 64], 0).unwrap_err();
        assert!(matches!(err, StorageError::WriteFenced));
        assert!(err.is_permission_denied());
        assert_eq!(backend.inner().snapshot(), vec![0xAA; 64]);

        let mut buf = [0u8; 64];
        backend.read_at(&mut buf, 0).unwrap();
        assert_eq!(buf, [0xAA; 64]);
    }

    #[test]
    fn stats_count_reads_writes_and_denials() {
        let backend = WriteFencedBackend::new(MemBackend::with_len(16));
        let mut buf = [0u8; 4];
        backend.read_at(&mut buf, 0).unwrap();
        backend.write_at(&buf, 0).unwrap();
        backend.toggle();
        let _ = backend.write_at(&buf, 0);
        backend.read_at(&mut buf, 4).unwrap();

        assert_eq!(
            backend.stats(),
            FenceStats {
                reads: 2,
                writes: 1,
                denied_writes: 1,
                toggles: 1,
            }
        );
    }

    #[test]
    fn concurrent_toggles_cancel_out_in_pairs() {
        let backend = Arc::new(WriteFencedBackend::new(MemBackend::with_len(4096)));
        let threads: Vec<_> = (0..4)
            .map(|i| {
                let backend = backend.clone();
                std::thread::spawn(move || {
                    let buf = [i as u8; 512];
                    for _ in 0..250 {
                        backend.toggle();
                        let _ = backend.write_at(&buf, (i * 512) as u64);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        // 1000 flips in total: back where we started.
        assert_eq!(backend.mode(), FaultMode::ReadWrite);
        let stats = backend.stats();
        assert_eq!(stats.toggles, 1000);
        assert_eq!(stats.writes + stats.denied_writes, 1000);
    }

    proptest! {
        #[test]
        fn write_is_fenced_iff_toggle_count_is_odd(toggles in 0usize..64) {
            let backend = WriteFencedBackend::new(MemBackend::with_len(4096));
            for _ in 0..toggles {
                backend.toggle();
            }
            let res = backend.write_at(&[0xEE; 4096], 0);
            prop_assert_eq!(res.is_err(), toggles % 2 == 1);

            let mut buf = [0u8; 4096];
            prop_assert!(backend.read_at(&mut buf, 0).is_ok());
            let expected = if toggles % 2 == 1 { 0x00 } else { 0xEE };
            prop_assert!(buf.iter().all(|b| *b == expected));
        }
    }
}
