//! Byte-addressed storage backends for crashblk virtual devices.
//!
//! A virtual block device is serviced by a user-level process, so every device needs something
//! that can read and write bytes at an offset. This crate provides:
//!
//! - [`BlockBackend`]: positional read/write contract shared by every backend
//! - [`BackingStore`]: a regular file opened read-write, sized once at open time
//! - [`MemBackend`]: fixed-size in-memory backend
//! - [`WriteFencedBackend`]: wrapper whose writes can be switched off at runtime to simulate a
//!   storage failure while reads keep working

#![forbid(unsafe_code)]

mod backend;
mod error;
mod fence;
mod file;

pub use backend::{BlockBackend, MemBackend};
pub use error::{errno, Result, StorageError};
pub use fence::{FaultMode, FenceStats, WriteFencedBackend};
pub use file::BackingStore;
