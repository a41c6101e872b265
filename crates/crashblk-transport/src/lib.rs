//! Contract between crashblk device sessions and a virtual-block-device transport.
//!
//! The transport owns the conversation with the kernel: it registers a device of a given size at
//! a slot, forwards the kernel's read/write requests to a [`BlockBackend`], and reports when the
//! device connection ends. Sessions only rely on the [`Transport`] and [`DeviceConnection`]
//! traits.
//!
//! [`LocalTransport`] is an in-process implementation. It keeps its own slot table and lets the
//! caller play the kernel's part (submit I/O, remove a device), which is what the test-suite and
//! the `crashblk` binary use. It creates no kernel device node, so its devices are only reachable
//! from inside the process.

#![forbid(unsafe_code)]

mod error;
mod local;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

pub use crashblk_storage::BlockBackend;
pub use error::{RequestError, TransportError};
pub use local::{LocalDevice, LocalTransport, DEFAULT_SLOT_CAPACITY};

/// Backend handed to the transport; I/O requests may run on any thread.
pub type SharedBackend = Arc<dyn BlockBackend>;

/// Where a device should be registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotRequest {
    /// Let the transport pick a free slot.
    Any,
    Index(u32),
}

impl fmt::Display for SlotRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotRequest::Any => f.write_str("any"),
            SlotRequest::Index(index) => write!(f, "{index}"),
        }
    }
}

/// Kernel device node path for a slot index.
pub fn device_path(index: u32) -> String {
    format!("/dev/nbd{index}")
}

pub trait Transport: Clone + Send + Sync + 'static {
    type Device: DeviceConnection;

    /// Registers a device of `size_bytes` backed by `backend`.
    fn connect(
        &self,
        backend: SharedBackend,
        size_bytes: u64,
        slot: SlotRequest,
    ) -> impl Future<Output = Result<Self::Device, TransportError>> + Send;

    /// Requests teardown of the device at `index`.
    ///
    /// Completion of the teardown is reported through [`DeviceConnection::wait`], not by this
    /// call returning.
    fn disconnect(&self, index: u32) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Human-readable name of the device at `index`, used in logs and errors.
    ///
    /// Defaults to the kernel node path. Transports that do not create a kernel node must
    /// override it.
    fn device_label(&self, index: u32) -> String {
        device_path(index)
    }
}

/// A registered device.
pub trait DeviceConnection: Send + 'static {
    fn index(&self) -> u32;

    /// Resolves once the device connection has ended. After this the slot is no longer valid.
    fn wait(self) -> impl Future<Output = Result<(), TransportError>> + Send;
}
