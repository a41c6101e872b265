use crashblk_storage::{errno, StorageError};
use thiserror::Error;

const ENXIO: i32 = 6;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("slot {0} is already in use")]
    SlotBusy(u32),

    #[error("no free device slot (capacity {0})")]
    NoFreeSlot(u32),

    #[error("slot {index} out of range (capacity {capacity})")]
    SlotOutOfRange { index: u32, capacity: u32 },

    #[error("connect refused for slot {0}")]
    Refused(u32),

    #[error("no device in slot {0}")]
    NoSuchDevice(u32),

    #[error("device in slot {index} failed: {reason}")]
    DeviceFailed { index: u32, reason: String },

    #[error("transport shut down")]
    Closed,
}

/// Failure of a single kernel-side I/O request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("no device in slot {0}")]
    NoSuchDevice(u32),

    #[error("request out of range: offset={offset} len={len} size={size_bytes}")]
    OutOfRange {
        offset: u64,
        len: usize,
        size_bytes: u64,
    },

    #[error(transparent)]
    Backend(#[from] StorageError),
}

impl RequestError {
    /// The errno the kernel would complete this request with.
    pub fn errno(&self) -> i32 {
        match self {
            RequestError::NoSuchDevice(_) => ENXIO,
            RequestError::OutOfRange { .. } => errno::EINVAL,
            RequestError::Backend(err) => err.errno(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fenced_write_surfaces_as_eperm() {
        let err = RequestError::from(StorageError::WriteFenced);
        assert_eq!(err.errno(), errno::EPERM);
    }

    #[test]
    fn device_errors_name_the_slot_not_a_node() {
        assert_eq!(TransportError::NoSuchDevice(3).to_string(), "no device in slot 3");
        assert_eq!(RequestError::NoSuchDevice(3).to_string(), "no device in slot 3");
        let failed = TransportError::DeviceFailed {
            index: 2,
            reason: "connection reset".into(),
        };
        assert_eq!(failed.to_string(), "device in slot 2 failed: connection reset");
        assert!(!failed.to_string().contains("/dev/"));
    }
}
