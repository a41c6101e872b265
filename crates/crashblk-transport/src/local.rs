use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{oneshot, Notify};

use crate::{
    DeviceConnection, RequestError, SharedBackend, SlotRequest, Transport, TransportError,
};

/// Number of slots a [`LocalTransport`] exposes unless told otherwise (the kernel's default
/// `nbds_max`).
pub const DEFAULT_SLOT_CAPACITY: u32 = 16;

type Completion = oneshot::Sender<Result<(), TransportError>>;

struct Slot {
    backend: SharedBackend,
    size_bytes: u64,
    done: Completion,
}

struct State {
    capacity: u32,
    slots: BTreeMap<u32, Slot>,
    refused: HashSet<u32>,
    defer_disconnect: bool,
    pending_disconnects: HashSet<u32>,
    disconnect_log: Vec<u32>,
}

struct Shared {
    state: Mutex<State>,
    changed: Notify,
}

/// In-process transport with its own slot table.
///
/// No kernel device node is created: a device registered here is reachable only through this
/// handle, and is labelled `local slot <index>` rather than by a `/dev` path.
///
/// Cloning is cheap; all clones share the same slot table. Besides the [`Transport`] contract it
/// exposes the kernel's side of the conversation: [`LocalTransport::read`] and
/// [`LocalTransport::write`] submit I/O requests to a connected device, and
/// [`LocalTransport::remove`] ends a device as if the kernel dropped it.
#[derive(Clone)]
pub struct LocalTransport {
    shared: Arc<Shared>,
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SLOT_CAPACITY)
    }

    pub fn with_capacity(capacity: u32) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    capacity,
                    slots: BTreeMap::new(),
                    refused: HashSet::new(),
                    defer_disconnect: false,
                    pending_disconnects: HashSet::new(),
                    disconnect_log: Vec::new(),
                }),
                changed: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Makes every future connect at `index` fail with [`TransportError::Refused`].
    pub fn refuse_connect(&self, index: u32) {
        self.lock().refused.insert(index);
    }

    /// When set, [`Transport::disconnect`] only records the request; the device keeps running
    /// until [`LocalTransport::remove`] is called.
    pub fn set_defer_disconnect(&self, defer: bool) {
        self.lock().defer_disconnect = defer;
    }

    /// Indices of connected devices, ascending.
    pub fn connected(&self) -> Vec<u32> {
        self.lock().slots.keys().copied().collect()
    }

    pub fn is_connected(&self, index: u32) -> bool {
        self.lock().slots.contains_key(&index)
    }

    pub fn size_bytes(&self, index: u32) -> Option<u64> {
        self.lock().slots.get(&index).map(|slot| slot.size_bytes)
    }

    /// Every disconnect request received so far, in arrival order.
    pub fn disconnect_requests(&self) -> Vec<u32> {
        self.lock().disconnect_log.clone()
    }

    pub fn is_disconnect_pending(&self, index: u32) -> bool {
        self.lock().pending_disconnects.contains(&index)
    }

    /// Waits until a device is connected at `index`.
    pub async fn wait_connected(&self, index: u32) {
        self.wait_until(|state| state.slots.contains_key(&index))
            .await
    }

    /// Waits until `count` disconnect requests have been received.
    pub async fn wait_disconnect_requests(&self, count: usize) {
        self.wait_until(|state| state.disconnect_log.len() >= count)
            .await
    }

    async fn wait_until(&self, mut done: impl FnMut(&State) -> bool) {
        loop {
            let changed = self.shared.changed.notified();
            let ready = done(&self.lock());
            if ready {
                return;
            }
            changed.await;
        }
    }

    /// Ends the device at `index` as if the kernel removed it. Returns `false` if nothing was
    /// connected there.
    pub fn remove(&self, index: u32) -> bool {
        self.finish(index, Ok(()))
    }

    /// Ends the device at `index` with an error reported through its `wait`.
    pub fn fail(&self, index: u32, reason: impl Into<String>) -> bool {
        self.finish(
            index,
            Err(TransportError::DeviceFailed {
                index,
                reason: reason.into(),
            }),
        )
    }

    fn finish(&self, index: u32, result: Result<(), TransportError>) -> bool {
        let slot = {
            let mut state = self.lock();
            state.pending_disconnects.remove(&index);
            state.slots.remove(&index)
        };
        let Some(slot) = slot else {
            return false;
        };
        tracing::debug!(index, device = %self.device_label(index), "device connection ended");
        // The session may already have stopped waiting.
        let _ = slot.done.send(result);
        self.shared.changed.notify_waiters();
        true
    }

    fn backend_for(
        &self,
        index: u32,
        offset: u64,
        len: usize,
    ) -> Result<SharedBackend, RequestError> {
        let state = self.lock();
        let slot = state
            .slots
            .get(&index)
            .ok_or(RequestError::NoSuchDevice(index))?;
        let in_range = offset
            .checked_add(len as u64)
            .is_some_and(|end| end <= slot.size_bytes);
        if !in_range {
            return Err(RequestError::OutOfRange {
                offset,
                len,
                size_bytes: slot.size_bytes,
            });
        }
        Ok(slot.backend.clone())
    }

    /// Submits a read request to the device at `index`.
    pub fn read(&self, index: u32, buf: &mut [u8], offset: u64) -> Result<usize, RequestError> {
        let backend = self.backend_for(index, offset, buf.len())?;
        Ok(backend.read_at(buf, offset)?)
    }

    /// Submits a write request to the device at `index`.
    pub fn write(&self, index: u32, buf: &[u8], offset: u64) -> Result<usize, RequestError> {
        let backend = self.backend_for(index, offset, buf.len())?;
        Ok(backend.write_at(buf, offset)?)
    }

    /// Submits a flush request to the device at `index`. Flushes carry no payload and are
    /// never fenced.
    pub fn flush(&self, index: u32) -> Result<(), RequestError> {
        let backend = self.backend_for(index, 0, 0)?;
        Ok(backend.flush()?)
    }

    fn register(
        &self,
        backend: SharedBackend,
        size_bytes: u64,
        slot: SlotRequest,
    ) -> Result<LocalDevice, TransportError> {
        let (done, done_rx) = oneshot::channel();
        let index = {
            let mut state = self.lock();
            let index = match slot {
                SlotRequest::Index(index) => {
                    if index >= state.capacity {
                        return Err(TransportError::SlotOutOfRange {
                            index,
                            capacity: state.capacity,
                        });
                    }
                    if state.slots.contains_key(&index) {
                        return Err(TransportError::SlotBusy(index));
                    }
                    index
                }
                SlotRequest::Any => (0..state.capacity)
                    .find(|index| {
                        !state.slots.contains_key(index) && !state.refused.contains(index)
                    })
                    .ok_or(TransportError::NoFreeSlot(state.capacity))?,
            };
            if state.refused.contains(&index) {
                return Err(TransportError::Refused(index));
            }
            state.slots.insert(
                index,
                Slot {
                    backend,
                    size_bytes,
                    done,
                },
            );
            index
        };

        tracing::debug!(index, size_bytes, device = %self.device_label(index), "device registered");
        self.shared.changed.notify_waiters();
        Ok(LocalDevice {
            index,
            done: done_rx,
        })
    }

    fn request_disconnect(&self, index: u32) -> Result<(), TransportError> {
        let defer = {
            let mut state = self.lock();
            state.disconnect_log.push(index);
            if !state.slots.contains_key(&index) {
                drop(state);
                self.shared.changed.notify_waiters();
                return Err(TransportError::NoSuchDevice(index));
            }
            if state.defer_disconnect {
                state.pending_disconnects.insert(index);
            }
            state.defer_disconnect
        };

        if defer {
            self.shared.changed.notify_waiters();
        } else {
            self.remove(index);
        }
        Ok(())
    }
}

impl Transport for LocalTransport {
    type Device = LocalDevice;

    async fn connect(
        &self,
        backend: SharedBackend,
        size_bytes: u64,
        slot: SlotRequest,
    ) -> Result<LocalDevice, TransportError> {
        self.register(backend, size_bytes, slot)
    }

    async fn disconnect(&self, index: u32) -> Result<(), TransportError> {
        self.request_disconnect(index)
    }

    fn device_label(&self, index: u32) -> String {
        format!("local slot {index}")
    }
}

/// Handle to a device registered with a [`LocalTransport`].
#[derive(Debug)]
pub struct LocalDevice {
    index: u32,
    done: oneshot::Receiver<Result<(), TransportError>>,
}

impl DeviceConnection for LocalDevice {
    fn index(&self) -> u32 {
        self.index
    }

    async fn wait(self) -> Result<(), TransportError> {
        // A dropped sender means every transport handle went away with the device still
        // registered.
        self.done.await.unwrap_or(Err(TransportError::Closed))
    }
}
