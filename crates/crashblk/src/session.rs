use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crashblk_storage::{BackingStore, BlockBackend, FenceStats, StorageError, WriteFencedBackend};
use crashblk_transport::{DeviceConnection, SlotRequest, Transport, TransportError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::SessionSignals;

/// Lifecycle of a [`DeviceSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    /// An interrupt asked the transport to tear the device down; still waiting for it to end.
    DisconnectRequested,
    Terminated,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("slot index overflow: base {base} + position {position}")]
    InvalidSlot { base: u32, position: usize },

    #[error("failed to set up device for {}: {source}", path.display())]
    Connect {
        path: PathBuf,
        source: TransportError,
    },

    #[error("{device} ended with error: {source}")]
    Wait {
        index: u32,
        /// Transport-provided label of the device.
        device: String,
        source: TransportError,
    },

    #[error("session task aborted: {0}")]
    Aborted(String),
}

impl SessionError {
    /// Short classification used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Storage(StorageError::Open { .. }) => "open-failure",
            SessionError::Storage(StorageError::Stat { .. }) => "stat-failure",
            SessionError::Storage(StorageError::WriteFenced) => "write-fenced",
            SessionError::Storage(StorageError::OffsetOverflow { .. } | StorageError::Io(_)) => {
                "storage-error"
            }
            SessionError::InvalidSlot { .. } => "invalid-slot",
            SessionError::Connect { .. } => "connect-failure",
            SessionError::Wait { .. } => "transport-wait-error",
            SessionError::Aborted(_) => "aborted",
        }
    }
}

/// Summary of a session that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub path: PathBuf,
    pub index: u32,
    pub size_bytes: u64,
    pub disconnect_requested: bool,
    pub stats: FenceStats,
}

/// Binds one backing file to one device slot for the lifetime of the device.
pub struct DeviceSession<T> {
    transport: T,
    path: PathBuf,
    slot: SlotRequest,
    signals: SessionSignals,
    state: Arc<watch::Sender<SessionState>>,
}

impl<T: Transport> DeviceSession<T> {
    pub fn new(
        transport: T,
        path: impl Into<PathBuf>,
        slot: SlotRequest,
        signals: SessionSignals,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Connecting);
        Self {
            transport,
            path: path.into(),
            slot,
            signals,
            state: Arc::new(state),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Observes state transitions of this session.
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Opens the backing file, connects the device and blocks until the transport reports the
    /// device ended.
    ///
    /// The first interrupt received while the device is active issues one disconnect request;
    /// later interrupts are ignored. The backing file is released only after any in-flight
    /// disconnect has completed.
    pub async fn run(self) -> Result<SessionReport, SessionError> {
        let state = self.state.clone();
        let result = self.run_inner().await;
        state.send_replace(SessionState::Terminated);
        result
    }

    async fn run_inner(self) -> Result<SessionReport, SessionError> {
        let DeviceSession {
            transport,
            path,
            slot,
            signals,
            state,
        } = self;
        let SessionSignals {
            toggles,
            interrupts,
        } = signals;

        let store = open_store(path.clone()).await?;
        let size_bytes = store.size_bytes();
        tracing::info!(path = %path.display(), size_bytes, "setting up loopback device");

        let backend = Arc::new(WriteFencedBackend::new(store));
        let toggler = ToggleListener::spawn(backend.clone(), toggles);

        let device = match transport.connect(backend.clone(), size_bytes, slot).await {
            Ok(device) => device,
            Err(source) => {
                toggler.shutdown().await;
                return Err(SessionError::Connect { path, source });
            }
        };
        let index = device.index();
        let label = transport.device_label(index);
        state.send_replace(SessionState::Active);
        tracing::info!(index, path = %path.display(), "connected to {label}");

        let (ended_tx, ended_rx) = oneshot::channel();
        let disconnector = tokio::spawn(handle_interrupts(
            transport,
            index,
            label.clone(),
            interrupts,
            ended_rx,
            state,
        ));

        let waited = device.wait().await;
        // No-op if the disconnector already stopped listening.
        let _ = ended_tx.send(());
        let disconnect_requested = match disconnector.await {
            Ok(requested) => requested,
            Err(err) => {
                tracing::error!(index, "disconnect handler failed: {err}");
                false
            }
        };

        toggler.shutdown().await;
        let stats = backend.stats();
        drop(backend);

        if let Err(source) = waited {
            return Err(SessionError::Wait {
                index,
                device: label,
                source,
            });
        }

        tracing::info!(
            index,
            reads = stats.reads,
            writes = stats.writes,
            denied_writes = stats.denied_writes,
            "released {label}"
        );
        Ok(SessionReport {
            path,
            index,
            size_bytes,
            disconnect_requested,
            stats,
        })
    }
}

async fn open_store(path: PathBuf) -> Result<BackingStore, StorageError> {
    let task_path = path.clone();
    match tokio::task::spawn_blocking(move || BackingStore::open(task_path)).await {
        Ok(result) => result,
        Err(err) => Err(StorageError::Open {
            path,
            source: io::Error::new(io::ErrorKind::Other, err),
        }),
    }
}

/// Waits for the first interrupt and turns it into one disconnect request.
///
/// Returns whether a disconnect was requested. Returns `false` without requesting anything once
/// `ended` fires, i.e. the device went away on its own.
async fn handle_interrupts<T: Transport>(
    transport: T,
    index: u32,
    label: String,
    mut interrupts: mpsc::UnboundedReceiver<()>,
    ended: oneshot::Receiver<()>,
    state: Arc<watch::Sender<SessionState>>,
) -> bool {
    let interrupted = tokio::select! {
        biased;
        _ = ended => false,
        received = interrupts.recv() => received.is_some(),
    };
    // Later interrupts fail to send instead of queueing.
    interrupts.close();
    if !interrupted {
        return false;
    }

    state.send_replace(SessionState::DisconnectRequested);
    tracing::info!(index, "disconnecting {label}");
    match transport.disconnect(index).await {
        Ok(()) => tracing::info!(index, "disconnected {label}"),
        Err(err) => tracing::warn!(index, "error while disconnecting {label}: {err}"),
    }
    true
}

/// Applies queued fault toggles to a backend until shut down.
struct ToggleListener {
    task: Option<JoinHandle<()>>,
}

impl ToggleListener {
    fn spawn<B>(
        backend: Arc<WriteFencedBackend<B>>,
        mut toggles: mpsc::UnboundedReceiver<()>,
    ) -> Self
    where
        B: BlockBackend + 'static,
    {
        let task = tokio::spawn(async move {
            while toggles.recv().await.is_some() {
                backend.toggle();
            }
        });
        Self { task: Some(task) }
    }

    /// Stops the listener and waits until it dropped its backend reference.
    async fn shutdown(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for ToggleListener {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crashblk_transport::LocalTransport;

    #[test]
    fn error_kinds_follow_the_failure_stage() {
        let err = SessionError::from(StorageError::Stat {
            path: PathBuf::from("disk.img"),
            source: io::Error::from(io::ErrorKind::Other),
        });
        assert_eq!(err.kind(), "stat-failure");

        let err = SessionError::Connect {
            path: PathBuf::from("disk.img"),
            source: TransportError::SlotBusy(0),
        };
        assert_eq!(err.kind(), "connect-failure");
        assert_eq!(
            err.to_string(),
            "failed to set up device for disk.img: slot 0 is already in use"
        );
    }

    #[test]
    fn storage_errors_after_open_are_not_open_failures() {
        let err = SessionError::from(StorageError::Open {
            path: PathBuf::from("disk.img"),
            source: io::Error::from(io::ErrorKind::NotFound),
        });
        assert_eq!(err.kind(), "open-failure");

        assert_eq!(SessionError::from(StorageError::WriteFenced).kind(), "write-fenced");
        let err = SessionError::from(StorageError::Io(io::Error::from(io::ErrorKind::Other)));
        assert_eq!(err.kind(), "storage-error");
        let err = SessionError::from(StorageError::OffsetOverflow {
            offset: u64::MAX,
            len: 8,
        });
        assert_eq!(err.kind(), "storage-error");
    }

    #[test]
    fn wait_error_uses_the_transport_label() {
        let err = SessionError::Wait {
            index: 1,
            device: LocalTransport::new().device_label(1),
            source: TransportError::Closed,
        };
        assert_eq!(err.to_string(), "local slot 1 ended with error: transport shut down");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn interrupt_handler_stands_down_when_device_ends_first() {
        let transport = LocalTransport::new();
        let (sender, signals) = SessionSignals::channel();
        let (state, _) = watch::channel(SessionState::Active);
        let (ended_tx, ended_rx) = oneshot::channel();

        ended_tx.send(()).unwrap();
        let requested = handle_interrupts(
            transport.clone(),
            0,
            transport.device_label(0),
            signals.interrupts,
            ended_rx,
            Arc::new(state),
        )
        .await;

        assert!(!requested);
        assert!(transport.disconnect_requests().is_empty());
        assert!(!sender.interrupt());
    }
}
