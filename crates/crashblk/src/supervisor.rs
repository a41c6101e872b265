use std::path::PathBuf;

use crashblk_transport::{SlotRequest, Transport};

use crate::{DeviceSession, SessionError, SessionReport, SignalHub};

/// Slot for the file at `position`: consecutive indices from `base`, or transport-chosen slots
/// when no base was given.
pub fn slot_for(base: Option<u32>, position: usize) -> Result<SlotRequest, SessionError> {
    let Some(base) = base else {
        return Ok(SlotRequest::Any);
    };
    u32::try_from(position)
        .ok()
        .and_then(|offset| base.checked_add(offset))
        .map(SlotRequest::Index)
        .ok_or(SessionError::InvalidSlot { base, position })
}

/// Terminal status of one session.
#[derive(Debug)]
pub struct SessionOutcome {
    pub path: PathBuf,
    pub result: Result<SessionReport, SessionError>,
}

#[derive(Debug, Default)]
pub struct SupervisorReport {
    pub outcomes: Vec<SessionOutcome>,
}

impl SupervisorReport {
    /// `true` when every session succeeded (trivially so when none were started).
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|outcome| outcome.result.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &SessionOutcome> {
        self.outcomes.iter().filter(|outcome| outcome.result.is_err())
    }
}

/// Runs one [`DeviceSession`] per backing file and waits for all of them.
pub struct Supervisor<T> {
    transport: T,
    signals: SignalHub,
}

impl<T: Transport> Supervisor<T> {
    pub fn new(transport: T, signals: SignalHub) -> Self {
        Self { transport, signals }
    }

    /// Starts every session concurrently and returns once all of them are terminal.
    ///
    /// A failing session never stops its siblings; its error is logged and kept in the report.
    pub async fn run(&self, paths: &[PathBuf], base: Option<u32>) -> SupervisorReport {
        let tasks: Vec<_> = paths
            .iter()
            .enumerate()
            .map(|(position, path)| {
                let transport = self.transport.clone();
                let signals = self.signals.subscribe();
                let session_path = path.clone();
                let task = tokio::spawn(async move {
                    match slot_for(base, position) {
                        Ok(slot) => {
                            DeviceSession::new(transport, session_path, slot, signals)
                                .run()
                                .await
                        }
                        Err(err) => Err(err),
                    }
                });
                (path.clone(), task)
            })
            .collect();

        let mut report = SupervisorReport::default();
        for (path, task) in tasks {
            let result = task
                .await
                .unwrap_or_else(|err| Err(SessionError::Aborted(err.to_string())));
            if let Err(err) = &result {
                tracing::error!(path = %path.display(), kind = err.kind(), "{err}");
            }
            report.outcomes.push(SessionOutcome { path, result });
        }
        report
    }
}
