//! Expose regular files as virtual block devices with switchable write failures.
//!
//! Each backing file gets a [`DeviceSession`]: the file is wrapped in a
//! [`crashblk_storage::WriteFencedBackend`], registered with a
//! [`crashblk_transport::Transport`], and kept alive until the transport reports the device
//! ended. A [`Supervisor`] runs one session per file concurrently.
//!
//! Operator notifications reach sessions through explicit subscriptions: a [`SignalHub`] hands
//! each session its own [`SessionSignals`]. Only the binary wires the hub to OS signals.

#![forbid(unsafe_code)]

mod config;
mod session;
mod signals;
mod supervisor;

pub use config::{Args, Config, ConfigError};
pub use session::{DeviceSession, SessionError, SessionReport, SessionState};
pub use signals::{SessionSignals, SignalForwarder, SignalHub, SignalSender};
pub use supervisor::{slot_for, SessionOutcome, Supervisor, SupervisorReport};
