use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Notification streams consumed by one device session.
///
/// Both channels are unbounded: a burst of toggles is queued and applied in arrival order, never
/// dropped.
#[derive(Debug)]
pub struct SessionSignals {
    pub(crate) toggles: mpsc::UnboundedReceiver<()>,
    pub(crate) interrupts: mpsc::UnboundedReceiver<()>,
}

impl SessionSignals {
    /// Creates a standalone subscription and the sender that feeds it.
    pub fn channel() -> (SignalSender, SessionSignals) {
        let (toggles_tx, toggles) = mpsc::unbounded_channel();
        let (interrupts_tx, interrupts) = mpsc::unbounded_channel();
        (
            SignalSender {
                toggles: toggles_tx,
                interrupts: interrupts_tx,
            },
            SessionSignals {
                toggles,
                interrupts,
            },
        )
    }
}

/// Sending half of a [`SessionSignals`] subscription.
#[derive(Debug, Clone)]
pub struct SignalSender {
    toggles: mpsc::UnboundedSender<()>,
    interrupts: mpsc::UnboundedSender<()>,
}

impl SignalSender {
    /// Queues a fault-mode toggle. Returns `false` once the session stopped listening.
    pub fn toggle_fault(&self) -> bool {
        self.toggles.send(()).is_ok()
    }

    /// Queues an interrupt. Returns `false` if the session already requested its disconnect or
    /// has terminated.
    pub fn interrupt(&self) -> bool {
        self.interrupts.send(()).is_ok()
    }

    fn is_closed(&self) -> bool {
        self.toggles.is_closed() && self.interrupts.is_closed()
    }
}

/// Fans operator notifications out to every subscribed session.
#[derive(Debug, Clone, Default)]
pub struct SignalHub {
    subscribers: Arc<Mutex<Vec<SignalSender>>>,
}

impl SignalHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<SignalSender>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self) -> SessionSignals {
        let (sender, signals) = SessionSignals::channel();
        let mut subscribers = self.lock();
        subscribers.retain(|s| !s.is_closed());
        subscribers.push(sender);
        signals
    }

    /// Toggles fault mode on every live session. Returns how many sessions were notified.
    pub fn toggle_fault(&self) -> usize {
        self.broadcast(SignalSender::toggle_fault)
    }

    /// Interrupts every live session. Returns how many sessions were notified.
    pub fn interrupt(&self) -> usize {
        self.broadcast(SignalSender::interrupt)
    }

    fn broadcast(&self, send: impl Fn(&SignalSender) -> bool) -> usize {
        let mut subscribers = self.lock();
        subscribers.retain(|s| !s.is_closed());
        subscribers.iter().filter(|s| send(*s)).count()
    }

    /// Routes `SIGUSR1` to [`SignalHub::toggle_fault`] and `SIGINT`/`SIGTERM` to
    /// [`SignalHub::interrupt`] until the returned forwarder is dropped.
    ///
    /// Must be called from within a Tokio runtime.
    #[cfg(unix)]
    pub fn forward_os_signals(&self) -> io::Result<SignalForwarder> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut usr1 = signal(SignalKind::user_defined1())?;
        let mut int = signal(SignalKind::interrupt())?;
        let mut term = signal(SignalKind::terminate())?;
        let hub = self.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(()) = usr1.recv() => {
                        let notified = hub.toggle_fault();
                        tracing::debug!(notified, "SIGUSR1 received");
                    }
                    Some(()) = int.recv() => {
                        let notified = hub.interrupt();
                        tracing::info!(notified, "SIGINT received, disconnecting devices");
                    }
                    Some(()) = term.recv() => {
                        let notified = hub.interrupt();
                        tracing::info!(notified, "SIGTERM received, disconnecting devices");
                    }
                    else => break,
                }
            }
        });
        Ok(SignalForwarder { task })
    }

    /// Routes Ctrl+C to [`SignalHub::interrupt`]. Fault toggling has no OS signal here.
    #[cfg(not(unix))]
    pub fn forward_os_signals(&self) -> io::Result<SignalForwarder> {
        let hub = self.clone();
        let task = tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                let notified = hub.interrupt();
                tracing::info!(notified, "Ctrl+C received, disconnecting devices");
            }
        });
        Ok(SignalForwarder { task })
    }
}

/// Background task forwarding OS signals into a [`SignalHub`]. Stops when dropped.
pub struct SignalForwarder {
    task: JoinHandle<()>,
}

impl Drop for SignalForwarder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "current_thread")]
    async fn hub_fans_out_to_every_subscriber() {
        let hub = SignalHub::new();
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();

        assert_eq!(hub.toggle_fault(), 2);
        assert_eq!(hub.toggle_fault(), 2);
        assert_eq!(hub.interrupt(), 2);

        for signals in [&mut a, &mut b] {
            assert_eq!(signals.toggles.recv().await, Some(()));
            assert_eq!(signals.toggles.recv().await, Some(()));
            assert!(signals.toggles.try_recv().is_err());
            assert_eq!(signals.interrupts.recv().await, Some(()));
        }
    }

    #[test]
    fn closed_interrupt_channel_swallows_further_interrupts() {
        let hub = SignalHub::new();
        let mut signals = hub.subscribe();
        signals.interrupts.close();

        assert_eq!(hub.interrupt(), 0);
        // Toggles still reach the session.
        assert_eq!(hub.toggle_fault(), 1);
    }

    #[test]
    fn dropped_subscriptions_are_pruned() {
        let hub = SignalHub::new();
        drop(hub.subscribe());
        let _live = hub.subscribe();

        assert_eq!(hub.toggle_fault(), 1);
        assert_eq!(hub.lock().len(), 1);
    }

    #[test]
    fn toggle_burst_is_queued_in_order() {
        let (sender, mut signals) = SessionSignals::channel();
        for _ in 0..1000 {
            assert!(sender.toggle_fault());
        }
        let mut received = 0;
        while signals.toggles.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 1000);
    }
}
