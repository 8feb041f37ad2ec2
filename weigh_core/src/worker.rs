//! Background thread ownership with a shared stop signal.
//!
//! Each `Worker` spawns exactly one named thread. Stopping drops the stop
//! sender, which wakes every `StopSignal::wait` on that signal at once, then
//! joins with a bounded timeout. A thread that does not exit in time is
//! logged and detached rather than blocking the caller forever.
use crossbeam_channel as xch;
use std::thread::JoinHandle;
use std::time::Duration;

/// Receiving side of a stop signal; cheap to clone into helper tasks.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: xch::Receiver<()>,
}

impl StopSignal {
    /// A signal plus the sender that fires it when dropped.
    pub fn pair() -> (xch::Sender<()>, Self) {
        let (tx, rx) = xch::bounded(0);
        (tx, Self { rx })
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self.rx.try_recv(), Err(xch::TryRecvError::Disconnected))
    }

    /// Sleep for `d` or until stopped. Returns true when stopped.
    pub fn wait(&self, d: Duration) -> bool {
        !matches!(self.rx.recv_timeout(d), Err(xch::RecvTimeoutError::Timeout))
    }

    /// For use inside `crossbeam_channel::select!`.
    pub fn receiver(&self) -> &xch::Receiver<()> {
        &self.rx
    }
}

pub struct Worker {
    name: String,
    stop_tx: Option<xch::Sender<()>>,
    done_rx: xch::Receiver<()>,
    handle: Option<JoinHandle<()>>,
    default_timeout: Duration,
}

struct DoneGuard(xch::Sender<()>);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        let _ = self.0.try_send(());
    }
}

impl Worker {
    pub fn spawn<F>(name: &str, stop_timeout: Duration, f: F) -> std::io::Result<Self>
    where
        F: FnOnce(StopSignal) + Send + 'static,
    {
        let (stop_tx, signal) = StopSignal::pair();
        let (done_tx, done_rx) = xch::bounded(1);
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _done = DoneGuard(done_tx);
                f(signal);
            })?;
        Ok(Self {
            name: name.to_string(),
            stop_tx: Some(stop_tx),
            done_rx,
            handle: Some(handle),
            default_timeout: stop_timeout,
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal and join. Idempotent; returns false on timeout.
    pub fn stop(&mut self) -> bool {
        self.stop_within(self.default_timeout)
    }

    pub fn stop_within(&mut self, timeout: Duration) -> bool {
        self.stop_tx.take();
        let Some(handle) = self.handle.take() else {
            return true;
        };
        match self.done_rx.recv_timeout(timeout) {
            Ok(()) | Err(xch::RecvTimeoutError::Disconnected) => match handle.join() {
                Ok(()) => {
                    tracing::trace!(worker = %self.name, "worker joined");
                    true
                }
                Err(e) => {
                    tracing::warn!(worker = %self.name, ?e, "worker panicked");
                    true
                }
            },
            Err(xch::RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    worker = %self.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "worker did not exit in time; detaching"
                );
                false
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}
