//! Cooperative shutdown of background threads

use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

/// Owner side of the shutdown signal
///
/// Background loops hold a [`ShutdownSignal`] and check it between units of
/// work; [`Shutdown::trigger()`] wakes every one of them.
pub struct Shutdown {
    sender: Mutex<Option<Sender<()>>>,
    receiver: Receiver<()>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (sender, receiver) = bounded(0);
        Self {
            sender: Mutex::new(Some(sender)),
            receiver,
        }
    }

    /// A signal handle for a background loop
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            receiver: self.receiver.clone(),
        }
    }

    /// Request shutdown; idempotent
    pub fn trigger(&self) {
        // Dropping the only sender disconnects every receiver at once.
        self.sender.lock().take();
    }
}

/// Listener side of the shutdown signal
#[derive(Clone)]
pub struct ShutdownSignal {
    receiver: Receiver<()>,
}

impl ShutdownSignal {
    /// Sleep for `duration` unless shutdown is requested first
    ///
    /// Returns `true` if shutdown was requested.
    pub fn wait(&self, duration: Duration) -> bool {
        !matches!(
            self.receiver.recv_timeout(duration),
            Err(RecvTimeoutError::Timeout)
        )
    }

    pub fn is_triggered(&self) -> bool {
        self.wait(Duration::ZERO)
    }

    /// Channel that disconnects on shutdown, for use in `select!`
    pub fn receiver(&self) -> &Receiver<()> {
        &self.receiver
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Instant;

    use super::*;

    #[test]
    fn wait_times_out_without_trigger() {
        let shutdown = Shutdown::new();
        let signal = shutdown.signal();
        assert!(!signal.wait(Duration::from_millis(5)));
        assert!(!signal.is_triggered());
    }

    #[test]
    fn trigger_wakes_sleepers() {
        let shutdown = Shutdown::new();
        let signal = shutdown.signal();
        let start = Instant::now();
        let sleeper = thread::spawn(move || signal.wait(Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(10));
        shutdown.trigger();
        assert!(sleeper.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(5));
        shutdown.trigger();
        assert!(shutdown.signal().is_triggered());
    }
}
