use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Shutdown flag with interruptible waits.
///
/// The watch loop sleeps between polls; a Ctrl-C must cut that sleep
/// short so the hooks are removed promptly, not after the next tick.
pub struct ShutdownSignal {
    state: Mutex<bool>,
    condvar: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Flip the flag and wake every waiter.
    pub fn trigger(&self) {
        *self.state.lock().unwrap() = true;
        self.condvar.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        *self.state.lock().unwrap()
    }

    /// Sleep for `duration` or until triggered, whichever comes first.
    /// Returns `true` if shutdown was triggered.
    pub fn wait(&self, duration: Duration) -> bool {
        let guard = self.state.lock().unwrap();
        match self
            .condvar
            .wait_timeout_while(guard, duration, |triggered| !*triggered)
        {
            Ok((guard, _)) => *guard,
            // A poisoned lock means a panicking thread; shut down.
            Err(_) => true,
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
