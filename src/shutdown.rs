use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// One-way stop flag shared between a controller and its worker threads.
///
/// Workers check `is_triggered` at the top of each iteration and use
/// `sleep` for every wait, so a trigger interrupts pacing sleeps and
/// backoffs immediately.
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let (flag, cond) = &*self.inner;
        *flag.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = true;
        cond.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self
            .inner
            .0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait up to `timeout`. Returns `true` when the signal fired.
    pub fn sleep(&self, timeout: Duration) -> bool {
        let (flag, cond) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut stopped = flag.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        while !*stopped {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            stopped = match cond.wait_timeout(stopped, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

impl std::fmt::Debug for StopSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopSignal")
            .field("triggered", &self.is_triggered())
            .finish()
    }
}
