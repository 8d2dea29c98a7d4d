use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Counting semaphore that bounds concurrent model invocations.
///
/// Callers wait up to a timeout for a permit; a caller that cannot be
/// admitted in time gets `None` and reports the model as unavailable.
pub struct CallGate {
    in_use: Mutex<usize>,
    released: Condvar,
    permits: usize,
}

/// Held while a model call runs; returns its permit on drop.
pub struct GatePermit<'a> {
    gate: &'a CallGate,
}

impl CallGate {
    pub fn new(permits: usize) -> Self {
        Self {
            in_use: Mutex::new(0),
            released: Condvar::new(),
            permits: permits.max(1),
        }
    }

    pub fn acquire(&self, timeout: Duration) -> Option<GatePermit<'_>> {
        let deadline = Instant::now() + timeout;
        let mut in_use = self.lock();
        while *in_use >= self.permits {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, _) = self
                .released
                .wait_timeout(in_use, remaining)
                .unwrap_or_else(|e| e.into_inner());
            in_use = guard;
        }
        *in_use += 1;
        Some(GatePermit { gate: self })
    }

    #[cfg(test)]
    fn in_use(&self) -> usize {
        *self.lock()
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        // The counter stays consistent even if a holder panicked.
        self.in_use.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for GatePermit<'_> {
    fn drop(&mut self) {
        let mut in_use = self.gate.lock();
        *in_use = in_use.saturating_sub(1);
        self.gate.released.notify_one();
    }
}
