//! Scoped suspension of the host's main thread.

use super::InjectError;
use crate::probe::ThreadControl;

/// Freezes one host thread for the duration of the unsafe patch window.
///
/// Resumes unconditionally on drop, so the host is never left parked when
/// the code inside the window fails or returns early. Enter only with the
/// host's registry mutex already held, and drop before any teardown that
/// could block.
pub struct SuspensionGuard<'a> {
    threads: &'a dyn ThreadControl,
    thread: u64,
}

impl<'a> SuspensionGuard<'a> {
    pub fn freeze(threads: &'a dyn ThreadControl, thread: u64) -> Result<Self, InjectError> {
        if !threads.suspend(thread) {
            return Err(InjectError::Precondition(format!(
                "cannot suspend host thread {}",
                thread
            )));
        }
        log::debug!("host thread {} suspended", thread);
        Ok(Self { threads, thread })
    }

    pub fn thread(&self) -> u64 {
        self.thread
    }

    /// Interrupt the frozen thread so it abandons its blocking read once
    /// resumed. Called after the activation swap, while still frozen.
    pub fn dislodge(&self) {
        self.threads.dislodge(self.thread);
    }
}

impl Drop for SuspensionGuard<'_> {
    fn drop(&mut self) {
        if !self.threads.resume(self.thread) {
            log::warn!("failed to resume host thread {}", self.thread);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::fake::{EventLog, FakeThreads};

    #[test]
    fn resumes_on_drop() {
        let log = EventLog::default();
        let threads = FakeThreads::new(log.clone());

        {
            let guard = SuspensionGuard::freeze(&threads, 7).unwrap();
            assert_eq!(guard.thread(), 7);
        }

        assert_eq!(log.events(), ["suspend 7", "resume 7"]);
    }

    #[test]
    fn resumes_when_patch_window_fails_early() {
        let log = EventLog::default();
        let threads = FakeThreads::new(log.clone());

        let failing_window = || -> Result<(), InjectError> {
            let _guard = SuspensionGuard::freeze(&threads, 1)?;
            Err(InjectError::Precondition("mid-patch failure".into()))
        };
        assert!(failing_window().is_err());

        assert_eq!(log.events(), ["suspend 1", "resume 1"]);
    }
}
