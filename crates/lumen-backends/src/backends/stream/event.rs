//! Completion events for stream commands

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Pending,
    Complete,
    /// Command failed or was discarded after an earlier failure
    Failed(String),
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    signal: Condvar,
}

/// Completion signal of one submitted command
#[derive(Debug, Clone)]
pub struct Event(Arc<Inner>);

impl Event {
    pub fn new() -> Self {
        Self(Arc::new(Inner {
            state: Mutex::new(State::Pending),
            signal: Condvar::new(),
        }))
    }

    pub fn complete(&self) {
        self.finish(State::Complete);
    }

    pub fn fail(&self, reason: impl Into<String>) {
        self.finish(State::Failed(reason.into()));
    }

    fn finish(&self, state: State) {
        let mut guard = self.0.state.lock();
        *guard = state;
        self.0.signal.notify_all();
    }

    /// Block until the command finishes; `Err` carries the failure reason
    pub fn wait(&self) -> Result<(), String> {
        let mut guard = self.0.state.lock();
        while *guard == State::Pending {
            self.0.signal.wait(&mut guard);
        }
        match &*guard {
            State::Failed(reason) => Err(reason.clone()),
            _ => Ok(()),
        }
    }

    pub fn is_pending(&self) -> bool {
        *self.0.state.lock() == State::Pending
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wait_returns_after_completion_on_another_thread() {
        let event = Event::new();
        let signaller = event.clone();
        let handle = thread::spawn(move || signaller.complete());
        assert_eq!(event.wait(), Ok(()));
        handle.join().unwrap();
        assert!(!event.is_pending());
    }

    #[test]
    fn failure_reason_is_reported_to_every_waiter() {
        let event = Event::new();
        event.fail("kernel aborted");
        assert_eq!(event.wait(), Err("kernel aborted".to_string()));
        assert_eq!(event.clone().wait(), Err("kernel aborted".to_string()));
    }
}
