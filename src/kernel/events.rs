//! Process lifecycle events
//!
//! Every process holds a sender; the manager side drains the receiver.
//! Consumers (a shell, a task monitor) watch for `start`/`exit`; the
//! kernel itself uses `alive` and `might_exit` for liveness tracking.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

/// Events emitted over a process's lifetime
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The entry program has begun evaluating
    Start { pid: u32 },
    /// An op was dispatched; the process is doing work
    Alive { pid: u32 },
    /// In-flight ops hit zero with an exit-wait pending
    MightExit { pid: u32, code: i32 },
    /// The process is gone
    Exit { pid: u32, code: i32 },
}

impl LifecycleEvent {
    pub fn pid(&self) -> u32 {
        match self {
            LifecycleEvent::Start { pid }
            | LifecycleEvent::Alive { pid }
            | LifecycleEvent::MightExit { pid, .. }
            | LifecycleEvent::Exit { pid, .. } => *pid,
        }
    }
}

pub type EventSender = Sender<LifecycleEvent>;

/// Receiving side of the lifecycle fan-in, held by the manager
pub struct EventHub {
    rx: Receiver<LifecycleEvent>,
}

impl EventHub {
    pub fn new() -> (Self, EventSender) {
        let (tx, rx) = mpsc::channel();
        (Self { rx }, tx)
    }

    /// Everything queued so far, in arrival order
    pub fn drain(&self) -> Vec<LifecycleEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            out.push(event);
        }
        out
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<LifecycleEvent> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Block until an event matches, or the timeout runs out. Non-matching
    /// events are discarded.
    pub fn wait_for(
        &self,
        timeout: Duration,
        mut pred: impl FnMut(&LifecycleEvent) -> bool,
    ) -> Option<LifecycleEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let event = self.recv_timeout(remaining)?;
            if pred(&event) {
                return Some(event);
            }
        }
    }
}
