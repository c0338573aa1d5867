//! Completion signalling: one-shot events, chained completion tokens,
//! and the payloads multicast to subscribers.

use iostore_core::ContainerId;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One-shot event a thread can block on.
///
/// Triggering is sticky: waits after the trigger return immediately.
#[derive(Clone, Default)]
pub struct IoEvent {
    inner: Arc<EventInner>,
}

#[derive(Default)]
struct EventInner {
    set: Mutex<bool>,
    condvar: Condvar,
}

impl IoEvent {
    /// A fresh, untriggered event.
    pub fn new() -> Self {
        IoEvent::default()
    }

    /// Wake all current and future waiters.
    pub fn trigger(&self) {
        let mut set = self.inner.set.lock();
        *set = true;
        self.inner.condvar.notify_all();
    }

    /// Block until the event is triggered.
    pub fn wait(&self) {
        let mut set = self.inner.set.lock();
        while !*set {
            self.inner.condvar.wait(&mut set);
        }
    }

    /// Block up to `timeout`; true when the event fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut set = self.inner.set.lock();
        while !*set {
            if self.inner.condvar.wait_until(&mut set, deadline).timed_out() {
                return *set;
            }
        }
        true
    }

    /// True once triggered.
    pub fn is_set(&self) -> bool {
        *self.inner.set.lock()
    }
}

/// Completion chain: callbacks registered before the trigger run when it
/// fires; callbacks registered after run immediately.
#[derive(Clone, Default)]
pub struct CompletionToken {
    inner: Arc<Mutex<TokenState>>,
}

#[derive(Default)]
struct TokenState {
    triggered: bool,
    subsequents: Vec<Box<dyn FnOnce() + Send>>,
}

impl CompletionToken {
    /// A fresh, untriggered token.
    pub fn new() -> Self {
        CompletionToken::default()
    }

    /// Run `subsequent` when the token triggers (or now, if it already
    /// has).
    pub fn add_subsequent<F: FnOnce() + Send + 'static>(&self, subsequent: F) {
        {
            let mut state = self.inner.lock();
            if !state.triggered {
                state.subsequents.push(Box::new(subsequent));
                return;
            }
        }
        subsequent();
    }

    /// Fire the token, running queued subsequents outside the lock.
    pub fn trigger(&self) {
        let subsequents = {
            let mut state = self.inner.lock();
            state.triggered = true;
            std::mem::take(&mut state.subsequents)
        };
        for subsequent in subsequents {
            subsequent();
        }
    }

    /// True once triggered.
    pub fn is_triggered(&self) -> bool {
        self.inner.lock().triggered
    }
}

/// Payload multicast to signature-error subscribers when a block fails
/// digest verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureErrorEvent {
    /// Name of the container holding the failing block
    pub container: String,
    /// Index of the block in the container's block array
    pub block_index: u32,
    /// Digest recorded in the signature section
    pub expected: [u8; 20],
    /// Digest computed from the on-disk bytes
    pub actual: [u8; 20],
}

/// What happened to a mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountChange {
    /// Container became visible to lookups
    Mounted,
    /// Container was removed from the mount table
    Unmounted,
}

/// Payload multicast to mount subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEvent {
    /// Id of the affected container
    pub container_id: ContainerId,
    /// Name the container was mounted under
    pub name: String,
    /// Mount or unmount
    pub change: MountChange,
}
