//! Read request and batch state.
//!
//! Requests are reference-counted nodes shared between the caller's
//! [`IoRequest`] handle and the scheduler queue. Completion happens
//! exactly once: every terminal path funnels through
//! [`RequestShared::complete`], which ignores requests that already
//! reached a terminal status.
//!
//! Priority updates re-push the request instead of re-keying the heap;
//! the queue drops popped entries whose captured priority went stale, and
//! workers claim a request with a compare-and-swap before processing, so
//! duplicate queue entries are discarded harmlessly.

use crate::dispatcher::Queue;
use crate::events::{CompletionToken, IoEvent};
use iostore_core::{ChunkId, Error, IoBuffer, IoPriority, RequestStatus, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

pub(crate) type Callback = Box<dyn FnOnce(&IoRequest) + Send>;

pub(crate) struct RequestState {
    pub status: RequestStatus,
    /// Terminal outcome; taken (once) by `get_result`
    pub outcome: Option<Result<IoBuffer>>,
    /// Caller-supplied destination buffer, taken when processing starts
    pub target: Option<IoBuffer>,
    pub callback: Option<Callback>,
}

/// Shared node behind an [`IoRequest`] handle and its queue entries.
pub(crate) struct RequestShared {
    pub chunk_id: ChunkId,
    pub offset: u64,
    pub size: u64,
    /// Tie-break within a priority class (FIFO)
    pub seq: u64,
    pub priority: AtomicI32,
    /// Checked between blocks by the read path
    pub cancelled: AtomicBool,
    /// Set once by whichever party (worker or cancel) takes the request
    pub claimed: AtomicBool,
    pub state: Mutex<RequestState>,
    pub batch: Option<Arc<BatchShared>>,
    pub queue: Weak<Queue>,
}

impl RequestShared {
    pub fn new(
        chunk_id: ChunkId,
        offset: u64,
        size: u64,
        priority: IoPriority,
        seq: u64,
        target: Option<IoBuffer>,
        callback: Option<Callback>,
        batch: Option<Arc<BatchShared>>,
        queue: Weak<Queue>,
    ) -> Arc<Self> {
        Arc::new(RequestShared {
            chunk_id,
            offset,
            size,
            seq,
            priority: AtomicI32::new(priority.value()),
            cancelled: AtomicBool::new(false),
            claimed: AtomicBool::new(false),
            state: Mutex::new(RequestState {
                status: RequestStatus::Pending,
                outcome: None,
                target,
                callback,
            }),
            batch,
            queue,
        })
    }

    /// Move the request to its terminal state. Later calls are no-ops.
    pub fn complete(self: &Arc<Self>, outcome: Result<IoBuffer>) {
        let callback = {
            let mut state = self.state.lock();
            if state.status.is_terminal() {
                return;
            }
            state.status = match &outcome {
                Ok(_) => RequestStatus::Ok,
                Err(Error::Cancelled) => RequestStatus::Cancelled,
                Err(error) => RequestStatus::Failed(error.code()),
            };
            state.outcome = Some(outcome);
            state.callback.take()
        };
        if let Some(callback) = callback {
            callback(&IoRequest {
                shared: Arc::clone(self),
            });
        }
        if let Some(batch) = &self.batch {
            batch.complete_one();
        }
    }
}

/// Handle to one in-flight (or finished) read request.
pub struct IoRequest {
    pub(crate) shared: Arc<RequestShared>,
}

impl IoRequest {
    /// Chunk the request reads from.
    pub fn chunk_id(&self) -> ChunkId {
        self.shared.chunk_id
    }

    /// Current status; `Pending` until the terminal transition.
    pub fn status(&self) -> RequestStatus {
        self.shared.state.lock().status
    }

    /// Take the result buffer (or error). The outcome can be taken once;
    /// polling a pending request and re-taking both fail with
    /// `InvalidParameter`, while `status` keeps answering after the take.
    pub fn get_result(&self) -> Result<IoBuffer> {
        let mut state = self.shared.state.lock();
        if !state.status.is_terminal() {
            return Err(Error::InvalidParameter(
                "request is still pending".to_string(),
            ));
        }
        state.outcome.take().ok_or_else(|| {
            Error::InvalidParameter("request result was already taken".to_string())
        })?
    }

    /// Cancel the request. Queued requests complete as `Cancelled`
    /// immediately; a request already being processed stops at the next
    /// block boundary. Cancelling a finished request does nothing.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
        if self
            .shared
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // Still queued; any heap entries become stale duplicates
            self.shared.complete(Err(Error::Cancelled));
        }
    }

    /// Raise or lower the scheduling priority of a queued request.
    pub fn update_priority(&self, priority: IoPriority) {
        self.shared
            .priority
            .store(priority.value(), Ordering::Release);
        if self.shared.claimed.load(Ordering::Acquire) {
            return;
        }
        // Fresh entry at the new priority; the old entry's captured
        // priority no longer matches and the queue drops it at pop time
        if let Some(queue) = self.shared.queue.upgrade() {
            queue.push(Arc::clone(&self.shared));
        }
    }
}

/// What to fire when the last request of a batch completes.
#[derive(Default)]
struct BatchDone {
    fired: bool,
    callbacks: Vec<Box<dyn FnOnce() + Send>>,
    events: Vec<IoEvent>,
    tokens: Vec<CompletionToken>,
}

/// Countdown shared by every request of one batch.
pub(crate) struct BatchShared {
    remaining: AtomicUsize,
    /// Completion only fires after the batch was issued
    armed: AtomicBool,
    done: Mutex<BatchDone>,
}

impl BatchShared {
    pub fn new() -> Arc<Self> {
        Arc::new(BatchShared {
            remaining: AtomicUsize::new(0),
            armed: AtomicBool::new(false),
            done: Mutex::new(BatchDone::default()),
        })
    }

    /// Account for one staged request.
    pub fn stage_one(&self) {
        self.remaining.fetch_add(1, Ordering::AcqRel);
    }

    /// Account for one completed request, firing the batch completion
    /// when it was the last one of an issued batch.
    pub fn complete_one(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1
            && self.armed.load(Ordering::Acquire)
        {
            self.fire();
        }
    }

    /// Arm completion, registering the signals to fire. Fires right away
    /// when every request already finished.
    pub fn arm(
        &self,
        callback: Option<Box<dyn FnOnce() + Send>>,
        event: Option<IoEvent>,
        token: Option<CompletionToken>,
    ) {
        {
            let mut done = self.done.lock();
            if let Some(callback) = callback {
                done.callbacks.push(callback);
            }
            if let Some(event) = event {
                done.events.push(event);
            }
            if let Some(token) = token {
                done.tokens.push(token);
            }
        }
        self.armed.store(true, Ordering::Release);
        if self.remaining.load(Ordering::Acquire) == 0 {
            self.fire();
        }
    }

    fn fire(&self) {
        let done = {
            let mut done = self.done.lock();
            if done.fired {
                return;
            }
            done.fired = true;
            std::mem::take(&mut *done)
        };
        for callback in done.callbacks {
            callback();
        }
        for event in done.events {
            event.trigger();
        }
        for token in done.tokens {
            token.trigger();
        }
    }
}
