//! Prioritized read dispatcher over a mount table.
//!
//! Requests go into a max-heap keyed by (priority, issue order) and are
//! drained by a fixed pool of worker threads. Priority updates push a
//! duplicate heap entry instead of re-keying; pop drops entries whose
//! captured priority went stale, and the claim flag on each request makes
//! sure only one entry is ever processed.
//!
//! Shutdown stops the workers after their current request and completes
//! everything still queued as `Cancelled`.

use crate::events::{CompletionToken, IoEvent, MountChange, MountEvent, SignatureErrorEvent};
use crate::mounts::{KeyRegistry, MountTable, MountedContainerInfo};
use crate::request::{BatchShared, Callback, IoRequest, RequestShared};
use iostore_container::{
    AesKey, ChunkInfo, CodecRegistry, ContainerReader, ReadOptions,
};
use iostore_core::{ChunkId, ContainerId, Error, IoBuffer, IoPriority, Result};
use parking_lot::{Condvar, Mutex};
use rsa::RsaPublicKey;
use smallvec::SmallVec;
use std::collections::BinaryHeap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use uuid::Uuid;

/// One heap entry. The priority is captured at push time; a request
/// whose priority changed afterwards simply has a second entry.
struct QueueEntry {
    priority: i32,
    seq: u64,
    request: Arc<RequestShared>,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: highest priority first, then FIFO within a class
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

/// Scheduler queue shared by handles, batches, and workers.
pub(crate) struct Queue {
    heap: Mutex<BinaryHeap<QueueEntry>>,
    condvar: Condvar,
    shutdown: AtomicBool,
}

impl Queue {
    fn new() -> Arc<Self> {
        Arc::new(Queue {
            heap: Mutex::new(BinaryHeap::new()),
            condvar: Condvar::new(),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Enqueue at the request's current priority. After shutdown the
    /// request completes as cancelled instead.
    pub fn push(&self, request: Arc<RequestShared>) {
        if self.shutdown.load(Ordering::Acquire) {
            if request
                .claimed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                request.complete(Err(Error::Cancelled));
            }
            return;
        }
        let entry = QueueEntry {
            priority: request.priority.load(Ordering::Acquire),
            seq: request.seq,
            request,
        };
        self.heap.lock().push(entry);
        self.condvar.notify_one();
    }

    fn pop_blocking(&self) -> Option<Arc<RequestShared>> {
        let mut heap = self.heap.lock();
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return None;
            }
            if let Some(entry) = heap.pop() {
                // An entry whose captured priority no longer matches the
                // request is stale; the entry pushed by `update_priority`
                // carries the current one
                if entry.priority != entry.request.priority.load(Ordering::Acquire) {
                    continue;
                }
                return Some(entry.request);
            }
            self.condvar.wait(&mut heap);
        }
    }

    /// First call wins; wakes every worker.
    fn begin_shutdown(&self) -> bool {
        let first = !self.shutdown.swap(true, Ordering::AcqRel);
        self.condvar.notify_all();
        first
    }

    fn drain(&self) -> Vec<Arc<RequestShared>> {
        std::mem::take(&mut *self.heap.lock())
            .into_iter()
            .map(|entry| entry.request)
            .collect()
    }
}

/// Bounds how many reads touch the filesystem at once.
struct InflightGate {
    budget: usize,
    active: Mutex<usize>,
    condvar: Condvar,
}

impl InflightGate {
    fn new(budget: usize) -> Self {
        InflightGate {
            budget,
            active: Mutex::new(0),
            condvar: Condvar::new(),
        }
    }

    fn acquire(&self) {
        if self.budget == 0 {
            return;
        }
        let mut active = self.active.lock();
        while *active >= self.budget {
            self.condvar.wait(&mut active);
        }
        *active += 1;
    }

    fn release(&self) {
        if self.budget == 0 {
            return;
        }
        *self.active.lock() -= 1;
        self.condvar.notify_one();
    }
}

/// Dispatcher construction parameters.
pub struct DispatcherConfig {
    /// Worker threads draining the queue (0 = none; useful in tests)
    pub worker_count: usize,
    /// Reads allowed to touch the filesystem at once (0 = unlimited)
    pub inflight_budget: usize,
    /// Public key for TOC signature verification at mount time
    pub signature_key: Option<RsaPublicKey>,
    /// Codec registry handed to every mounted reader
    pub codecs: Arc<CodecRegistry>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            worker_count: 2,
            inflight_budget: 0,
            signature_key: None,
            codecs: Arc::new(CodecRegistry::default()),
        }
    }
}

type SignatureSubscriber = Arc<dyn Fn(&SignatureErrorEvent) + Send + Sync>;
type MountSubscriber = Arc<dyn Fn(&MountEvent) + Send + Sync>;

pub(crate) struct DispatcherShared {
    queue: Arc<Queue>,
    mounts: MountTable,
    keys: Arc<KeyRegistry>,
    codecs: Arc<CodecRegistry>,
    signature_key: Option<RsaPublicKey>,
    seq: AtomicU64,
    inflight: InflightGate,
    signature_subscribers: Mutex<Vec<SignatureSubscriber>>,
    mount_subscribers: Mutex<Vec<MountSubscriber>>,
}

impl DispatcherShared {
    fn publish_signature_error(&self, event: &SignatureErrorEvent) {
        let subscribers: Vec<SignatureSubscriber> =
            self.signature_subscribers.lock().clone();
        for subscriber in subscribers {
            subscriber(event);
        }
    }

    fn publish_mount_event(&self, event: &MountEvent) {
        let subscribers: Vec<MountSubscriber> = self.mount_subscribers.lock().clone();
        for subscriber in subscribers {
            subscriber(event);
        }
    }
}

/// Asynchronous, prioritized chunk read service.
///
/// Mount containers, then read chunks by id; the highest-order mounted
/// container holding an id serves it. Requests run on worker threads and
/// complete through callbacks, events, or polling.
pub struct IoDispatcher {
    shared: Arc<DispatcherShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl IoDispatcher {
    /// Start a dispatcher and its worker threads.
    pub fn new(config: DispatcherConfig) -> Result<Self> {
        let shared = Arc::new(DispatcherShared {
            queue: Queue::new(),
            mounts: MountTable::new(),
            keys: Arc::new(KeyRegistry::new()),
            codecs: config.codecs,
            signature_key: config.signature_key,
            seq: AtomicU64::new(0),
            inflight: InflightGate::new(config.inflight_budget),
            signature_subscribers: Mutex::new(Vec::new()),
            mount_subscribers: Mutex::new(Vec::new()),
        });

        let mut workers = Vec::with_capacity(config.worker_count);
        for i in 0..config.worker_count {
            let worker_shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("iostore-io-{}", i))
                .spawn(move || worker_loop(worker_shared))?;
            workers.push(handle);
        }
        tracing::debug!(workers = config.worker_count, "dispatcher started");

        Ok(IoDispatcher {
            shared,
            workers: Mutex::new(workers),
        })
    }

    /// Register an AES key; containers mounted before or after can use it
    /// only if it was present at mount time.
    pub fn register_encryption_key(&self, guid: Uuid, key: AesKey) {
        self.shared.keys.register(guid, key);
    }

    /// Open `<directory>/<name>.toc` and add it to the mount table.
    pub fn mount(&self, directory: &Path, name: &str, order: i32) -> Result<ContainerId> {
        let reader = Arc::new(ContainerReader::open_with_codecs(
            directory,
            name,
            &*self.shared.keys,
            self.shared.signature_key.as_ref(),
            Arc::clone(&self.shared.codecs),
        )?);
        let container_id = reader.container_id();
        self.shared.mounts.mount(reader, order)?;
        tracing::info!(container = name, %container_id, order, "container mounted");
        self.shared.publish_mount_event(&MountEvent {
            container_id,
            name: name.to_string(),
            change: MountChange::Mounted,
        });
        Ok(container_id)
    }

    /// Remove a container from the mount table. Reads already dispatched
    /// against it finish normally; new lookups no longer see it.
    pub fn unmount(&self, container_id: ContainerId) -> Result<()> {
        let reader = self.shared.mounts.unmount(container_id)?;
        tracing::info!(container = reader.name(), %container_id, "container unmounted");
        self.shared.publish_mount_event(&MountEvent {
            container_id,
            name: reader.name().to_string(),
            change: MountChange::Unmounted,
        });
        Ok(())
    }

    /// All mounts in lookup order.
    pub fn mounted_containers(&self) -> Vec<MountedContainerInfo> {
        self.shared.mounts.list()
    }

    /// TOC record for a chunk, from the container that would serve it.
    pub fn chunk_info(&self, chunk_id: ChunkId) -> Option<ChunkInfo> {
        self.shared
            .mounts
            .resolve(chunk_id)?
            .chunk_info(chunk_id)
    }

    /// Memory-map a chunk from the container that would serve it.
    pub fn open_mapped(&self, chunk_id: ChunkId, offset: u64) -> Result<IoBuffer> {
        let reader = self
            .shared
            .mounts
            .resolve(chunk_id)
            .ok_or(Error::UnknownChunkId(chunk_id))?;
        reader.open_mapped(chunk_id, offset)
    }

    /// Observe block digest failures from any mounted container.
    pub fn subscribe_signature_errors<F>(&self, subscriber: F)
    where
        F: Fn(&SignatureErrorEvent) + Send + Sync + 'static,
    {
        self.shared
            .signature_subscribers
            .lock()
            .push(Arc::new(subscriber));
    }

    /// Observe mounts and unmounts.
    pub fn subscribe_mount_events<F>(&self, subscriber: F)
    where
        F: Fn(&MountEvent) + Send + Sync + 'static,
    {
        self.shared
            .mount_subscribers
            .lock()
            .push(Arc::new(subscriber));
    }

    /// Stage several reads that complete as one unit.
    pub fn new_batch(&self) -> IoBatch {
        IoBatch {
            shared: Arc::clone(&self.shared),
            batch: BatchShared::new(),
            staged: SmallVec::new(),
        }
    }

    /// Enqueue one read and return its handle.
    pub fn read_async(
        &self,
        chunk_id: ChunkId,
        offset: u64,
        size: u64,
        priority: IoPriority,
    ) -> IoRequest {
        self.submit(chunk_id, offset, size, priority, None, None)
    }

    /// Read a chunk range, blocking until it completes. Needs at least
    /// one worker thread.
    pub fn read(
        &self,
        chunk_id: ChunkId,
        offset: u64,
        size: u64,
        priority: IoPriority,
    ) -> Result<IoBuffer> {
        let event = IoEvent::new();
        let trigger = event.clone();
        let request = self.submit(
            chunk_id,
            offset,
            size,
            priority,
            None,
            Some(Box::new(move |_: &IoRequest| trigger.trigger())),
        );
        event.wait();
        request.get_result()
    }

    /// Read a whole chunk, blocking until it completes.
    pub fn read_chunk(&self, chunk_id: ChunkId, priority: IoPriority) -> Result<IoBuffer> {
        self.read(chunk_id, 0, u64::MAX, priority)
    }

    fn submit(
        &self,
        chunk_id: ChunkId,
        offset: u64,
        size: u64,
        priority: IoPriority,
        target: Option<IoBuffer>,
        callback: Option<Callback>,
    ) -> IoRequest {
        let seq = self.shared.seq.fetch_add(1, Ordering::Relaxed);
        let request = RequestShared::new(
            chunk_id,
            offset,
            size,
            priority,
            seq,
            target,
            callback,
            None,
            Arc::downgrade(&self.shared.queue),
        );
        self.shared.queue.push(Arc::clone(&request));
        IoRequest { shared: request }
    }

    /// Stop the workers and cancel everything still queued. In-flight
    /// reads finish first. Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        if !self.shared.queue.begin_shutdown() {
            return;
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            let _ = handle.join();
        }
        for request in self.shared.queue.drain() {
            if request
                .claimed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                request.complete(Err(Error::Cancelled));
            }
        }
        tracing::debug!("dispatcher stopped");
    }
}

impl Drop for IoDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<DispatcherShared>) {
    while let Some(request) = shared.queue.pop_blocking() {
        // Losing the claim race means a duplicate entry or a cancel
        // already took the request
        if request
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            continue;
        }
        if request.cancelled.load(Ordering::Acquire) {
            request.complete(Err(Error::Cancelled));
            continue;
        }
        let reader = match shared.mounts.resolve(request.chunk_id) {
            Some(reader) => reader,
            None => {
                request.complete(Err(Error::UnknownChunkId(request.chunk_id)));
                continue;
            }
        };

        shared.inflight.acquire();
        let target = request.state.lock().target.take();
        let options = ReadOptions {
            offset: request.offset,
            size: request.size,
            target_buffer: target,
        };
        let outcome = reader.read_cancellable(request.chunk_id, options, Some(&request.cancelled));
        shared.inflight.release();

        if let Err(Error::BlockSignatureMismatch {
            container,
            block_index,
            expected,
            actual,
        }) = &outcome
        {
            shared.publish_signature_error(&SignatureErrorEvent {
                container: container.clone(),
                block_index: *block_index,
                expected: *expected,
                actual: *actual,
            });
        }
        request.complete(outcome);
    }
}

/// Several reads issued together, completing as one unit.
///
/// Stage requests with the `read*` methods, then call one of the
/// `issue*` methods. Dropping an unissued batch cancels its requests.
pub struct IoBatch {
    shared: Arc<DispatcherShared>,
    batch: Arc<BatchShared>,
    staged: SmallVec<[Arc<RequestShared>; 8]>,
}

impl IoBatch {
    /// Stage a read of `size` bytes at `offset`.
    pub fn read(
        &mut self,
        chunk_id: ChunkId,
        offset: u64,
        size: u64,
        priority: IoPriority,
    ) -> IoRequest {
        self.stage(chunk_id, offset, size, priority, None, None)
    }

    /// Stage a read into a caller-supplied buffer.
    pub fn read_with_target(
        &mut self,
        chunk_id: ChunkId,
        offset: u64,
        size: u64,
        priority: IoPriority,
        target: IoBuffer,
    ) -> IoRequest {
        self.stage(chunk_id, offset, size, priority, Some(target), None)
    }

    /// Stage a read with a per-request completion callback.
    pub fn read_with_callback<F>(
        &mut self,
        chunk_id: ChunkId,
        offset: u64,
        size: u64,
        priority: IoPriority,
        callback: F,
    ) -> IoRequest
    where
        F: FnOnce(&IoRequest) + Send + 'static,
    {
        self.stage(chunk_id, offset, size, priority, None, Some(Box::new(callback)))
    }

    /// Enqueue every staged request.
    pub fn issue(self) {
        self.issue_internal(None, None, None);
    }

    /// Enqueue and run `callback` when the last request completes.
    pub fn issue_with_callback<F: FnOnce() + Send + 'static>(self, callback: F) {
        self.issue_internal(Some(Box::new(callback)), None, None);
    }

    /// Enqueue and trigger `event` when the last request completes.
    pub fn issue_and_trigger_event(self, event: &IoEvent) {
        self.issue_internal(None, Some(event.clone()), None);
    }

    /// Enqueue and trigger `token` when the last request completes.
    pub fn issue_and_dispatch_subsequents(self, token: &CompletionToken) {
        self.issue_internal(None, None, Some(token.clone()));
    }

    fn stage(
        &mut self,
        chunk_id: ChunkId,
        offset: u64,
        size: u64,
        priority: IoPriority,
        target: Option<IoBuffer>,
        callback: Option<Callback>,
    ) -> IoRequest {
        let seq = self.shared.seq.fetch_add(1, Ordering::Relaxed);
        self.batch.stage_one();
        let request = RequestShared::new(
            chunk_id,
            offset,
            size,
            priority,
            seq,
            target,
            callback,
            Some(Arc::clone(&self.batch)),
            Arc::downgrade(&self.shared.queue),
        );
        self.staged.push(Arc::clone(&request));
        IoRequest { shared: request }
    }

    fn issue_internal(
        mut self,
        callback: Option<Box<dyn FnOnce() + Send>>,
        event: Option<IoEvent>,
        token: Option<CompletionToken>,
    ) {
        self.batch.arm(callback, event, token);
        for request in self.staged.drain(..) {
            self.shared.queue.push(request);
        }
    }
}

impl Drop for IoBatch {
    fn drop(&mut self) {
        for request in self.staged.drain(..) {
            if request
                .claimed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                request.complete(Err(Error::Cancelled));
            }
        }
    }
}
