// queue.rs

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use log::warn;

use crate::buffer_list::{BufferList, UnitKey};
use crate::error::QueueError;
use crate::transport::{Completion, PipeId, Transport, TransportError};

/// Configuration for one pipe queue
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Bytes moved by every read or write request.
    pub chunk_size: usize,
    /// Maximum number of units buffered across both lists.
    pub capacity: usize,
    /// Ask the transport to fix the pipe's transfer size to `chunk_size`.
    pub fixed_transfer: bool,
    /// How long the worker and waiting callers park when nothing can move.
    pub idle_wait: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            chunk_size: 4096,
            capacity: 16,
            fixed_transfer: false,
            idle_wait: Duration::from_millis(1),
        }
    }
}

impl QueueConfig {
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn fixed_transfer(mut self, fixed: bool) -> Self {
        self.fixed_transfer = fixed;
        self
    }

    pub fn idle_wait(mut self, idle_wait: Duration) -> Self {
        self.idle_wait = idle_wait;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), QueueError> {
        if self.chunk_size < 1 || self.capacity < 1 {
            return Err(QueueError::InvalidParameter);
        }
        Ok(())
    }
}

/// Snapshot of a queue's counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueMetrics {
    /// Requests handed to the transport.
    pub submitted: u64,
    /// Units collected successfully by callers.
    pub completed: u64,
    /// Bytes moved by collected units.
    pub bytes: u64,
    /// Non-blocking writes refused because the queue was full.
    pub busy_rejections: u64,
    /// Submissions the transport refused outright.
    pub failed_submissions: u64,
    pub pending: usize,
    pub write_status: usize,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub(crate) submitted: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) bytes: AtomicU64,
    pub(crate) busy_rejections: AtomicU64,
    pub(crate) failed_submissions: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnitStatus {
    Submitted,
    Completed,
    Failed(TransportError),
}

/// One in-flight transfer: its data, its completion token and what the
/// transport said when it was submitted.
pub(crate) struct TransferUnit<K> {
    pub(crate) status: UnitStatus,
    pub(crate) data: Vec<u8>,
    pub(crate) bytes_transferred: usize,
    /// `None` once the unit has been collected or released.
    pub(crate) token: Option<K>,
}

impl<K> TransferUnit<K> {
    pub(crate) fn new(data: Vec<u8>, token: K) -> Self {
        Self {
            status: UnitStatus::Submitted,
            data,
            bytes_transferred: 0,
            token: Some(token),
        }
    }
}

pub(crate) type UnitRef<K> = Arc<Mutex<TransferUnit<K>>>;

pub(crate) struct Buffers<K> {
    pub(crate) pending: BufferList<UnitRef<K>>,
    pub(crate) write_status: BufferList<UnitRef<K>>,
    /// Set once the queue is being destroyed; nothing may be linked afterwards.
    pub(crate) closed: bool,
}

impl<K> Buffers<K> {
    pub(crate) fn len(&self) -> usize {
        self.pending.len() + self.write_status.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum List {
    Pending,
    WriteStatus,
}

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-pipe queue state shared between the requester thread and callers.
pub(crate) struct Queue<T: Transport> {
    pub(crate) transport: Arc<T>,
    pub(crate) pipe: PipeId,
    pub(crate) config: QueueConfig,
    active: AtomicBool,
    pub(crate) buffers: Mutex<Buffers<T::Token>>,
    changed: Condvar,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    pub(crate) worker: Mutex<Option<JoinHandle<()>>>,
    pub(crate) counters: Counters,
}

impl<T: Transport> Queue<T> {
    pub(crate) fn new(transport: Arc<T>, pipe: PipeId, config: QueueConfig) -> Self {
        let (wake_tx, wake_rx) = bounded(1);
        Self {
            transport,
            pipe,
            config,
            active: AtomicBool::new(true),
            buffers: Mutex::new(Buffers {
                pending: BufferList::new(),
                write_status: BufferList::new(),
                closed: false,
            }),
            changed: Condvar::new(),
            wake_tx,
            wake_rx,
            worker: Mutex::new(None),
            counters: Counters::default(),
        }
    }

    /// Identity of the transport this queue is bound to.
    pub(crate) fn transport_key(&self) -> usize {
        Arc::as_ptr(&self.transport) as *const () as usize
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Tell the requester to stop at its next iteration.
    pub(crate) fn stop(&self) {
        self.active.store(false, Ordering::Release);
        self.wake_worker();
    }

    /// Refuse any further caller operation and release waiting callers.
    pub(crate) fn close(&self) {
        lock(&self.buffers).closed = true;
        self.changed.notify_all();
    }

    pub(crate) fn is_closed(&self) -> bool {
        lock(&self.buffers).closed
    }

    pub(crate) fn lock_buffers(&self) -> MutexGuard<'_, Buffers<T::Token>> {
        lock(&self.buffers)
    }

    pub(crate) fn wake_worker(&self) {
        // A full channel already holds a wake-up.
        let _ = self.wake_tx.try_send(());
    }

    pub(crate) fn park_worker(&self) {
        let _ = self.wake_rx.recv_timeout(self.config.idle_wait);
    }

    pub(crate) fn notify_changed(&self) {
        self.changed.notify_all();
    }

    fn wait_changed<'a>(&self, guard: MutexGuard<'a, Buffers<T::Token>>) -> MutexGuard<'a, Buffers<T::Token>> {
        match self.changed.wait_timeout(guard, self.config.idle_wait) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.lock_buffers().pending.len()
    }

    pub(crate) fn write_status_len(&self) -> usize {
        self.lock_buffers().write_status.len()
    }

    pub(crate) fn metrics(&self) -> QueueMetrics {
        let (pending, write_status) = {
            let buffers = self.lock_buffers();
            (buffers.pending.len(), buffers.write_status.len())
        };
        QueueMetrics {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            bytes: self.counters.bytes.load(Ordering::Relaxed),
            busy_rejections: self.counters.busy_rejections.load(Ordering::Relaxed),
            failed_submissions: self.counters.failed_submissions.load(Ordering::Relaxed),
            pending,
            write_status,
        }
    }

    /// Allocate a zeroed chunk, reporting allocation failure instead of aborting.
    pub(crate) fn alloc_chunk(&self) -> Result<Vec<u8>, QueueError> {
        let mut data = Vec::new();
        data.try_reserve_exact(self.config.chunk_size)
            .map_err(|_| QueueError::NoSystemResources)?;
        data.resize(self.config.chunk_size, 0);
        Ok(data)
    }

    /// Give a unit's token back to the transport. Its data goes with the last `Arc`.
    pub(crate) fn release_unit(&self, unit: &UnitRef<T::Token>) {
        let token = lock(unit).token.take();
        if let Some(token) = token {
            self.transport.release_token(token);
        }
    }

    /// Copy one chunk of `data` into a new unit and queue it for the requester.
    pub(crate) fn enqueue_write(&self, data: &[u8], wait: bool) -> Result<(), QueueError> {
        let chunk_size = self.config.chunk_size;
        if data.len() < chunk_size {
            return Err(QueueError::InvalidParameter);
        }
        let mut copy = self.alloc_chunk()?;
        copy.copy_from_slice(&data[..chunk_size]);

        let mut buffers = self.lock_buffers();
        loop {
            if buffers.closed {
                return Err(QueueError::InvalidParameter);
            }
            if buffers.len() < self.config.capacity {
                break;
            }
            if !wait {
                self.counters.busy_rejections.fetch_add(1, Ordering::Relaxed);
                return Err(QueueError::Busy);
            }
            buffers = self.wait_changed(buffers);
        }

        let token = self.transport.acquire_token().map_err(|e| {
            warn!("pipe {}: could not acquire completion token: {}", self.pipe, e);
            QueueError::NoSystemResources
        })?;
        buffers
            .pending
            .append(Arc::new(Mutex::new(TransferUnit::new(copy, token))));
        drop(buffers);

        self.notify_changed();
        self.wake_worker();
        Ok(())
    }

    /// Collect the oldest read, copying its bytes into `out`.
    pub(crate) fn read_head(&self, out: &mut [u8], wait: bool) -> Result<usize, QueueError> {
        loop {
            let (key, unit) = {
                let mut buffers = self.lock_buffers();
                loop {
                    if buffers.closed {
                        return Err(QueueError::InvalidParameter);
                    }
                    if let Some((key, unit)) = buffers.pending.head() {
                        break (key, Arc::clone(unit));
                    }
                    if !wait {
                        return Err(QueueError::NoMoreItems);
                    }
                    buffers = self.wait_changed(buffers);
                }
            };

            if let Some(bytes) = self.collect(List::Pending, key, &unit, Some(&mut *out), wait)? {
                return Ok(bytes);
            }
        }
    }

    /// Collect the oldest dispatched write.
    pub(crate) fn write_status_head(&self, wait: bool) -> Result<usize, QueueError> {
        loop {
            let (key, unit) = {
                let mut buffers = self.lock_buffers();
                loop {
                    if buffers.closed {
                        return Err(QueueError::InvalidParameter);
                    }
                    if let Some((key, unit)) = buffers.write_status.head() {
                        break (key, Arc::clone(unit));
                    }
                    if buffers.pending.is_empty() {
                        return Err(QueueError::NoMoreItems);
                    }
                    if !wait {
                        return Err(QueueError::IoPending);
                    }
                    buffers = self.wait_changed(buffers);
                }
            };

            if let Some(bytes) = self.collect(List::WriteStatus, key, &unit, None, wait)? {
                return Ok(bytes);
            }
        }
    }

    /// Poll one unit and free it on success.
    ///
    /// `Ok(None)` means someone else collected or released the unit first and
    /// the caller should look at the new head.
    fn collect(
        &self,
        list: List,
        key: UnitKey,
        unit: &UnitRef<T::Token>,
        out: Option<&mut [u8]>,
        wait: bool,
    ) -> Result<Option<usize>, QueueError> {
        let mut guard = lock(unit);
        let io = &mut *guard;
        let Some(token) = io.token.as_mut() else {
            return Ok(None);
        };
        if let UnitStatus::Failed(e) = io.status {
            return Err(QueueError::Transport(e));
        }

        let bytes = loop {
            match self.transport.poll_completion(token, &mut io.data, wait) {
                Ok(Completion::Done(bytes)) => break bytes.min(io.data.len()),
                Ok(Completion::Pending) | Err(TransportError::IoPending | TransportError::IoIncomplete)
                    if wait =>
                {
                    std::thread::yield_now()
                }
                Ok(Completion::Pending) => return Err(QueueError::IoIncomplete),
                Err(TransportError::IoPending) => return Err(QueueError::IoPending),
                Err(TransportError::IoIncomplete) => return Err(QueueError::IoIncomplete),
                Err(e) => return Err(QueueError::Transport(e)),
            }
        };

        io.status = UnitStatus::Completed;
        io.bytes_transferred = bytes;
        if let Some(out) = out {
            out[..io.bytes_transferred].copy_from_slice(&io.data[..io.bytes_transferred]);
        }
        let token = io.token.take();
        drop(guard);
        if let Some(token) = token {
            self.transport.release_token(token);
        }

        {
            let mut buffers = self.lock_buffers();
            match list {
                List::Pending => buffers.pending.unlink(key),
                List::WriteStatus => buffers.write_status.unlink(key),
            };
        }
        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.notify_changed();
        self.wake_worker();
        Ok(Some(bytes))
    }
}
