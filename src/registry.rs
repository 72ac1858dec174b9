// registry.rs

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;

use log::{error, info, warn};

use crate::error::QueueError;
use crate::queue::{lock, Queue, QueueConfig, QueueMetrics};
use crate::requester;
use crate::transport::{Direction, PipeId, Transport};

type QueueKey = (usize, PipeId);

/// Reference to a live pipe queue.
///
/// Clones share the same queue. Once the queue is destroyed, through
/// [`Registry::destroy_queue`] or by a fatal transport status, every clone is
/// stale and operations on it fail with [`QueueError::InvalidParameter`].
pub struct QueueHandle<T: Transport> {
    queue: Arc<Queue<T>>,
}

impl<T: Transport> Clone for QueueHandle<T> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
        }
    }
}

impl<T: Transport> QueueHandle<T> {
    pub fn pipe(&self) -> PipeId {
        self.queue.pipe
    }

    pub fn direction(&self) -> Direction {
        self.queue.pipe.direction()
    }

    pub fn chunk_size(&self) -> usize {
        self.queue.config.chunk_size
    }

    pub fn capacity(&self) -> usize {
        self.queue.config.capacity
    }

    /// Units waiting on a read, or queued for the requester to write.
    pub fn pending_len(&self) -> usize {
        self.queue.pending_len()
    }

    /// Writes handed to the transport and not collected yet.
    pub fn write_status_len(&self) -> usize {
        self.queue.write_status_len()
    }

    pub fn metrics(&self) -> QueueMetrics {
        self.queue.metrics()
    }

    /// Whether the queue has not been destroyed.
    pub fn is_live(&self) -> bool {
        !self.queue.is_closed()
    }
}

/// Owner of every pipe queue.
///
/// At most one queue exists per (transport, pipe). Dropping the registry
/// shuts down any queue still alive.
pub struct Registry<T: Transport + 'static> {
    queues: Mutex<HashMap<QueueKey, Arc<Queue<T>>>>,
}

impl<T: Transport + 'static> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Transport + 'static> Registry<T> {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live queues.
    pub fn len(&self) -> usize {
        lock(&self.queues).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a queue is registered for `pipe` on `transport`.
    pub fn contains(&self, transport: &Arc<T>, pipe: impl Into<PipeId>) -> bool {
        let key = (Arc::as_ptr(transport) as *const () as usize, pipe.into());
        lock(&self.queues).contains_key(&key)
    }

    /// Create a queue for `pipe` and start its requester thread.
    ///
    /// # Arguments
    ///
    /// * `transport` - Open device; it must outlive the queue
    /// * `pipe` - Pipe to service, top bit set for IN
    /// * `config` - Chunk size, capacity and stream mode
    ///
    /// # Returns
    ///
    /// * `Result<QueueHandle<T>, QueueError>` - Handle to the running queue, or
    ///   `InvalidParameter`, `PipeReserved`, `NoSystemResources`, or the
    ///   transport's refusal to configure the pipe
    pub fn create_queue(
        &self,
        transport: &Arc<T>,
        pipe: impl Into<PipeId>,
        config: QueueConfig,
    ) -> Result<QueueHandle<T>, QueueError> {
        let pipe = pipe.into();
        config.validate()?;

        let mut queues = lock(&self.queues);
        let queue = Arc::new(Queue::new(Arc::clone(transport), pipe, config));
        let key = (queue.transport_key(), pipe);
        if queues.contains_key(&key) {
            return Err(QueueError::PipeReserved);
        }

        if queue.config.fixed_transfer {
            transport.configure_stream(pipe, queue.config.chunk_size)?;
        } else {
            transport.clear_stream(pipe)?;
        }

        let worker_queue = Arc::clone(&queue);
        let worker = thread::Builder::new()
            .name(format!("pipe-queue-{:02x}", pipe.0))
            .spawn(move || requester::run(worker_queue))
            .map_err(|e| {
                error!("pipe {}: failed to spawn requester: {}", pipe, e);
                QueueError::NoSystemResources
            })?;
        *lock(&queue.worker) = Some(worker);
        queues.insert(key, Arc::clone(&queue));

        info!(
            "pipe {}: queue created (chunk {} bytes, capacity {}, {} live)",
            pipe,
            queue.config.chunk_size,
            queue.config.capacity,
            queues.len()
        );
        Ok(QueueHandle { queue })
    }

    /// Stop a queue's requester, free its buffers and unregister it.
    ///
    /// Blocks until the requester has aborted the pipe and exited.
    pub fn destroy_queue(&self, handle: QueueHandle<T>) -> Result<(), QueueError> {
        self.teardown(&handle.queue)
    }

    /// Copy the oldest completed read into `buffer`.
    ///
    /// With `wait` set, blocks until a read is buffered and has completed.
    /// On a fatal transport status the queue is destroyed and `queue` is set
    /// to `None`.
    ///
    /// # Returns
    ///
    /// * `Result<usize, QueueError>` - Bytes copied into `buffer`
    pub fn read(
        &self,
        queue: &mut Option<QueueHandle<T>>,
        buffer: &mut [u8],
        wait: bool,
    ) -> Result<usize, QueueError> {
        let handle = queue.as_ref().ok_or(QueueError::InvalidParameter)?;
        if handle.direction() != Direction::In || buffer.len() < handle.chunk_size() {
            return Err(QueueError::InvalidParameter);
        }
        let result = handle.queue.read_head(buffer, wait);
        self.check_fatal(queue, result)
    }

    /// Queue one chunk from `data` for writing.
    ///
    /// The first `chunk_size` bytes are copied, so `data` can be reused as
    /// soon as this returns. When the queue is full this returns `Busy`,
    /// or with `wait` set, blocks until there is room.
    pub fn write(&self, queue: &QueueHandle<T>, data: &[u8], wait: bool) -> Result<(), QueueError> {
        if queue.direction() != Direction::Out {
            return Err(QueueError::InvalidParameter);
        }
        queue.queue.enqueue_write(data, wait)
    }

    /// Collect the result of the oldest dispatched write.
    ///
    /// Returns `IoPending` while writes are queued but none has been handed to
    /// the transport, and `NoMoreItems` when nothing is queued at all. On a
    /// fatal transport status the queue is destroyed and `queue` is set to
    /// `None`.
    ///
    /// # Returns
    ///
    /// * `Result<usize, QueueError>` - Bytes the transport wrote
    pub fn write_status(&self, queue: &mut Option<QueueHandle<T>>, wait: bool) -> Result<usize, QueueError> {
        let handle = queue.as_ref().ok_or(QueueError::InvalidParameter)?;
        if handle.direction() != Direction::Out {
            return Err(QueueError::InvalidParameter);
        }
        let result = handle.queue.write_status_head(wait);
        self.check_fatal(queue, result)
    }

    /// Destroy every live queue.
    pub fn shutdown(&self) {
        let queues: Vec<_> = lock(&self.queues).values().cloned().collect();
        if queues.is_empty() {
            return;
        }
        info!("shutting down {} live queues", queues.len());
        for queue in queues {
            if let Err(e) = self.teardown(&queue) {
                warn!("pipe {}: already being destroyed ({})", queue.pipe, e);
            }
        }
    }

    fn check_fatal<R>(
        &self,
        queue: &mut Option<QueueHandle<T>>,
        result: Result<R, QueueError>,
    ) -> Result<R, QueueError> {
        if let Err(QueueError::Transport(e)) = &result {
            if let Some(handle) = queue.take() {
                error!("pipe {}: fatal transport status, destroying queue: {}", handle.pipe(), e);
                // A concurrent destroy may already own the teardown.
                let _ = self.teardown(&handle.queue);
            }
        }
        result
    }

    fn teardown(&self, queue: &Arc<Queue<T>>) -> Result<(), QueueError> {
        // Whoever takes the join handle owns the teardown.
        let worker = lock(&queue.worker).take().ok_or(QueueError::InvalidParameter)?;

        queue.close();
        queue.stop();
        if worker.join().is_err() {
            error!("pipe {}: requester panicked, releasing its buffers", queue.pipe);
            requester::teardown(queue);
        }

        let mut queues = lock(&self.queues);
        let key = (queue.transport_key(), queue.pipe);
        if queues.get(&key).is_some_and(|live| Arc::ptr_eq(live, queue)) {
            queues.remove(&key);
        }
        info!("pipe {}: queue destroyed ({} live)", queue.pipe, queues.len());
        Ok(())
    }
}

impl<T: Transport + 'static> Drop for Registry<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
