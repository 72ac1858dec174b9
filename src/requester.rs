// requester.rs

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::queue::{lock, Queue, TransferUnit, UnitStatus};
use crate::transport::{Direction, Transport, TransportError};

/// Body of a queue's requester thread.
///
/// Keeps the transport busy: an IN queue submits a new read whenever there is
/// room, an OUT queue hands the oldest queued payload to the transport. It
/// never waits for a completion; callers collect those. When nothing can be
/// submitted it parks until woken or until `idle_wait` passes. Once the queue
/// is stopped it aborts the pipe and releases every buffered unit.
pub(crate) fn run<T: Transport>(queue: Arc<Queue<T>>) {
    debug!("pipe {}: requester started", queue.pipe);

    while queue.is_active() {
        let progressed = match queue.pipe.direction() {
            Direction::In => issue_read(&queue),
            Direction::Out => issue_write(&queue),
        };
        if !progressed {
            queue.park_worker();
        }
    }

    teardown(&queue);
    debug!("pipe {}: requester stopped", queue.pipe);
}

fn submit_status(queue: &Queue<impl Transport>, result: Result<(), TransportError>) -> UnitStatus {
    match result {
        Ok(()) | Err(TransportError::IoPending | TransportError::IoIncomplete) => {
            queue.counters.submitted.fetch_add(1, Ordering::Relaxed);
            UnitStatus::Submitted
        }
        Err(e) => {
            warn!("pipe {}: transport refused request: {}", queue.pipe, e);
            queue.counters.failed_submissions.fetch_add(1, Ordering::Relaxed);
            UnitStatus::Failed(e)
        }
    }
}

/// Start one more read if the queue has room. Returns whether a unit was added.
fn issue_read<T: Transport>(queue: &Queue<T>) -> bool {
    let mut buffers = queue.lock_buffers();
    if buffers.closed || buffers.len() >= queue.config.capacity {
        return false;
    }

    let data = match queue.alloc_chunk() {
        Ok(data) => data,
        Err(e) => {
            warn!("pipe {}: could not allocate read buffer: {}", queue.pipe, e);
            return false;
        }
    };
    // Tokens come back as callers collect reads; retried on every wake.
    let token = match queue.transport.acquire_token() {
        Ok(token) => token,
        Err(e) => {
            debug!("pipe {}: no completion token for read: {}", queue.pipe, e);
            return false;
        }
    };

    let mut unit = TransferUnit::new(data, token);
    if let Some(token) = unit.token.as_mut() {
        let result = queue.transport.submit_read(queue.pipe, queue.config.chunk_size, token);
        unit.status = submit_status(queue, result);
    }
    buffers.pending.append(Arc::new(Mutex::new(unit)));
    drop(buffers);

    queue.notify_changed();
    true
}

/// Hand the oldest queued write to the transport and move it to the
/// write-status list, whatever the submission reported.
fn issue_write<T: Transport>(queue: &Queue<T>) -> bool {
    let mut buffers = queue.lock_buffers();
    let Some(unit) = buffers.pending.pop_front() else {
        return false;
    };

    {
        let mut guard = lock(&unit);
        let io = &mut *guard;
        if let Some(token) = io.token.as_mut() {
            let result = queue.transport.submit_write(queue.pipe, &io.data, token);
            io.status = submit_status(queue, result);
        }
    }
    buffers.write_status.append(unit);
    drop(buffers);

    queue.notify_changed();
    true
}

/// Abort the pipe and free every unit left on either list.
///
/// Safe to run more than once; later runs find both lists empty.
pub(crate) fn teardown<T: Transport>(queue: &Queue<T>) {
    if let Err(e) = queue.transport.abort_pipe(queue.pipe) {
        warn!("pipe {}: abort failed: {}", queue.pipe, e);
    }

    let units = {
        let mut buffers = queue.lock_buffers();
        buffers.closed = true;
        let mut units = buffers.pending.drain();
        units.extend(buffers.write_status.drain());
        units
    };

    // Polls blocked on these units were woken by the abort, so locking them
    // here does not wait on the transport.
    for unit in &units {
        queue.release_unit(unit);
    }
    queue.notify_changed();

    debug!("pipe {}: released {} buffered units", queue.pipe, units.len());
}
