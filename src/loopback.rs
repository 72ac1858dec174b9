// loopback.rs

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use log::debug;

use crate::transport::{Completion, Open, PipeId, Selector, Transport, TransportError};

/// Completion token of the loopback device.
#[derive(Debug)]
pub struct LoopbackToken {
    request: Option<u64>,
}

#[derive(Debug)]
enum RequestState {
    /// Read waiting for data.
    Waiting { len: usize },
    /// Finished; reads carry the received bytes.
    Done { bytes: usize, data: Option<Vec<u8>> },
    Aborted,
}

#[derive(Debug)]
struct Request {
    pipe: PipeId,
    state: RequestState,
}

#[derive(Default)]
struct State {
    next_request: u64,
    requests: HashMap<u64, Request>,
    /// Written chunks not yet read, per endpoint number.
    chunks: HashMap<u8, VecDeque<Vec<u8>>>,
    /// Outstanding reads in submission order, per endpoint number.
    readers: HashMap<u8, VecDeque<u64>>,
    stream_sizes: HashMap<PipeId, usize>,
    live_tokens: usize,
    closed: bool,
}

impl State {
    fn begin(&mut self, token: &mut LoopbackToken, pipe: PipeId, state: RequestState) -> u64 {
        if let Some(old) = token.request.take() {
            self.requests.remove(&old);
        }
        let id = self.next_request;
        self.next_request += 1;
        self.requests.insert(id, Request { pipe, state });
        token.request = Some(id);
        id
    }

    /// Match queued chunks with waiting reads on one endpoint.
    fn deliver(&mut self, number: u8) {
        let (Some(chunks), Some(readers)) = (self.chunks.get_mut(&number), self.readers.get_mut(&number)) else {
            return;
        };
        while !chunks.is_empty() {
            let Some(id) = readers.pop_front() else {
                break;
            };
            let Some(request) = self.requests.get_mut(&id) else {
                continue;
            };
            if let RequestState::Waiting { len } = request.state {
                let mut data = chunks.pop_front().unwrap_or_default();
                data.truncate(len);
                request.state = RequestState::Done {
                    bytes: data.len(),
                    data: Some(data),
                };
            }
        }
    }
}

/// In-process device whose OUT pipes feed the IN pipes with the same number.
///
/// A chunk written to pipe `0x02` is returned by the next read on pipe `0x82`.
/// Reads stay pending until a matching write arrives or the pipe is aborted.
pub struct LoopbackTransport {
    name: String,
    state: Mutex<State>,
    completed: Condvar,
}

impl LoopbackTransport {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(State::default()),
            completed: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tokens handed out and not yet released.
    pub fn live_tokens(&self) -> usize {
        self.lock().live_tokens
    }

    /// Fixed transfer size configured for `pipe`, if any.
    pub fn stream_size(&self, pipe: PipeId) -> Option<usize> {
        self.lock().stream_sizes.get(&pipe).copied()
    }

    /// Chunks written to endpoint `number` that no read has picked up.
    pub fn queued_chunks(&self, number: u8) -> usize {
        self.lock().chunks.get(&number).map_or(0, VecDeque::len)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for LoopbackTransport {
    type Token = LoopbackToken;

    fn acquire_token(&self) -> Result<LoopbackToken, TransportError> {
        let mut state = self.lock();
        if state.closed {
            return Err(TransportError::InvalidHandle);
        }
        state.live_tokens += 1;
        Ok(LoopbackToken { request: None })
    }

    fn release_token(&self, token: LoopbackToken) {
        let mut state = self.lock();
        if let Some(id) = token.request {
            state.requests.remove(&id);
        }
        state.live_tokens = state.live_tokens.saturating_sub(1);
    }

    fn submit_read(&self, pipe: PipeId, len: usize, token: &mut LoopbackToken) -> Result<(), TransportError> {
        if !pipe.is_in() {
            return Err(TransportError::InvalidHandle);
        }
        let mut state = self.lock();
        if state.closed {
            return Err(TransportError::DeviceNotConnected);
        }
        let len = state.stream_sizes.get(&pipe).copied().unwrap_or(len).min(len);
        let id = state.begin(token, pipe, RequestState::Waiting { len });
        state.readers.entry(pipe.number()).or_default().push_back(id);
        state.deliver(pipe.number());
        drop(state);

        self.completed.notify_all();
        Ok(())
    }

    fn submit_write(&self, pipe: PipeId, data: &[u8], token: &mut LoopbackToken) -> Result<(), TransportError> {
        if pipe.is_in() {
            return Err(TransportError::InvalidHandle);
        }
        let mut state = self.lock();
        if state.closed {
            return Err(TransportError::DeviceNotConnected);
        }
        state.begin(
            token,
            pipe,
            RequestState::Done {
                bytes: data.len(),
                data: None,
            },
        );
        state.chunks.entry(pipe.number()).or_default().push_back(data.to_vec());
        state.deliver(pipe.number());
        drop(state);

        self.completed.notify_all();
        Ok(())
    }

    fn poll_completion(
        &self,
        token: &mut LoopbackToken,
        buffer: &mut [u8],
        wait: bool,
    ) -> Result<Completion, TransportError> {
        let id = token.request.ok_or(TransportError::InvalidHandle)?;
        let mut state = self.lock();
        loop {
            match &state.requests.get(&id).ok_or(TransportError::InvalidHandle)?.state {
                RequestState::Done { bytes, data } => {
                    let bytes = (*bytes).min(buffer.len());
                    if let Some(data) = data {
                        buffer[..bytes].copy_from_slice(&data[..bytes]);
                    }
                    return Ok(Completion::Done(bytes));
                }
                RequestState::Aborted => return Err(TransportError::Aborted),
                RequestState::Waiting { .. } => {}
            }
            if !wait {
                return Ok(Completion::Pending);
            }
            state = self.completed.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn abort_pipe(&self, pipe: PipeId) -> Result<(), TransportError> {
        let mut state = self.lock();
        let mut aborted = 0;
        for request in state.requests.values_mut() {
            if request.pipe == pipe && matches!(request.state, RequestState::Waiting { .. }) {
                request.state = RequestState::Aborted;
                aborted += 1;
            }
        }
        if pipe.is_in() {
            state.readers.remove(&pipe.number());
        }
        drop(state);

        debug!("{}: aborted {} requests on pipe {}", self.name, aborted, pipe);
        self.completed.notify_all();
        Ok(())
    }

    fn configure_stream(&self, pipe: PipeId, chunk_size: usize) -> Result<(), TransportError> {
        self.lock().stream_sizes.insert(pipe, chunk_size);
        Ok(())
    }

    fn clear_stream(&self, pipe: PipeId) -> Result<(), TransportError> {
        self.lock().stream_sizes.remove(&pipe);
        Ok(())
    }

    fn close(&self) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.closed = true;
        for request in state.requests.values_mut() {
            if matches!(request.state, RequestState::Waiting { .. }) {
                request.state = RequestState::Aborted;
            }
        }
        state.readers.clear();
        drop(state);

        self.completed.notify_all();
        Ok(())
    }
}

impl Open for LoopbackTransport {
    fn open(selector: &Selector) -> Result<Self, TransportError> {
        let name = match selector {
            Selector::Index(index) => format!("loopback-{}", index),
            Selector::SerialNumber(serial) => format!("loopback-sn-{}", serial),
            Selector::Description(description) => description.clone(),
        };
        debug!("{}: opened", name);
        Ok(Self::new(&name))
    }
}
