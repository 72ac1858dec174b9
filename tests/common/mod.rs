// Scripted transport shared by the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use pipe_queue::{Completion, PipeId, Transport, TransportError};

#[derive(Debug)]
pub struct MockToken {
    request: Option<u64>,
}

#[derive(Debug, Clone)]
enum State {
    Waiting,
    Done(Vec<u8>),
    Written(usize),
    Failed(TransportError),
}

/// How the next submitted read resolves.
#[derive(Debug, Clone)]
pub enum ReadScript {
    /// Completes with these bytes.
    Data(Vec<u8>),
    /// Polling the completion reports this status.
    Fail(TransportError),
    /// The submission itself is refused with this status.
    Refuse(TransportError),
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    requests: HashMap<u64, (PipeId, State)>,
    read_script: VecDeque<ReadScript>,
    waiting_reads: VecDeque<u64>,
    write_refusals: VecDeque<TransportError>,
    written: Vec<(PipeId, Vec<u8>)>,
    aborts: Vec<PipeId>,
    configured: Vec<(PipeId, Option<usize>)>,
    configure_error: Option<TransportError>,
    live_tokens: usize,
    token_limit: Option<usize>,
    poll_stalls: usize,
}

/// Transport whose completions are scripted by the test.
///
/// Reads with no script entry stay pending until data is pushed or the pipe
/// is aborted. Writes complete immediately unless a refusal is queued.
#[derive(Default)]
pub struct MockTransport {
    inner: Mutex<Inner>,
    changed: Condvar,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Complete the oldest waiting read, or script the next one.
    pub fn push_read(&self, script: ReadScript) {
        let mut inner = self.lock();
        if let Some(id) = inner.waiting_reads.pop_front() {
            let state = match script {
                ReadScript::Data(data) => State::Done(data),
                ReadScript::Fail(e) | ReadScript::Refuse(e) => State::Failed(e),
            };
            if let Some(request) = inner.requests.get_mut(&id) {
                request.1 = state;
            }
        } else {
            inner.read_script.push_back(script);
        }
        drop(inner);
        self.changed.notify_all();
    }

    pub fn refuse_next_write(&self, status: TransportError) {
        self.lock().write_refusals.push_back(status);
    }

    pub fn fail_configure(&self, status: TransportError) {
        self.lock().configure_error = Some(status);
    }

    pub fn limit_tokens(&self, limit: usize) {
        self.lock().token_limit = Some(limit);
    }

    /// The next `count` polls report `IoIncomplete` whatever the request state.
    pub fn stall_polls(&self, count: usize) {
        self.lock().poll_stalls = count;
    }

    pub fn live_tokens(&self) -> usize {
        self.lock().live_tokens
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.lock().written.iter().map(|(_, data)| data.clone()).collect()
    }

    pub fn aborts(&self) -> Vec<PipeId> {
        self.lock().aborts.clone()
    }

    pub fn configured(&self) -> Vec<(PipeId, Option<usize>)> {
        self.lock().configured.clone()
    }

    fn begin(inner: &mut Inner, token: &mut MockToken, pipe: PipeId, state: State) -> u64 {
        if let Some(old) = token.request.take() {
            inner.requests.remove(&old);
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.requests.insert(id, (pipe, state));
        token.request = Some(id);
        id
    }
}

impl Transport for MockTransport {
    type Token = MockToken;

    fn acquire_token(&self) -> Result<MockToken, TransportError> {
        let mut inner = self.lock();
        if inner.token_limit.is_some_and(|limit| inner.live_tokens >= limit) {
            return Err(TransportError::InsufficientResources);
        }
        inner.live_tokens += 1;
        Ok(MockToken { request: None })
    }

    fn release_token(&self, token: MockToken) {
        let mut inner = self.lock();
        if let Some(id) = token.request {
            inner.requests.remove(&id);
        }
        inner.live_tokens -= 1;
    }

    fn submit_read(&self, pipe: PipeId, _len: usize, token: &mut MockToken) -> Result<(), TransportError> {
        let mut inner = self.lock();
        match inner.read_script.pop_front() {
            Some(ReadScript::Data(data)) => {
                Self::begin(&mut inner, token, pipe, State::Done(data));
            }
            Some(ReadScript::Fail(e)) => {
                Self::begin(&mut inner, token, pipe, State::Failed(e));
            }
            Some(ReadScript::Refuse(e)) => {
                Self::begin(&mut inner, token, pipe, State::Failed(e));
                return Err(e);
            }
            None => {
                let id = Self::begin(&mut inner, token, pipe, State::Waiting);
                inner.waiting_reads.push_back(id);
            }
        }
        Ok(())
    }

    fn submit_write(&self, pipe: PipeId, data: &[u8], token: &mut MockToken) -> Result<(), TransportError> {
        let mut inner = self.lock();
        if let Some(e) = inner.write_refusals.pop_front() {
            Self::begin(&mut inner, token, pipe, State::Failed(e));
            return Err(e);
        }
        inner.written.push((pipe, data.to_vec()));
        Self::begin(&mut inner, token, pipe, State::Written(data.len()));
        Ok(())
    }

    fn poll_completion(
        &self,
        token: &mut MockToken,
        buffer: &mut [u8],
        wait: bool,
    ) -> Result<Completion, TransportError> {
        let id = token.request.ok_or(TransportError::InvalidHandle)?;
        let mut inner = self.lock();
        if inner.poll_stalls > 0 {
            inner.poll_stalls -= 1;
            return Err(TransportError::IoIncomplete);
        }
        loop {
            let state = inner
                .requests
                .get(&id)
                .map(|(_, state)| state.clone())
                .ok_or(TransportError::InvalidHandle)?;
            match state {
                State::Done(data) => {
                    let n = data.len().min(buffer.len());
                    buffer[..n].copy_from_slice(&data[..n]);
                    return Ok(Completion::Done(n));
                }
                State::Written(n) => return Ok(Completion::Done(n)),
                State::Failed(e) => return Err(e),
                State::Waiting if !wait => return Ok(Completion::Pending),
                State::Waiting => inner = self.changed.wait(inner).unwrap(),
            }
        }
    }

    fn abort_pipe(&self, pipe: PipeId) -> Result<(), TransportError> {
        let mut inner = self.lock();
        inner.aborts.push(pipe);
        for (request_pipe, state) in inner.requests.values_mut() {
            if *request_pipe == pipe && matches!(state, State::Waiting) {
                *state = State::Failed(TransportError::Aborted);
            }
        }
        let Inner {
            requests,
            waiting_reads,
            ..
        } = &mut *inner;
        waiting_reads.retain(|id| requests.get(id).is_some_and(|(p, _)| *p != pipe));
        drop(inner);
        self.changed.notify_all();
        Ok(())
    }

    fn configure_stream(&self, pipe: PipeId, chunk_size: usize) -> Result<(), TransportError> {
        let mut inner = self.lock();
        if let Some(e) = inner.configure_error {
            return Err(e);
        }
        inner.configured.push((pipe, Some(chunk_size)));
        Ok(())
    }

    fn clear_stream(&self, pipe: PipeId) -> Result<(), TransportError> {
        let mut inner = self.lock();
        if let Some(e) = inner.configure_error {
            return Err(e);
        }
        inner.configured.push((pipe, None));
        Ok(())
    }
}

/// Poll `condition` until it holds or two seconds pass.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}
