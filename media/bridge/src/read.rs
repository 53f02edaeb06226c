/*!
    Single-outstanding-request read channel.

    A puller (a graph worker in pull mode, or the ingestion thread) posts one
    request into the engine's read slot and blocks until the host's servicer
    completes it. Short completions advance the request in place. In exact
    mode the remainder is re-posted until the full size arrives or the source
    reports a terminal result. A drain requested by a stream interrupts the
    wait so the puller can run it, then the wait resumes on the same request.
*/

use parking_lot::MutexGuard;
use tracing::{debug, trace, warn};

use media_types::ReadResult;

use crate::engine::{Shared, State};

/**
    A read the servicer must answer from the byte source.
*/
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadRequest {
    pub offset: u64,
    pub size: usize,
}

/**
    Outcome of waiting for a read request.
*/
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadWait {
    /// A request was taken and must be completed.
    Request(ReadRequest),
    /// A flush began while waiting; no request was taken.
    Flushing,
    /// The channel was torn down; no further requests will be posted.
    TornDown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PullMode {
    /// Keep re-posting until the full size is delivered.
    Exact,
    /// Return whatever the first completion delivered.
    Partial,
}

/// Result of a pull, with the delivered bytes.
#[derive(Debug)]
pub(crate) struct Pulled {
    pub(crate) result: ReadResult,
    pub(crate) data: Vec<u8>,
    /// Bytes the source reported as ready when it had more than requested.
    pub(crate) available: Option<usize>,
}

impl Pulled {
    fn terminal(result: ReadResult) -> Self {
        Self {
            result,
            data: Vec::new(),
            available: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Posted,
    InFlight,
    Partial,
    Done,
}

#[derive(Debug)]
pub(crate) struct PendingRead {
    offset: u64,
    remaining: usize,
    data: Vec<u8>,
    stage: Stage,
    result: ReadResult,
    available: Option<usize>,
}

impl PendingRead {
    fn new(offset: u64, size: usize) -> Self {
        Self {
            offset,
            remaining: size,
            data: Vec::with_capacity(size),
            stage: Stage::Posted,
            result: ReadResult::Success,
            available: None,
        }
    }

    fn fail(&mut self) {
        self.result = ReadResult::Failure;
        self.stage = Stage::Done;
    }
}

/**
    Drain handshake between a stream and the thread currently pulling.
*/
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum DrainState {
    #[default]
    Idle,
    Requested,
    Running,
}

#[derive(Debug, Default)]
pub(crate) struct ReadSlot {
    /// Requests may be posted.
    connected: bool,
    /// Torn down for good; servicers stop waiting.
    closed: bool,
    request: Option<PendingRead>,
    flush_epoch: u64,
}

impl ReadSlot {
    pub(crate) fn open(&mut self) {
        self.connected = !self.closed;
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn has_request(&self) -> bool {
        self.request.is_some()
    }

    /// Wakes servicers blocked in `await_request` once.
    pub(crate) fn begin_flush(&mut self) {
        self.flush_epoch = self.flush_epoch.wrapping_add(1);
    }

    /**
        Force-completes an outstanding request with failure.

        Returns true if a request was aborted.
    */
    pub(crate) fn abort(&mut self) -> bool {
        match self.request.as_mut() {
            Some(request) if request.stage != Stage::Done => {
                request.fail();
                true
            }
            _ => false,
        }
    }

    pub(crate) fn tear_down(&mut self) {
        self.connected = false;
        self.closed = true;
        self.abort();
    }
}

/**
    Blocks until a request is posted, a flush begins, or the channel is torn down.

    Waiting may start before the engine connects.
*/
pub(crate) fn await_request(shared: &Shared) -> ReadWait {
    let mut state = shared.state.lock();
    let epoch = state.read.flush_epoch;

    loop {
        if state.read.closed {
            return ReadWait::TornDown;
        }
        if let Some(request) = state.read.request.as_mut() {
            if request.stage == Stage::Posted {
                request.stage = Stage::InFlight;
                trace!(offset = request.offset, size = request.remaining, "read request taken");
                return ReadWait::Request(ReadRequest {
                    offset: request.offset,
                    size: request.remaining,
                });
            }
        }
        if state.read.flush_epoch != epoch {
            return ReadWait::Flushing;
        }
        shared.request_cond.wait(&mut state);
    }
}

/**
    Completes the in-flight request with the bytes the source delivered.

    A successful completion shorter than the outstanding size leaves the
    request open at the advanced offset. Bytes beyond the outstanding size
    are not copied; their count is reported to the puller as available.
*/
pub(crate) fn complete_request(shared: &Shared, result: ReadResult, data: &[u8]) {
    let mut state = shared.state.lock();

    let Some(request) = state
        .read
        .request
        .as_mut()
        .filter(|request| request.stage == Stage::InFlight)
    else {
        warn!(?result, len = data.len(), "read completion without an in-flight request");
        return;
    };

    let delivered = data.len();
    if result == ReadResult::Success && delivered < request.remaining {
        request.data.extend_from_slice(data);
        request.offset += delivered as u64;
        request.remaining -= delivered;
        request.stage = Stage::Partial;
        trace!(delivered, remaining = request.remaining, "short read");
    } else {
        if result == ReadResult::Success {
            let take = delivered.min(request.remaining);
            request.data.extend_from_slice(&data[..take]);
            if delivered > request.remaining {
                request.available = Some(delivered);
            }
            request.remaining -= take;
        }
        request.result = result;
        request.stage = Stage::Done;
    }

    shared.done_cond.notify_all();
}

/**
    Pulls `size` bytes at `offset`, or at the next sequential offset.

    Only one request exists at a time; a second puller waits for the slot.
*/
pub(crate) fn pull(shared: &Shared, offset: Option<u64>, size: usize, mode: PullMode) -> Pulled {
    let mut state = shared.state.lock();

    let offset = offset.unwrap_or(state.offsets.next_pull);
    state.offsets.next_pull = offset.saturating_add(size as u64);

    let mut size = size;
    if state.seekable {
        let file_size = state.offsets.file_size;
        if offset >= file_size {
            return Pulled::terminal(ReadResult::Eos);
        }
        if let Ok(rest) = usize::try_from(file_size - offset) {
            size = size.min(rest);
        }
    }

    loop {
        service_drain(shared, &mut state);
        if !state.read.connected {
            return Pulled::terminal(ReadResult::Failure);
        }
        if mode == PullMode::Partial && !state.push_active {
            return Pulled::terminal(ReadResult::Failure);
        }
        if state.read.request.is_none() {
            break;
        }
        shared.done_cond.wait(&mut state);
    }

    trace!(offset, size, ?mode, "posting read request");
    state.read.request = Some(PendingRead::new(offset, size));
    shared.request_cond.notify_all();

    let mut short_reads = 0u32;
    loop {
        let Some(request) = state.read.request.as_mut() else {
            return Pulled::terminal(ReadResult::Failure);
        };
        match request.stage {
            Stage::Done => break,
            Stage::Partial if mode == PullMode::Partial => break,
            Stage::Partial => {
                short_reads += 1;
                if shared
                    .config
                    .short_read_limit
                    .is_some_and(|limit| short_reads > limit)
                {
                    warn!(offset, size, short_reads, "source keeps returning short reads");
                    request.fail();
                    break;
                }
                request.stage = Stage::Posted;
                shared.request_cond.notify_all();
            }
            Stage::Posted | Stage::InFlight => {}
        }

        if service_drain(shared, &mut state) {
            continue;
        }
        shared.done_cond.wait(&mut state);
    }

    let request = state.read.request.take();
    shared.done_cond.notify_all();
    drop(state);

    let Some(request) = request else {
        return Pulled::terminal(ReadResult::Failure);
    };
    trace!(offset, result = ?request.result, len = request.data.len(), "read request returned");

    if request.result.is_terminal() {
        return Pulled::terminal(request.result);
    }
    Pulled {
        result: request.result,
        data: request.data,
        available: request.available,
    }
}

/**
    Runs a drain requested by a stream, with the engine lock released.

    Returns true if a drain ran.
*/
fn service_drain(shared: &Shared, state: &mut MutexGuard<'_, State>) -> bool {
    if state.drain != DrainState::Requested {
        return false;
    }

    state.drain = DrainState::Running;
    debug!("draining graph on behalf of a stream");
    MutexGuard::unlocked(state, || shared.graph.drain());
    state.drain = DrainState::Idle;

    for stream in &state.streams {
        stream.signals.event.notify_all();
    }
    true
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use rstest::rstest;

    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::Engine;
    use crate::testing::{GraphCall, MockGraph};

    fn channel(config: EngineConfig) -> (Engine, Arc<Shared>, MockGraph) {
        let graph = MockGraph::pull(Vec::new());
        let engine = Engine::new(graph.clone(), config);
        let shared = Arc::clone(engine.shared());
        shared.state.lock().read.open();
        (engine, shared, graph)
    }

    fn take(shared: &Shared) -> ReadRequest {
        match await_request(shared) {
            ReadWait::Request(request) => request,
            other => panic!("expected a request, got {other:?}"),
        }
    }

    fn spawn_pull(
        shared: &Arc<Shared>,
        offset: u64,
        size: usize,
        mode: PullMode,
    ) -> thread::JoinHandle<Pulled> {
        let shared = Arc::clone(shared);
        thread::spawn(move || pull(&shared, Some(offset), size, mode))
    }

    #[rstest]
    #[timeout(Duration::from_secs(5))]
    fn full_read_completes_in_one_cycle() {
        let (_engine, shared, _graph) = channel(EngineConfig::default());
        let puller = spawn_pull(&shared, 10, 100, PullMode::Exact);

        let request = take(&shared);
        assert_eq!(request, ReadRequest { offset: 10, size: 100 });
        complete_request(&shared, ReadResult::Success, &[7; 100]);

        let pulled = puller.join().unwrap();
        assert_eq!(pulled.result, ReadResult::Success);
        assert_eq!(pulled.data, vec![7; 100]);
        assert_eq!(pulled.available, None);
        assert!(!shared.state.lock().read.has_request());
    }

    #[test]
    fn pull_past_the_end_of_the_offset_space() {
        let (_engine, shared, _graph) = channel(EngineConfig::default());
        {
            let mut state = shared.state.lock();
            state.seekable = true;
            state.offsets.file_size = 10;
        }

        let pulled = pull(&shared, Some(u64::MAX - 4), 16, PullMode::Exact);
        assert_eq!(pulled.result, ReadResult::Eos);
        assert_eq!(shared.state.lock().offsets.next_pull, u64::MAX);
    }

    #[rstest]
    #[timeout(Duration::from_secs(5))]
    fn short_reads_are_reposted_until_complete() {
        let (_engine, shared, _graph) = channel(EngineConfig::default());
        let puller = spawn_pull(&shared, 0, 100, PullMode::Exact);

        let mut seen = Vec::new();
        let mut byte = 0u8;
        loop {
            let request = take(&shared);
            seen.push(request);
            let len = request.size.min(30);
            let chunk: Vec<u8> = (0..len).map(|i| byte.wrapping_add(i as u8)).collect();
            byte = byte.wrapping_add(len as u8);
            complete_request(&shared, ReadResult::Success, &chunk);
            if len == request.size {
                break;
            }
        }

        let pulled = puller.join().unwrap();
        assert_eq!(
            seen,
            vec![
                ReadRequest { offset: 0, size: 100 },
                ReadRequest { offset: 30, size: 70 },
                ReadRequest { offset: 60, size: 40 },
                ReadRequest { offset: 90, size: 10 },
            ]
        );
        assert_eq!(pulled.result, ReadResult::Success);
        assert_eq!(pulled.data, (0..100u8).collect::<Vec<_>>());
    }

    #[rstest]
    #[timeout(Duration::from_secs(5))]
    fn partial_pull_returns_short_data() {
        let (_engine, shared, _graph) = channel(EngineConfig::default());
        shared.state.lock().push_active = true;
        let puller = spawn_pull(&shared, 0, 64, PullMode::Partial);

        take(&shared);
        complete_request(&shared, ReadResult::Success, &[1; 24]);

        let pulled = puller.join().unwrap();
        assert_eq!(pulled.result, ReadResult::Success);
        assert_eq!(pulled.data.len(), 24);
    }

    #[rstest]
    #[timeout(Duration::from_secs(5))]
    fn oversized_completion_reports_available_bytes() {
        let (_engine, shared, _graph) = channel(EngineConfig::default());
        let puller = spawn_pull(&shared, 0, 16, PullMode::Exact);

        take(&shared);
        complete_request(&shared, ReadResult::Success, &[3; 40]);

        let pulled = puller.join().unwrap();
        assert_eq!(pulled.data, vec![3; 16]);
        assert_eq!(pulled.available, Some(40));
    }

    #[rstest]
    #[case(ReadResult::Eos)]
    #[case(ReadResult::Failure)]
    #[case(ReadResult::Flushing)]
    #[timeout(Duration::from_secs(5))]
    fn terminal_result_ends_short_read_sequence(#[case] result: ReadResult) {
        let (_engine, shared, _graph) = channel(EngineConfig::default());
        let puller = spawn_pull(&shared, 0, 50, PullMode::Exact);

        take(&shared);
        complete_request(&shared, ReadResult::Success, &[0; 20]);
        assert_eq!(take(&shared), ReadRequest { offset: 20, size: 30 });
        complete_request(&shared, result, &[]);

        let pulled = puller.join().unwrap();
        assert_eq!(pulled.result, result);
        assert!(pulled.data.is_empty());
    }

    #[rstest]
    #[timeout(Duration::from_secs(5))]
    fn short_read_limit_fails_the_pull() {
        let config = EngineConfig {
            short_read_limit: Some(2),
            ..Default::default()
        };
        let (_engine, shared, _graph) = channel(config);
        let puller = spawn_pull(&shared, 0, 10, PullMode::Exact);

        for _ in 0..3 {
            take(&shared);
            complete_request(&shared, ReadResult::Success, &[]);
        }

        assert_eq!(puller.join().unwrap().result, ReadResult::Failure);
    }

    #[rstest]
    #[timeout(Duration::from_secs(5))]
    fn teardown_fails_in_flight_read_and_wakes_servicers() {
        let (_engine, shared, _graph) = channel(EngineConfig::default());
        let puller = spawn_pull(&shared, 0, 10, PullMode::Exact);
        take(&shared);

        let (tx, rx) = mpsc::channel();
        let servicer = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || tx.send(await_request(&shared)).unwrap())
        };
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        {
            let mut state = shared.state.lock();
            state.read.tear_down();
        }
        shared.request_cond.notify_all();
        shared.done_cond.notify_all();

        assert_eq!(puller.join().unwrap().result, ReadResult::Failure);
        assert_eq!(rx.recv().unwrap(), ReadWait::TornDown);
        servicer.join().unwrap();

        let late = pull(&shared, Some(0), 10, PullMode::Exact);
        assert_eq!(late.result, ReadResult::Failure);
    }

    #[rstest]
    #[timeout(Duration::from_secs(5))]
    fn flush_wakes_waiting_servicer() {
        let (_engine, shared, _graph) = channel(EngineConfig::default());

        let (tx, rx) = mpsc::channel();
        let servicer = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || tx.send(await_request(&shared)).unwrap())
        };
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        shared.state.lock().read.begin_flush();
        shared.request_cond.notify_all();

        assert_eq!(rx.recv().unwrap(), ReadWait::Flushing);
        servicer.join().unwrap();
    }

    #[rstest]
    #[timeout(Duration::from_secs(5))]
    fn completion_without_request_is_ignored() {
        let (_engine, shared, _graph) = channel(EngineConfig::default());
        complete_request(&shared, ReadResult::Success, &[1, 2, 3]);
        assert!(!shared.state.lock().read.has_request());
    }

    #[rstest]
    #[timeout(Duration::from_secs(5))]
    fn seekable_reads_stop_at_file_end() {
        let (_engine, shared, _graph) = channel(EngineConfig::default());
        {
            let mut state = shared.state.lock();
            state.seekable = true;
            state.offsets.file_size = 50;
        }

        assert_eq!(pull(&shared, Some(50), 10, PullMode::Exact).result, ReadResult::Eos);

        let puller = spawn_pull(&shared, 40, 20, PullMode::Exact);
        assert_eq!(take(&shared), ReadRequest { offset: 40, size: 10 });
        complete_request(&shared, ReadResult::Success, &[9; 10]);
        assert_eq!(puller.join().unwrap().data, vec![9; 10]);
    }

    #[rstest]
    #[timeout(Duration::from_secs(5))]
    fn sequential_pulls_continue_from_last_offset() {
        let (_engine, shared, _graph) = channel(EngineConfig::default());

        let puller = spawn_pull(&shared, 100, 8, PullMode::Exact);
        take(&shared);
        complete_request(&shared, ReadResult::Success, &[0; 8]);
        puller.join().unwrap();

        let puller = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || pull(&shared, None, 4, PullMode::Exact))
        };
        assert_eq!(take(&shared), ReadRequest { offset: 108, size: 4 });
        complete_request(&shared, ReadResult::Success, &[0; 4]);
        puller.join().unwrap();
    }

    #[rstest]
    #[timeout(Duration::from_secs(5))]
    fn waiting_puller_services_drain() {
        let (_engine, shared, graph) = channel(EngineConfig::default());
        let puller = spawn_pull(&shared, 0, 10, PullMode::Exact);
        take(&shared);

        shared.state.lock().drain = DrainState::Requested;
        shared.done_cond.notify_all();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while shared.state.lock().drain != DrainState::Idle {
            assert!(std::time::Instant::now() < deadline, "drain was not serviced");
            thread::sleep(Duration::from_millis(1));
        }
        assert!(graph.calls().contains(&GraphCall::Drain));

        complete_request(&shared, ReadResult::Success, &[0; 10]);
        assert_eq!(puller.join().unwrap().result, ReadResult::Success);
    }
}
