/*!
    Demux engine.

    The engine owns the graph, the read channel and the output streams. All
    of their state sits behind one mutex; every blocking operation waits on
    one of the engine's condition variables (or a stream's) and rechecks its
    flags after each wake.
*/

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use media_types::{Aperture, Error, Format, Result};

use crate::callbacks::GraphContext;
use crate::config::{EngineConfig, GraphKind, QueueLimits};
use crate::graph::{Graph, GraphSetup, PadId};
use crate::ingest;
use crate::read::{DrainState, ReadSlot};
use crate::source::ReadService;
use crate::stream::{Stream, StreamState};

/**
    Lifecycle of an engine.
*/
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Created, not yet connected.
    Init,
    /// Connected; streams are available.
    Connected,
    /// A connection attempt failed. Only disconnecting is possible.
    Failed,
    /// Torn down.
    Disconnected,
}

/// Byte offsets of the source, as seen by the graph.
#[derive(Debug, Default)]
pub(crate) struct Offsets {
    pub(crate) file_size: u64,
    /// Next offset the ingestion thread reads.
    pub(crate) next: u64,
    /// Offset at which ingestion stops; the file size when unset.
    pub(crate) stop: Option<u64>,
    /// Offset of the next sequential pull.
    pub(crate) next_pull: u64,
}

impl Offsets {
    pub(crate) fn limit(&self) -> u64 {
        self.stop.unwrap_or(self.file_size)
    }
}

#[derive(Debug)]
pub(crate) struct State {
    pub(crate) phase: Phase,
    pub(crate) streams: Vec<StreamState>,
    /// Number of pre-declared streams, claimed in order by new pads.
    pub(crate) expected_streams: usize,
    pub(crate) read: ReadSlot,
    pub(crate) offsets: Offsets,
    pub(crate) flushing: bool,
    pub(crate) drain: DrainState,
    /// First fatal error reported by the graph or the byte source.
    pub(crate) error: Option<Error>,
    pub(crate) seekable: bool,
    pub(crate) has_duration: bool,
    pub(crate) no_more_pads: bool,
    /// The ingestion thread reached the end of the source at least once.
    pub(crate) input_ended: bool,
    pub(crate) pull_mode: bool,
    pub(crate) push_active: bool,
    pub(crate) input_format: Option<Format>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            phase: Phase::Init,
            streams: Vec::new(),
            expected_streams: 0,
            read: ReadSlot::default(),
            offsets: Offsets::default(),
            flushing: true,
            drain: DrainState::Idle,
            error: None,
            seekable: false,
            has_duration: false,
            no_more_pads: false,
            input_ended: false,
            pull_mode: false,
            push_active: false,
            input_format: None,
        }
    }
}

impl State {
    fn ensure_init(&self) -> Result<()> {
        match self.phase {
            Phase::Init => Ok(()),
            Phase::Connected => Err(Error::InvalidState("engine is already connected")),
            Phase::Failed => Err(Error::InvalidState("engine failed to connect")),
            Phase::Disconnected => Err(Error::InvalidState("engine is disconnected")),
        }
    }

    fn begin_connection(&mut self) {
        self.read.open();
        self.no_more_pads = false;
        self.error = None;
        self.input_ended = false;
        self.drain = DrainState::Idle;
    }

    /**
        Returns true once the graph will not announce further streams.
    */
    pub(crate) fn discovery_complete(&self, kind: GraphKind) -> bool {
        match kind {
            GraphKind::Decodebin | GraphKind::Avi => self.no_more_pads,
            GraphKind::MpegAudio => {
                self.has_duration || self.streams.first().is_some_and(|stream| stream.eos)
            }
            GraphKind::Wave | GraphKind::RawConverter => true,
        }
    }

    pub(crate) fn claimed_streams(&self) -> usize {
        self.streams.iter().filter(|stream| stream.claimed).count()
    }

    /**
        Assigns a stream to a newly announced pad.

        The first unclaimed pre-declared stream is reused; otherwise a new
        stream is appended. Returns the stream index.
    */
    pub(crate) fn claim_stream(&mut self, pad: PadId) -> usize {
        let declared = self
            .streams
            .iter()
            .take(self.expected_streams)
            .position(|stream| !stream.claimed);

        let index = match declared {
            Some(index) => index,
            None => {
                self.streams.push(StreamState::discovered());
                self.streams.len() - 1
            }
        };

        let stream = &mut self.streams[index];
        stream.claimed = true;
        stream.upstream = Some(pad);
        stream.segment = None;
        index
    }
}

pub(crate) struct Shared {
    pub(crate) state: Mutex<State>,
    /// Discovery progress, caps, duration and errors.
    pub(crate) init_cond: Condvar,
    /// A read request was posted, or the read channel changed state.
    pub(crate) request_cond: Condvar,
    /// A read request completed, the slot was freed, or a drain is pending.
    pub(crate) done_cond: Condvar,
    pub(crate) graph: Box<dyn Graph>,
    pub(crate) config: EngineConfig,
    pub(crate) ingest: Mutex<Option<JoinHandle<()>>>,
}

/**
    Bridges a byte source to a demux graph and exposes its output streams.

    An engine is connected once, through either [`Engine::connect`] or
    [`Engine::connect_unseekable`], and torn down by
    [`Engine::disconnect`] or by dropping it. A failed connection is not
    retried in place; the engine has to be dropped and recreated.
*/
pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    pub fn new(graph: impl Graph + 'static, config: EngineConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                init_cond: Condvar::new(),
                request_cond: Condvar::new(),
                done_cond: Condvar::new(),
                graph: Box::new(graph),
                config,
                ingest: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn phase(&self) -> Phase {
        self.shared.state.lock().phase
    }

    /**
        Returns a handle for answering read requests from the byte source.

        The host must service reads, typically from a dedicated thread, for
        the engine to make progress, including during `connect`.
    */
    pub fn reader(&self) -> ReadService {
        ReadService::new(Arc::clone(&self.shared))
    }

    /**
        Connects a seekable source of `total_size` bytes.

        Blocks until the graph has discovered its streams and negotiated a
        format on each, or until it reports an error.
    */
    pub fn connect(&self, total_size: u64) -> Result<()> {
        let kind = self.shared.config.kind;
        {
            let mut state = self.shared.state.lock();
            state.ensure_init()?;
            if kind.requires_unseekable() {
                return Err(Error::Unsupported("graph kind needs an unseekable source"));
            }
            state.seekable = true;
            state.offsets = Offsets {
                file_size: total_size,
                ..Default::default()
            };
            state.begin_connection();
        }
        info!(total_size, ?kind, "connecting seekable source");

        self.start_graph()?;

        let mut state = self.shared.state.lock();
        let discovered = self.wait_init(&mut state, "stream discovery", |state| {
            state.discovery_complete(kind)
        });
        if let Err(e) = discovered {
            return Err(Self::fail(&mut state, e));
        }

        for index in 0..state.streams.len() {
            let negotiated = self.wait_init(&mut state, "stream caps", |state| {
                state
                    .streams
                    .get(index)
                    .is_none_or(|stream| stream.preferred_format.is_some())
            });
            if let Err(e) = negotiated {
                return Err(Self::fail(&mut state, e));
            }

            // Many demuxers record duration before fixing caps, so it is
            // only queried once caps are known.
            let Some(pad) = state.streams.get(index).and_then(|stream| stream.upstream) else {
                continue;
            };
            let graph = &self.shared.graph;
            let (language, duration) = MutexGuard::unlocked(&mut state, || {
                (graph.query_language(pad), graph.query_duration(pad))
            });
            if let Some(stream) = state.streams.get_mut(index) {
                stream.language = language;
                stream.duration = duration;
            }
        }

        state.offsets.next = 0;
        state.phase = Phase::Connected;
        info!(streams = state.streams.len(), "connected");
        Ok(())
    }

    /**
        Connects an unseekable source whose streams are known in advance.

        `output_formats` and `apertures` describe each of the
        `expected_streams` outputs. Fails unless the graph produces at least
        that many streams before discovery ends or the input runs out.
    */
    pub fn connect_unseekable(
        &self,
        input_format: Format,
        expected_streams: usize,
        output_formats: &[Format],
        apertures: Option<&[Aperture]>,
    ) -> Result<()> {
        let kind = self.shared.config.kind;
        if output_formats.len() != expected_streams {
            return Err(Error::InvalidArgument(format!(
                "{} output formats for {expected_streams} streams",
                output_formats.len()
            )));
        }
        if let Some(apertures) = apertures {
            if apertures.len() != expected_streams {
                return Err(Error::InvalidArgument(format!(
                    "{} apertures for {expected_streams} streams",
                    apertures.len()
                )));
            }
        }
        if kind == GraphKind::RawConverter && expected_streams != 1 {
            return Err(Error::Unsupported("raw converter produces exactly one stream"));
        }

        {
            let mut state = self.shared.state.lock();
            state.ensure_init()?;
            state.seekable = false;
            state.flushing = false;
            state.input_format = Some(input_format);
            state.offsets = Offsets::default();
            state.expected_streams = expected_streams;
            state.streams = output_formats
                .iter()
                .enumerate()
                .map(|(i, format)| {
                    StreamState::declared(*format, apertures.map(|apertures| apertures[i]))
                })
                .collect();
            state.begin_connection();
        }
        info!(expected_streams, ?kind, ?input_format, "connecting unseekable source");

        self.start_graph()?;

        let mut state = self.shared.state.lock();
        let waited = self.wait_init(&mut state, "declared streams", |state| {
            state.claimed_streams() >= expected_streams
                || state.input_ended
                || state.discovery_complete(kind)
        });
        if let Err(e) = waited {
            return Err(Self::fail(&mut state, e));
        }

        let found = state.claimed_streams();
        if found < expected_streams {
            warn!(expected_streams, found, "graph produced too few streams");
            return Err(Self::fail(
                &mut state,
                Error::StreamCount {
                    expected: expected_streams,
                    found,
                },
            ));
        }

        state.phase = Phase::Connected;
        info!(streams = found, "connected");
        Ok(())
    }

    fn start_graph(&self) -> Result<()> {
        let setup = {
            let state = self.shared.state.lock();
            GraphSetup {
                kind: self.shared.config.kind,
                seekable: state.seekable,
                input_format: state.input_format,
                queue_limits: self.shared.config.queue_limits,
            }
        };

        let ctx = GraphContext::new(Arc::downgrade(&self.shared));
        if let Err(message) = self.shared.graph.start(ctx, &setup) {
            error!(%message, "failed to start graph");
            let mut state = self.shared.state.lock();
            return Err(Self::fail(&mut state, Error::ConnectFailed(message)));
        }

        let pull_mode = self.shared.state.lock().pull_mode;
        if !pull_mode && !ingest::activate(&self.shared) {
            let mut state = self.shared.state.lock();
            return Err(Self::fail(
                &mut state,
                Error::ConnectFailed("failed to start ingestion".into()),
            ));
        }
        Ok(())
    }

    /**
        Waits on the discovery condition until `done` holds.

        Fails as soon as the graph reports an error, or when the configured
        discovery timeout elapses.
    */
    fn wait_init(
        &self,
        state: &mut MutexGuard<'_, State>,
        what: &'static str,
        mut done: impl FnMut(&State) -> bool,
    ) -> Result<()> {
        let deadline = self
            .shared
            .config
            .discovery_timeout
            .map(|timeout| Instant::now() + timeout);

        loop {
            if let Some(error) = &state.error {
                return Err(error.clone());
            }
            if done(&**state) {
                return Ok(());
            }
            match deadline {
                Some(deadline) => {
                    let timed_out = self.shared.init_cond.wait_until(state, deadline).timed_out();
                    if timed_out && state.error.is_none() && !done(&**state) {
                        return Err(Error::Timeout(what));
                    }
                }
                None => self.shared.init_cond.wait(state),
            }
        }
    }

    fn fail(state: &mut State, error: Error) -> Error {
        warn!(%error, "connection failed");
        state.phase = Phase::Failed;
        error
    }

    /**
        Tears the engine down.

        Every blocked producer, consumer and read servicer is released, the
        ingestion thread is joined, the graph is stopped and all streams are
        freed. Calling it again does nothing.
    */
    pub fn disconnect(&mut self) {
        let shared = &self.shared;
        let started = {
            let mut state = shared.state.lock();
            if state.read.is_closed() {
                return;
            }
            debug!(phase = ?state.phase, "disconnecting");

            for stream in &mut state.streams {
                stream.flushing = true;
                stream.signals.event_empty.notify_all();
                stream.signals.event.notify_all();
            }
            let started = state.read.is_connected();
            state.read.tear_down();
            started
        };
        shared.request_cond.notify_all();
        shared.done_cond.notify_all();

        if started {
            ingest::deactivate(shared);
            shared.graph.stop();

            let pads: Vec<PadId> = {
                let state = shared.state.lock();
                state.streams.iter().filter_map(|stream| stream.upstream).collect()
            };
            for pad in pads {
                shared.graph.unlink(pad);
            }
        }

        let mut state = shared.state.lock();
        state.streams.clear();
        state.expected_streams = 0;
        state.pull_mode = false;
        state.phase = Phase::Disconnected;
        drop(state);

        shared.init_cond.notify_all();
        info!("disconnected");
    }

    /**
        Starts a flush: every blocked [`Stream::get_event`] returns `None`
        and stays non-blocking until [`Engine::end_flush`].
    */
    pub fn begin_flush(&self) {
        let mut state = self.shared.state.lock();
        state.flushing = true;
        state.read.begin_flush();
        for stream in &state.streams {
            stream.signals.event.notify_all();
            stream.signals.event_empty.notify_all();
        }
        drop(state);

        self.shared.request_cond.notify_all();
        debug!("flush started");
    }

    pub fn end_flush(&self) {
        let mut state = self.shared.state.lock();
        state.flushing = false;
        // Ingestion may be parked on an EOS acknowledgement until now.
        for stream in &state.streams {
            stream.signals.event_empty.notify_all();
        }
        drop(state);
        debug!("flush stopped");
    }

    /**
        Lifts the graph's queue limits so random access does not starve
        streams whose data sits further away in the file.
    */
    pub fn set_unlimited_buffering(&self) {
        self.shared.graph.set_queue_limits(QueueLimits::unlimited());
    }

    pub fn stream_count(&self) -> usize {
        self.shared.state.lock().streams.len()
    }

    pub fn stream(&self, index: usize) -> Option<Stream<'_>> {
        (index < self.stream_count()).then(|| Stream::new(self, index))
    }

    pub fn is_seekable(&self) -> bool {
        self.shared.state.lock().seekable
    }

    pub fn has_error(&self) -> bool {
        self.shared.state.lock().error.is_some()
    }

    pub fn error_message(&self) -> Option<String> {
        self.shared.state.lock().error.as_ref().map(ToString::to_string)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.disconnect();
    }
}
