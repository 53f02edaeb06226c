/*!
    Scripted graph for tests.

    [`MockGraph`] behaves like a small demuxer: it announces one pad per
    [`MockOutput`], reports caps, and streams the output's buffers once the
    consumer enables the stream. Every call the engine makes is recorded.
*/

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use media_types::{FlowError, Format, TimeSegment};

use crate::callbacks::GraphContext;
use crate::config::QueueLimits;
use crate::graph::{
    BusMessage, Graph, GraphBuffer, GraphSetup, LinkPlan, PadId, PostProcess, QosEvent,
    ScheduleMode, SeekRequest, SinkEvent, SinkId, SourceEvent,
};

/// Pad ids handed out by the mock start here.
pub const FIRST_PAD: u64 = 100;

/// Spacing of the timestamps of streamed buffers.
pub const FRAME_INTERVAL: Duration = Duration::from_millis(40);

/**
    One output of a [`MockGraph`].
*/
#[derive(Clone, Debug, Default)]
pub struct MockOutput {
    pub caps: Format,
    pub buffers: Vec<Vec<u8>>,
    pub duration: Option<Duration>,
    pub language: Option<String>,
}

impl MockOutput {
    pub fn new(caps: Format, buffers: Vec<Vec<u8>>) -> Self {
        Self {
            caps,
            buffers,
            ..Default::default()
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_language(mut self, language: &str) -> Self {
        self.language = Some(language.to_string());
        self
    }
}

/**
    A call the engine made into the graph.
*/
#[derive(Clone, Debug, PartialEq)]
pub enum GraphCall {
    Start,
    Stop,
    PushEvent(SourceEvent),
    Reconfigure(SinkId, PostProcess),
    Unlink(PadId),
    Seek(SinkId, SeekRequest),
    Qos(SinkId, QosEvent),
    Drain,
    QueueLimits(QueueLimits),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Pull,
    Push,
}

struct Inner {
    mode: Mode,
    outputs: Vec<MockOutput>,
    static_pads: bool,
    fail_start: Option<String>,
    reject_input: Option<FlowError>,
    header_size: usize,
    calls: Mutex<Vec<GraphCall>>,
    ctx: Mutex<Option<GraphContext>>,
    links: Mutex<Vec<LinkPlan>>,
    streaming: Mutex<HashSet<SinkId>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    announced: AtomicBool,
    stopped: AtomicBool,
    received: Mutex<Vec<u8>>,
    pushed: Mutex<Vec<usize>>,
}

/**
    Scripted demux graph.

    A pull graph reads a header through the engine's read channel before it
    announces its pads. A push graph announces them when the first chunk
    arrives and forwards every chunk as a buffer to each linked sink.
*/
#[derive(Clone)]
pub struct MockGraph {
    inner: Arc<Inner>,
}

impl MockGraph {
    fn with_mode(mode: Mode, outputs: Vec<MockOutput>) -> Self {
        Self {
            inner: Arc::new(Inner {
                mode,
                outputs,
                static_pads: false,
                fail_start: None,
                reject_input: None,
                header_size: 16,
                calls: Mutex::new(Vec::new()),
                ctx: Mutex::new(None),
                links: Mutex::new(Vec::new()),
                streaming: Mutex::new(HashSet::new()),
                workers: Mutex::new(Vec::new()),
                announced: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                received: Mutex::new(Vec::new()),
                pushed: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn pull(outputs: Vec<MockOutput>) -> Self {
        Self::with_mode(Mode::Pull, outputs)
    }

    pub fn push(outputs: Vec<MockOutput>) -> Self {
        Self::with_mode(Mode::Push, outputs)
    }

    fn configure(mut self, f: impl FnOnce(&mut Inner)) -> Self {
        let inner = Arc::get_mut(&mut self.inner).expect("configure the mock before cloning it");
        f(inner);
        self
    }

    /// Announces every pad from `start`.
    pub fn static_pads(self) -> Self {
        self.configure(|inner| inner.static_pads = true)
    }

    /// Makes `start` fail with `message`.
    pub fn failing_start(self, message: &str) -> Self {
        let message = message.to_string();
        self.configure(|inner| inner.fail_start = Some(message))
    }

    /// Makes every pushed input chunk fail with `error` after it is recorded.
    pub fn rejecting_input(self, error: FlowError) -> Self {
        self.configure(|inner| inner.reject_input = Some(error))
    }

    /// Number of header bytes a pull graph reads before announcing pads.
    pub fn header_size(self, size: usize) -> Self {
        self.configure(|inner| inner.header_size = size)
    }

    pub fn calls(&self) -> Vec<GraphCall> {
        self.inner.calls.lock().clone()
    }

    /// Context received in the last `start`, until `stop`.
    pub fn context(&self) -> Option<GraphContext> {
        self.inner.ctx.lock().clone()
    }

    /// Link plans returned by the engine, in pad order.
    pub fn links(&self) -> Vec<LinkPlan> {
        self.inner.links.lock().clone()
    }

    /// Every byte pushed into the graph's input.
    pub fn received(&self) -> Vec<u8> {
        self.inner.received.lock().clone()
    }

    /// Sizes of the chunks pushed into the graph's input.
    pub fn pushed(&self) -> Vec<usize> {
        self.inner.pushed.lock().clone()
    }

    fn record(&self, call: GraphCall) {
        self.inner.calls.lock().push(call);
    }

    fn spawn(&self, name: &str, f: impl FnOnce(MockGraph) + Send + 'static) {
        let graph = self.clone();
        let worker = thread::Builder::new()
            .name(name.into())
            .spawn(move || f(graph))
            .expect("failed to spawn mock graph worker");
        self.inner.workers.lock().push(worker);
    }

    fn announce(&self, ctx: &GraphContext) {
        if self.inner.announced.swap(true, Ordering::SeqCst) {
            return;
        }

        for (i, output) in self.inner.outputs.iter().enumerate() {
            let pad = PadId(FIRST_PAD + i as u64);
            let Some(plan) = ctx.on_pad_added(pad, &output.caps) else {
                return;
            };
            let sink = plan.sink;
            self.inner.links.lock().push(plan);

            ctx.on_sink_event(sink, SinkEvent::Caps(output.caps));
            if output.language.is_some() {
                ctx.on_sink_event(
                    sink,
                    SinkEvent::Tags {
                        language: output.language.clone(),
                    },
                );
            }
        }
        ctx.on_no_more_pads();
    }

    fn sinks(&self) -> Vec<SinkId> {
        self.inner.links.lock().iter().map(|plan| plan.sink).collect()
    }

    fn output_for(&self, pad: PadId) -> Option<&MockOutput> {
        let index = pad.0.checked_sub(FIRST_PAD)?;
        self.inner.outputs.get(usize::try_from(index).ok()?)
    }

    fn stream_output(&self, ctx: GraphContext, sink: SinkId, output: MockOutput) {
        ctx.on_sink_event(sink, SinkEvent::Segment(TimeSegment::default()));

        for (i, data) in output.buffers.into_iter().enumerate() {
            if self.inner.stopped.load(Ordering::SeqCst) {
                return;
            }
            let buffer = GraphBuffer {
                pts: Some(FRAME_INTERVAL * i as u32),
                duration: Some(FRAME_INTERVAL),
                discontinuity: i == 0,
                delta: i > 0,
                ..GraphBuffer::new(data)
            };
            if ctx.on_sink_buffer(sink, buffer).is_err() {
                return;
            }
        }
        ctx.on_sink_event(sink, SinkEvent::Eos);
    }
}

impl Graph for MockGraph {
    fn start(&self, ctx: GraphContext, setup: &GraphSetup) -> Result<(), String> {
        self.record(GraphCall::Start);
        if let Some(message) = &self.inner.fail_start {
            return Err(message.clone());
        }

        self.inner.stopped.store(false, Ordering::SeqCst);
        *self.inner.ctx.lock() = Some(ctx.clone());

        if self.inner.static_pads || !setup.kind.has_dynamic_pads() {
            self.announce(&ctx);
        }

        if self.inner.mode == Mode::Pull && setup.seekable {
            if !ctx.activate(ScheduleMode::Pull, true) {
                return Err("failed to activate pull mode".into());
            }
            let header = self.inner.header_size;
            self.spawn("mock-discovery", move |graph| {
                match ctx.pull_range(Some(0), header) {
                    Ok(_) => graph.announce(&ctx),
                    Err(e) if !graph.inner.stopped.load(Ordering::SeqCst) => {
                        ctx.on_bus_message(BusMessage::Error {
                            source: "mock-demux".into(),
                            message: format!("failed to read header: {e}"),
                            debug: None,
                        });
                    }
                    Err(_) => {}
                }
            });
        }
        Ok(())
    }

    fn stop(&self) {
        self.record(GraphCall::Stop);
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.ctx.lock().take();

        let workers: Vec<_> = self.inner.workers.lock().drain(..).collect();
        for worker in workers {
            let _ = worker.join();
        }
    }

    fn push_buffer(&self, data: Vec<u8>) -> Result<(), FlowError> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(FlowError::Flushing);
        }
        self.inner.pushed.lock().push(data.len());
        self.inner.received.lock().extend_from_slice(&data);
        if let Some(error) = self.inner.reject_input {
            return Err(error);
        }

        let Some(ctx) = self.context() else {
            return Err(FlowError::Flushing);
        };
        self.announce(&ctx);

        for sink in self.sinks() {
            ctx.on_sink_buffer(sink, GraphBuffer::new(data.clone()))?;
        }
        Ok(())
    }

    fn push_event(&self, event: SourceEvent) -> bool {
        self.record(GraphCall::PushEvent(event.clone()));

        let forwarded = match event {
            SourceEvent::Eos => SinkEvent::Eos,
            SourceEvent::FlushStart => SinkEvent::FlushStart,
            SourceEvent::FlushStop { reset_time } => SinkEvent::FlushStop { reset_time },
            _ => return true,
        };
        if let Some(ctx) = self.context() {
            for sink in self.sinks() {
                ctx.on_sink_event(sink, forwarded.clone());
            }
        }
        true
    }

    fn reconfigure(&self, sink: SinkId, post: &PostProcess) {
        self.record(GraphCall::Reconfigure(sink, *post));

        if self.inner.mode != Mode::Pull || !self.inner.streaming.lock().insert(sink) {
            return;
        }
        let Some(ctx) = self.context() else {
            return;
        };
        let Some(output) = self.output_for(PadId(FIRST_PAD + sink.0 as u64)).cloned() else {
            return;
        };
        self.spawn("mock-stream", move |graph| graph.stream_output(ctx, sink, output));
    }

    fn unlink(&self, pad: PadId) {
        self.record(GraphCall::Unlink(pad));
    }

    fn seek(&self, sink: SinkId, request: &SeekRequest) -> bool {
        self.record(GraphCall::Seek(sink, *request));
        true
    }

    fn qos(&self, sink: SinkId, event: &QosEvent) {
        self.record(GraphCall::Qos(sink, *event));
    }

    fn drain(&self) {
        self.record(GraphCall::Drain);
    }

    fn query_duration(&self, pad: PadId) -> Option<Duration> {
        self.output_for(pad)?.duration
    }

    fn query_language(&self, pad: PadId) -> Option<String> {
        self.output_for(pad)?.language.clone()
    }

    fn set_queue_limits(&self, limits: QueueLimits) {
        self.record(GraphCall::QueueLimits(limits));
    }
}
