/*!
    Entry points the graph calls from its own threads.

    The graph receives a [`GraphContext`] when it is started and reports
    everything through it: pulls from the byte source, source queries and
    events, pad discovery, per-sink events and buffers, and bus messages.
    The context holds the engine weakly; once the engine is gone every call
    fails softly.
*/

use std::ops::Range;
use std::sync::{Arc, Weak};

use tracing::{debug, error, trace, warn};

use media_types::{BufferInfo, Error, FlowError, Format, StreamEvent};

use crate::engine::Shared;
use crate::graph::{
    BusMessage, ByteSegment, GraphBuffer, LinkPlan, PadId, PostProcess, ScheduleMode, Scheduling,
    SeekFormat, SinkEvent, SinkId, SourceEvent, SourceRequest, Stage,
};
use crate::ingest;
use crate::mailbox;
use crate::read::{self, PullMode};

/**
    Handle through which a running graph calls back into its engine.
*/
#[derive(Clone)]
pub struct GraphContext {
    shared: Weak<Shared>,
}

impl std::fmt::Debug for GraphContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphContext")
            .field("alive", &(self.shared.strong_count() > 0))
            .finish()
    }
}

impl GraphContext {
    pub(crate) fn new(shared: Weak<Shared>) -> Self {
        Self { shared }
    }

    fn upgrade(&self) -> Option<Arc<Shared>> {
        self.shared.upgrade()
    }

    /* Source side */

    /**
        Reads exactly `size` bytes at `offset`, or right after the previous
        pull when `offset` is `None`.

        Fewer bytes are returned only at the end of a seekable source.
    */
    pub fn pull_range(&self, offset: Option<u64>, size: usize) -> Result<Vec<u8>, FlowError> {
        let shared = self.upgrade().ok_or(FlowError::Flushing)?;
        let pulled = read::pull(&shared, offset, size, PullMode::Exact);
        pulled.result.into_flow()?;
        Ok(pulled.data)
    }

    /**
        Activates or deactivates the engine's source in `mode`.

        Push mode runs the ingestion thread. Returns false if the mode could
        not be entered.
    */
    pub fn activate(&self, mode: ScheduleMode, active: bool) -> bool {
        let Some(shared) = self.upgrade() else {
            return false;
        };
        debug!(?mode, active, "source activation");

        shared.state.lock().pull_mode = false;
        match mode {
            ScheduleMode::Pull => {
                shared.state.lock().pull_mode = active;
                true
            }
            ScheduleMode::Push if active => ingest::activate(&shared),
            ScheduleMode::Push => {
                ingest::deactivate(&shared);
                true
            }
        }
    }

    pub fn scheduling(&self) -> Scheduling {
        let seekable = self
            .upgrade()
            .is_some_and(|shared| shared.state.lock().seekable);
        Scheduling {
            seekable,
            modes: [ScheduleMode::Push, ScheduleMode::Pull],
        }
    }

    /**
        Size of the source in bytes. Unknown for unseekable sources.
    */
    pub fn source_size(&self) -> Option<u64> {
        let shared = self.upgrade()?;
        let state = shared.state.lock();
        state.seekable.then_some(state.offsets.file_size)
    }

    /**
        Byte range the source can seek within.
    */
    pub fn seeking_range(&self) -> Option<Range<u64>> {
        self.source_size().map(|size| 0..size)
    }

    /**
        Format of the input, for graphs that cannot detect it.

        `None` means any format.
    */
    pub fn source_caps(&self) -> Option<Format> {
        self.upgrade()?.state.lock().input_format
    }

    /**
        Handles an upstream request arriving at the engine's source.
    */
    pub fn source_event(&self, request: SourceRequest) -> bool {
        let Some(shared) = self.upgrade() else {
            return false;
        };
        trace!(?request, "source event");

        match request {
            SourceRequest::Seek {
                format: SeekFormat::Bytes,
                start,
                flush,
            } => {
                perform_source_seek(&shared, start, flush);
                true
            }
            SourceRequest::Seek { format, .. } => {
                warn!(?format, "unhandled source seek format");
                false
            }
            SourceRequest::FlushStart
            | SourceRequest::FlushStop
            | SourceRequest::Qos
            | SourceRequest::Reconfigure => true,
            SourceRequest::Other(name) => {
                warn!(event = name, "ignoring source event");
                false
            }
        }
    }

    /* Discovery */

    /**
        Assigns a stream to a newly announced output pad.

        Returns how to link the pad, or `None` if the engine is gone.
    */
    pub fn on_pad_added(&self, pad: PadId, caps: &Format) -> Option<LinkPlan> {
        let shared = self.upgrade()?;
        let kind = shared.config.kind;

        let mut state = shared.state.lock();
        let index = state.claim_stream(pad);
        let stream = &state.streams[index];

        let mut stages = Vec::new();
        let mut post = PostProcess::default();
        if kind.inserts_post_processing() && caps.is_raw() {
            match caps {
                Format::Video(_) => {
                    stages = vec![
                        Stage::Deinterlace,
                        Stage::ColorConvert,
                        Stage::Flip,
                        Stage::CropBox,
                        Stage::ColorConvert,
                    ];
                    // Unseekable outputs are fixed up front, so the
                    // post-processing can be set before caps are negotiated.
                    if !state.seekable {
                        post = PostProcess::for_output(&stream.current_format, stream.aperture.as_ref());
                    }
                }
                Format::Audio(_) => stages = vec![Stage::AudioConvert],
                Format::Unknown => {}
            }
        }
        drop(state);

        shared.init_cond.notify_all();
        debug!(?pad, stream = index, ?caps, ?stages, "pad added");
        Some(LinkPlan {
            sink: SinkId(index),
            stages,
            post,
        })
    }

    pub fn on_pad_removed(&self, pad: PadId) {
        let Some(shared) = self.upgrade() else {
            return;
        };

        let index = {
            let mut state = shared.state.lock();
            let found = state
                .streams
                .iter_mut()
                .enumerate()
                .find(|(_, stream)| stream.upstream == Some(pad));
            match found {
                Some((index, stream)) => {
                    stream.upstream = None;
                    Some(index)
                }
                None => None,
            }
        };

        match index {
            Some(index) => {
                debug!(?pad, stream = index, "pad removed");
                shared.graph.unlink(pad);
            }
            None => warn!(?pad, "removed pad does not feed a stream"),
        }
    }

    pub fn on_no_more_pads(&self) {
        let Some(shared) = self.upgrade() else {
            return;
        };
        shared.state.lock().no_more_pads = true;
        shared.init_cond.notify_all();
        debug!("no more pads");
    }

    /* Sink side */

    /**
        Handles an event arriving at a stream's sink.

        Segment and EOS events are queued for the consumer when the stream
        is enabled; this blocks while the stream's mailbox is occupied.
    */
    pub fn on_sink_event(&self, sink: SinkId, event: SinkEvent) -> bool {
        let Some(shared) = self.upgrade() else {
            return false;
        };
        let index = sink.0;
        trace!(stream = index, ?event, "sink event");

        let enabled = {
            let state = shared.state.lock();
            let Some(stream) = state.streams.get(index) else {
                warn!(stream = index, "event for an unknown sink");
                return false;
            };
            stream.enabled
        };

        match event {
            SinkEvent::Segment(segment) => {
                if enabled {
                    if let Some(stream) = shared.state.lock().streams.get_mut(index) {
                        stream.segment = Some(segment);
                    }
                    let event = StreamEvent::Segment(segment.to_event());
                    return deliver(&shared, index, event);
                }
            }
            SinkEvent::Eos => {
                if enabled {
                    return deliver(&shared, index, StreamEvent::Eos);
                } else {
                    if let Some(stream) = shared.state.lock().streams.get_mut(index) {
                        stream.eos = true;
                    }
                    shared.init_cond.notify_all();
                }
            }
            SinkEvent::FlushStart => {
                if enabled {
                    let mut state = shared.state.lock();
                    if let Some(stream) = state.streams.get_mut(index) {
                        stream.flushing = true;
                        stream.mailbox.clear();
                        stream.signals.event_empty.notify_all();
                    }
                }
            }
            SinkEvent::FlushStop { reset_time } => {
                let mut state = shared.state.lock();
                if let Some(stream) = state.streams.get_mut(index) {
                    if reset_time {
                        stream.segment = None;
                    }
                    if enabled {
                        stream.flushing = false;
                    }
                }
            }
            SinkEvent::Caps(format) => {
                if let Some(stream) = shared.state.lock().streams.get_mut(index) {
                    stream.preferred_format = Some(format);
                }
                shared.init_cond.notify_all();
            }
            SinkEvent::Tags { language } => {
                if let Some(language) = language {
                    if let Some(stream) = shared.state.lock().streams.get_mut(index) {
                        stream.language = Some(language);
                    }
                }
            }
            SinkEvent::Other(name) => {
                warn!(stream = index, event = name, "ignoring sink event");
            }
        }
        true
    }

    /**
        Queues a buffer for the consumer, blocking while the stream's mailbox
        is occupied. Buffers for disabled streams are dropped.
    */
    pub fn on_sink_buffer(&self, sink: SinkId, buffer: GraphBuffer) -> Result<(), FlowError> {
        let shared = self.upgrade().ok_or(FlowError::Flushing)?;
        let index = sink.0;

        let enabled = {
            let state = shared.state.lock();
            state
                .streams
                .get(index)
                .ok_or(FlowError::NotLinked)?
                .enabled
        };
        if !enabled {
            trace!(stream = index, size = buffer.data.len(), "dropping buffer for disabled stream");
            return Ok(());
        }

        let info = BufferInfo {
            pts: buffer.pts,
            duration: buffer.duration,
            discontinuity: buffer.discontinuity,
            preroll: buffer.live,
            delta: buffer.delta,
            size: buffer.data.len(),
        };
        mailbox::queue_event(&shared, index, StreamEvent::Buffer(info), Some(buffer.data))
    }

    /**
        Formats a sink accepts: the consumer's format once enabled.

        `None` means any format.
    */
    pub fn sink_caps(&self, sink: SinkId) -> Option<Format> {
        let shared = self.upgrade()?;
        let state = shared.state.lock();
        let stream = state.streams.get(sink.0)?;
        stream.enabled.then_some(stream.current_format)
    }

    /**
        Checks a proposed format against the consumer's. Disabled streams
        accept anything; frame rates are not compared.
    */
    pub fn accept_caps(&self, sink: SinkId, caps: &Format) -> bool {
        let Some(shared) = self.upgrade() else {
            return false;
        };
        let state = shared.state.lock();
        let Some(stream) = state.streams.get(sink.0) else {
            return false;
        };
        if !stream.enabled {
            return true;
        }

        let accepted = caps.is_compatible(&stream.current_format);
        if !accepted {
            warn!(stream = sink.0, ?caps, wanted = ?stream.current_format, "rejecting caps");
        }
        accepted
    }

    /* Bus */

    pub fn on_bus_message(&self, message: BusMessage) {
        let Some(shared) = self.upgrade() else {
            return;
        };

        match message {
            BusMessage::Error {
                source,
                message,
                debug: details,
            } => {
                error!(%source, %message, ?details, "graph error");
                shared
                    .state
                    .lock()
                    .error
                    .get_or_insert_with(|| Error::Graph(format!("{source}: {message}")));
                shared.init_cond.notify_all();
            }
            BusMessage::Warning {
                source,
                message,
                debug: details,
            } => {
                warn!(%source, %message, ?details, "graph warning");
            }
            BusMessage::DurationChanged => {
                shared.state.lock().has_duration = true;
                shared.init_cond.notify_all();
            }
            BusMessage::Other(name) => trace!(message = name, "bus message"),
        }
    }
}

/// Queues a segment or EOS event; a flushing stream drops it silently.
fn deliver(shared: &Shared, index: usize, event: StreamEvent) -> bool {
    match mailbox::queue_event(shared, index, event, None) {
        Ok(()) => true,
        Err(FlowError::Flushing) => {
            debug!(stream = index, ?event, "stream flushing; event dropped");
            true
        }
        Err(e) => {
            error!(stream = index, ?event, error = %e, "failed to queue event");
            false
        }
    }
}

/**
    Repositions the source at `offset`, flushing the graph's input first
    when `flush` is set.
*/
pub(crate) fn perform_source_seek(shared: &Shared, offset: u64, flush: bool) {
    debug!(offset, flush, "source seek");

    if flush {
        shared.graph.push_event(SourceEvent::FlushStart);
    }

    let push_active = {
        let mut state = shared.state.lock();
        state.offsets.next = offset;
        state.push_active
    };

    if flush {
        shared.graph.push_event(SourceEvent::FlushStop { reset_time: true });
        if push_active {
            shared
                .graph
                .push_event(SourceEvent::Segment(ByteSegment { start: offset }));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{EngineConfig, GraphKind};
    use crate::engine::Engine;
    use crate::stream::StreamState;
    use crate::testing::{GraphCall, MockGraph};
    use media_types::{Aperture, AudioFormat, AudioInfo, Rational, VideoFormat, VideoInfo};

    fn video(format: VideoFormat, fps: u32) -> Format {
        Format::Video(VideoInfo {
            format,
            width: 320,
            height: 240,
            fps: Rational::new(fps, 1),
        })
    }

    fn pcm() -> Format {
        Format::Audio(AudioInfo {
            format: AudioFormat::S16le,
            channels: 2,
            channel_mask: 3,
            rate: 44100,
        })
    }

    fn context(kind: GraphKind) -> (Engine, GraphContext, MockGraph) {
        let graph = MockGraph::pull(Vec::new());
        let engine = Engine::new(graph.clone(), EngineConfig::new(kind));
        let ctx = GraphContext::new(Arc::downgrade(engine.shared()));
        (engine, ctx, graph)
    }

    #[test]
    fn raw_video_gets_post_processing() {
        let (_engine, ctx, _graph) = context(GraphKind::Decodebin);
        ctx.shared.upgrade().unwrap().state.lock().seekable = true;

        let plan = ctx.on_pad_added(PadId(1), &video(VideoFormat::I420, 25)).unwrap();
        assert_eq!(plan.sink, SinkId(0));
        assert_eq!(
            plan.stages,
            vec![
                Stage::Deinterlace,
                Stage::ColorConvert,
                Stage::Flip,
                Stage::CropBox,
                Stage::ColorConvert,
            ]
        );
        assert_eq!(plan.post, PostProcess::default());

        let plan = ctx.on_pad_added(PadId(2), &pcm()).unwrap();
        assert_eq!(plan.sink, SinkId(1));
        assert_eq!(plan.stages, vec![Stage::AudioConvert]);

        let plan = ctx.on_pad_added(PadId(3), &video(VideoFormat::H264, 25)).unwrap();
        assert!(plan.stages.is_empty());
    }

    #[test]
    fn wave_links_directly() {
        let (_engine, ctx, _graph) = context(GraphKind::Wave);
        let plan = ctx.on_pad_added(PadId(1), &pcm()).unwrap();
        assert!(plan.stages.is_empty());
    }

    #[test]
    fn unseekable_video_uses_declared_aperture() {
        let (engine, ctx, _graph) = context(GraphKind::Decodebin);
        {
            let mut state = engine.shared().state.lock();
            state.expected_streams = 1;
            state.streams.push(StreamState::declared(
                video(VideoFormat::Bgrx, 30),
                Some(Aperture::new(0, 0, 320, 200)),
            ));
        }

        let plan = ctx.on_pad_added(PadId(5), &video(VideoFormat::Nv12, 30)).unwrap();
        assert_eq!(plan.sink, SinkId(0));
        assert!(plan.post.vertical_flip);
        assert_eq!(plan.post.crop.map(|crop| crop.bottom), Some(-40));
    }

    #[test]
    fn accept_caps_ignores_frame_rate() {
        let (engine, ctx, _graph) = context(GraphKind::Decodebin);
        engine
            .shared()
            .state
            .lock()
            .streams
            .push(StreamState::declared(video(VideoFormat::Nv12, 30), None));

        assert!(ctx.accept_caps(SinkId(0), &video(VideoFormat::Nv12, 24)));
        assert!(!ctx.accept_caps(SinkId(0), &video(VideoFormat::I420, 30)));
        assert_eq!(ctx.sink_caps(SinkId(0)), Some(video(VideoFormat::Nv12, 30)));

        engine.shared().state.lock().streams[0].enabled = false;
        assert!(ctx.accept_caps(SinkId(0), &pcm()));
        assert_eq!(ctx.sink_caps(SinkId(0)), None);
    }

    #[test]
    fn first_bus_error_is_kept() {
        let (engine, ctx, _graph) = context(GraphKind::Decodebin);
        ctx.on_bus_message(BusMessage::Warning {
            source: "demux".into(),
            message: "odd index".into(),
            debug: Some("entry 3".into()),
        });
        assert!(!engine.has_error());

        for message in ["bad header", "later failure"] {
            ctx.on_bus_message(BusMessage::Error {
                source: "demux".into(),
                message: message.into(),
                debug: Some("offset 0".into()),
            });
        }
        assert_eq!(
            engine.shared().state.lock().error,
            Some(Error::Graph("demux: bad header".into()))
        );
        assert_eq!(
            engine.error_message().as_deref(),
            Some("graph error: demux: bad header")
        );
    }

    #[test]
    fn byte_seek_flushes_and_resets_offsets() {
        let (engine, ctx, graph) = context(GraphKind::Decodebin);
        engine.shared().state.lock().push_active = true;

        assert!(ctx.source_event(SourceRequest::Seek {
            format: SeekFormat::Bytes,
            start: 512,
            flush: true,
        }));
        assert!(!ctx.source_event(SourceRequest::Seek {
            format: SeekFormat::Time,
            start: 0,
            flush: true,
        }));
        assert!(ctx.source_event(SourceRequest::Qos));
        assert!(!ctx.source_event(SourceRequest::Other("latency")));

        {
            let state = engine.shared().state.lock();
            assert_eq!(state.offsets.next, 512);
        }
        assert_eq!(
            graph.calls(),
            vec![
                GraphCall::PushEvent(SourceEvent::FlushStart),
                GraphCall::PushEvent(SourceEvent::FlushStop { reset_time: true }),
                GraphCall::PushEvent(SourceEvent::Segment(ByteSegment { start: 512 })),
            ]
        );
    }

    #[test]
    fn source_queries_follow_seekability() {
        let (engine, ctx, _graph) = context(GraphKind::Decodebin);
        assert_eq!(ctx.source_size(), None);
        assert_eq!(ctx.seeking_range(), None);
        assert!(!ctx.scheduling().seekable);

        {
            let mut state = engine.shared().state.lock();
            state.seekable = true;
            state.offsets.file_size = 4000;
        }
        assert_eq!(ctx.source_size(), Some(4000));
        assert_eq!(ctx.seeking_range(), Some(0..4000));
        assert!(ctx.scheduling().seekable);
    }

    #[test]
    fn sink_events_update_stream_state() {
        let (engine, ctx, _graph) = context(GraphKind::Decodebin);
        ctx.on_pad_added(PadId(1), &pcm());

        assert!(ctx.on_sink_event(SinkId(0), SinkEvent::Caps(pcm())));
        assert!(ctx.on_sink_event(
            SinkId(0),
            SinkEvent::Tags {
                language: Some("eng".into())
            }
        ));
        // Disabled streams record EOS instead of queueing it.
        assert!(ctx.on_sink_event(SinkId(0), SinkEvent::Eos));
        assert!(!ctx.on_sink_event(SinkId(4), SinkEvent::Eos));

        let state = engine.shared().state.lock();
        let stream = &state.streams[0];
        assert_eq!(stream.preferred_format, Some(pcm()));
        assert_eq!(stream.language.as_deref(), Some("eng"));
        assert!(stream.eos);
        assert!(stream.mailbox.is_empty());
    }

    #[test]
    fn disabled_stream_drops_buffers() {
        let (engine, ctx, _graph) = context(GraphKind::Decodebin);
        ctx.on_pad_added(PadId(1), &pcm());

        let buffer = GraphBuffer {
            pts: Some(Duration::from_millis(40)),
            ..GraphBuffer::new(vec![1, 2, 3])
        };
        assert_eq!(ctx.on_sink_buffer(SinkId(0), buffer), Ok(()));
        assert!(engine.shared().state.lock().streams[0].mailbox.is_empty());
        assert_eq!(
            ctx.on_sink_buffer(SinkId(3), GraphBuffer::new(vec![0])),
            Err(FlowError::NotLinked)
        );
    }

    #[test]
    fn pad_removal_unlinks() {
        let (engine, ctx, graph) = context(GraphKind::Decodebin);
        ctx.on_pad_added(PadId(9), &pcm());
        ctx.on_pad_removed(PadId(9));
        ctx.on_pad_removed(PadId(10));

        assert_eq!(engine.shared().state.lock().streams[0].upstream, None);
        assert_eq!(graph.calls(), vec![GraphCall::Unlink(PadId(9))]);
    }

    #[test]
    fn dead_engine_fails_softly() {
        let (engine, ctx, _graph) = context(GraphKind::Decodebin);
        drop(engine);
        assert_eq!(ctx.pull_range(Some(0), 4), Err(FlowError::Flushing));
        assert!(ctx.on_pad_added(PadId(1), &pcm()).is_none());
        assert!(!ctx.activate(ScheduleMode::Pull, true));
        assert_eq!(ctx.source_caps(), None);
    }
}
