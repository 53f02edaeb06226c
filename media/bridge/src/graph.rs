/*!
    Interface to the demux graph.

    The graph is an opaque actor with its own worker threads. The engine
    drives it through [`Graph`], and the graph reports back exclusively
    through the [`GraphContext`](crate::GraphContext) it receives in
    [`Graph::start`]. No mutable state is shared between the two.
*/

use std::time::Duration;

use media_types::{Aperture, FlowError, Format, TimeSegment, VideoInfo};

use crate::config::{GraphKind, QueueLimits};
use crate::GraphContext;

/**
    Identifier of an output pad inside the graph.
*/
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PadId(pub u64);

/**
    Identifier of an engine-side sink, one per output stream.

    The value is the index of the stream it feeds.
*/
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SinkId(pub usize);

/**
    How the graph consumes the engine's byte source.
*/
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScheduleMode {
    /// Graph threads pull ranges on demand.
    Pull,
    /// The engine's ingestion thread pushes sequential chunks.
    Push,
}

/**
    Answer to a scheduling query on the engine's source.
*/
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Scheduling {
    /// Random access is possible; otherwise only sequential reads are.
    pub seekable: bool,
    /// Modes the source can be activated in.
    pub modes: [ScheduleMode; 2],
}

/**
    What the engine knows when it starts the graph.
*/
#[derive(Clone, Debug, PartialEq)]
pub struct GraphSetup {
    pub kind: GraphKind,
    /// Random-access source of known size.
    pub seekable: bool,
    /// Input format for graphs that cannot detect it themselves.
    pub input_format: Option<Format>,
    /// Initial queue limits.
    pub queue_limits: QueueLimits,
}

/**
    A normalization stage inserted between a graph output and an engine sink.
*/
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Deinterlace,
    ColorConvert,
    Flip,
    CropBox,
    AudioConvert,
}

/**
    Crop offsets applied by [`Stage::CropBox`].

    Negative values remove pixels from the corresponding edge.
*/
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct CropBox {
    pub left: i64,
    pub top: i64,
    pub right: i64,
    pub bottom: i64,
}

impl CropBox {
    /**
        Computes the crop that maps a frame of the given shape onto the aperture.

        Returns `None` when the aperture covers the whole frame.
    */
    pub fn from_aperture(aperture: &Aperture, video: &VideoInfo) -> Option<Self> {
        if aperture.is_full_frame(video.width, video.height) {
            return None;
        }

        let edge = |bound: u32, extent: u32| {
            if bound == 0 {
                0
            } else {
                i64::from(bound) - i64::from(extent)
            }
        };

        Some(Self {
            left: -i64::from(aperture.left),
            top: -i64::from(aperture.top),
            right: edge(aperture.right, video.width),
            bottom: edge(aperture.bottom, video.height),
        })
    }
}

/**
    Settings of the post-processing stages of one stream.
*/
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PostProcess {
    pub vertical_flip: bool,
    pub crop: Option<CropBox>,
}

impl PostProcess {
    /**
        Derives the settings for a stream negotiated to `format`.
    */
    pub fn for_output(format: &Format, aperture: Option<&Aperture>) -> Self {
        let Format::Video(video) = format else {
            return Self::default();
        };
        Self {
            vertical_flip: format.needs_vertical_flip(),
            crop: aperture.and_then(|aperture| CropBox::from_aperture(aperture, video)),
        }
    }
}

/**
    How a newly announced pad is to be linked to its sink.
*/
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkPlan {
    pub sink: SinkId,
    /// Stages to insert between the pad and the sink, in order. Empty means
    /// a direct link.
    pub stages: Vec<Stage>,
    pub post: PostProcess,
}

/**
    Byte-stream segment pushed in front of ingested data.
*/
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ByteSegment {
    pub start: u64,
}

/**
    Events the engine pushes into the graph's input.
*/
#[derive(Clone, Debug, PartialEq)]
pub enum SourceEvent {
    StreamStart,
    Caps(Format),
    Segment(ByteSegment),
    FlushStart,
    FlushStop { reset_time: bool },
    Eos,
}

/**
    Format of a seek requested on the engine's source.
*/
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeekFormat {
    Bytes,
    Time,
}

/**
    Upstream requests the graph sends to the engine's source.
*/
#[derive(Clone, Debug, PartialEq)]
pub enum SourceRequest {
    Seek {
        format: SeekFormat,
        start: u64,
        flush: bool,
    },
    FlushStart,
    FlushStop,
    Qos,
    Reconfigure,
    Other(&'static str),
}

/**
    Events arriving at an engine sink from the graph.
*/
#[derive(Clone, Debug, PartialEq)]
pub enum SinkEvent {
    /// New time segment. Segments in other formats are not forwarded.
    Segment(TimeSegment),
    Eos,
    FlushStart,
    FlushStop { reset_time: bool },
    Caps(Format),
    /// Stream tags; only the language is used.
    Tags { language: Option<String> },
    Other(&'static str),
}

/**
    A decoded or demuxed buffer arriving at an engine sink.
*/
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GraphBuffer {
    pub data: Vec<u8>,
    pub pts: Option<Duration>,
    pub duration: Option<Duration>,
    pub discontinuity: bool,
    pub live: bool,
    pub delta: bool,
}

impl GraphBuffer {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            ..Default::default()
        }
    }
}

/**
    Seek flags passed through to the graph.
*/
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SeekFlags {
    /// Snap to the nearest key frame.
    pub key_unit: bool,
    /// Emit a segment-done message instead of EOS.
    pub segment: bool,
    /// Flush the graph before seeking.
    pub flush: bool,
}

/**
    Time seek issued on one output stream.
*/
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SeekRequest {
    pub rate: f64,
    /// New start position; `None` leaves it unchanged.
    pub start: Option<Duration>,
    /// New stop position; `None` leaves it unchanged.
    pub stop: Option<Duration>,
    pub flags: SeekFlags,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QosKind {
    Underflow,
    Overflow,
}

/**
    Quality-of-service feedback sent upstream from a sink.
*/
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QosEvent {
    pub kind: QosKind,
    pub proportion: f64,
    /// Lateness in nanoseconds; negative when early.
    pub diff: i64,
    /// Running time of the buffer the feedback refers to.
    pub timestamp: Duration,
}

/**
    Messages posted on the graph's bus.
*/
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BusMessage {
    Error {
        source: String,
        message: String,
        debug: Option<String>,
    },
    Warning {
        source: String,
        message: String,
        debug: Option<String>,
    },
    DurationChanged,
    Other(&'static str),
}

/**
    Control surface of a demux graph.

    Every method is called without any engine lock held, so implementations
    may call back into the context synchronously.
*/
pub trait Graph: Send + Sync {
    /**
        Builds the topology and brings it to the paused state.

        Static output pads must be announced through the context before this
        returns. A graph that wants to pull its input activates the source in
        pull mode from here; otherwise the engine activates push mode once
        this returns.
    */
    fn start(&self, ctx: GraphContext, setup: &GraphSetup) -> Result<(), String>;

    /**
        Stops all graph threads and drops the context.
    */
    fn stop(&self);

    /**
        Pushes ingested bytes into the graph's input.
    */
    fn push_buffer(&self, data: Vec<u8>) -> Result<(), FlowError>;

    /**
        Pushes an event into the graph's input. Returns false if it was refused.
    */
    fn push_event(&self, event: SourceEvent) -> bool;

    /// Applies new post-processing settings and renegotiates the sink's format.
    fn reconfigure(&self, sink: SinkId, post: &PostProcess);

    /// Unlinks an output pad from its sink.
    fn unlink(&self, pad: PadId);

    /// Sends a time seek upstream from a sink.
    fn seek(&self, sink: SinkId, request: &SeekRequest) -> bool;

    /// Sends quality-of-service feedback upstream from a sink.
    fn qos(&self, sink: SinkId, event: &QosEvent);

    /// Blocks until data queued in the graph has been pushed to the sinks.
    fn drain(&self);

    fn query_duration(&self, pad: PadId) -> Option<Duration>;

    fn query_language(&self, pad: PadId) -> Option<String>;

    fn set_queue_limits(&self, limits: QueueLimits);
}
