/*!
    Bridge between a pull-based byte source and an opaque demux graph.

    The graph runs its own worker threads. They pull input bytes through a
    single-request read channel that the host answers from its byte source,
    or, for sources that can only be read sequentially, an ingestion thread
    pulls and pushes the bytes on their behalf. Demuxed output arrives on
    per-stream single-slot mailboxes that the consumer drains event by event.

    ```ignore
    let engine = Engine::new(graph, EngineConfig::default());
    let reader = engine.reader().spawn(SeekableReader::new(file)?)?;
    engine.connect(size)?;

    let video = engine.stream(0).unwrap();
    video.enable(format, None);
    while let Some(event) = video.get_event() {
        // ...
    }
    ```
*/

mod callbacks;
mod config;
mod engine;
mod graph;
mod ingest;
mod mailbox;
mod read;
mod source;
mod stream;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use callbacks::GraphContext;
pub use config::{DEFAULT_CHUNK_SIZE, EngineConfig, GraphKind, QueueLimits};
pub use engine::{Engine, Phase};
pub use graph::{
    BusMessage, ByteSegment, CropBox, Graph, GraphBuffer, GraphSetup, LinkPlan, PadId,
    PostProcess, QosEvent, QosKind, ScheduleMode, Scheduling, SeekFlags, SeekFormat, SeekRequest,
    SinkEvent, SinkId, SourceEvent, SourceRequest, Stage,
};
pub use read::{ReadRequest, ReadWait};
pub use source::{ByteSource, ReadService, SeekableReader};
pub use stream::Stream;

pub use media_types::{
    Aperture, AudioFormat, AudioInfo, BufferInfo, Error, FlowError, Format, Rational, ReadResult,
    Result, SegmentEvent, StreamEvent, TimeSegment, VideoFormat, VideoInfo,
};
