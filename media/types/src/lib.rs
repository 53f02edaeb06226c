/*!
    Shared types for the media demux bridge.

    This crate defines the vocabulary that crosses the bridge boundary: format
    descriptors, the events a consumer reads from an output stream, and the
    result codes exchanged with the byte source and the demux graph. It has no
    runtime dependencies, so collaborators can depend on it without pulling in
    the engine itself.
*/

mod error;
mod event;
mod flow;
mod format;

pub use error::{Error, Result};
pub use event::{BufferInfo, SegmentEvent, StreamEvent, TimeSegment};
pub use flow::{FlowError, ReadResult};
pub use format::{Aperture, AudioFormat, AudioInfo, Format, Rational, VideoFormat, VideoInfo};
