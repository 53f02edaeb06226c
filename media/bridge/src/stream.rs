/*!
    Output streams.
*/

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use media_types::{Aperture, Format, Result, StreamEvent, TimeSegment};

use crate::engine::Engine;
use crate::graph::{PadId, PostProcess, QosEvent, QosKind, SeekFlags, SeekRequest, SinkId};
use crate::mailbox::{self, Mailbox, StreamSignals};

/**
    Engine-side state of one output stream, guarded by the engine lock.
*/
#[derive(Debug, Default)]
pub(crate) struct StreamState {
    pub(crate) mailbox: Mailbox,
    pub(crate) signals: Arc<StreamSignals>,
    /// Format announced by the graph; `None` until caps arrive.
    pub(crate) preferred_format: Option<Format>,
    /// Format the consumer asked for.
    pub(crate) current_format: Format,
    pub(crate) aperture: Option<Aperture>,
    pub(crate) enabled: bool,
    pub(crate) eos: bool,
    pub(crate) flushing: bool,
    /// Timing segment of the last segment event; `None` after a flush that
    /// reset time.
    pub(crate) segment: Option<TimeSegment>,
    pub(crate) duration: Option<Duration>,
    pub(crate) language: Option<String>,
    /// Graph pad feeding this stream, while linked.
    pub(crate) upstream: Option<PadId>,
    /// Taken by a graph pad; pre-declared streams start unclaimed.
    pub(crate) claimed: bool,
}

impl StreamState {
    /**
        A stream created for a pad the graph just announced.
    */
    pub(crate) fn discovered() -> Self {
        Self {
            claimed: true,
            ..Default::default()
        }
    }

    /**
        A stream declared ahead of discovery with a fixed output format.
    */
    pub(crate) fn declared(format: Format, aperture: Option<Aperture>) -> Self {
        Self {
            current_format: format,
            aperture,
            enabled: true,
            ..Default::default()
        }
    }
}

/**
    Handle to one output stream of an [`Engine`].

    Handles borrow the engine, so they cannot outlive it or survive a
    disconnect.
*/
#[derive(Clone, Copy)]
pub struct Stream<'a> {
    engine: &'a Engine,
    index: usize,
}

impl<'a> Stream<'a> {
    pub(crate) fn new(engine: &'a Engine, index: usize) -> Self {
        Self { engine, index }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    fn sink(&self) -> SinkId {
        SinkId(self.index)
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut StreamState) -> T) -> Option<T> {
        let mut state = self.engine.shared().state.lock();
        state.streams.get_mut(self.index).map(f)
    }

    /**
        Returns the format the graph negotiated, once it is known.
    */
    pub fn preferred_format(&self) -> Option<Format> {
        self.with_state(|stream| stream.preferred_format).flatten()
    }

    /**
        Returns the format the stream was enabled with.
    */
    pub fn current_format(&self) -> Format {
        self.with_state(|stream| stream.current_format)
            .unwrap_or_default()
    }

    /**
        Returns the largest buffer the stream delivers in its current format,
        if that format is raw.
    */
    pub fn max_buffer_size(&self) -> Option<usize> {
        self.current_format().max_buffer_size()
    }

    pub fn is_enabled(&self) -> bool {
        self.with_state(|stream| stream.enabled).unwrap_or(false)
    }

    /**
        Selects the stream for output in `format`, optionally cropped to
        `aperture`.

        Only seekable engines renegotiate; on an unseekable engine the
        formats are fixed at connection time and this does nothing.
    */
    pub fn enable(&self, format: Format, aperture: Option<Aperture>) {
        let shared = self.engine.shared();
        {
            let mut state = shared.state.lock();
            if !state.seekable {
                debug!(stream = self.index, "ignoring enable on an unseekable engine");
                return;
            }
            let Some(stream) = state.streams.get_mut(self.index) else {
                return;
            };
            stream.current_format = format;
            stream.enabled = true;
            if aperture.is_some() {
                stream.aperture = aperture;
            }
        }

        let post = PostProcess::for_output(&format, aperture.as_ref());
        debug!(stream = self.index, ?format, ?post, "stream enabled");
        shared.graph.reconfigure(self.sink(), &post);
    }

    /**
        Deselects the stream. Buffers arriving for it are discarded.
    */
    pub fn disable(&self) {
        self.with_state(|stream| stream.enabled = false);
        debug!(stream = self.index, "stream disabled");
    }

    /**
        Blocks until the next event arrives.

        Returns `None` when the engine is flushing.
    */
    pub fn get_event(&self) -> Option<StreamEvent> {
        mailbox::get_event(self.engine.shared(), self.index)
    }

    /**
        Copies bytes out of the buffer returned by the last
        [`get_event`](Self::get_event).
    */
    pub fn copy_bytes(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        mailbox::copy_bytes(self.engine.shared(), self.index, offset, dst)
    }

    /**
        Releases the held buffer so the next event can be queued.
    */
    pub fn release_buffer(&self) {
        mailbox::release_buffer(self.engine.shared(), self.index)
    }

    /**
        Seeks the graph through this stream.

        Returns false on unseekable engines or if the graph refused the seek.
    */
    pub fn seek(
        &self,
        rate: f64,
        start: Option<Duration>,
        stop: Option<Duration>,
        flags: SeekFlags,
    ) -> bool {
        let shared = self.engine.shared();
        if !shared.state.lock().seekable {
            return false;
        }

        let request = SeekRequest {
            rate,
            start,
            stop,
            flags,
        };
        debug!(stream = self.index, ?request, "seeking");
        shared.graph.seek(self.sink(), &request)
    }

    /**
        Blocks until data already inside the graph has reached this stream.

        Returns true if the drain completed without producing an event.
    */
    pub fn drain(&self) -> bool {
        mailbox::drain(self.engine.shared(), self.index)
    }

    /**
        Forwards playback timing feedback to the graph.

        `timestamp` is in stream time; feedback for timestamps outside the
        current segment is dropped.
    */
    pub fn notify_qos(&self, underflow: bool, proportion: f64, diff: i64, timestamp: Duration) {
        let running_time = self
            .with_state(|stream| stream.segment)
            .flatten()
            .and_then(|segment| segment.to_running_time(timestamp));
        let Some(running_time) = running_time else {
            trace!(stream = self.index, ?timestamp, "ignoring QoS without a running time");
            return;
        };

        let event = QosEvent {
            kind: if underflow {
                QosKind::Underflow
            } else {
                QosKind::Overflow
            },
            proportion,
            diff,
            timestamp: running_time,
        };
        self.engine.shared().graph.qos(self.sink(), &event);
    }

    pub fn duration(&self) -> Option<Duration> {
        self.with_state(|stream| stream.duration).flatten()
    }

    pub fn language(&self) -> Option<String> {
        self.with_state(|stream| stream.language.clone()).flatten()
    }
}
