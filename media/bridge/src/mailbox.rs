/*!
    Per-stream single-slot mailbox.

    Graph threads queue one event at a time into a stream; the consumer takes
    it out. Segment and EOS events leave the slot as soon as they are read.
    A buffer stays in the slot until the consumer releases it, so a producer
    can never overwrite bytes the consumer is still copying.
*/

use parking_lot::Condvar;
use tracing::{debug, trace, warn};

use media_types::{Error, FlowError, Result, StreamEvent};

use crate::engine::Shared;
use crate::read::DrainState;

/**
    Condition variables of one stream, waited on with the engine lock.
*/
#[derive(Debug, Default)]
pub(crate) struct StreamSignals {
    /// An event was queued, or a wait on the stream must recheck its state.
    pub(crate) event: Condvar,
    /// The slot was emptied, or the stream started flushing.
    pub(crate) event_empty: Condvar,
}

#[derive(Debug, Default)]
pub(crate) struct Mailbox {
    event: Option<StreamEvent>,
    buffer: Option<Vec<u8>>,
}

impl Mailbox {
    pub(crate) fn is_empty(&self) -> bool {
        self.event.is_none()
    }

    fn put(&mut self, event: StreamEvent, buffer: Option<Vec<u8>>) {
        debug_assert!(self.is_empty());
        self.event = Some(event);
        self.buffer = buffer;
    }

    /**
        Reads the held event. Segment and EOS events are removed; a buffer
        stays until [`Mailbox::release`].
    */
    fn read(&mut self) -> Option<StreamEvent> {
        let event = self.event?;
        if !event.is_buffer() {
            self.event = None;
        }
        Some(event)
    }

    fn buffer(&self) -> Option<&[u8]> {
        match self.event {
            Some(StreamEvent::Buffer(_)) => self.buffer.as_deref(),
            _ => None,
        }
    }

    fn release(&mut self) -> Option<Vec<u8>> {
        if !self.event.is_some_and(|event| event.is_buffer()) {
            return None;
        }
        self.event = None;
        self.buffer.take()
    }

    /// Drops whatever the slot holds.
    pub(crate) fn clear(&mut self) {
        self.event = None;
        self.buffer = None;
    }
}

/**
    Queues an event, blocking while the slot is occupied.

    Fails with [`FlowError::Flushing`] if the stream is or starts flushing;
    the event and its bytes are dropped in that case.
*/
pub(crate) fn queue_event(
    shared: &Shared,
    index: usize,
    event: StreamEvent,
    buffer: Option<Vec<u8>>,
) -> std::result::Result<(), FlowError> {
    let mut state = shared.state.lock();
    let Some(signals) = state.streams.get(index).map(|stream| stream.signals.clone()) else {
        return Err(FlowError::NotLinked);
    };

    loop {
        let Some(stream) = state.streams.get_mut(index) else {
            return Err(FlowError::NotLinked);
        };
        if stream.flushing {
            debug!(stream = index, "stream is flushing; discarding event");
            return Err(FlowError::Flushing);
        }
        if stream.mailbox.is_empty() {
            stream.mailbox.put(event, buffer);
            break;
        }
        signals.event_empty.wait(&mut state);
    }
    drop(state);

    signals.event.notify_all();
    trace!(stream = index, ?event, "event queued");
    Ok(())
}

/**
    Takes the next event, blocking while the slot is empty.

    Returns `None` as soon as the engine is flushing.
*/
pub(crate) fn get_event(shared: &Shared, index: usize) -> Option<StreamEvent> {
    let mut state = shared.state.lock();
    let signals = state.streams.get(index)?.signals.clone();

    loop {
        if state.flushing {
            trace!(stream = index, "engine is flushing");
            return None;
        }
        let stream = state.streams.get_mut(index)?;
        if let Some(event) = stream.mailbox.read() {
            // Remembered so a later drain on this stream returns at once.
            if event.is_eos() {
                stream.eos = true;
            }
            if !event.is_buffer() {
                signals.event_empty.notify_all();
            }
            return Some(event);
        }
        signals.event.wait(&mut state);
    }
}

/**
    Copies `dst.len()` bytes starting at `offset` out of the held buffer.
*/
pub(crate) fn copy_bytes(shared: &Shared, index: usize, offset: usize, dst: &mut [u8]) -> Result<()> {
    let state = shared.state.lock();
    let data = state
        .streams
        .get(index)
        .and_then(|stream| stream.mailbox.buffer())
        .ok_or(Error::NoBuffer)?;

    let range = offset
        .checked_add(dst.len())
        .filter(|&end| end <= data.len())
        .map(|end| offset..end)
        .ok_or(Error::OutOfRange {
            offset,
            len: dst.len(),
            size: data.len(),
        })?;

    dst.copy_from_slice(&data[range]);
    Ok(())
}

/**
    Releases the held buffer, freeing the slot for the producer.
*/
pub(crate) fn release_buffer(shared: &Shared, index: usize) {
    let mut state = shared.state.lock();
    let Some(stream) = state.streams.get_mut(index) else {
        return;
    };

    match stream.mailbox.release() {
        Some(bytes) => {
            trace!(stream = index, size = bytes.len(), "buffer released");
            stream.signals.event_empty.notify_all();
        }
        None => warn!(stream = index, "release without a held buffer"),
    }
}

/**
    Waits until the graph has drained into this stream.

    Returns true if the drain completed and the slot is still empty.
    Draining a disabled stream or one that already delivered EOS returns
    true at once.
*/
pub(crate) fn drain(shared: &Shared, index: usize) -> bool {
    let mut state = shared.state.lock();
    let Some(stream) = state.streams.get(index) else {
        return true;
    };
    if !stream.enabled || stream.eos {
        return true;
    }
    let signals = stream.signals.clone();

    if state.drain == DrainState::Idle {
        state.drain = DrainState::Requested;
    }
    shared.done_cond.notify_all();

    loop {
        let Some(stream) = state.streams.get(index) else {
            return true;
        };
        if state.flushing || state.drain == DrainState::Idle || !stream.mailbox.is_empty() {
            break;
        }
        signals.event.wait(&mut state);
    }

    let drained = state
        .streams
        .get(index)
        .is_none_or(|stream| stream.mailbox.is_empty());
    if state.drain == DrainState::Requested {
        state.drain = DrainState::Idle;
    }
    drained
}

#[cfg(test)]
mod tests {
    use super::*;
    use media_types::{BufferInfo, SegmentEvent};
    use std::time::Duration;

    fn buffer_event(size: usize) -> StreamEvent {
        StreamEvent::Buffer(BufferInfo {
            size,
            ..Default::default()
        })
    }

    #[test]
    fn segment_clears_on_read() {
        let mut mailbox = Mailbox::default();
        let segment = StreamEvent::Segment(SegmentEvent {
            position: Duration::ZERO,
            stop: None,
            rate: 1.0,
        });
        mailbox.put(segment, None);

        assert_eq!(mailbox.read(), Some(segment));
        assert!(mailbox.is_empty());
        assert_eq!(mailbox.read(), None);
    }

    #[test]
    fn buffer_stays_until_released() {
        let mut mailbox = Mailbox::default();
        mailbox.put(buffer_event(3), Some(vec![1, 2, 3]));

        assert_eq!(mailbox.read(), Some(buffer_event(3)));
        assert!(!mailbox.is_empty());
        assert_eq!(mailbox.buffer(), Some(&[1, 2, 3][..]));

        assert_eq!(mailbox.release(), Some(vec![1, 2, 3]));
        assert!(mailbox.is_empty());
        assert_eq!(mailbox.buffer(), None);
    }

    #[test]
    fn release_ignores_non_buffer_events() {
        let mut mailbox = Mailbox::default();
        mailbox.put(StreamEvent::Eos, None);
        assert_eq!(mailbox.release(), None);
        assert!(!mailbox.is_empty());
    }

    #[test]
    fn clear_drops_held_buffer() {
        let mut mailbox = Mailbox::default();
        mailbox.put(buffer_event(1), Some(vec![0]));
        mailbox.clear();
        assert!(mailbox.is_empty());
        assert_eq!(mailbox.buffer(), None);
    }
}
