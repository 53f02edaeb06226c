/*!
    Ingestion thread for push-mode graphs.

    When the graph does not pull its input itself, this thread reads the
    source sequentially through the read channel and pushes the bytes into
    the graph in chunks. Short reads are accumulated until a full chunk is
    available, so the graph never sees a fragment in the middle of the
    stream.
*/

use std::sync::Arc;
use std::thread;

use tracing::{debug, error, trace};

use media_types::{Error, FlowError, ReadResult};

use crate::callbacks;
use crate::engine::Shared;
use crate::graph::{ByteSegment, SourceEvent};
use crate::read::{self, PullMode};

const CHUNK_ALIGN: usize = 4096;

/**
    Starts the ingestion thread unless it is already running.
*/
pub(crate) fn activate(shared: &Arc<Shared>) -> bool {
    let mut handle = shared.ingest.lock();
    if handle.is_some() {
        return true;
    }

    shared.state.lock().push_active = true;
    let worker = Arc::clone(shared);
    let spawned = thread::Builder::new()
        .name("media-ingest".into())
        .spawn(move || run(&worker));

    match spawned {
        Ok(join) => {
            debug!("ingestion started");
            *handle = Some(join);
            true
        }
        Err(e) => {
            error!(error = %e, "failed to spawn ingestion thread");
            shared.state.lock().push_active = false;
            false
        }
    }
}

/**
    Stops the ingestion thread and waits for it to exit.

    The in-flight read, if any, is failed so the thread cannot stay blocked
    on the byte source.
*/
pub(crate) fn deactivate(shared: &Shared) {
    let Some(join) = shared.ingest.lock().take() else {
        return;
    };

    {
        let mut state = shared.state.lock();
        state.push_active = false;
        if state.read.abort() {
            debug!("failed in-flight read for ingestion shutdown");
        }
        for stream in &state.streams {
            stream.signals.event_empty.notify_all();
        }
    }
    shared.done_cond.notify_all();
    shared.request_cond.notify_all();

    // The graph may deactivate its source from a callback running on this
    // very thread.
    if join.thread().id() == thread::current().id() {
        return;
    }
    if join.join().is_err() {
        error!("ingestion thread panicked");
    }
    debug!("ingestion stopped");
}

enum AfterEos {
    /// No stream is waiting for data; stop ingesting.
    Stop,
    /// The engine is flushing; continue without a new segment.
    Resume,
    /// Start a new byte segment and continue.
    Rearm,
}

fn run(shared: &Shared) {
    debug!("ingestion running");
    let graph = &shared.graph;

    graph.push_event(SourceEvent::StreamStart);
    let input_format = shared.state.lock().input_format;
    if let Some(format) = input_format {
        graph.push_event(SourceEvent::Caps(format));
    }
    graph.push_event(SourceEvent::Segment(ByteSegment::default()));

    let mut target = shared.config.chunk_size;
    let mut pending: Vec<u8> = Vec::new();
    let mut eos_sent = false;

    loop {
        let (seekable, next, remaining) = {
            let state = shared.state.lock();
            let limit = state.offsets.limit();
            let next = state.offsets.next;
            (state.seekable, next, limit.saturating_sub(next))
        };

        if seekable && remaining == 0 {
            flush_pending(shared, &mut pending);
            break;
        }

        let mut want = target.saturating_sub(pending.len()).max(1);
        if seekable {
            want = usize::try_from(remaining).map_or(want, |remaining| want.min(remaining));
        }

        let pulled = read::pull(shared, Some(next), want, PullMode::Partial);

        match pulled.result {
            ReadResult::Flushing if !seekable => {
                debug!(dropped = pending.len(), "source flushed; restarting from offset 0");
                pending.clear();
                callbacks::perform_source_seek(shared, 0, true);
                continue;
            }
            ReadResult::Eos if !seekable => {
                if !flush_pending(shared, &mut pending) {
                    break;
                }
                graph.push_event(SourceEvent::Eos);

                match wait_for_eos_acks(shared) {
                    AfterEos::Stop => {
                        eos_sent = true;
                        break;
                    }
                    AfterEos::Resume => continue,
                    AfterEos::Rearm => {
                        graph.push_event(SourceEvent::Segment(ByteSegment::default()));
                        continue;
                    }
                }
            }
            ReadResult::Success => {}
            result => {
                let mut state = shared.state.lock();
                if state.read.is_connected() && state.push_active && result == ReadResult::Failure {
                    error!(offset = next, "failed to read source data");
                    state.error.get_or_insert_with(|| {
                        Error::Transport("failed to read source data".into())
                    });
                    drop(state);
                    shared.init_cond.notify_all();
                } else {
                    debug!(?result, offset = next, "ingestion read ended");
                }
                break;
            }
        }

        let delivered = pulled.data.len();
        shared.state.lock().offsets.next = next.saturating_add(delivered as u64);
        pending.extend_from_slice(&pulled.data);
        trace!(offset = next, delivered, pending = pending.len(), "ingested");

        if let Some(available) = pulled.available {
            if available > delivered {
                let needed = pending.len() + (available - delivered);
                target = needed.next_multiple_of(CHUNK_ALIGN).max(target);
                trace!(target, "growing ingestion chunk");
                continue;
            }
        }

        let goal = if seekable {
            let left = usize::try_from(remaining - delivered as u64).unwrap_or(usize::MAX);
            target.min(pending.len().saturating_add(left))
        } else {
            target
        };
        if pending.len() < goal {
            continue;
        }

        match push(shared, &mut pending) {
            Ok(()) => {}
            Err(FlowError::Flushing) => {
                debug!("graph input is flushing");
            }
            Err(e) => {
                error!(error = %e, "failed to push source data");
                break;
            }
        }
    }

    if !eos_sent {
        graph.push_event(SourceEvent::Eos);
    }
    debug!("ingestion finished");
}

fn push(shared: &Shared, pending: &mut Vec<u8>) -> Result<(), FlowError> {
    let chunk = std::mem::take(pending);
    trace!(size = chunk.len(), "pushing chunk");
    shared.graph.push_buffer(chunk)
}

/**
    Pushes whatever is left of a partial chunk before the input ends.

    Returns false if the graph rejected the data with anything other than
    a flush.
*/
fn flush_pending(shared: &Shared, pending: &mut Vec<u8>) -> bool {
    if pending.is_empty() {
        return true;
    }
    match push(shared, pending) {
        Ok(()) => true,
        Err(FlowError::Flushing) => {
            debug!("graph input is flushing; tail dropped");
            true
        }
        Err(e) => {
            error!(error = %e, "failed to push source data");
            false
        }
    }
}

/**
    Waits until every claimed and enabled stream has either consumed the
    EOS that was just pushed or started flushing.

    No acknowledgement can arrive while the engine is flushing, so a flush
    parks the wait until it ends and ingestion then resumes without a new
    segment.
*/
fn wait_for_eos_acks(shared: &Shared) -> AfterEos {
    let mut state = shared.state.lock();
    state.input_ended = true;
    shared.init_cond.notify_all();

    let waiting: Vec<usize> = state
        .streams
        .iter()
        .enumerate()
        .filter(|(_, stream)| stream.claimed && stream.enabled)
        .map(|(index, _)| index)
        .collect();
    if waiting.is_empty() {
        debug!("source ended with no stream to feed");
        return AfterEos::Stop;
    }

    for &index in &waiting {
        loop {
            if !state.push_active {
                return AfterEos::Stop;
            }
            let Some(stream) = state.streams.get(index) else {
                break;
            };
            let signals = Arc::clone(&stream.signals);
            if state.flushing {
                signals.event_empty.wait(&mut state);
                if !state.flushing {
                    debug!("flush ended during end of input; resuming");
                    for &index in &waiting {
                        if let Some(stream) = state.streams.get_mut(index) {
                            stream.eos = false;
                        }
                    }
                    return AfterEos::Resume;
                }
                continue;
            }
            if stream.flushing || stream.eos {
                break;
            }
            signals.event_empty.wait(&mut state);
        }
        if let Some(stream) = state.streams.get_mut(index) {
            stream.eos = false;
        }
    }

    if state.flushing {
        AfterEos::Resume
    } else {
        debug!("source ended; waiting for more data");
        AfterEos::Rearm
    }
}
