#![allow(dead_code)]

use std::thread;
use std::time::{Duration, Instant};

use media_bridge::testing::{MockGraph, MockOutput};
use media_bridge::{
    AudioFormat, AudioInfo, ByteSource, Engine, EngineConfig, Format, Rational, ReadResult,
    ReadService, ReadWait, ReadRequest, VideoFormat, VideoInfo,
};

pub fn video(format: VideoFormat) -> Format {
    Format::Video(VideoInfo {
        format,
        width: 320,
        height: 240,
        fps: Rational::new(25, 1),
    })
}

pub fn pcm() -> Format {
    Format::Audio(AudioInfo {
        format: AudioFormat::S16le,
        channels: 2,
        channel_mask: 3,
        rate: 48000,
    })
}

pub fn input_format() -> Format {
    video(VideoFormat::H264)
}

/**
    An unseekable engine whose graph announced one pad per format up front.

    Nothing feeds the graph: its ingestion thread sits on a read request
    until the test answers it, and sink traffic is driven through the
    graph's context.
*/
pub fn passive_engine(formats: &[Format]) -> (Engine, MockGraph) {
    let outputs = formats
        .iter()
        .map(|format| MockOutput::new(*format, Vec::new()))
        .collect();
    let graph = MockGraph::push(outputs).static_pads();
    let engine = Engine::new(graph.clone(), EngineConfig::default());
    engine
        .connect_unseekable(input_format(), formats.len(), formats, None)
        .unwrap();
    (engine, graph)
}

pub fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

pub fn take_request(reader: &ReadService) -> ReadRequest {
    match reader.next_request() {
        ReadWait::Request(request) => request,
        other => panic!("expected a read request, got {other:?}"),
    }
}

/**
    In-memory source that is read sequentially. Reads are capped at
    `max_read` bytes; reading past the end reports EOS.
*/
pub struct MemorySource {
    pub data: Vec<u8>,
    pub max_read: usize,
}

impl MemorySource {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            max_read: usize::MAX,
        }
    }

    pub fn with_max_read(mut self, max_read: usize) -> Self {
        self.max_read = max_read;
        self
    }
}

impl ByteSource for MemorySource {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> (ReadResult, usize) {
        let Ok(offset) = usize::try_from(offset) else {
            return (ReadResult::Eos, 0);
        };
        if offset >= self.data.len() {
            return (ReadResult::Eos, 0);
        }
        let len = buf.len().min(self.max_read).min(self.data.len() - offset);
        buf[..len].copy_from_slice(&self.data[offset..offset + len]);
        (ReadResult::Success, len)
    }

    fn size(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }
}

/// Source whose every read fails.
pub struct BrokenSource;

impl ByteSource for BrokenSource {
    fn read(&mut self, _offset: u64, _buf: &mut [u8]) -> (ReadResult, usize) {
        (ReadResult::Failure, 0)
    }
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
