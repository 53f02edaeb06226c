/*!
    Host side of the read channel.

    A [`ReadService`] takes the requests the graph posts and answers them
    from a [`ByteSource`]. The engine never touches the source itself.
*/

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, trace, warn};

use media_types::ReadResult;

use crate::engine::Shared;
use crate::read::{self, ReadRequest, ReadWait};

/**
    A byte source the host reads on the engine's behalf.
*/
pub trait ByteSource: Send {
    /**
        Reads up to `buf.len()` bytes at `offset`.

        Returns the result and the number of bytes written to `buf`. A
        successful short read is allowed; the engine asks again for the rest.
    */
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> (ReadResult, usize);

    /// Total size, if known.
    fn size(&self) -> Option<u64> {
        None
    }
}

/**
    [`ByteSource`] over anything that implements [`Read`] and [`Seek`].
*/
#[derive(Debug)]
pub struct SeekableReader<R> {
    inner: R,
    size: u64,
}

impl<R: Read + Seek> SeekableReader<R> {
    pub fn new(mut inner: R) -> io::Result<Self> {
        let size = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;
        Ok(Self { inner, size })
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read + Seek + Send> ByteSource for SeekableReader<R> {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> (ReadResult, usize) {
        if offset >= self.size {
            return (ReadResult::Eos, 0);
        }
        if let Err(e) = self.inner.seek(SeekFrom::Start(offset)) {
            warn!(offset, error = %e, "seek failed");
            return (ReadResult::Failure, 0);
        }

        loop {
            match self.inner.read(buf) {
                Ok(0) => return (ReadResult::Eos, 0),
                Ok(n) => return (ReadResult::Success, n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(offset, error = %e, "read failed");
                    return (ReadResult::Failure, 0);
                }
            }
        }
    }

    fn size(&self) -> Option<u64> {
        Some(self.size)
    }
}

/**
    Answers the engine's read requests.

    At most one request is outstanding at any time. Any number of services
    may wait for it; exactly one takes each request.
*/
#[derive(Clone)]
pub struct ReadService {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ReadService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadService").finish_non_exhaustive()
    }
}

impl ReadService {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /**
        Blocks until the engine posts a read request.

        Returns [`ReadWait::Flushing`] once per flush so the caller can
        notice it, and [`ReadWait::TornDown`] after disconnect.
    */
    pub fn next_request(&self) -> ReadWait {
        read::await_request(&self.shared)
    }

    /**
        Completes the request returned by the last
        [`next_request`](Self::next_request).

        `data` is what the source delivered; a successful completion may be
        short, or longer than requested to hint that more data is ready.
    */
    pub fn complete(&self, result: ReadResult, data: &[u8]) {
        read::complete_request(&self.shared, result, data);
    }

    /**
        Waits for one request and answers it from `source`.

        Returns false once the engine is torn down.
    */
    pub fn serve_one<S: ByteSource + ?Sized>(&self, source: &mut S, buf: &mut Vec<u8>) -> bool {
        let ReadRequest { offset, size } = match self.next_request() {
            ReadWait::Request(request) => request,
            ReadWait::Flushing => return true,
            ReadWait::TornDown => return false,
        };

        buf.resize(size, 0);
        let (result, len) = source.read(offset, buf);
        let len = len.min(size);
        trace!(offset, size, len, ?result, "serving read");
        self.complete(result, &buf[..len]);
        true
    }

    /**
        Answers requests from `source` until the engine is torn down.
    */
    pub fn serve<S: ByteSource + ?Sized>(&self, source: &mut S) {
        let mut buf = Vec::new();
        while self.serve_one(source, &mut buf) {}
        debug!("read channel closed");
    }

    /**
        Serves `source` from a dedicated thread. The thread exits on
        disconnect and hands the source back.
    */
    pub fn spawn<S: ByteSource + 'static>(self, mut source: S) -> io::Result<JoinHandle<S>> {
        thread::Builder::new()
            .name("media-read".into())
            .spawn(move || {
                self.serve(&mut source);
                source
            })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn seekable_reader_reads_at_offset() {
        let mut reader = SeekableReader::new(Cursor::new((0..100u8).collect::<Vec<_>>())).unwrap();
        assert_eq!(ByteSource::size(&reader), Some(100));

        let mut buf = [0; 4];
        assert_eq!(reader.read(10, &mut buf), (ReadResult::Success, 4));
        assert_eq!(buf, [10, 11, 12, 13]);

        let mut buf = [0; 8];
        assert_eq!(reader.read(96, &mut buf), (ReadResult::Success, 4));
        assert_eq!(&buf[..4], &[96, 97, 98, 99]);
    }

    #[test]
    fn seekable_reader_reports_eos_past_end() {
        let mut reader = SeekableReader::new(Cursor::new(vec![1, 2, 3])).unwrap();
        let mut buf = [0; 4];
        assert_eq!(reader.read(3, &mut buf), (ReadResult::Eos, 0));
        assert_eq!(reader.read(50, &mut buf), (ReadResult::Eos, 0));
        assert_eq!(reader.into_inner().into_inner(), vec![1, 2, 3]);
    }
}
