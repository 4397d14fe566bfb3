//! Single-pass fan-out of a byte stream to named sinks
//!
//! [`FanOutReader`] wraps any [`AsyncRead`] and hands every chunk it reads
//! to each attached sink, in attachment order, before returning the chunk to
//! its own caller. The backend uploader reads from the wrapper; digest
//! accumulators and the staging writer observe the identical byte sequence
//! along the way, so the payload is never buffered whole.
//!
//! Sinks are polled like any other async writer. A sink that is waiting on
//! disk returns `Pending` and the reader suspends with it; the caller's
//! buffer is only filled once every sink has taken the whole chunk.

use crate::core::digest::{DigestSet, HashAlgorithm, Hasher};
use crate::error::{Result, StowageError};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tracing::debug;

/// Largest chunk pulled from the source per read
const MAX_CHUNK: usize = 64 * 1024;

/// Consumer of fanned-out chunks
///
/// Implementations must never block the calling thread: slow work is
/// driven from `poll_write_chunk` and reported as `Pending`.
pub trait ChunkSink: Send {
    /// Accept a prefix of `chunk`, returning how many bytes were taken
    fn poll_write_chunk(&mut self, cx: &mut Context<'_>, chunk: &[u8]) -> Poll<io::Result<usize>>;

    /// Called once the source reports end of stream, polled until ready
    fn poll_finish(&mut self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// A sink attached to a [`FanOutReader`]
pub enum Sink {
    /// Digest accumulator; finalizes to a hex digest on exhaustion
    Digest(DigestSink),
    /// Arbitrary byte consumer, e.g. a staging writer
    Writer(Box<dyn ChunkSink>),
}

impl Sink {
    pub fn digest(algorithm: HashAlgorithm) -> Self {
        Sink::Digest(DigestSink::new(algorithm))
    }

    pub fn writer(sink: impl ChunkSink + 'static) -> Self {
        Sink::Writer(Box::new(sink))
    }

    fn poll_write_chunk(&mut self, cx: &mut Context<'_>, chunk: &[u8]) -> Poll<io::Result<usize>> {
        match self {
            Sink::Digest(d) => d.poll_write_chunk(cx, chunk),
            Sink::Writer(w) => w.poll_write_chunk(cx, chunk),
        }
    }

    fn poll_finish(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self {
            Sink::Digest(d) => d.poll_finish(cx),
            Sink::Writer(w) => w.poll_finish(cx),
        }
    }
}

/// Streaming digest accumulator
pub struct DigestSink {
    algorithm: HashAlgorithm,
    hasher: Option<Hasher>,
    hex: Option<String>,
}

impl DigestSink {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        DigestSink {
            algorithm,
            hasher: Some(algorithm.hasher()),
            hex: None,
        }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Finalized hex digest, `None` until the stream is exhausted
    pub fn hexdigest(&self) -> Option<&str> {
        self.hex.as_deref()
    }
}

impl ChunkSink for DigestSink {
    fn poll_write_chunk(&mut self, _cx: &mut Context<'_>, chunk: &[u8]) -> Poll<io::Result<usize>> {
        match self.hasher.as_mut() {
            Some(hasher) => {
                hasher.update(chunk);
                Poll::Ready(Ok(chunk.len()))
            }
            None => Poll::Ready(Err(io::Error::other(format!(
                "{} digest already finalized",
                self.algorithm
            )))),
        }
    }

    fn poll_finish(&mut self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Some(hasher) = self.hasher.take() {
            self.hex = Some(hasher.finalize_hex());
        }
        Poll::Ready(Ok(()))
    }
}

struct NamedSink {
    name: String,
    sink: Sink,
}

/// Stream wrapper that replicates each chunk to every attached sink
pub struct FanOutReader<R> {
    inner: R,
    sinks: Vec<NamedSink>,
    started: bool,
    exhausted: bool,
    failed: bool,
    bytes_read: u64,
    // Chunk in flight: fanned out to `sinks[..cursor]` (plus `offset` bytes
    // of `sinks[cursor]`), then handed to the caller from `delivered` on
    chunk: Vec<u8>,
    cursor: usize,
    offset: usize,
    fanned: bool,
    delivered: usize,
    finishing: bool,
}

impl<R> FanOutReader<R> {
    pub fn new(inner: R) -> Self {
        FanOutReader {
            inner,
            sinks: Vec::new(),
            started: false,
            exhausted: false,
            failed: false,
            bytes_read: 0,
            chunk: Vec::new(),
            cursor: 0,
            offset: 0,
            fanned: false,
            delivered: 0,
            finishing: false,
        }
    }

    /// Register a sink under a unique name
    ///
    /// # Errors
    ///
    /// Returns `Configuration` once reading has begun, on a duplicate name,
    /// or when a digest sink repeats an algorithm already attached.
    pub fn attach(&mut self, name: impl Into<String>, sink: Sink) -> Result<()> {
        let name = name.into();
        if self.started {
            return Err(StowageError::Configuration(format!(
                "cannot attach sink '{}' after streaming has started",
                name
            )));
        }
        if self.sinks.iter().any(|s| s.name == name) {
            return Err(StowageError::Configuration(format!(
                "sink '{}' is already attached",
                name
            )));
        }
        if let Sink::Digest(d) = &sink {
            let duplicate = self.sinks.iter().any(
                |s| matches!(&s.sink, Sink::Digest(existing) if existing.algorithm() == d.algorithm()),
            );
            if duplicate {
                return Err(StowageError::Configuration(format!(
                    "a {} digest sink is already attached",
                    d.algorithm()
                )));
            }
        }
        debug!(sink = %name, position = self.sinks.len(), "attached fan-out sink");
        self.sinks.push(NamedSink { name, sink });
        Ok(())
    }

    /// Attach a digest accumulator named after its algorithm
    pub fn attach_digest(&mut self, algorithm: HashAlgorithm) -> Result<()> {
        self.attach(algorithm.name(), Sink::digest(algorithm))
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Names of attached sinks in attachment order
    pub fn sink_names(&self) -> impl Iterator<Item = &str> {
        self.sinks.iter().map(|s| s.name.as_str())
    }

    /// Finalized digest of the named digest sink
    pub fn digest(&self, name: &str) -> Result<&str> {
        let named = self
            .sinks
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| StowageError::Configuration(format!("no sink named '{}'", name)))?;
        let Sink::Digest(d) = &named.sink else {
            return Err(StowageError::Configuration(format!(
                "sink '{}' is not a digest sink",
                name
            )));
        };
        self.ensure_exhausted()?;
        d.hexdigest().ok_or_else(|| {
            StowageError::NotReady(format!("digest '{}' has not been finalized", name))
        })
    }

    /// All finalized digests, keyed by algorithm
    pub fn digests(&self) -> Result<DigestSet> {
        self.ensure_exhausted()?;
        let mut set = DigestSet::new();
        for named in &self.sinks {
            if let Sink::Digest(d) = &named.sink {
                let hex = d.hexdigest().ok_or_else(|| {
                    StowageError::NotReady(format!("digest '{}' has not been finalized", named.name))
                })?;
                set.insert(d.algorithm(), hex.to_string());
            }
        }
        Ok(set)
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn ensure_exhausted(&self) -> Result<()> {
        if self.exhausted {
            Ok(())
        } else {
            Err(StowageError::NotReady(format!(
                "stream not exhausted ({} bytes read so far)",
                self.bytes_read
            )))
        }
    }

    /// Drive the in-flight chunk through every sink still owed it
    fn poll_fan_out(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.cursor < self.sinks.len() {
            let named = &mut self.sinks[self.cursor];
            while self.offset < self.chunk.len() {
                let n = ready!(named.sink.poll_write_chunk(cx, &self.chunk[self.offset..]))?;
                if n == 0 {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("sink '{}' accepted no bytes", named.name),
                    )));
                }
                self.offset += n;
            }
            self.cursor += 1;
            self.offset = 0;
        }
        self.fanned = true;
        self.bytes_read += self.chunk.len() as u64;
        Poll::Ready(Ok(()))
    }

    fn poll_finish_sinks(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.cursor < self.sinks.len() {
            ready!(self.sinks[self.cursor].sink.poll_finish(cx))?;
            self.cursor += 1;
        }
        self.exhausted = true;
        debug!(bytes = self.bytes_read, sinks = self.sinks.len(), "fan-out stream exhausted");
        Poll::Ready(Ok(()))
    }

    fn fail(&mut self, e: io::Error) -> Poll<io::Result<()>> {
        self.failed = true;
        self.chunk.clear();
        Poll::Ready(Err(e))
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for FanOutReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.failed {
            return Poll::Ready(Err(io::Error::other(
                "fan-out stream stopped after an earlier error",
            )));
        }
        if this.exhausted {
            return Poll::Ready(Ok(()));
        }

        loop {
            if this.fanned {
                let end = this.chunk.len().min(this.delivered + buf.remaining());
                buf.put_slice(&this.chunk[this.delivered..end]);
                this.delivered = end;
                if this.delivered == this.chunk.len() {
                    this.chunk.clear();
                    this.cursor = 0;
                    this.offset = 0;
                    this.fanned = false;
                    this.delivered = 0;
                }
                return Poll::Ready(Ok(()));
            }

            if !this.chunk.is_empty() {
                match this.poll_fan_out(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Err(e)) => return this.fail(e),
                    Poll::Ready(Ok(())) => continue,
                }
            }

            if this.finishing {
                return match this.poll_finish_sinks(cx) {
                    Poll::Pending => Poll::Pending,
                    Poll::Ready(Err(e)) => this.fail(e),
                    Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
                };
            }

            // Only a zero-length read into a non-empty buffer means end of stream
            let want = buf.remaining().min(MAX_CHUNK);
            if want == 0 {
                return Poll::Ready(Ok(()));
            }
            this.started = true;
            this.chunk.resize(want, 0);
            let mut scratch = ReadBuf::new(&mut this.chunk[..]);
            match Pin::new(&mut this.inner).poll_read(cx, &mut scratch) {
                Poll::Pending => {
                    this.chunk.clear();
                    return Poll::Pending;
                }
                Poll::Ready(Err(e)) => return this.fail(e),
                Poll::Ready(Ok(())) => {
                    let n = scratch.filled().len();
                    this.chunk.truncate(n);
                    this.cursor = 0;
                    this.offset = 0;
                    if n == 0 {
                        this.finishing = true;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::digest::digest_hex;
    use parking_lot::Mutex;
    use std::future::Future;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tokio::io::AsyncReadExt;

    /// Records every chunk it sees
    #[derive(Clone, Default)]
    struct Capture {
        chunks: Arc<Mutex<Vec<Vec<u8>>>>,
        finished: Arc<Mutex<u32>>,
    }

    impl ChunkSink for Capture {
        fn poll_write_chunk(&mut self, _cx: &mut Context<'_>, chunk: &[u8]) -> Poll<io::Result<usize>> {
            self.chunks.lock().push(chunk.to_vec());
            Poll::Ready(Ok(chunk.len()))
        }

        fn poll_finish(&mut self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            *self.finished.lock() += 1;
            Poll::Ready(Ok(()))
        }
    }

    /// Yields once before every call, then takes at most two bytes
    #[derive(Default)]
    struct Trickle {
        seen: Arc<Mutex<Vec<u8>>>,
        finished: Arc<Mutex<u32>>,
        yielded: bool,
    }

    impl Trickle {
        fn yield_once(&mut self, cx: &mut Context<'_>) -> bool {
            self.yielded = !self.yielded;
            if self.yielded {
                cx.waker().wake_by_ref();
            }
            self.yielded
        }
    }

    impl ChunkSink for Trickle {
        fn poll_write_chunk(&mut self, cx: &mut Context<'_>, chunk: &[u8]) -> Poll<io::Result<usize>> {
            if self.yield_once(cx) {
                return Poll::Pending;
            }
            let n = chunk.len().min(2);
            self.seen.lock().extend_from_slice(&chunk[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_finish(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            if self.yield_once(cx) {
                return Poll::Pending;
            }
            *self.finished.lock() += 1;
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_fan_out_hashes_and_copies() {
        let source = tokio_test::io::Builder::new()
            .read(b"hel")
            .read(b"lo")
            .build();
        let capture = Capture::default();

        let mut reader = FanOutReader::new(source);
        for algorithm in HashAlgorithm::ALL {
            reader.attach_digest(algorithm).unwrap();
        }
        reader.attach("file", Sink::writer(capture.clone())).unwrap();

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();

        assert_eq!(out, b"hello");
        assert!(reader.is_exhausted());
        assert_eq!(reader.bytes_read(), 5);
        assert_eq!(capture.chunks.lock().concat(), b"hello");
        assert_eq!(*capture.finished.lock(), 1);

        let digests = reader.digests().unwrap();
        assert_eq!(digests.len(), 3);
        for algorithm in HashAlgorithm::ALL {
            assert_eq!(
                digests.get(algorithm).unwrap(),
                digest_hex(algorithm, b"hello")
            );
        }
        assert_eq!(
            reader.digest("sha256").unwrap(),
            digest_hex(HashAlgorithm::Sha256, b"hello")
        );
    }

    #[tokio::test]
    async fn test_sinks_run_in_attachment_order() {
        #[derive(Clone)]
        struct Tagged(&'static str, Arc<Mutex<Vec<&'static str>>>);
        impl ChunkSink for Tagged {
            fn poll_write_chunk(&mut self, _cx: &mut Context<'_>, chunk: &[u8]) -> Poll<io::Result<usize>> {
                self.1.lock().push(self.0);
                Poll::Ready(Ok(chunk.len()))
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reader = FanOutReader::new(&b"x"[..]);
        reader.attach("first", Sink::writer(Tagged("first", log.clone()))).unwrap();
        reader.attach("second", Sink::writer(Tagged("second", log.clone()))).unwrap();

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(*log.lock(), vec!["first", "second"]);
        assert_eq!(reader.sink_names().collect::<Vec<_>>(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_attach_after_start_fails() {
        let mut reader = FanOutReader::new(&b"abc"[..]);
        reader.attach_digest(HashAlgorithm::Sha256).unwrap();

        let mut one = [0u8; 1];
        reader.read_exact(&mut one).await.unwrap();

        let err = reader.attach_digest(HashAlgorithm::Md5).unwrap_err();
        assert!(matches!(err, StowageError::Configuration(_)));
    }

    #[test]
    fn test_duplicate_sinks_rejected() {
        let mut reader = FanOutReader::new(&b""[..]);
        reader.attach_digest(HashAlgorithm::Sha1).unwrap();
        assert!(reader.attach_digest(HashAlgorithm::Sha1).is_err());
        assert!(reader.attach("other", Sink::digest(HashAlgorithm::Sha1)).is_err());
        assert!(reader.attach("sha1", Sink::writer(Capture::default())).is_err());
    }

    #[tokio::test]
    async fn test_digest_before_exhaustion_not_ready() {
        let mut reader = FanOutReader::new(&b"abcdef"[..]);
        reader.attach_digest(HashAlgorithm::Sha256).unwrap();

        assert!(matches!(reader.digest("sha256"), Err(StowageError::NotReady(_))));

        let mut partial = [0u8; 3];
        reader.read_exact(&mut partial).await.unwrap();
        assert!(matches!(reader.digests(), Err(StowageError::NotReady(_))));

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert!(reader.digests().is_ok());
    }

    #[tokio::test]
    async fn test_empty_stream_finalizes() {
        let mut reader = FanOutReader::new(&b""[..]);
        reader.attach_digest(HashAlgorithm::Sha256).unwrap();

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();

        assert_eq!(reader.bytes_read(), 0);
        assert_eq!(
            reader.digest("sha256").unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn test_read_error_propagates_and_stops() {
        let source = tokio_test::io::Builder::new()
            .read(b"partial")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "client went away"))
            .build();
        let capture = Capture::default();

        let mut reader = FanOutReader::new(source);
        reader.attach_digest(HashAlgorithm::Sha256).unwrap();
        reader.attach("file", Sink::writer(capture.clone())).unwrap();

        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);

        // Sink state is left as-is, nothing finalized
        assert_eq!(capture.chunks.lock().concat(), b"partial");
        assert_eq!(*capture.finished.lock(), 0);
        assert!(!reader.is_exhausted());
        assert!(matches!(reader.digests(), Err(StowageError::NotReady(_))));

        let mut more = [0u8; 4];
        assert!(reader.read(&mut more).await.is_err());
    }

    #[tokio::test]
    async fn test_sink_error_aborts_read() {
        struct Broken;
        impl ChunkSink for Broken {
            fn poll_write_chunk(&mut self, _cx: &mut Context<'_>, _chunk: &[u8]) -> Poll<io::Result<usize>> {
                Poll::Ready(Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only staging")))
            }
        }

        let mut reader = FanOutReader::new(&b"payload"[..]);
        reader.attach_digest(HashAlgorithm::Sha256).unwrap();
        reader.attach("file", Sink::writer(Broken)).unwrap();

        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);

        // The rejected chunk never reaches the caller
        assert!(out.is_empty());
        assert_eq!(reader.bytes_read(), 0);
        assert!(matches!(reader.digests(), Err(StowageError::NotReady(_))));

        let mut sink = Vec::new();
        assert!(tokio::io::copy(&mut reader, &mut sink).await.is_err());
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_sink_accepting_nothing_is_an_error() {
        struct Stuck;
        impl ChunkSink for Stuck {
            fn poll_write_chunk(&mut self, _cx: &mut Context<'_>, _chunk: &[u8]) -> Poll<io::Result<usize>> {
                Poll::Ready(Ok(0))
            }
        }

        let mut reader = FanOutReader::new(&b"abc"[..]);
        reader.attach("file", Sink::writer(Stuck)).unwrap();

        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_pending_sink_receives_every_byte() {
        let source = tokio_test::io::Builder::new()
            .read(b"fan ")
            .read(b"out")
            .read(b" slowly")
            .build();
        let trickle = Trickle::default();
        let (seen, finished) = (trickle.seen.clone(), trickle.finished.clone());

        let mut reader = FanOutReader::new(source);
        reader.attach("slow", Sink::writer(trickle)).unwrap();
        reader.attach_digest(HashAlgorithm::Md5).unwrap();

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();

        assert_eq!(out, b"fan out slowly");
        assert_eq!(*seen.lock(), b"fan out slowly");
        assert_eq!(*finished.lock(), 1);
        assert_eq!(reader.bytes_read(), 14);
        assert_eq!(
            reader.digest("md5").unwrap(),
            digest_hex(HashAlgorithm::Md5, b"fan out slowly")
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_waiting_sink_does_not_stall_executor() {
        /// Takes `delay` per chunk without holding the thread
        struct Sleepy {
            delay: Duration,
            sleep: Option<Pin<Box<tokio::time::Sleep>>>,
        }

        impl ChunkSink for Sleepy {
            fn poll_write_chunk(&mut self, cx: &mut Context<'_>, chunk: &[u8]) -> Poll<io::Result<usize>> {
                let delay = self.delay;
                let sleep = self
                    .sleep
                    .get_or_insert_with(|| Box::pin(tokio::time::sleep(delay)));
                ready!(sleep.as_mut().poll(cx));
                self.sleep = None;
                Poll::Ready(Ok(chunk.len()))
            }
        }

        let mut reader = FanOutReader::new(&b"one chunk"[..]);
        reader
            .attach(
                "file",
                Sink::writer(Sleepy {
                    delay: Duration::from_millis(300),
                    sleep: None,
                }),
            )
            .unwrap();

        let started = Instant::now();
        let read = async {
            let mut out = Vec::new();
            reader.read_to_end(&mut out).await.map(|_| out)
        };
        let tick = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            started.elapsed()
        };
        let (out, ticked) = tokio::join!(read, tick);

        assert_eq!(out.unwrap(), b"one chunk");
        assert!(ticked < Duration::from_millis(200), "timer fired after {:?}", ticked);
    }
}
