//! Streaming buffer adapters.
//!
//! Four backing stores share one non-blocking transfer contract:
//!
//! - [`Accumulator`]: bytes flow *in* from a socket into growable memory,
//!   bounded by a hard cap.
//! - [`Block`]: a fixed, pre-existing byte range flows *out*.
//! - [`RingBuffer`]: fixed circular region, bytes flow in and out.
//! - [`FileSource`]: a byte range of an open file flows *out*, through
//!   `sendfile(2)` when the sink supports it.
//!
//! [`StreamSource`] couples a [`RingBuffer`] with an arbitrary reader to
//! serve streamed bodies.
//!
//! Input sides are driven with `fill(source)`, output sides with
//! `pump(sink)`. Neither ever blocks: each call moves as many bytes as the
//! peer accepts right now (possibly zero) and reports them in a
//! [`Progress`]. The caller re-invokes when readiness comes back.
//!
//! Readiness is observable through `is_readable` (output side has bytes or
//! a terminal condition to deliver) and `is_writable` (input side has room).

use bytes::{Bytes, BytesMut};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::fs::FileExt;

/// Minimum free space made available to a single read.
const MIN_READ_ROOM: usize = 4096;

/// Largest chunk staged in memory when a file cannot be sent zero-copy.
const FILE_CHUNK_SIZE: usize = 64 * 1024;

/// Upper bound for a single `sendfile` call.
const MAX_SENDFILE_CHUNK: usize = 0x7fff_f000;

/// Outcome of one non-blocking transfer call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    /// Bytes moved by this call.
    pub bytes: usize,
    /// The stream has nothing more to deliver (output side) or the source
    /// reported end of input (input side).
    pub eof: bool,
}

impl Progress {
    fn moved(bytes: usize) -> Self {
        Self { bytes, eof: false }
    }

    fn eof(bytes: usize) -> Self {
        Self { bytes, eof: true }
    }
}

/// Destination for output streams.
///
/// Sockets implement this; so does `Vec<u8>` for in-memory collection.
pub trait Sink {
    /// Write as much of `buf` as possible without blocking.
    fn write_bytes(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Zero-copy transfer of `len` bytes of `file` starting at `offset`.
    ///
    /// Returns `None` when the sink has no kernel-level path, in which case
    /// callers fall back to staging the bytes in memory.
    fn send_file(&mut self, _file: &File, _offset: u64, _len: usize) -> Option<io::Result<usize>> {
        None
    }
}

impl Sink for Vec<u8> {
    fn write_bytes(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.extend_from_slice(buf);
        Ok(buf.len())
    }
}

impl Sink for mio::net::TcpStream {
    fn write_bytes(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write(buf)
    }

    #[cfg(target_os = "linux")]
    fn send_file(&mut self, file: &File, offset: u64, len: usize) -> Option<io::Result<usize>> {
        use std::os::unix::io::AsRawFd;

        let mut off = offset as libc::off_t;
        let count = len.min(MAX_SENDFILE_CHUNK);
        // SAFETY: both descriptors are open for the duration of the call and
        // `off` is a valid, exclusively borrowed offset.
        let n = unsafe { libc::sendfile(self.as_raw_fd(), file.as_raw_fd(), &mut off, count) };
        if n < 0 {
            Some(Err(io::Error::last_os_error()))
        } else {
            Some(Ok(n as usize))
        }
    }
}

/// Write into a sink, mapping would-block to `None`.
fn write_to<K: Sink + ?Sized>(sink: &mut K, buf: &[u8]) -> io::Result<Option<usize>> {
    loop {
        match sink.write_bytes(buf) {
            Ok(0) if !buf.is_empty() => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
            }
            Ok(n) => return Ok(Some(n)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Read from a source, mapping would-block to `None` and EOF to `Some(0)`.
fn read_from<R: Read + ?Sized>(source: &mut R, buf: &mut [u8]) -> io::Result<Option<usize>> {
    loop {
        match source.read(buf) {
            Ok(n) => return Ok(Some(n)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Accumulator
// ---------------------------------------------------------------------------

/// Why an [`Accumulator`] stopped accepting bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The hard cap was reached.
    Truncated,
    /// The source reported end of input.
    Eof,
}

/// Result of [`Accumulator::fill`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Fill {
    pub bytes: usize,
    /// Set on exactly one call: the one that completed the accumulator.
    pub completed: Option<Completion>,
}

/// Bounded, growable input buffer.
///
/// Wraps a `BytesMut` (typically a connection's arena) and appends incoming
/// bytes up to `cap`. Once the cap is hit or the source signals end of
/// input, the accumulator reports its completion once and ignores further
/// fills.
#[derive(Debug)]
pub struct Accumulator {
    buf: BytesMut,
    cap: usize,
    completion: Option<Completion>,
}

impl Accumulator {
    /// Wrap `buf`. Bytes already present count as received.
    pub fn new(buf: BytesMut, cap: usize) -> Self {
        Self {
            buf,
            cap,
            completion: None,
        }
    }

    /// Bytes received so far.
    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Room left before the cap.
    pub fn remaining(&self) -> usize {
        self.cap.saturating_sub(self.buf.len())
    }

    pub fn completion(&self) -> Option<Completion> {
        self.completion
    }

    /// Input-side readiness: false once completed.
    pub fn is_writable(&self) -> bool {
        self.completion.is_none()
    }

    /// Read once from `source`.
    ///
    /// A `Fill` with zero bytes and no completion means the source would
    /// block.
    pub fn fill<R: Read + ?Sized>(&mut self, source: &mut R) -> io::Result<Fill> {
        if self.completion.is_some() {
            return Ok(Fill::default());
        }
        if self.remaining() == 0 {
            return Ok(self.complete(0, Completion::Truncated));
        }

        let len = self.buf.len();
        if self.buf.capacity() - len < MIN_READ_ROOM {
            // Geometric growth, never past the cap.
            let grow = len.max(MIN_READ_ROOM).min(self.remaining());
            self.buf.reserve(grow);
        }
        let room = (self.buf.capacity() - len).min(self.remaining());
        self.buf.resize(len + room, 0);

        let result = read_from(source, &mut self.buf[len..]);
        let n = match &result {
            Ok(Some(n)) => *n,
            _ => 0,
        };
        self.buf.truncate(len + n);

        match result? {
            None => Ok(Fill::default()),
            Some(0) => Ok(self.complete(0, Completion::Eof)),
            Some(n) if self.buf.len() >= self.cap => Ok(self.complete(n, Completion::Truncated)),
            Some(n) => Ok(Fill {
                bytes: n,
                completed: None,
            }),
        }
    }

    fn complete(&mut self, bytes: usize, completion: Completion) -> Fill {
        self.completion = Some(completion);
        Fill {
            bytes,
            completed: Some(completion),
        }
    }

    /// Give the underlying storage back, e.g. to reuse it as an arena.
    pub fn into_inner(self) -> BytesMut {
        self.buf
    }
}

// ---------------------------------------------------------------------------
// Block
// ---------------------------------------------------------------------------

/// Fixed contiguous byte range served as an output stream.
#[derive(Debug, Clone)]
pub struct Block {
    data: Bytes,
    offset: usize,
}

impl Block {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            offset: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn is_exhausted(&self) -> bool {
        self.offset == self.data.len()
    }

    /// Output-side readiness. An exhausted block is still "ready" in the
    /// sense that its next pump delivers the EOF signal.
    pub fn is_readable(&self) -> bool {
        true
    }

    /// Offer all remaining bytes to `sink`, advancing by what it consumed.
    pub fn pump<K: Sink + ?Sized>(&mut self, sink: &mut K) -> io::Result<Progress> {
        if self.is_exhausted() {
            return Ok(Progress::eof(0));
        }
        match write_to(sink, &self.data[self.offset..])? {
            None => Ok(Progress::default()),
            Some(n) => {
                self.offset += n;
                Ok(Progress {
                    bytes: n,
                    eof: self.is_exhausted(),
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// RingBuffer
// ---------------------------------------------------------------------------

/// Fixed-capacity circular buffer with independent read and write cursors.
///
/// An explicit byte count disambiguates the full and empty cases when the
/// cursors coincide.
#[derive(Debug)]
pub struct RingBuffer {
    buf: Box<[u8]>,
    read: usize,
    write: usize,
    len: usize,
    eof: bool,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be positive");
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            read: 0,
            write: 0,
            len: 0,
            eof: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.buf.len()
    }

    /// End of input has been recorded on the write side.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Read-side readiness: buffered bytes, or an EOF to report.
    pub fn is_readable(&self) -> bool {
        self.len > 0 || self.eof
    }

    /// Write-side readiness: room left and input still open.
    pub fn is_writable(&self) -> bool {
        !self.is_full() && !self.eof
    }

    /// Record end of input. Buffered bytes still drain.
    pub fn set_eof(&mut self) {
        self.eof = true;
    }

    /// Contiguous free region starting at the write cursor.
    fn write_region(&mut self) -> &mut [u8] {
        let end = if self.write >= self.read && self.len < self.buf.len() {
            self.buf.len()
        } else {
            self.read
        };
        let start = self.write;
        if self.is_full() {
            return &mut self.buf[start..start];
        }
        &mut self.buf[start..end]
    }

    /// Contiguous readable region starting at the read cursor.
    fn read_region(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        let end = if self.read < self.write {
            self.write
        } else {
            self.buf.len()
        };
        &self.buf[self.read..end]
    }

    /// Advance the write cursor after `n` bytes were produced.
    fn commit(&mut self, n: usize) {
        debug_assert!(self.len + n <= self.buf.len(), "ring buffer overwrite");
        self.write = (self.write + n) % self.buf.len();
        self.len += n;
    }

    /// Advance the read cursor after `n` bytes were consumed.
    fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len, "ring buffer underread");
        self.read = (self.read + n) % self.buf.len();
        self.len -= n;
    }

    /// Read once from `source` into free space.
    pub fn fill<R: Read + ?Sized>(&mut self, source: &mut R) -> io::Result<Progress> {
        if !self.is_writable() {
            return Ok(Progress {
                bytes: 0,
                eof: self.eof,
            });
        }
        let region = self.write_region();
        debug_assert!(!region.is_empty(), "ring buffer writable without free space");
        match read_from(source, region)? {
            None => Ok(Progress::default()),
            Some(0) => {
                self.eof = true;
                Ok(Progress::eof(0))
            }
            Some(n) => {
                self.commit(n);
                Ok(Progress::moved(n))
            }
        }
    }

    /// Drain buffered bytes into `sink`.
    ///
    /// `eof` is reported once the buffer is empty and end of input was
    /// recorded.
    pub fn pump<K: Sink + ?Sized>(&mut self, sink: &mut K) -> io::Result<Progress> {
        let mut total = 0;
        while self.len > 0 {
            let region_len = self.read_region().len();
            let written = {
                let start = self.read;
                write_to(sink, &self.buf[start..start + region_len])?
            };
            match written {
                None => break,
                Some(n) => {
                    self.consume(n);
                    total += n;
                    if n < region_len {
                        break;
                    }
                }
            }
        }
        Ok(Progress {
            bytes: total,
            eof: self.eof && self.len == 0,
        })
    }
}

// ---------------------------------------------------------------------------
// FileSource
// ---------------------------------------------------------------------------

/// Byte range `[offset, end)` of an open file served as an output stream.
#[derive(Debug)]
pub struct FileSource {
    file: File,
    offset: u64,
    end: u64,
    /// Staged bytes for sinks without a zero-copy path.
    chunk: Vec<u8>,
    chunk_start: u64,
}

impl FileSource {
    pub fn new(file: File, offset: u64, end: u64) -> Self {
        debug_assert!(offset <= end, "file range reversed");
        Self {
            file,
            offset,
            end,
            chunk: Vec::new(),
            chunk_start: 0,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn remaining(&self) -> u64 {
        self.end - self.offset
    }

    pub fn is_readable(&self) -> bool {
        true
    }

    /// Transfer the next part of the range into `sink`.
    pub fn pump<K: Sink + ?Sized>(&mut self, sink: &mut K) -> io::Result<Progress> {
        if self.offset >= self.end {
            return Ok(Progress::eof(0));
        }
        let want = usize::try_from(self.remaining()).unwrap_or(usize::MAX);

        let sent = match sink.send_file(&self.file, self.offset, want) {
            Some(Ok(0)) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "file shorter than declared range",
                ));
            }
            Some(Ok(n)) => Some(n),
            Some(Err(ref e)) if e.kind() == io::ErrorKind::WouldBlock => None,
            Some(Err(e)) => return Err(e),
            None => {
                self.stage_chunk()?;
                let skip = (self.offset - self.chunk_start) as usize;
                write_to(sink, &self.chunk[skip..])?
            }
        };

        match sent {
            None => Ok(Progress::default()),
            Some(n) => {
                self.offset += n as u64;
                Ok(Progress {
                    bytes: n,
                    eof: self.offset == self.end,
                })
            }
        }
    }

    /// Make sure the staged chunk covers the current offset.
    fn stage_chunk(&mut self) -> io::Result<()> {
        let chunk_end = self.chunk_start + self.chunk.len() as u64;
        if self.offset >= self.chunk_start && self.offset < chunk_end {
            return Ok(());
        }
        let len = usize::try_from(self.remaining())
            .unwrap_or(usize::MAX)
            .min(FILE_CHUNK_SIZE);
        self.chunk.resize(len, 0);
        let n = loop {
            match self.file.read_at(&mut self.chunk, self.offset) {
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        if n == 0 {
            self.chunk.clear();
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "file shorter than declared range",
            ));
        }
        self.chunk.truncate(n);
        self.chunk_start = self.offset;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// StreamSource
// ---------------------------------------------------------------------------

/// An arbitrary reader served as an output stream through a [`RingBuffer`].
///
/// With a declared length the source delivers exactly that many bytes: the
/// reader is not read past it, and ending short is an `UnexpectedEof` error.
pub struct StreamSource {
    reader: Box<dyn Read + Send>,
    ring: RingBuffer,
    /// Bytes still owed to the peer, if the length was declared.
    owed: Option<u64>,
}

impl StreamSource {
    pub fn new(reader: Box<dyn Read + Send>, len: Option<u64>, buffer_size: usize) -> Self {
        let mut ring = RingBuffer::new(buffer_size);
        if len == Some(0) {
            ring.set_eof();
        }
        Self {
            reader,
            ring,
            owed: len,
        }
    }

    /// Move bytes from the reader to `sink` until one of them would block.
    pub fn pump<K: Sink + ?Sized>(&mut self, sink: &mut K) -> io::Result<Progress> {
        let mut moved = 0;
        loop {
            if self.ring.is_writable() {
                self.fill()?;
            }
            let progress = self.ring.pump(sink)?;
            moved += progress.bytes;
            if progress.eof || progress.bytes == 0 {
                return Ok(Progress {
                    bytes: moved,
                    eof: progress.eof,
                });
            }
        }
    }

    fn fill(&mut self) -> io::Result<()> {
        let Some(owed) = self.owed else {
            self.ring.fill(&mut self.reader)?;
            return Ok(());
        };
        let progress = self.ring.fill(&mut (&mut self.reader).take(owed))?;
        if progress.eof {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream shorter than declared length",
            ));
        }
        let owed = owed - progress.bytes as u64;
        if owed == 0 {
            self.ring.set_eof();
        }
        self.owed = Some(owed);
        Ok(())
    }
}
