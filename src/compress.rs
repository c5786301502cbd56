//! Streaming gzip over reader/writer pairs, plus the bounded chunk pipe that
//! glues flate2's push-style write codecs to pull-style consumers.

use std::collections::VecDeque;
use std::io::{self, Read, Write};

use flate2::Compression;
use flate2::write::{GzDecoder, GzEncoder};

/// Read/copy buffer for the streaming codecs.
pub const COPY_BUF: usize = 64 * 1024;

/// Result of one pull from a [`ChunkPipe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeRead {
    /// Bytes were copied into the caller's buffer.
    Data(usize),
    /// Nothing buffered yet; the producer has not closed the pipe.
    Empty,
    /// The pipe is closed and fully drained.
    Eof,
}

/// Bounded queue of byte chunks between a push-style producer and a pull-style
/// consumer.
///
/// Guarantees: chunk order is preserved, bytes out equals bytes in at EOF, a
/// read larger than the front chunk drains it and a smaller read splits it,
/// and reads after the final chunk return [`PipeRead::Eof`]. Producers must
/// not push into a full pipe; the codec drivers below drain between feeds and
/// surface an overflow as `WouldBlock` so the caller can drain and retry.
#[derive(Debug, Default)]
pub struct ChunkPipe {
    chunks: VecDeque<Vec<u8>>,
    front_pos: usize,
    closed: bool,
    bytes_in: u64,
    bytes_out: u64,
}

impl ChunkPipe {
    /// Queue capacity in chunks.
    pub const HIGH_WATER: usize = 10;

    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.chunks.len() >= Self::HIGH_WATER
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    #[must_use]
    pub const fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    #[must_use]
    pub const fn bytes_out(&self) -> u64 {
        self.bytes_out
    }

    /// Push one chunk. The payload may be empty when `is_last` marks EOF.
    ///
    /// # Errors
    /// `WouldBlock` when the pipe is full, `BrokenPipe` after EOF was pushed.
    pub fn push(&mut self, chunk: &[u8], is_last: bool) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "push after end of stream"));
        }
        if self.is_full() {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "chunk pipe full"));
        }
        if !chunk.is_empty() {
            self.bytes_in += chunk.len() as u64;
            self.chunks.push_back(chunk.to_vec());
        }
        if is_last {
            self.closed = true;
        }
        Ok(())
    }

    /// Pull up to `buf.len()` bytes from the front of the queue.
    pub fn read_into(&mut self, buf: &mut [u8]) -> PipeRead {
        let Some(front) = self.chunks.front() else {
            return if self.closed { PipeRead::Eof } else { PipeRead::Empty };
        };
        let take = buf.len().min(front.len() - self.front_pos);
        buf[..take].copy_from_slice(&front[self.front_pos..self.front_pos + take]);
        self.front_pos += take;
        if self.front_pos == front.len() {
            self.chunks.pop_front();
            self.front_pos = 0;
        }
        self.bytes_out += take as u64;
        PipeRead::Data(take)
    }
}

impl Write for ChunkPipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.push(buf, false)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn drain<W: Write + ?Sized>(pipe: &mut ChunkPipe, writer: &mut W, buf: &mut [u8]) -> io::Result<u64> {
    let mut out = 0u64;
    loop {
        match pipe.read_into(buf) {
            PipeRead::Data(n) => {
                writer.write_all(&buf[..n])?;
                out += n as u64;
            }
            PipeRead::Empty | PipeRead::Eof => return Ok(out),
        }
    }
}

/// Gzip-compress `reader` into `writer` at level 9. Returns compressed bytes written.
///
/// # Errors
/// Returns any read or write error.
pub fn compress<R: Read + ?Sized, W: Write + ?Sized>(
    reader: &mut R,
    writer: &mut W,
) -> io::Result<u64> {
    let mut enc = GzEncoder::new(ChunkPipe::new(), Compression::best());
    run_codec(reader, writer, &mut enc, GzEncoder::get_mut, GzEncoder::try_finish)?;
    let mut pipe = enc.finish()?;
    finish_pipe(&mut pipe, writer)
}

/// Gunzip `reader` into `writer`. Returns decompressed bytes written.
///
/// # Errors
/// Returns any read or write error, including malformed gzip input.
pub fn decompress<R: Read + ?Sized, W: Write + ?Sized>(
    reader: &mut R,
    writer: &mut W,
) -> io::Result<u64> {
    let mut dec = GzDecoder::new(ChunkPipe::new());
    run_codec(reader, writer, &mut dec, GzDecoder::get_mut, GzDecoder::try_finish)?;
    let mut pipe = dec.finish()?;
    finish_pipe(&mut pipe, writer)
}

/// Feed the whole of `reader` through a write-style codec, draining the codec's
/// pipe into `writer` whenever it reports backpressure.
fn run_codec<R, W, C>(
    reader: &mut R,
    writer: &mut W,
    codec: &mut C,
    pipe_of: impl Fn(&mut C) -> &mut ChunkPipe,
    try_finish: impl Fn(&mut C) -> io::Result<()>,
) -> io::Result<()>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
    C: Write,
{
    let mut inbuf = vec![0u8; COPY_BUF];
    let mut outbuf = vec![0u8; COPY_BUF];
    loop {
        let n = reader.read(&mut inbuf)?;
        if n == 0 {
            break;
        }
        let mut data = &inbuf[..n];
        while !data.is_empty() {
            match codec.write(data) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(consumed) => data = &data[consumed..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    drain(pipe_of(codec), writer, &mut outbuf)?;
                }
                Err(e) => return Err(e),
            }
        }
        drain(pipe_of(codec), writer, &mut outbuf)?;
    }
    loop {
        match try_finish(codec) {
            Ok(()) => break,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                drain(pipe_of(codec), writer, &mut outbuf)?;
            }
            Err(e) => return Err(e),
        }
    }
    drain(pipe_of(codec), writer, &mut outbuf)?;
    Ok(())
}

fn finish_pipe<W: Write + ?Sized>(pipe: &mut ChunkPipe, writer: &mut W) -> io::Result<u64> {
    pipe.push(&[], true)?;
    let mut outbuf = vec![0u8; COPY_BUF];
    drain(pipe, writer, &mut outbuf)?;
    debug_assert_eq!(pipe.bytes_in(), pipe.bytes_out());
    Ok(pipe.bytes_out())
}

/// Decompress `compressed` chunk by chunk and compare against `plain`.
///
/// Returns `false` on any content or length mismatch, including trailing data
/// on the plain side after the compressed stream ends.
///
/// # Errors
/// Returns read errors from either stream; malformed gzip input is a mismatch,
/// not an error.
pub fn compare_compressed_with_plain<R1, R2>(compressed: &mut R1, plain: &mut R2) -> io::Result<bool>
where
    R1: Read + ?Sized,
    R2: Read + ?Sized,
{
    let mut dec = flate2::read::GzDecoder::new(compressed);
    let mut a = vec![0u8; COPY_BUF];
    let mut b = vec![0u8; COPY_BUF];
    loop {
        let n = match dec.read(&mut a) {
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::InvalidInput
                        | io::ErrorKind::InvalidData
                        | io::ErrorKind::UnexpectedEof
                ) =>
            {
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        if n == 0 {
            return Ok(plain.read(&mut b)? == 0);
        }
        let mut got = 0;
        while got < n {
            let m = plain.read(&mut b[got..n])?;
            if m == 0 {
                return Ok(false);
            }
            got += m;
        }
        if a[..n] != b[..n] {
            return Ok(false);
        }
    }
}
