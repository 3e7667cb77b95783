//! Multiplexed stdout/stderr stream decoding.
//!
//! The runtime interleaves the output of an attached command on a single byte
//! channel. Every unit on the wire is an 8-byte header followed by a payload:
//!
//! ```text
//! [stream type: u8][0x00 0x00 0x00][payload length: u32 big-endian][payload ...]
//! ```
//!
//! Two sources are supported: a fully buffered blob ([`BufferedFrames`]) and a
//! live duplex channel ([`LiveFrames`]). Both stop quietly at end-of-stream,
//! and a truncated or malformed header ends the stream the same way.

use futures::stream::{self, Stream};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

/// Size of a frame header in bytes.
pub const STREAM_HEADER_SIZE: usize = 8;

/// Stream a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    Stdin,
    Stdout,
    Stderr,
    /// A type byte the runtime does not document. Always passed through.
    Other(u8),
}

impl StreamType {
    /// Decode the header's stream-type byte.
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0 => StreamType::Stdin,
            1 => StreamType::Stdout,
            2 => StreamType::Stderr,
            other => StreamType::Other(other),
        }
    }

    /// Encode back to the header byte.
    pub fn as_byte(self) -> u8 {
        match self {
            StreamType::Stdin => 0,
            StreamType::Stdout => 1,
            StreamType::Stderr => 2,
            StreamType::Other(other) => other,
        }
    }
}

/// Selects which streams a reader keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFilter {
    pub stdout: bool,
    pub stderr: bool,
}

impl StreamFilter {
    /// Keep both stdout and stderr.
    pub const ALL: StreamFilter = StreamFilter {
        stdout: true,
        stderr: true,
    };

    pub fn new(stdout: bool, stderr: bool) -> Self {
        Self { stdout, stderr }
    }

    /// Whether frames of `stream` should be emitted.
    pub fn includes(&self, stream: StreamType) -> bool {
        match stream {
            StreamType::Stdout => self.stdout,
            StreamType::Stderr => self.stderr,
            _ => true,
        }
    }
}

impl Default for StreamFilter {
    fn default() -> Self {
        Self::ALL
    }
}

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub stream: StreamType,
    pub length: u32,
}

impl FrameHeader {
    /// Parse a header. Returns `None` when the reserved bytes are not zero.
    pub fn parse(bytes: &[u8; STREAM_HEADER_SIZE]) -> Option<Self> {
        if bytes[1..4] != [0, 0, 0] {
            return None;
        }

        Some(Self {
            stream: StreamType::from_byte(bytes[0]),
            length: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        })
    }

    pub fn encode(&self) -> [u8; STREAM_HEADER_SIZE] {
        let len = self.length.to_be_bytes();
        [self.stream.as_byte(), 0, 0, 0, len[0], len[1], len[2], len[3]]
    }
}

/// A frame borrowed from a buffered source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub stream: StreamType,
    pub payload: &'a [u8],
}

/// A frame read from a live channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedFrame {
    pub stream: StreamType,
    pub payload: Vec<u8>,
}

/// Append one encoded frame to `out`.
///
/// # Panics
///
/// Panics if `payload` is longer than `u32::MAX` bytes.
pub fn encode_frame(stream: StreamType, payload: &[u8], out: &mut Vec<u8>) {
    let length = u32::try_from(payload.len()).expect("frame payload exceeds u32::MAX bytes");
    out.extend_from_slice(&FrameHeader { stream, length }.encode());
    out.extend_from_slice(payload);
}

/// Iterator over the frames of an already buffered response.
///
/// Frames of excluded streams are skipped. Iteration ends when fewer than
/// [`STREAM_HEADER_SIZE`] bytes remain, or when a header is malformed or
/// declares more payload than the buffer holds.
pub struct BufferedFrames<'a> {
    buf: &'a [u8],
    offset: usize,
    filter: StreamFilter,
}

impl<'a> BufferedFrames<'a> {
    pub fn new(buf: &'a [u8], filter: StreamFilter) -> Self {
        Self {
            buf,
            offset: 0,
            filter,
        }
    }

    /// Concatenate the payloads of every remaining included frame.
    pub fn concat(self) -> Vec<u8> {
        let mut out = Vec::new();
        for frame in self {
            out.extend_from_slice(frame.payload);
        }
        out
    }
}

impl<'a> Iterator for BufferedFrames<'a> {
    type Item = Frame<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let rest = &self.buf[self.offset..];
            let header: &[u8; STREAM_HEADER_SIZE] =
                rest.get(..STREAM_HEADER_SIZE)?.try_into().ok()?;

            let Some(header) = FrameHeader::parse(header) else {
                debug!("Malformed frame header at offset {}, ending stream", self.offset);
                self.offset = self.buf.len();
                return None;
            };

            let start = self.offset + STREAM_HEADER_SIZE;
            let end = start + header.length as usize;
            if end > self.buf.len() {
                debug!(
                    "Frame at offset {} declares {} bytes but only {} remain, ending stream",
                    self.offset,
                    header.length,
                    self.buf.len() - start
                );
                self.offset = self.buf.len();
                return None;
            }

            self.offset = end;
            if self.filter.includes(header.stream) {
                return Some(Frame {
                    stream: header.stream,
                    payload: &self.buf[start..end],
                });
            }
        }
    }
}

/// Lazy reader of frames from a live channel.
///
/// The sequence ends at channel closure, at a short header or payload read,
/// at a zero-length frame (the peer's completion marker), or at a malformed
/// header. Once ended it stays ended; it cannot be restarted.
pub struct LiveFrames<R> {
    reader: R,
    filter: StreamFilter,
    finished: bool,
}

impl<R> LiveFrames<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R, filter: StreamFilter) -> Self {
        Self {
            reader,
            filter,
            finished: false,
        }
    }

    /// Whether the sequence has ended.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Read the next included frame.
    ///
    /// # Errors
    ///
    /// Returns I/O errors other than an unexpected EOF, which ends the sequence.
    pub async fn next_frame(&mut self) -> io::Result<Option<OwnedFrame>> {
        while !self.finished {
            let mut header = [0u8; STREAM_HEADER_SIZE];
            if !self.fill(&mut header).await? {
                break;
            }

            let Some(header) = FrameHeader::parse(&header) else {
                debug!("Malformed frame header on live stream, ending stream");
                break;
            };
            if header.length == 0 {
                break;
            }

            let Some(payload) = self.take_payload(header.length).await? else {
                break;
            };

            if self.filter.includes(header.stream) {
                return Ok(Some(OwnedFrame {
                    stream: header.stream,
                    payload,
                }));
            }
        }

        self.finished = true;
        Ok(None)
    }

    /// Drain the remaining included frames into one buffer.
    ///
    /// # Errors
    ///
    /// Returns the first I/O error encountered.
    pub async fn read_to_end(&mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(frame) = self.next_frame().await? {
            out.extend_from_slice(&frame.payload);
        }
        Ok(out)
    }

    /// Convert into a [`Stream`] of payload chunks.
    pub fn into_stream(self) -> impl Stream<Item = io::Result<Vec<u8>>> {
        stream::unfold(self, |mut frames| async move {
            match frames.next_frame().await {
                Ok(Some(frame)) => Some((Ok(frame.payload), frames)),
                Ok(None) => None,
                Err(e) => {
                    frames.finished = true;
                    Some((Err(e), frames))
                }
            }
        })
    }

    /// Give back the underlying reader.
    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Read exactly `length` payload bytes, growing the buffer as they
    /// arrive. `None` if the channel closes first.
    async fn take_payload(&mut self, length: u32) -> io::Result<Option<Vec<u8>>> {
        let mut payload = Vec::new();
        if let Err(e) = (&mut self.reader)
            .take(u64::from(length))
            .read_to_end(&mut payload)
            .await
        {
            self.finished = true;
            return Err(e);
        }
        Ok((payload.len() == length as usize).then_some(payload))
    }

    async fn fill(&mut self, buf: &mut [u8]) -> io::Result<bool> {
        match self.reader.read_exact(buf).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => {
                self.finished = true;
                Err(e)
            }
        }
    }
}
