//! Header-framed codec for adapter stdio streams.
//!
//! Adapters speak the framing shared by language servers and debug
//! adapters: a block of `Key: Value` lines terminated by `\r\n\r\n`, one of
//! which declares the exact byte length of the body that follows.
//!
//! [`FrameCodec::feed`] accepts arbitrarily chunked bytes and yields every
//! frame that has become complete; [`FrameCodec::encode`] produces the bytes
//! for one outbound message.
//!
//! # Examples
//!
//! ```rust,ignore
//! let mut codec = FrameCodec::new();
//! for frame in codec.feed(b"Content-Length: 5\r\n\r\nhello") {
//!     assert_eq!(&frame?.body[..], b"hello");
//! }
//! ```

use std::fmt::{Display, Formatter};

use bytes::{Buf, Bytes, BytesMut};

use crate::config::FramingConfig;
use crate::AppError;

/// Separator between the header block and the body.
pub const HEADER_DELIMITER: &[u8] = b"\r\n\r\n";

/// Header declaring the body length when no override is configured.
pub const DEFAULT_LENGTH_HEADER: &str = "Content-Length";

/// Ceiling on buffered, not-yet-framed bytes: 8 MiB.
///
/// A peer that streams past this without completing a frame is treated as a
/// fatal framing failure rather than allowed to grow the buffer further.
pub const DEFAULT_MAX_BUFFER_BYTES: usize = 8 * 1024 * 1024;

/// One complete framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Header lines in wire order, names and values trimmed.
    pub headers: Vec<(String, String)>,
    /// Exactly the declared number of body bytes.
    pub body: Bytes,
}

impl Frame {
    /// Look up a header value by case-insensitive name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Body as UTF-8 text, if it is valid UTF-8.
    #[must_use]
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

/// Framing failures produced while decoding.
#[derive(Debug)]
pub enum FrameError {
    /// Header block carried no length declaration.
    MissingLength,
    /// Length declaration was not a non-negative integer that fits `usize`.
    InvalidLength(String),
    /// Header block was not UTF-8 or contained a line without `:`.
    MalformedHeader(String),
    /// Buffered or declared size exceeded the configured ceiling.
    Overflow {
        /// Bytes that would have to be held to complete the frame.
        required: usize,
        /// Configured ceiling.
        limit: usize,
    },
    /// Underlying stream failed.
    Io(std::io::Error),
}

impl FrameError {
    /// Whether the stream can no longer be trusted.
    ///
    /// Header-level errors drop only the offending header block; overflow and
    /// I/O failures end the stream.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Overflow { .. } | Self::Io(_))
    }
}

impl Display for FrameError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingLength => write!(f, "header block has no length declaration"),
            Self::InvalidLength(value) => write!(f, "invalid length declaration: {value:?}"),
            Self::MalformedHeader(msg) => write!(f, "malformed header block: {msg}"),
            Self::Overflow { required, limit } => {
                write!(f, "frame buffer overflow: {required} bytes exceeds {limit}")
            }
            Self::Io(err) => write!(f, "stream error: {err}"),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<std::io::Error> for FrameError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<FrameError> for AppError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(io_err) => Self::Io(io_err.to_string()),
            other => Self::Framing(other.to_string()),
        }
    }
}

/// Per-direction framing state: an accumulation buffer plus a scan cursor.
///
/// The buffer only grows by appended bytes and only shrinks by whole
/// consumed frames (or, on a header error, by the dropped header block).
#[derive(Debug)]
pub struct FrameCodec {
    length_header: String,
    content_type: Option<String>,
    max_buffer_bytes: usize,
    buffer: BytesMut,
    /// Offset from which the next delimiter search resumes.
    cursor: usize,
}

impl FrameCodec {
    /// Codec with `Content-Length` framing and the default buffer ceiling.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_LENGTH_HEADER, None, DEFAULT_MAX_BUFFER_BYTES)
    }

    /// Codec configured from a listener's `[framing]` table.
    #[must_use]
    pub fn from_config(config: &FramingConfig) -> Self {
        Self::with_limits(
            &config.length_header,
            config.content_type.clone(),
            config.max_buffer_bytes,
        )
    }

    /// Codec with explicit framing parameters.
    #[must_use]
    pub fn with_limits(
        length_header: &str,
        content_type: Option<String>,
        max_buffer_bytes: usize,
    ) -> Self {
        Self {
            length_header: length_header.to_owned(),
            content_type,
            max_buffer_bytes,
            buffer: BytesMut::new(),
            cursor: 0,
        }
    }

    /// Append `chunk` and iterate over every frame it completes.
    ///
    /// The iterator is lazy: each `next` parses at most one frame. Bytes of a
    /// trailing partial frame stay buffered for the next call. A fatal error
    /// is yielded once and ends the iteration.
    pub fn feed(&mut self, chunk: &[u8]) -> Frames<'_> {
        self.buffer.extend_from_slice(chunk);
        Frames {
            codec: self,
            halted: false,
        }
    }

    /// Serialise `body` as one framed message.
    #[must_use]
    pub fn encode(&self, body: &[u8]) -> Bytes {
        let mut header = format!("{}: {}\r\n", self.length_header, body.len());
        if let Some(ref content_type) = self.content_type {
            header.push_str("Content-Type: ");
            header.push_str(content_type);
            header.push_str("\r\n");
        }
        header.push_str("\r\n");

        let mut out = BytesMut::with_capacity(header.len() + body.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(body);
        out.freeze()
    }

    /// Bytes currently held waiting for a frame to complete.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let Some(header_end) = self.find_delimiter() else {
            return self.pending_or_overflow(self.buffer.len());
        };
        let body_start = header_end + HEADER_DELIMITER.len();

        let parsed = parse_headers(&self.buffer[..header_end])
            .and_then(|headers| self.declared_length(&headers).map(|len| (headers, len)));
        let (headers, length) = match parsed {
            Ok(parsed) => parsed,
            Err(err) => {
                // Drop the bad header block and resume scanning after it.
                self.buffer.advance(body_start);
                self.cursor = 0;
                return Err(err);
            }
        };

        let frame_end = body_start
            .checked_add(length)
            .ok_or(FrameError::Overflow {
                required: usize::MAX,
                limit: self.max_buffer_bytes,
            })?;
        if frame_end > self.max_buffer_bytes {
            return Err(FrameError::Overflow {
                required: frame_end,
                limit: self.max_buffer_bytes,
            });
        }
        if self.buffer.len() < frame_end {
            self.cursor = header_end;
            return Ok(None);
        }

        let mut frame_bytes = self.buffer.split_to(frame_end);
        let body = frame_bytes.split_off(body_start).freeze();
        self.cursor = 0;
        Ok(Some(Frame { headers, body }))
    }

    fn find_delimiter(&mut self) -> Option<usize> {
        let start = self.cursor.saturating_sub(HEADER_DELIMITER.len() - 1);
        let found = self.buffer[start..]
            .windows(HEADER_DELIMITER.len())
            .position(|window| window == HEADER_DELIMITER)
            .map(|offset| start + offset);
        if found.is_none() {
            self.cursor = self.buffer.len();
        }
        found
    }

    fn pending_or_overflow(&self, required: usize) -> Result<Option<Frame>, FrameError> {
        if required > self.max_buffer_bytes {
            Err(FrameError::Overflow {
                required,
                limit: self.max_buffer_bytes,
            })
        } else {
            Ok(None)
        }
    }

    fn declared_length(&self, headers: &[(String, String)]) -> Result<usize, FrameError> {
        let (_, value) = headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(&self.length_header))
            .ok_or(FrameError::MissingLength)?;
        value
            .parse::<usize>()
            .map_err(|_| FrameError::InvalidLength(value.clone()))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator returned by [`FrameCodec::feed`].
#[derive(Debug)]
pub struct Frames<'a> {
    codec: &'a mut FrameCodec,
    halted: bool,
}

impl Iterator for Frames<'_> {
    type Item = Result<Frame, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.halted {
            return None;
        }
        match self.codec.next_frame() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.halted = true;
                None
            }
            Err(err) => {
                self.halted = err.is_fatal();
                Some(Err(err))
            }
        }
    }
}

// ── Private helper ────────────────────────────────────────────────────────────

/// Split a header block into trimmed `(name, value)` pairs.
fn parse_headers(block: &[u8]) -> Result<Vec<(String, String)>, FrameError> {
    let text = std::str::from_utf8(block)
        .map_err(|_| FrameError::MalformedHeader("header block is not valid UTF-8".into()))?;

    text.split("\r\n")
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.split_once(':')
                .map(|(name, value)| (name.trim().to_owned(), value.trim().to_owned()))
                .ok_or_else(|| FrameError::MalformedHeader(format!("line without ':': {line:?}")))
        })
        .collect()
}
