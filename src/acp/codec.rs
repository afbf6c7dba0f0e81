//! NDJSON codec for ACP agent streams.
//!
//! Line framing is delegated to [`tokio_util::codec::LinesCodec`] with a
//! fixed maximum line length so an unterminated or oversized message from a
//! misbehaving agent cannot exhaust memory. On top of the framing, each line
//! is parsed into a [`Message`].
//!
//! A line that is not valid UTF-8 or JSON, or that exceeds [`MAX_LINE_BYTES`],
//! does not fail the stream: it is yielded as [`Frame::Malformed`] so the
//! transport can report it and keep reading. Only I/O failures surface as
//! decoder errors.

use std::io;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::acp::message::Message;
use crate::{AppError, Result};

/// Maximum line length accepted by the ACP codec: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// One decoded line.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A well-formed envelope.
    Message(Message),
    /// A non-blank line that did not parse as an envelope.
    Malformed {
        /// The offending line, verbatim.
        line: String,
        /// Parser diagnostic.
        reason: String,
    },
}

/// Codec used for both halves of the agent's stdio.
///
/// # Examples
///
/// ```rust,ignore
/// use tokio_util::codec::FramedRead;
/// use acp_bridge::acp::codec::AcpCodec;
///
/// let frames = FramedRead::new(child_stdout, AcpCodec::new());
/// ```
#[derive(Debug)]
pub struct AcpCodec(LinesCodec);

impl AcpCodec {
    /// Create a new `AcpCodec` with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_LINE_BYTES))
    }

    /// Parse lines until a non-blank one is found or the buffer runs dry.
    fn next_frame(&mut self, src: &mut BytesMut, eof: bool) -> Result<Option<Frame>> {
        loop {
            let decoded = if eof {
                self.0.decode_eof(src)
            } else {
                self.0.decode(src)
            };

            let line = match decoded {
                Ok(line) => line,
                // LinesCodec skips the remainder of the offending line itself.
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    return Ok(Some(Frame::Malformed {
                        line: String::new(),
                        reason: format!("line too long: exceeded {MAX_LINE_BYTES} bytes"),
                    }));
                }
                // Raised after the line was split off the buffer.
                Err(LinesCodecError::Io(e)) if e.kind() == io::ErrorKind::InvalidData => {
                    return Ok(Some(Frame::Malformed {
                        line: String::new(),
                        reason: format!("invalid UTF-8: {e}"),
                    }));
                }
                Err(e) => return Err(map_codec_error(e)),
            };

            let Some(line) = line else {
                return Ok(None);
            };

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            return Ok(Some(parse_frame(trimmed)));
        }
    }
}

impl Default for AcpCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for AcpCodec {
    type Item = Frame;
    type Error = AppError;

    /// Returns `Ok(None)` while no complete non-blank line is buffered.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] for read failures.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.next_frame(src, false)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.next_frame(src, true)
    }
}

impl Encoder<Message> for AcpCodec {
    type Error = AppError;

    /// Serialise `item` compactly and terminate it with `\n`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Acp`] if serialisation fails.
    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let line = serde_json::to_string(&item)
            .map_err(|e| AppError::Acp(format!("failed to serialise outbound message: {e}")))?;
        // The line limit only guards decoding.
        self.0.encode(line, dst).map_err(map_codec_error)
    }
}

fn parse_frame(line: &str) -> Frame {
    match serde_json::from_str::<Message>(line) {
        Ok(message) => Frame::Message(message),
        Err(e) => Frame::Malformed {
            line: line.to_owned(),
            reason: e.to_string(),
        },
    }
}

fn map_codec_error(e: LinesCodecError) -> AppError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            AppError::Acp(format!("line too long: exceeded {MAX_LINE_BYTES} bytes"))
        }
        LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
    }
}
