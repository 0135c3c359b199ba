//! Newline-delimited JSON framing with a bounded frame size.
//!
//! The reader keeps partially received frames across read timeouts so a
//! listener can poll a shutdown flag between reads without losing data.

use std::io::{self, Read, Write};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Largest accepted frame, excluding the trailing newline.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

const READ_CHUNK_BYTES: usize = 4 * 1024;

/// Result of one call to [`FrameReader::next_frame`].
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A complete, non-empty frame without its line terminator.
    Frame(Vec<u8>),
    /// A frame exceeded [`MAX_FRAME_BYTES`] and was discarded.
    Oversized,
    /// The read timed out before a full frame arrived; buffered bytes are kept.
    Idle,
    /// The peer closed the stream and no buffered bytes remain.
    Eof,
}

/// Splits a byte stream into newline-terminated frames.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    buffer: Vec<u8>,
    discarding: bool,
    limit: usize,
}

impl<R: Read> FrameReader<R> {
    /// Wraps `inner` using the default frame limit.
    pub const fn new(inner: R) -> Self {
        Self::with_limit(inner, MAX_FRAME_BYTES)
    }

    /// Wraps `inner` with a custom frame limit.
    pub const fn with_limit(inner: R, limit: usize) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            discarding: false,
            limit,
        }
    }

    /// Returns a reference to the wrapped reader.
    pub const fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Reports whether bytes of an incomplete frame are buffered.
    pub fn has_partial(&self) -> bool {
        !self.buffer.is_empty() && !self.discarding
    }

    /// Reads until a frame completes, the stream ends, or a read times out.
    ///
    /// # Errors
    ///
    /// Returns I/O errors other than interruption and read timeouts.
    pub fn next_frame(&mut self) -> io::Result<ReadOutcome> {
        let mut chunk = [0_u8; READ_CHUNK_BYTES];
        loop {
            if let Some(outcome) = self.take_buffered_line() {
                return Ok(outcome);
            }
            if self.buffer.len() > self.limit {
                self.buffer.clear();
                self.discarding = true;
            }

            match self.inner.read(&mut chunk) {
                Ok(0) => return Ok(self.finish()),
                Ok(read) => self
                    .buffer
                    .extend_from_slice(chunk.get(..read).unwrap_or_default()),
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error)
                    if matches!(
                        error.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    return Ok(ReadOutcome::Idle);
                }
                Err(error) => return Err(error),
            }
        }
    }

    fn take_buffered_line(&mut self) -> Option<ReadOutcome> {
        loop {
            let position = self.buffer.iter().position(|byte| *byte == b'\n')?;
            let mut line: Vec<u8> = self.buffer.drain(..=position).collect();
            if self.discarding {
                self.discarding = false;
                return Some(ReadOutcome::Oversized);
            }
            trim_line_ending(&mut line);
            if line.len() > self.limit {
                return Some(ReadOutcome::Oversized);
            }
            if !line.iter().all(u8::is_ascii_whitespace) {
                return Some(ReadOutcome::Frame(line));
            }
        }
    }

    fn finish(&mut self) -> ReadOutcome {
        if self.discarding {
            self.discarding = false;
            self.buffer.clear();
            return ReadOutcome::Oversized;
        }
        let mut line = std::mem::take(&mut self.buffer);
        trim_line_ending(&mut line);
        if line.iter().all(u8::is_ascii_whitespace) {
            ReadOutcome::Eof
        } else if line.len() > self.limit {
            ReadOutcome::Oversized
        } else {
            ReadOutcome::Frame(line)
        }
    }
}

fn trim_line_ending(line: &mut Vec<u8>) {
    while matches!(line.last(), Some(b'\n' | b'\r')) {
        line.pop();
    }
}

/// Decodes one frame.
///
/// # Errors
///
/// Returns [`FrameError::Decode`] when the frame is not valid JSON for `T`.
pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T, FrameError> {
    serde_json::from_slice(frame).map_err(FrameError::Decode)
}

/// Serialises `value` as a single frame and flushes it to `writer`.
///
/// # Errors
///
/// Returns an error when encoding fails, the frame exceeds
/// [`MAX_FRAME_BYTES`], or the write fails.
pub fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), FrameError>
where
    W: Write + ?Sized,
    T: Serialize + ?Sized,
{
    let mut payload = serde_json::to_vec(value).map_err(FrameError::Encode)?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge {
            size: payload.len(),
            limit: MAX_FRAME_BYTES,
        });
    }
    payload.push(b'\n');
    writer.write_all(&payload).map_err(FrameError::Io)?;
    writer.flush().map_err(FrameError::Io)
}

/// Errors raised while encoding, decoding, or transmitting frames.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The value could not be serialised.
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
    /// The frame did not contain the expected JSON document.
    #[error("failed to decode frame: {0}")]
    Decode(#[source] serde_json::Error),
    /// The encoded frame exceeds the limit.
    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    TooLarge {
        /// Encoded size in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        limit: usize,
    },
    /// Connecting to or writing the channel failed.
    #[error("channel i/o failed: {0}")]
    Io(#[source] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::Cursor;

    /// Reader that replays scripted chunks and timeouts.
    struct Scripted {
        steps: VecDeque<Option<Vec<u8>>>,
    }

    impl Scripted {
        fn new(steps: Vec<Option<&[u8]>>) -> Self {
            Self {
                steps: steps.into_iter().map(|step| step.map(<[u8]>::to_vec)).collect(),
            }
        }
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.steps.pop_front() {
                None => Ok(0),
                Some(None) => Err(io::Error::new(io::ErrorKind::WouldBlock, "timeout")),
                Some(Some(bytes)) => {
                    let len = bytes.len().min(buf.len());
                    buf.get_mut(..len)
                        .expect("buffer slice")
                        .copy_from_slice(bytes.get(..len).expect("chunk slice"));
                    Ok(len)
                }
            }
        }
    }

    #[test]
    fn splits_lines_and_skips_blank_ones() {
        let mut reader = FrameReader::new(Cursor::new(b"{\"a\":1}\n\n{\"b\":2}\r\n".to_vec()));
        assert_eq!(
            reader.next_frame().expect("first"),
            ReadOutcome::Frame(b"{\"a\":1}".to_vec())
        );
        assert_eq!(
            reader.next_frame().expect("second"),
            ReadOutcome::Frame(b"{\"b\":2}".to_vec())
        );
        assert_eq!(reader.next_frame().expect("eof"), ReadOutcome::Eof);
    }

    #[test]
    fn keeps_partial_frames_across_timeouts() {
        let mut reader = FrameReader::new(Scripted::new(vec![
            Some(b"{\"tag\":".as_slice()),
            None,
            Some(b"\"x\"}\n".as_slice()),
        ]));
        assert_eq!(reader.next_frame().expect("idle"), ReadOutcome::Idle);
        assert!(reader.has_partial());
        assert_eq!(
            reader.next_frame().expect("frame"),
            ReadOutcome::Frame(b"{\"tag\":\"x\"}".to_vec())
        );
    }

    #[test]
    fn discards_oversized_frames_and_recovers() {
        let mut input = vec![b'x'; 64];
        input.push(b'\n');
        input.extend_from_slice(b"ok\n");
        let mut reader = FrameReader::with_limit(Cursor::new(input), 16);
        assert_eq!(reader.next_frame().expect("oversized"), ReadOutcome::Oversized);
        assert_eq!(
            reader.next_frame().expect("next"),
            ReadOutcome::Frame(b"ok".to_vec())
        );
    }

    #[test]
    fn trailing_frame_without_newline_is_delivered() {
        let mut reader = FrameReader::new(Cursor::new(b"last".to_vec()));
        assert_eq!(
            reader.next_frame().expect("frame"),
            ReadOutcome::Frame(b"last".to_vec())
        );
        assert_eq!(reader.next_frame().expect("eof"), ReadOutcome::Eof);
    }

    #[test]
    fn write_frame_rejects_oversized_payloads() {
        let big = "y".repeat(MAX_FRAME_BYTES + 1);
        let mut sink = Vec::new();
        let error = write_frame(&mut sink, &big).expect_err("payload too large");
        assert!(matches!(error, FrameError::TooLarge { .. }));
        assert!(sink.is_empty());
    }

    #[test]
    fn decode_reports_invalid_json() {
        let error = decode::<serde_json::Value>(b"{not json").expect_err("invalid");
        assert!(matches!(error, FrameError::Decode(_)));
    }
}
