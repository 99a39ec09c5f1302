//! Wire framing (length + crc32c).
//!
//! Zero-length frames are legal: an empty chunk payload is a valid frame on
//! the data plane, so corruption is caught by the checksum alone.

use std::io::{Read, Write};

use crc32c::crc32c;
use thiserror::Error;

pub const FRAME_HEADER_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame length invalid: {reason}")]
    FrameLengthInvalid { reason: String },
    #[error("frame too large: max {max_frame_bytes} got {got_bytes}")]
    FrameTooLarge {
        max_frame_bytes: usize,
        got_bytes: usize,
    },
    #[error("frame crc mismatch: expected {expected} got {got}")]
    FrameCrcMismatch { expected: u32, got: u32 },
}

/// Outcome of a timeout-aware read.
#[derive(Debug)]
pub enum NextFrame {
    Frame(Vec<u8>),
    /// The read timeout expired before the first header byte. Once a frame
    /// has started, reads keep retrying until it completes.
    TimedOut,
    /// Clean EOF on a frame boundary.
    Closed,
}

pub struct FrameReader<R> {
    reader: R,
    max_frame_bytes: usize,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            reader,
            max_frame_bytes,
        }
    }

    /// Read the next frame, blocking until one arrives or the stream ends.
    pub fn read_next(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        match self.read_next_inner(false)? {
            NextFrame::Frame(body) => Ok(Some(body)),
            NextFrame::Closed => Ok(None),
            NextFrame::TimedOut => unreachable!("timeouts surface only in timeout mode"),
        }
    }

    /// Read the next frame, treating a timeout before the first byte as
    /// [`NextFrame::TimedOut`] rather than an error. Requires a read timeout
    /// on the underlying stream.
    pub fn read_next_timeout(&mut self) -> Result<NextFrame, FrameError> {
        self.read_next_inner(true)
    }

    fn read_next_inner(&mut self, timeout_mode: bool) -> Result<NextFrame, FrameError> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        let mut read = 0usize;
        while read < header.len() {
            match self.reader.read(&mut header[read..]) {
                Ok(0) => {
                    if read == 0 {
                        return Ok(NextFrame::Closed);
                    }
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "frame header truncated",
                    )
                    .into());
                }
                Ok(n) => read += n,
                Err(err) if is_timeout(&err) => {
                    if timeout_mode && read == 0 {
                        return Ok(NextFrame::TimedOut);
                    }
                    // mid-frame: the rest is in flight, keep reading
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }

        let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if length > self.max_frame_bytes {
            return Err(FrameError::FrameTooLarge {
                max_frame_bytes: self.max_frame_bytes,
                got_bytes: length,
            });
        }

        let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let mut body = vec![0u8; length];
        let mut read_body = 0usize;
        while read_body < length {
            match self.reader.read(&mut body[read_body..]) {
                Ok(0) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "frame body truncated",
                    )
                    .into());
                }
                Ok(n) => read_body += n,
                Err(err) if is_timeout(&err) => continue,
                Err(err) => return Err(err.into()),
            }
        }

        let actual_crc = crc32c(&body);
        if actual_crc != expected_crc {
            return Err(FrameError::FrameCrcMismatch {
                expected: expected_crc,
                got: actual_crc,
            });
        }

        Ok(NextFrame::Frame(body))
    }
}

fn is_timeout(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

pub struct FrameWriter<W> {
    writer: W,
    max_frame_bytes: usize,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(writer: W, max_frame_bytes: usize) -> Self {
        Self {
            writer,
            max_frame_bytes,
        }
    }

    pub fn write_frame(&mut self, payload: &[u8]) -> Result<usize, FrameError> {
        let frame = encode_frame(payload, self.max_frame_bytes)?;
        self.writer.write_all(&frame)?;
        self.writer.flush()?;
        Ok(frame.len())
    }
}

pub fn encode_frame(payload: &[u8], max_frame_bytes: usize) -> Result<Vec<u8>, FrameError> {
    if payload.len() > max_frame_bytes {
        return Err(FrameError::FrameTooLarge {
            max_frame_bytes,
            got_bytes: payload.len(),
        });
    }
    let length = u32::try_from(payload.len()).map_err(|_| FrameError::FrameLengthInvalid {
        reason: "frame length exceeds u32".to_string(),
    })?;
    let crc = crc32c(payload);

    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(&crc.to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_roundtrip_validates_crc() {
        let payload = b"hello";
        let frame = encode_frame(payload, 1024).unwrap();

        let mut reader = FrameReader::new(Cursor::new(frame), 1024);
        let decoded = reader.read_next().unwrap().unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn empty_frame_roundtrips() {
        let frame = encode_frame(&[], 1024).unwrap();

        let mut reader = FrameReader::new(Cursor::new(frame), 1024);
        let decoded = reader.read_next().unwrap().unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn corrupted_body_fails_crc() {
        let mut frame = encode_frame(b"payload", 1024).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;

        let mut reader = FrameReader::new(Cursor::new(frame), 1024);
        let err = reader.read_next().unwrap_err();
        assert!(matches!(err, FrameError::FrameCrcMismatch { .. }));
    }

    #[test]
    fn reader_rejects_oversize_frame() {
        let payload = vec![0u8; 10];
        let frame = encode_frame(&payload, 1024).unwrap();

        let mut reader = FrameReader::new(Cursor::new(frame), 5);
        let err = reader.read_next().unwrap_err();
        assert!(matches!(err, FrameError::FrameTooLarge { .. }));
    }

    #[test]
    fn eof_on_boundary_is_closed() {
        let mut reader = FrameReader::new(Cursor::new(Vec::new()), 1024);
        assert!(reader.read_next().unwrap().is_none());
    }

    #[test]
    fn truncated_header_is_an_error() {
        let frame = encode_frame(b"hi", 1024).unwrap();
        let mut reader = FrameReader::new(Cursor::new(frame[..4].to_vec()), 1024);
        assert!(reader.read_next().is_err());
    }
}
