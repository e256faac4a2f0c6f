//! Peer stream framing: u32 LE body length + u32 LE crc32c, then the body.

use std::io::{Read, Write};

use crc32c::crc32c;
use thiserror::Error;

use super::proto::{
    ProtoDecodeError, ProtoEncodeError, ReplMessage, decode_repl_message, encode_repl_message,
};
use crate::core::Limits;

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
    #[error(transparent)]
    Encode(#[from] ProtoEncodeError),
    #[error(transparent)]
    Decode(#[from] ProtoDecodeError),
}

impl FrameError {
    /// Corruption and oversize frames poison the stream; io errors may be a
    /// transient disconnect.
    pub fn is_stream_fatal(&self) -> bool {
        !matches!(self, FrameError::Io(_))
    }
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

    /// Next frame body, or `None` on a clean end of stream.
    pub fn read_next(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        if !read_full(&mut self.reader, &mut header, true)? {
            return Ok(None);
        }

        let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if length == 0 {
            return Err(FrameError::FrameLengthInvalid {
                reason: "frame length cannot be zero".to_string(),
            });
        }
        if length > self.max_frame_bytes {
            return Err(FrameError::FrameTooLarge {
                max_frame_bytes: self.max_frame_bytes,
                got_bytes: length,
            });
        }

        let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let mut body = vec![0u8; length];
        read_full(&mut self.reader, &mut body, false)?;

        let actual_crc = crc32c(&body);
        if actual_crc != expected_crc {
            return Err(FrameError::FrameCrcMismatch {
                expected: expected_crc,
                got: actual_crc,
            });
        }
        Ok(Some(body))
    }

    pub fn read_message(&mut self, limits: &Limits) -> Result<Option<ReplMessage>, FrameError> {
        match self.read_next()? {
            Some(body) => Ok(Some(decode_repl_message(&body, limits)?)),
            None => Ok(None),
        }
    }
}

/// Fills `buf`. Returns `false` only when `eof_ok` and nothing was read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8], eof_ok: bool) -> Result<bool, FrameError> {
    let mut read = 0usize;
    while read < buf.len() {
        let n = reader.read(&mut buf[read..])?;
        if n == 0 {
            if read == 0 && eof_ok {
                return Ok(false);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "frame truncated",
            )
            .into());
        }
        read += n;
    }
    Ok(true)
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
        Ok(frame.len())
    }

    pub fn write_message(&mut self, message: &ReplMessage) -> Result<usize, FrameError> {
        let body = encode_repl_message(message)?;
        let written = self.write_frame(&body)?;
        self.writer.flush()?;
        Ok(written)
    }

    pub fn into_inner(self) -> W {
        self.writer
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
