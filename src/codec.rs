use bytes::{Buf, BufMut, BytesMut};
use std::convert::TryInto;
use std::io::Cursor;
use tokio_util::codec::{Decoder, Encoder};

use crate::command::Command;
use crate::frame::{self, Frame};
use crate::Error;

/// 512 MiB, the largest bulk string a Redis server accepts.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 512 * 1024 * 1024;

/// Appends the wire form of `command` to `dst`: an array header followed by one bulk string per
/// argument.
pub fn encode(command: &Command, dst: &mut BytesMut) {
    let args = command.as_slice();
    let payload: usize = args.iter().map(|arg| arg.len() + 16).sum();
    dst.reserve(16 + payload);

    dst.put_u8(b'*');
    dst.put_slice(args.len().to_string().as_bytes());
    dst.put_slice(b"\r\n");

    for arg in args {
        dst.put_u8(b'$');
        dst.put_slice(arg.len().to_string().as_bytes());
        dst.put_slice(b"\r\n");
        dst.put_slice(arg);
        dst.put_slice(b"\r\n");
    }
}

/// Removes one complete frame from the front of `src`.
///
/// Returns `Ok(None)` and leaves `src` untouched when it does not yet hold a whole frame.
pub fn decode(src: &mut BytesMut) -> Result<Option<Frame>, Error> {
    let mut cursor = Cursor::new(&src[..]);
    let frame = match Frame::parse(&mut cursor) {
        Ok(frame) => frame,
        Err(frame::Error::Incomplete) => return Ok(None), // Not enough data to parse a frame.
        Err(err) => return Err(err.into()),
    };

    let position: usize = cursor
        .position()
        .try_into()
        .map_err(|_| Error::Protocol("frame position overflow".to_string()))?;

    // Remove the parsed frame from the buffer.
    src.advance(position);

    Ok(Some(frame))
}

#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> FrameCodec {
        FrameCodec { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        FrameCodec::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match decode(src)? {
            Some(frame) => Ok(Some(frame)),
            // A peer that keeps streaming without ever completing a frame would otherwise grow the
            // buffer forever.
            None if src.len() > self.max_frame_size => {
                Err(Error::FrameTooLarge(self.max_frame_size))
            }
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            None => Err(Error::Protocol(format!(
                "connection closed with {} bytes of a truncated frame",
                buf.len()
            ))),
        }
    }
}

impl Encoder<Command> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, command: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode(&command, dst);
        Ok(())
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&frame.serialize());
        Ok(())
    }
}
