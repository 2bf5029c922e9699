use bytes::{Buf, Bytes, BytesMut};
use log::{trace, warn};
use std::cell::RefCell;
use std::io::ErrorKind;
use tether::{Context, Handler, Unit, WriteFuture};

use crate::length_field_prepender::SUPPORTED_FIELD_LENGTHS;

/// Inbound handler that splits a byte stream into frames carrying a binary
/// length prefix, the counterpart of [`LengthFieldPrepender`](crate::LengthFieldPrepender).
///
/// Bytes are buffered until a whole frame is available. The prefix itself is
/// stripped from every frame unless [`initial_bytes_to_strip`] says otherwise.
/// A frame longer than `max_frame_length` is reported through
/// `fire_handle_read_exception` and the buffered bytes are discarded.
///
/// [`initial_bytes_to_strip`]: LengthFieldBasedFrameDecoder::initial_bytes_to_strip
pub struct LengthFieldBasedFrameDecoder {
    length_field_length: usize,
    max_frame_length: usize,
    length_adjustment: i64,
    initial_bytes_to_strip: usize,
    big_endian: bool,
    buffer: RefCell<BytesMut>,
}

impl LengthFieldBasedFrameDecoder {
    /// Creates a decoder for a `length_field_length` byte, big-endian prefix.
    pub fn new(length_field_length: usize, max_frame_length: usize) -> Result<Self, std::io::Error> {
        if !SUPPORTED_FIELD_LENGTHS.contains(&length_field_length) {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!(
                    "length_field_length must be either 1, 2, 3, 4, or 8: {}",
                    length_field_length
                ),
            ));
        }
        Ok(Self {
            length_field_length,
            max_frame_length,
            length_adjustment: 0,
            initial_bytes_to_strip: length_field_length,
            big_endian: true,
            buffer: RefCell::new(BytesMut::new()),
        })
    }

    /// Value added to the decoded length to obtain the number of bytes that follow the field.
    pub fn length_adjustment(mut self, adjustment: i64) -> Self {
        self.length_adjustment = adjustment;
        self
    }

    /// Number of bytes removed from the start of every frame. Defaults to the field width.
    pub fn initial_bytes_to_strip(mut self, strip: usize) -> Self {
        self.initial_bytes_to_strip = strip;
        self
    }

    /// Reads the field in little-endian byte order.
    pub fn little_endian(mut self) -> Self {
        self.big_endian = false;
        self
    }

    /// Removes the next complete frame from `src`.
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Bytes>, std::io::Error> {
        if src.len() < self.length_field_length {
            return Ok(None);
        }

        let mut head = &src[..self.length_field_length];
        let length = if self.big_endian {
            head.get_uint(self.length_field_length)
        } else {
            head.get_uint_le(self.length_field_length)
        };

        let body = i128::from(length) + i128::from(self.length_adjustment);
        if body < 0 {
            return Err(std::io::Error::new(
                ErrorKind::InvalidData,
                format!("negative frame length after adjustment: {}", body),
            ));
        }
        let frame_length = self.length_field_length as i128 + body;
        if frame_length > self.max_frame_length as i128 {
            return Err(std::io::Error::new(
                ErrorKind::InvalidData,
                format!(
                    "frame length exceeds {}: {}",
                    self.max_frame_length, frame_length
                ),
            ));
        }
        let frame_length = frame_length as usize;
        if self.initial_bytes_to_strip > frame_length {
            return Err(std::io::Error::new(
                ErrorKind::InvalidData,
                format!(
                    "frame length ({}) is less than initial_bytes_to_strip ({})",
                    frame_length, self.initial_bytes_to_strip
                ),
            ));
        }

        if src.len() < frame_length {
            src.reserve(frame_length - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(frame_length);
        frame.advance(self.initial_bytes_to_strip);
        Ok(Some(frame.freeze()))
    }
}

impl Handler for LengthFieldBasedFrameDecoder {
    type Rin = BytesMut;
    type Rout = Bytes;
    type Win = Unit;
    type Wout = Unit;

    fn name(&self) -> &str {
        "LengthFieldBasedFrameDecoder"
    }

    fn handle_read(&self, ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>, msg: Self::Rin) {
        self.buffer.borrow_mut().unsplit(msg);
        loop {
            // released before the frame travels on, a later stage may read again
            let decoded = self.decode(&mut self.buffer.borrow_mut());
            match decoded {
                Ok(Some(frame)) => {
                    trace!("decoded {} byte frame", frame.len());
                    ctx.fire_handle_read(frame);
                }
                Ok(None) => break,
                Err(err) => {
                    self.buffer.borrow_mut().clear();
                    ctx.fire_handle_read_exception(Box::new(err));
                    break;
                }
            }
        }
    }

    fn handle_read_eof(&self, ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>) {
        let leftover = self.buffer.borrow().len();
        if leftover > 0 {
            warn!("discarding {} bytes of a partial frame at end of input", leftover);
            self.buffer.borrow_mut().clear();
        }
        ctx.fire_handle_read_eof();
    }

    fn handle_write(
        &self,
        _ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>,
        msg: Self::Win,
    ) -> WriteFuture {
        msg.unreachable()
    }
}
