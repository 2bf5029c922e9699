use bytes::{BufMut, Bytes, BytesMut};
use log::trace;
use std::io::ErrorKind;
use tether::{write_error, Context, Handler, Unit, WriteFuture};

/// Field widths a length prefix may use.
pub const SUPPORTED_FIELD_LENGTHS: [usize; 5] = [1, 2, 3, 4, 8];

/// Outbound handler that prepends the length of every message as a binary field.
///
/// With a 2 byte field, the 12 byte message `"HELLO, WORLD"` is written as
///
/// ```text
/// +--------+----------------+
/// | 0x000C | "HELLO, WORLD" |
/// +--------+----------------+
/// ```
///
/// and with [`length_includes_length_field`](LengthFieldPrepender::length_includes_length_field)
/// the prefix becomes `0x000E` (12 bytes of data plus the 2 byte field).
///
/// ```rust
/// use bytes::Bytes;
/// use tether_codec::LengthFieldPrepender;
///
/// let prepender = LengthFieldPrepender::new(2)?;
/// assert_eq!(prepender.encode(Bytes::from_static(b"HELLO, WORLD"))?[..2], [0x00, 0x0C]);
/// # Ok::<(), std::io::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct LengthFieldPrepender {
    length_field_length: usize,
    length_adjustment: i64,
    length_includes_length_field: bool,
    big_endian: bool,
}

impl LengthFieldPrepender {
    /// Creates a prepender with a `length_field_length` byte, big-endian prefix.
    ///
    /// Fails with `InvalidInput` unless the width is one of
    /// [`SUPPORTED_FIELD_LENGTHS`].
    pub fn new(length_field_length: usize) -> Result<Self, std::io::Error> {
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
            length_adjustment: 0,
            length_includes_length_field: false,
            big_endian: true,
        })
    }

    /// Adds `adjustment` to every encoded length.
    pub fn length_adjustment(mut self, adjustment: i64) -> Self {
        self.length_adjustment = adjustment;
        self
    }

    /// Counts the field itself in the encoded length.
    pub fn length_includes_length_field(mut self, includes: bool) -> Self {
        self.length_includes_length_field = includes;
        self
    }

    /// Writes the field in network byte order (the default).
    pub fn big_endian(mut self) -> Self {
        self.big_endian = true;
        self
    }

    /// Writes the field in little-endian byte order.
    pub fn little_endian(mut self) -> Self {
        self.big_endian = false;
        self
    }

    fn frame_length(&self, payload: usize) -> Result<u64, std::io::Error> {
        let mut length = payload as i64 + self.length_adjustment;
        if self.length_includes_length_field {
            length += self.length_field_length as i64;
        }
        if length < 0 {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("Adjusted frame length ({}) is less than zero", length),
            ));
        }

        let length = length as u64;
        let bits = self.length_field_length * 8;
        if bits < u64::BITS as usize && length >= 1u64 << bits {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!(
                    "length does not fit into a {} byte field: {}",
                    self.length_field_length, length
                ),
            ));
        }
        Ok(length)
    }

    /// Returns `msg` with its length field in front.
    pub fn encode(&self, msg: Bytes) -> Result<Bytes, std::io::Error> {
        let length = self.frame_length(msg.len())?;

        let mut buf = BytesMut::with_capacity(self.length_field_length + msg.len());
        if self.big_endian {
            buf.put_uint(length, self.length_field_length);
        } else {
            buf.put_uint_le(length, self.length_field_length);
        }
        buf.put(msg);
        Ok(buf.freeze())
    }
}

impl Handler for LengthFieldPrepender {
    type Rin = Unit;
    type Rout = Unit;
    type Win = Bytes;
    type Wout = Bytes;

    fn name(&self) -> &str {
        "LengthFieldPrepender"
    }

    fn handle_read(&self, _ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>, msg: Self::Rin) {
        msg.unreachable()
    }

    fn handle_write(
        &self,
        ctx: &Context<Self::Rin, Self::Rout, Self::Win, Self::Wout>,
        msg: Self::Win,
    ) -> WriteFuture {
        match self.encode(msg) {
            Ok(frame) => {
                trace!("prepended {} byte length field", self.length_field_length);
                ctx.fire_handle_write(frame)
            }
            Err(err) => write_error(err.kind(), err.to_string()),
        }
    }
}
