//! A byte cursor over a [`Buffer`].

use crate::buffer::{Buffer, Endianness, Readable};
use crate::error::{FormatError, IoError, Result, bail};

/// A cursor over a bounded buffer with a mutable byte order.
///
/// The position never exceeds the end of the buffer. Positions and sub-stream offsets use
/// the buffer's address space: [`ByteStream::get_sub_stream`] takes an offset measured from
/// the start of the buffer (not from the cursor), while [`ByteStream::get_stream`] takes the
/// next bytes at the cursor.
#[derive(Debug, Clone, Copy)]
pub struct ByteStream<'a> {
    buffer: Buffer<'a>,
    pos: u32,
    endianness: Endianness,
}

impl<'a> ByteStream<'a> {
    /// Create a new cursor at the start of `buffer`.
    pub fn new(buffer: Buffer<'a>, endianness: Endianness) -> Self {
        Self {
            buffer,
            pos: buffer.origin(),
            endianness,
        }
    }

    /// Create a cursor directly from a slice.
    pub fn from_slice(data: &'a [u8], endianness: Endianness) -> Result<Self> {
        Ok(Self::new(Buffer::new(data)?, endianness))
    }

    /// The underlying buffer.
    #[inline]
    pub fn buffer(&self) -> Buffer<'a> {
        self.buffer
    }

    /// The current byte order.
    #[inline]
    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    /// Change the byte order.
    #[inline]
    pub fn set_endianness(&mut self, endianness: Endianness) {
        self.endianness = endianness;
    }

    /// The current position.
    #[inline]
    pub fn position(&self) -> u32 {
        self.pos
    }

    /// Move the cursor to `pos`. Moving to the very end is allowed.
    pub fn set_position(&mut self, pos: u32) -> Result<()> {
        if !self.buffer.is_valid(pos as u64, 0) {
            bail!(IoError::BufferOverflow {
                offset: pos as u64,
                count: 0,
                size: self.buffer.end(),
            });
        }

        self.pos = pos;

        Ok(())
    }

    /// The size of the stream, including the bytes before the cursor.
    #[inline]
    pub fn size(&self) -> u32 {
        self.buffer.end() as u32
    }

    /// The number of bytes after the cursor.
    #[inline]
    pub fn remain_size(&self) -> u32 {
        (self.buffer.end() - self.pos as u64) as u32
    }

    /// Whether the cursor is at the end.
    #[inline]
    pub fn at_end(&self) -> bool {
        self.remain_size() == 0
    }

    /// Ensure that `bytes` bytes are available at the cursor.
    #[inline]
    pub fn check(&self, bytes: u32) -> Result<u32> {
        if !self.buffer.is_valid(self.pos as u64, bytes as u64) {
            bail!(IoError::BufferOverflow {
                offset: self.pos as u64,
                count: bytes as u64,
                size: self.buffer.end(),
            });
        }

        Ok(bytes)
    }

    /// Ensure that `count` elements of `elem_size` bytes are available at the cursor.
    ///
    /// Used before loops that would otherwise only fail after doing a lot of work.
    pub fn check_elements(&self, count: u32, elem_size: u32) -> Result<u32> {
        let bytes = count.checked_mul(elem_size).ok_or(IoError::SizeOverflow)?;

        self.check(bytes)
    }

    /// Advance the cursor by `bytes`.
    #[inline]
    pub fn skip_bytes(&mut self, bytes: u32) -> Result<()> {
        self.pos += self.check(bytes)?;

        Ok(())
    }

    /// Advance the cursor by `count` elements of `elem_size` bytes.
    pub fn skip_elements(&mut self, count: u32, elem_size: u32) -> Result<()> {
        self.pos += self.check_elements(count, elem_size)?;

        Ok(())
    }

    /// The bytes from the cursor to the end.
    pub fn peek_remaining(&self) -> &'a [u8] {
        let start = (self.pos - self.buffer.origin()) as usize;

        &self.buffer.data()[start..]
    }

    /// Peek at the next `count` bytes.
    pub fn peek_bytes(&self, count: u32) -> Result<&'a [u8]> {
        self.buffer.get(self.pos, count)
    }

    /// Read the next `count` bytes.
    pub fn get_bytes(&mut self, count: u32) -> Result<&'a [u8]> {
        let bytes = self.peek_bytes(count)?;
        self.pos += count;

        Ok(bytes)
    }

    /// Peek at the value at the cursor.
    #[inline]
    pub fn peek<T: Readable>(&self) -> Result<T> {
        self.buffer.read(self.pos, 0, self.endianness)
    }

    /// Read the value at the cursor.
    #[inline]
    pub fn get<T: Readable>(&mut self) -> Result<T> {
        let value = self.peek::<T>()?;
        self.pos += T::SIZE as u32;

        Ok(value)
    }

    /// Read `count` values at the cursor.
    pub fn get_array<T: Readable>(&mut self, count: u32) -> Result<Vec<T>> {
        self.check_elements(count, T::SIZE as u32)?;

        (0..count).map(|_| self.get::<T>()).collect()
    }

    /// Peek at the byte `index` bytes after the cursor.
    pub fn peek_u8(&self, index: u32) -> Result<u8> {
        self.buffer.read_u8(self.pos.saturating_add(index))
    }

    /// Read a byte.
    pub fn get_u8(&mut self) -> Result<u8> {
        self.get()
    }

    /// Read a 16-bit unsigned integer.
    pub fn get_u16(&mut self) -> Result<u16> {
        self.get()
    }

    /// Read a 32-bit unsigned integer.
    pub fn get_u32(&mut self) -> Result<u32> {
        self.get()
    }

    /// Read a 64-bit unsigned integer.
    pub fn get_u64(&mut self) -> Result<u64> {
        self.get()
    }

    /// Read a 16-bit signed integer.
    pub fn get_i16(&mut self) -> Result<i16> {
        self.get()
    }

    /// Read a 32-bit signed integer.
    pub fn get_i32(&mut self) -> Result<i32> {
        self.get()
    }

    /// Read a 32-bit float.
    pub fn get_f32(&mut self) -> Result<f32> {
        self.get()
    }

    /// Peek at a 16-bit unsigned integer.
    pub fn peek_u16(&self) -> Result<u16> {
        self.peek()
    }

    /// Peek at a 32-bit unsigned integer.
    pub fn peek_u32(&self) -> Result<u32> {
        self.peek()
    }

    /// A stream over `size` bytes at the buffer-absolute `offset`.
    pub fn get_sub_stream(&self, offset: u32, size: u32) -> Result<ByteStream<'a>> {
        Ok(Self::new(
            self.buffer.get_sub_view(offset, size)?,
            self.endianness,
        ))
    }

    /// A stream over everything from the buffer-absolute `offset` to the end.
    pub fn get_sub_stream_from(&self, offset: u32) -> Result<ByteStream<'a>> {
        Ok(Self::new(
            self.buffer.get_sub_view_from(offset)?,
            self.endianness,
        ))
    }

    /// A stream over the next `size` bytes, without advancing.
    pub fn peek_stream(&self, size: u32) -> Result<ByteStream<'a>> {
        self.get_sub_stream(self.pos, size)
    }

    /// A stream over the next `size` bytes; the cursor advances past them.
    pub fn get_stream(&mut self, size: u32) -> Result<ByteStream<'a>> {
        let stream = self.peek_stream(size)?;
        self.pos += size;

        Ok(stream)
    }

    /// A stream over the next `count` elements of `elem_size` bytes.
    pub fn get_stream_elements(&mut self, count: u32, elem_size: u32) -> Result<ByteStream<'a>> {
        let size = count.checked_mul(elem_size).ok_or(IoError::SizeOverflow)?;

        self.get_stream(size)
    }

    /// Re-address the remaining bytes so that the cursor position becomes `new_position`.
    ///
    /// The new stream covers `size` bytes starting at the cursor and is positioned at
    /// `new_position`. Offsets below `new_position` are invalid in the new stream.
    pub fn rebase(&self, new_position: u32, size: u32) -> Result<ByteStream<'a>> {
        let buffer = self.buffer.rebase(self.pos, new_position, size)?;

        Ok(Self {
            buffer,
            pos: new_position,
            endianness: self.endianness,
        })
    }

    /// Whether the bytes at the cursor start with `prefix`.
    pub fn has_prefix(&self, prefix: &[u8]) -> bool {
        self.has_pattern_at(prefix, 0)
    }

    /// Whether `pattern` is found `offset` bytes after the cursor.
    pub fn has_pattern_at(&self, pattern: &[u8], offset: u32) -> bool {
        self.buffer
            .get(self.pos.saturating_add(offset), pattern.len() as u32)
            .is_ok_and(|bytes| bytes == pattern)
    }

    /// Skip `prefix` if the bytes at the cursor start with it.
    pub fn skip_prefix(&mut self, prefix: &[u8]) -> bool {
        let has = self.has_prefix(prefix);

        if has {
            self.pos += prefix.len() as u32;
        }

        has
    }

    /// Peek at a NUL-terminated string at the cursor, without the terminator.
    pub fn peek_string(&self) -> Result<&'a str> {
        let bytes = self.peek_remaining();
        let end = bytes
            .iter()
            .position(|b| *b == 0)
            .ok_or(IoError::UnterminatedString)?;

        core::str::from_utf8(&bytes[..end])
            .map_err(|_| FormatError::Corrupt("string is not valid UTF-8").into())
    }

    /// Read a NUL-terminated string, consuming the terminator.
    pub fn get_string(&mut self) -> Result<&'a str> {
        let s = self.peek_string()?;
        self.pos += s.len() as u32 + 1;

        Ok(s)
    }

    /// Read a fixed-length string with trailing NULs removed.
    pub fn get_fixed_string(&mut self, len: u32) -> Result<String> {
        let bytes = self.get_bytes(len)?;
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());

        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }

    /// Read a TIFF-style byte order marker.
    pub fn get_byte_order_marker(&mut self) -> Result<Endianness> {
        let bytes = self.peek_bytes(2)?;
        let endianness = Endianness::from_marker([bytes[0], bytes[1]])
            .ok_or(FormatError::InvalidSignature("byte order"))?;
        self.pos += 2;

        Ok(endianness)
    }

    /// The absolute range of the next `size` bytes in the root allocation.
    pub(crate) fn range_at(&self, offset: u32, size: u32) -> crate::ranges::Range {
        crate::ranges::Range::new(self.buffer.absolute(offset), size as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DecodeError;

    #[test]
    fn typed_reads() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        let mut bs = ByteStream::from_slice(&data, Endianness::Big).unwrap();

        assert_eq!(bs.get_u16().unwrap(), 0x0102);
        bs.set_endianness(Endianness::Little);
        assert_eq!(bs.get_u16().unwrap(), 0x0403);
        assert_eq!(bs.remain_size(), 4);
        assert!(bs.get_u64().is_err());
        assert_eq!(bs.position(), 4);
        assert_eq!(bs.get_u32().unwrap(), 0x08070605);
        assert!(bs.at_end());
        assert!(bs.get_u8().is_err());
    }

    #[test]
    fn check_elements_overflow() {
        let data = [0; 16];
        let bs = ByteStream::from_slice(&data, Endianness::Little).unwrap();

        assert!(bs.check_elements(4, 4).is_ok());
        assert!(bs.check_elements(5, 4).is_err());
        assert!(matches!(
            bs.check_elements(u32::MAX, 2),
            Err(DecodeError::Io(IoError::SizeOverflow))
        ));
    }

    #[test]
    fn sub_streams() {
        let data: Vec<u8> = (0..32).collect();
        let mut bs = ByteStream::from_slice(&data, Endianness::Little).unwrap();
        bs.skip_bytes(10).unwrap();

        // Sub-streams are addressed from the start of the buffer.
        let sub = bs.get_sub_stream(4, 2).unwrap();
        assert_eq!(sub.peek_remaining(), &[4, 5]);

        // Streams are taken at the cursor.
        let taken = bs.get_stream(3).unwrap();
        assert_eq!(taken.peek_remaining(), &[10, 11, 12]);
        assert_eq!(bs.position(), 13);
        assert!(bs.get_stream(100).is_err());
    }

    #[test]
    fn strings() {
        let data = b"Canon\0EOS\0\0\0abc";
        let mut bs = ByteStream::from_slice(data, Endianness::Little).unwrap();

        assert_eq!(bs.peek_string().unwrap(), "Canon");
        assert_eq!(bs.get_string().unwrap(), "Canon");
        assert_eq!(bs.get_fixed_string(6).unwrap(), "EOS");
        assert!(matches!(
            bs.get_string(),
            Err(DecodeError::Io(IoError::UnterminatedString))
        ));
    }

    #[test]
    fn prefixes() {
        let data = b"AdobeMakN";
        let mut bs = ByteStream::from_slice(data, Endianness::Little).unwrap();

        assert!(bs.has_pattern_at(b"MakN", 5));
        assert!(!bs.skip_prefix(b"Apple"));
        assert!(bs.skip_prefix(b"Adobe"));
        assert!(bs.has_prefix(b"MakN"));
        assert!(!bs.has_prefix(b"MakNX"));
    }

    #[test]
    fn rebase() {
        let data: Vec<u8> = (0..32).collect();
        let mut bs = ByteStream::from_slice(&data, Endianness::Little).unwrap();
        bs.skip_bytes(8).unwrap();

        let rebased = bs.rebase(1000, 8).unwrap();
        assert_eq!(rebased.position(), 1000);
        assert_eq!(rebased.get_sub_stream(1002, 2).unwrap().peek_remaining(), &[10, 11]);
        assert!(rebased.get_sub_stream(999, 2).is_err());
    }

    #[test]
    fn byte_order_marker() {
        let mut bs = ByteStream::from_slice(b"MMII??", Endianness::Unknown).unwrap();

        assert_eq!(bs.get_byte_order_marker().unwrap(), Endianness::Big);
        assert_eq!(bs.get_byte_order_marker().unwrap(), Endianness::Little);
        assert!(bs.get_byte_order_marker().is_err());
    }
}
