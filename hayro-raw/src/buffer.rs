//! Bounds-checked views over immutable input bytes.
//!
//! Every access is validated against the view's length with 64-bit arithmetic, so a hostile
//! `offset + count` pair can never wrap around. Views only ever narrow: a sub-view is always
//! contained in the view it was carved from.

use crate::error::{FormatError, IoError, Result, bail};
use crate::ranges::Range;

/// The number of zeroed bytes appended to owned input buffers.
///
/// The margin is never semantically valid data. Bit readers may fetch up to this many bytes
/// past the end of their input (and see zeros), after which they fail.
pub const MARGIN: usize = 16;

/// The byte order used to interpret multi-byte values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endianness {
    /// Least significant byte first (`II`).
    Little,
    /// Most significant byte first (`MM`).
    Big,
    /// Not determined yet.
    #[default]
    Unknown,
}

impl Endianness {
    /// Interpret a TIFF-style byte order marker.
    pub fn from_marker(marker: [u8; 2]) -> Option<Self> {
        match &marker {
            b"II" => Some(Self::Little),
            b"MM" => Some(Self::Big),
            _ => None,
        }
    }
}

/// A value that can be read from a buffer.
pub trait Readable: Copy {
    /// The size of the value in bytes.
    const SIZE: usize;

    /// Decode the value from exactly `SIZE` bytes.
    fn from_bytes(bytes: &[u8], endianness: Endianness) -> Result<Self>;
}

macro_rules! readable {
    ($($ty:ty),*) => {
        $(
            impl Readable for $ty {
                const SIZE: usize = size_of::<$ty>();

                #[inline]
                fn from_bytes(bytes: &[u8], endianness: Endianness) -> Result<Self> {
                    let arr: [u8; size_of::<$ty>()] = core::array::from_fn(|i| bytes[i]);

                    match endianness {
                        Endianness::Little => Ok(<$ty>::from_le_bytes(arr)),
                        Endianness::Big => Ok(<$ty>::from_be_bytes(arr)),
                        Endianness::Unknown if Self::SIZE == 1 => Ok(<$ty>::from_le_bytes(arr)),
                        Endianness::Unknown => bail!(FormatError::UnknownByteOrder),
                    }
                }
            }
        )*
    };
}

readable!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

/// A borrowed, bounds-checked view of input bytes.
///
/// Offsets passed to a buffer are interpreted relative to its `origin`, which is `0` for every
/// ordinary view. A rebased view (see [`Buffer::rebase`]) has a non-zero origin so that
/// offsets recorded in a different address space still resolve to the right bytes.
#[derive(Debug, Clone, Copy)]
pub struct Buffer<'a> {
    data: &'a [u8],
    origin: u32,
    base: u64,
}

impl<'a> Buffer<'a> {
    /// Create a new view over `data`.
    ///
    /// Fails if `data` is longer than what 32-bit offsets can address.
    pub fn new(data: &'a [u8]) -> Result<Self> {
        if u32::try_from(data.len()).is_err() {
            bail!(IoError::InputTooLarge);
        }

        Ok(Self {
            data,
            origin: 0,
            base: 0,
        })
    }

    /// The first valid offset of this view.
    #[inline]
    pub fn origin(&self) -> u32 {
        self.origin
    }

    /// The number of bytes in this view.
    #[inline]
    pub fn len(&self) -> u32 {
        self.data.len() as u32
    }

    /// Whether the view is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// One past the last valid offset of this view.
    #[inline]
    pub fn end(&self) -> u64 {
        self.origin as u64 + self.data.len() as u64
    }

    /// The underlying bytes.
    #[inline]
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Whether `count` bytes at `offset` are inside the view.
    #[inline]
    pub fn is_valid(&self, offset: u64, count: u64) -> bool {
        offset >= self.origin as u64
            && offset
                .checked_add(count)
                .is_some_and(|end| end <= self.end())
    }

    fn check(&self, offset: u64, count: u64) -> Result<usize> {
        if !self.is_valid(offset, count) {
            bail!(IoError::BufferOverflow {
                offset,
                count,
                size: self.end(),
            });
        }

        Ok((offset - self.origin as u64) as usize)
    }

    /// Get `count` bytes starting at `offset`.
    pub fn get(&self, offset: u32, count: u32) -> Result<&'a [u8]> {
        let start = self.check(offset as u64, count as u64)?;

        Ok(&self.data[start..start + count as usize])
    }

    /// Carve out `size` bytes starting at `offset` as a new view with origin `0`.
    pub fn get_sub_view(&self, offset: u32, size: u32) -> Result<Buffer<'a>> {
        let start = self.check(offset as u64, size as u64)?;

        Ok(Self {
            data: &self.data[start..start + size as usize],
            origin: 0,
            base: self.base + start as u64,
        })
    }

    /// Carve out everything from `offset` to the end.
    pub fn get_sub_view_from(&self, offset: u32) -> Result<Buffer<'a>> {
        let size = self.end().saturating_sub(offset as u64) as u32;

        self.get_sub_view(offset, size)
    }

    /// Re-address the bytes starting at `offset` so that they appear at `new_origin`.
    ///
    /// The resulting view covers at most `size` bytes.
    pub fn rebase(&self, offset: u32, new_origin: u32, size: u32) -> Result<Buffer<'a>> {
        let view = self.get_sub_view(offset, size)?;

        if new_origin as u64 + size as u64 > u32::MAX as u64 {
            bail!(IoError::SizeOverflow);
        }

        Ok(Self {
            origin: new_origin,
            ..view
        })
    }

    /// Read the `index`-th value of type `T` starting at `offset`.
    #[inline]
    pub fn read<T: Readable>(&self, offset: u32, index: u32, endianness: Endianness) -> Result<T> {
        let start = offset as u64 + index as u64 * T::SIZE as u64;
        let start = self.check(start, T::SIZE as u64)?;

        T::from_bytes(&self.data[start..start + T::SIZE], endianness)
    }

    /// Read a byte.
    pub fn read_u8(&self, offset: u32) -> Result<u8> {
        self.read(offset, 0, Endianness::Little)
    }

    /// Read a 16-bit unsigned integer.
    pub fn read_u16(&self, offset: u32, endianness: Endianness) -> Result<u16> {
        self.read(offset, 0, endianness)
    }

    /// Read a 32-bit unsigned integer.
    pub fn read_u32(&self, offset: u32, endianness: Endianness) -> Result<u32> {
        self.read(offset, 0, endianness)
    }

    /// Read a 64-bit unsigned integer.
    pub fn read_u64(&self, offset: u32, endianness: Endianness) -> Result<u64> {
        self.read(offset, 0, endianness)
    }

    /// Read a 16-bit signed integer.
    pub fn read_i16(&self, offset: u32, endianness: Endianness) -> Result<i16> {
        self.read(offset, 0, endianness)
    }

    /// Read a 32-bit signed integer.
    pub fn read_i32(&self, offset: u32, endianness: Endianness) -> Result<i32> {
        self.read(offset, 0, endianness)
    }

    /// Read a 32-bit float.
    pub fn read_f32(&self, offset: u32, endianness: Endianness) -> Result<f32> {
        self.read(offset, 0, endianness)
    }

    /// The half-open byte range covered by this view, measured in the root allocation.
    pub fn range(&self) -> Range {
        Range::new(self.base, self.data.len() as u64)
    }

    /// The position of `offset` in the root allocation.
    pub(crate) fn absolute(&self, offset: u32) -> u64 {
        (self.base + offset as u64).saturating_sub(self.origin as u64)
    }
}

/// An owning input buffer with a zeroed padding margin.
#[derive(Debug, Clone)]
pub struct OwnedBuffer {
    storage: Vec<u8>,
    len: usize,
}

impl OwnedBuffer {
    /// Take ownership of `data` and append the padding margin.
    pub fn new(mut data: Vec<u8>) -> Result<Self> {
        let len = data.len();

        if u32::try_from(len).is_err() {
            bail!(IoError::InputTooLarge);
        }

        data.resize(len + MARGIN, 0);

        Ok(Self { storage: data, len })
    }

    /// A view of the meaningful bytes.
    pub fn as_buffer(&self) -> Buffer<'_> {
        Buffer {
            data: &self.storage[..self.len],
            origin: 0,
            base: 0,
        }
    }

    /// The meaningful bytes followed by the margin.
    pub fn padded(&self) -> &[u8] {
        &self.storage
    }

    /// The number of meaningful bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer holds no meaningful bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DecodeError;

    fn sample() -> Vec<u8> {
        (0..=255).collect()
    }

    #[test]
    fn out_of_bounds_is_rejected() {
        let data = sample();
        let buf = Buffer::new(&data).unwrap();

        for (offset, len) in [(0, 257), (256, 1), (255, 2), (u32::MAX, 2), (1, u32::MAX)] {
            assert!(matches!(
                buf.get_sub_view(offset, len),
                Err(DecodeError::Io(IoError::BufferOverflow { .. }))
            ));
            assert!(buf.get(offset, len).is_err());
        }

        assert!(buf.read_u32(253, Endianness::Little).is_err());
        assert!(buf.read_u16(254, Endianness::Big).is_ok());
    }

    #[test]
    fn in_bounds_matches_slice() {
        let data = sample();
        let buf = Buffer::new(&data).unwrap();

        for (offset, len) in [(0, 0), (0, 256), (17, 3), (255, 1), (256, 0)] {
            let view = buf.get_sub_view(offset, len).unwrap();
            assert_eq!(view.data(), &data[offset as usize..(offset + len) as usize]);
        }
    }

    #[test]
    fn narrowing_is_idempotent() {
        let data = sample();
        let buf = Buffer::new(&data).unwrap();

        for (a, b, c, d) in [(10, 100, 5, 20), (0, 256, 0, 256), (200, 56, 56, 0)] {
            let nested = buf.get_sub_view(a, b).unwrap().get_sub_view(c, d).unwrap();
            let direct = buf.get_sub_view(a + c, d).unwrap();

            assert_eq!(nested.data(), direct.data());
            assert_eq!(nested.range(), direct.range());
        }
    }

    #[test]
    fn endianness() {
        let data = [0x12, 0x34, 0x56, 0x78];
        let buf = Buffer::new(&data).unwrap();

        assert_eq!(buf.read_u16(0, Endianness::Little).unwrap(), 0x3412);
        assert_eq!(buf.read_u16(0, Endianness::Big).unwrap(), 0x1234);
        assert_eq!(buf.read_u32(0, Endianness::Big).unwrap(), 0x12345678);
        assert_eq!(buf.read::<u16>(0, 1, Endianness::Big).unwrap(), 0x5678);
        assert!(matches!(
            buf.read_u16(0, Endianness::Unknown),
            Err(DecodeError::Format(FormatError::UnknownByteOrder))
        ));
        assert_eq!(buf.read_u8(3).unwrap(), 0x78);
    }

    #[test]
    fn rebased_offsets() {
        let data = sample();
        let buf = Buffer::new(&data).unwrap();
        let rebased = buf.rebase(100, 5000, 20).unwrap();

        assert_eq!(rebased.read_u8(5000).unwrap(), 100);
        assert_eq!(rebased.read_u8(5019).unwrap(), 119);
        assert!(rebased.read_u8(4999).is_err());
        assert!(rebased.read_u8(5020).is_err());
        assert_eq!(rebased.get_sub_view(5002, 2).unwrap().data(), &[102, 103]);
    }

    #[test]
    fn owned_buffer_margin() {
        let owned = OwnedBuffer::new(vec![1, 2, 3]).unwrap();

        assert_eq!(owned.len(), 3);
        assert_eq!(owned.as_buffer().data(), &[1, 2, 3]);
        assert_eq!(owned.padded().len(), 3 + MARGIN);
        assert!(owned.padded()[3..].iter().all(|b| *b == 0));
    }
}
