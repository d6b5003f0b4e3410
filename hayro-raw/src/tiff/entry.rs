//! TIFF directory entries.

use std::borrow::Cow;

use crate::buffer::{Buffer, Endianness, Readable};
use crate::cursor::ByteStream;
use crate::error::{FormatError, Result, bail};
use crate::ranges::Range;
use crate::tiff::tags;

/// The data type of a TIFF entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum TiffDataType {
    /// No type.
    NoType = 0,
    /// 8-bit unsigned integer.
    Byte = 1,
    /// 8-bit bytes with a terminating NUL.
    Ascii = 2,
    /// 16-bit unsigned integer.
    Short = 3,
    /// 32-bit unsigned integer.
    Long = 4,
    /// Two 32-bit unsigned integers.
    Rational = 5,
    /// 8-bit signed integer.
    SByte = 6,
    /// 8-bit bytes without interpretation.
    Undefined = 7,
    /// 16-bit signed integer.
    SShort = 8,
    /// 32-bit signed integer.
    SLong = 9,
    /// Two 32-bit signed integers.
    SRational = 10,
    /// 32-bit IEEE float.
    Float = 11,
    /// 64-bit IEEE float.
    Double = 12,
    /// 32-bit offset of an IFD.
    Offset = 13,
}

impl TiffDataType {
    /// Convert a raw type value.
    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            0 => Self::NoType,
            1 => Self::Byte,
            2 => Self::Ascii,
            3 => Self::Short,
            4 => Self::Long,
            5 => Self::Rational,
            6 => Self::SByte,
            7 => Self::Undefined,
            8 => Self::SShort,
            9 => Self::SLong,
            10 => Self::SRational,
            11 => Self::Float,
            12 => Self::Double,
            13 => Self::Offset,
            _ => return None,
        })
    }

    /// log2 of the element size in bytes.
    pub fn shift(self) -> u32 {
        match self {
            Self::NoType | Self::Byte | Self::Ascii | Self::SByte | Self::Undefined => 0,
            Self::Short | Self::SShort => 1,
            Self::Long | Self::SLong | Self::Float | Self::Offset => 2,
            Self::Rational | Self::SRational | Self::Double => 3,
        }
    }
}

/// A single entry of an IFD.
#[derive(Debug, Clone)]
pub struct TiffEntry<'a> {
    tag: u16,
    ty: TiffDataType,
    count: u32,
    data: Cow<'a, [u8]>,
    endianness: Endianness,
    // The enclosing stream, positioned at the start of the data.
    origin: Option<ByteStream<'a>>,
    // Where the data lives in the root allocation, if it is stored out of line.
    out_of_line: Option<Range>,
}

impl<'a> TiffEntry<'a> {
    /// Parse a 12-byte entry record.
    pub(crate) fn parse(bs: &mut ByteStream<'a>) -> Result<Self> {
        let tag = bs.get_u16()?;
        let raw_type = bs.get_u16()?;
        let ty = TiffDataType::from_u16(raw_type).ok_or(FormatError::UnknownEntryType {
            tag,
            ty: raw_type,
        })?;
        let count = bs.get_u32()?;

        if count > u32::MAX >> ty.shift() {
            bail!(FormatError::EntrySizeOverflow { tag });
        }

        let byte_size = count << ty.shift();

        let (data, origin, out_of_line) = if byte_size <= 4 {
            let origin = *bs;
            let data = bs.get_sub_stream(bs.position(), byte_size)?;
            bs.skip_bytes(4)?;

            (data.peek_remaining(), origin, None)
        } else {
            let offset = bs.get_u32()?;
            let data = bs.get_sub_stream(offset, byte_size)?;
            let mut origin = *bs;
            origin.set_position(offset)?;

            (
                data.peek_remaining(),
                origin,
                Some(bs.range_at(offset, byte_size)),
            )
        };

        Ok(Self {
            tag,
            ty,
            count,
            data: Cow::Borrowed(data),
            endianness: bs.endianness(),
            origin: Some(origin),
            out_of_line,
        })
    }

    /// Create an entry that is not backed by file data.
    pub fn synthetic(
        tag: u16,
        ty: TiffDataType,
        count: u32,
        data: Vec<u8>,
        endianness: Endianness,
    ) -> Result<Self> {
        if count > u32::MAX >> ty.shift() {
            bail!(FormatError::EntrySizeOverflow { tag });
        }

        if data.len() as u64 != (count as u64) << ty.shift() {
            bail!(FormatError::Corrupt("entry data does not match its size"));
        }

        Ok(Self {
            tag,
            ty,
            count,
            data: Cow::Owned(data),
            endianness,
            origin: None,
            out_of_line: None,
        })
    }

    /// The tag of the entry.
    pub fn tag(&self) -> u16 {
        self.tag
    }

    /// The data type of the entry.
    pub fn ty(&self) -> TiffDataType {
        self.ty
    }

    /// The number of values.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// The raw data bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The byte order of the data.
    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    /// A stream over the data of the entry.
    pub fn get_data(&self) -> Result<ByteStream<'_>> {
        ByteStream::from_slice(&self.data, self.endianness)
    }

    /// The enclosing stream, positioned at the start of the data.
    ///
    /// Offset-like tags (sub-IFDs, maker notes) use this, because offsets inside them are
    /// relative to the enclosing stream rather than to the entry.
    pub(crate) fn origin(&self) -> Option<ByteStream<'a>> {
        self.origin
    }

    pub(crate) fn out_of_line_range(&self) -> Option<Range> {
        self.out_of_line
    }

    /// Whether the entry points to sub-IFDs or a maker note.
    pub(crate) fn is_offset_like(&self) -> bool {
        self.ty == TiffDataType::Offset || tags::OFFSET_TAGS.contains(&self.tag)
    }

    /// Whether the entry holds integers.
    pub fn is_int(&self) -> bool {
        matches!(
            self.ty,
            TiffDataType::Long | TiffDataType::Short | TiffDataType::Byte
        )
    }

    /// Whether the entry holds a string.
    pub fn is_string(&self) -> bool {
        self.ty == TiffDataType::Ascii
    }

    /// Whether the entry can be read with [`TiffEntry::get_float`].
    pub fn is_float(&self) -> bool {
        matches!(
            self.ty,
            TiffDataType::Float
                | TiffDataType::Double
                | TiffDataType::Rational
                | TiffDataType::SRational
                | TiffDataType::Long
                | TiffDataType::SLong
                | TiffDataType::Short
                | TiffDataType::SShort
        )
    }

    fn wrong_type(&self) -> FormatError {
        FormatError::WrongEntryType {
            tag: self.tag,
            ty: self.ty as u16,
        }
    }

    fn peek<T: Readable>(&self, index: u32) -> Result<T> {
        let buffer = Buffer::new(&self.data)?;

        buffer.read(0, index, self.endianness)
    }

    /// Read the `index`-th byte.
    pub fn get_u8(&self, index: u32) -> Result<u8> {
        if !matches!(self.ty, TiffDataType::Byte | TiffDataType::Undefined) {
            bail!(self.wrong_type());
        }

        self.peek(index)
    }

    /// Read the `index`-th unsigned 16-bit value.
    pub fn get_u16(&self, index: u32) -> Result<u16> {
        if !matches!(self.ty, TiffDataType::Short | TiffDataType::Undefined) {
            bail!(self.wrong_type());
        }

        self.peek(index)
    }

    /// Read the `index`-th signed 16-bit value.
    pub fn get_i16(&self, index: u32) -> Result<i16> {
        if !matches!(self.ty, TiffDataType::SShort | TiffDataType::Undefined) {
            bail!(self.wrong_type());
        }

        self.peek(index)
    }

    /// Read the `index`-th unsigned 32-bit value.
    ///
    /// Shorts and bytes are widened. For rationals this reads the raw numerators and
    /// denominators.
    pub fn get_u32(&self, index: u32) -> Result<u32> {
        match self.ty {
            TiffDataType::Short => self.get_u16(index).map(u32::from),
            TiffDataType::Byte => self.peek::<u8>(index).map(u32::from),
            TiffDataType::Long
            | TiffDataType::Offset
            | TiffDataType::Undefined
            | TiffDataType::Rational
            | TiffDataType::SRational => self.peek(index),
            _ => Err(self.wrong_type().into()),
        }
    }

    /// Read the `index`-th signed 32-bit value.
    pub fn get_i32(&self, index: u32) -> Result<i32> {
        match self.ty {
            TiffDataType::SShort => self.get_i16(index).map(i32::from),
            TiffDataType::SLong | TiffDataType::Undefined => self.peek(index),
            _ => Err(self.wrong_type().into()),
        }
    }

    /// Read the `index`-th value as a float, converting integers and rationals.
    pub fn get_float(&self, index: u32) -> Result<f32> {
        match self.ty {
            TiffDataType::Double => self.peek::<f64>(index).map(|v| v as f32),
            TiffDataType::Float => self.peek(index),
            TiffDataType::Long | TiffDataType::Short => self.get_u32(index).map(|v| v as f32),
            TiffDataType::SLong | TiffDataType::SShort => self.get_i32(index).map(|v| v as f32),
            TiffDataType::Rational => {
                let a = self.get_u32(index * 2)?;
                let b = self.get_u32(index * 2 + 1)?;

                Ok(if b != 0 { a as f32 / b as f32 } else { 0.0 })
            }
            TiffDataType::SRational => {
                let a = self.get_u32(index * 2)? as i32;
                let b = self.get_u32(index * 2 + 1)? as i32;

                Ok(if b != 0 { a as f32 / b as f32 } else { 0.0 })
            }
            _ => Err(self.wrong_type().into()),
        }
    }

    /// Read the entry as a string, up to the first NUL or `count` bytes.
    pub fn get_string(&self) -> Result<String> {
        if !matches!(self.ty, TiffDataType::Ascii | TiffDataType::Byte) {
            bail!(self.wrong_type());
        }

        let bytes = &self.data[..(self.count as usize).min(self.data.len())];
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());

        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }

    /// Read `count` unsigned 16-bit values.
    pub fn get_u16_array(&self, count: u32) -> Result<Vec<u16>> {
        (0..count).map(|i| self.get_u16(i)).collect()
    }

    /// Read `count` unsigned 32-bit values.
    pub fn get_u32_array(&self, count: u32) -> Result<Vec<u32>> {
        (0..count).map(|i| self.get_u32(i)).collect()
    }

    /// Read `count` float values.
    pub fn get_float_array(&self, count: u32) -> Result<Vec<f32>> {
        (0..count).map(|i| self.get_float(i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DecodeError;

    fn entry(bytes: &[u8]) -> Result<TiffEntry<'_>> {
        let mut bs = ByteStream::from_slice(bytes, Endianness::Little)?;
        bs.skip_bytes(8)?;

        TiffEntry::parse(&mut bs)
    }

    #[test]
    fn inline_shorts() {
        let mut data = vec![0; 8];
        data.extend_from_slice(&[0x00, 0x01, 3, 0, 2, 0, 0, 0, 0x34, 0x12, 0x78, 0x56]);
        let e = entry(&data).unwrap();

        assert_eq!(e.tag(), tags::IMAGEWIDTH);
        assert_eq!(e.ty(), TiffDataType::Short);
        assert_eq!(e.get_u16(1).unwrap(), 0x5678);
        assert_eq!(e.get_u32(0).unwrap(), 0x1234);
        assert_eq!(e.get_float(0).unwrap(), 0x1234 as f32);
        assert!(e.get_u16(2).is_err());
        assert!(e.out_of_line_range().is_none());
        assert!(matches!(
            e.get_i32(0),
            Err(DecodeError::Format(FormatError::WrongEntryType { .. }))
        ));
    }

    #[test]
    fn out_of_line_rational() {
        let mut data = vec![0; 8];
        data.extend_from_slice(&[0x28, 0xc6, 5, 0, 2, 0, 0, 0, 20, 0, 0, 0]);
        for v in [3_u32, 2, 7, 0] {
            data.extend_from_slice(&v.to_le_bytes());
        }
        let e = entry(&data).unwrap();

        assert_eq!(e.get_float(0).unwrap(), 1.5);
        assert_eq!(e.get_float(1).unwrap(), 0.0);
        assert_eq!(e.out_of_line_range(), Some(Range::new(20, 16)));
    }

    #[test]
    fn rejects_bad_records() {
        let mut data = vec![0; 8];
        data.extend_from_slice(&[0, 1, 14, 0, 1, 0, 0, 0, 0, 0, 0, 0]);
        assert!(matches!(
            entry(&data),
            Err(DecodeError::Format(FormatError::UnknownEntryType { ty: 14, .. }))
        ));

        let mut data = vec![0; 8];
        data.extend_from_slice(&[0, 1, 12, 0, 0xff, 0xff, 0xff, 0x3f, 0, 0, 0, 0]);
        assert!(matches!(
            entry(&data),
            Err(DecodeError::Format(FormatError::EntrySizeOverflow { .. }))
        ));

        let mut data = vec![0; 8];
        data.extend_from_slice(&[0, 1, 4, 0, 4, 0, 0, 0, 0xf0, 0, 0, 0]);
        assert!(matches!(entry(&data), Err(DecodeError::Io(_))));
    }

    #[test]
    fn strings() {
        let e = TiffEntry::synthetic(
            tags::MAKE,
            TiffDataType::Ascii,
            8,
            b"Canon\0xy".to_vec(),
            Endianness::Little,
        )
        .unwrap();
        assert_eq!(e.get_string().unwrap(), "Canon");

        let e = TiffEntry::synthetic(
            tags::MODEL,
            TiffDataType::Ascii,
            3,
            b"EOS".to_vec(),
            Endianness::Little,
        )
        .unwrap();
        assert_eq!(e.get_string().unwrap(), "EOS");
        assert!(
            TiffEntry::synthetic(tags::MODEL, TiffDataType::Short, 3, vec![0; 4], Endianness::Big)
                .is_err()
        );
    }
}
