//! CIFF heap entries.

use crate::buffer::Endianness;
use crate::cursor::ByteStream;
use crate::error::{FormatError, Result, bail};
use crate::ranges::Range;

/// The data type of a CIFF entry, stored in bits 11 to 13 of the tag word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CiffDataType {
    /// 8-bit unsigned integer.
    Byte,
    /// 8-bit bytes with a terminating NUL.
    Ascii,
    /// 16-bit unsigned integer.
    Short,
    /// 32-bit unsigned integer.
    Long,
    /// A structure of mixed types.
    Mix,
    /// A nested heap.
    Sub1,
    /// A nested heap.
    Sub2,
    /// The one reserved type value.
    Reserved,
}

impl CiffDataType {
    fn from_tag_word(word: u16) -> Self {
        match word & 0x3800 {
            0x0000 => Self::Byte,
            0x0800 => Self::Ascii,
            0x1000 => Self::Short,
            0x1800 => Self::Long,
            0x2000 => Self::Mix,
            0x2800 => Self::Sub1,
            0x3000 => Self::Sub2,
            _ => Self::Reserved,
        }
    }

    /// log2 of the element size in bytes.
    pub fn shift(self) -> u32 {
        match self {
            Self::Byte | Self::Ascii | Self::Reserved => 0,
            Self::Short => 1,
            Self::Long | Self::Mix | Self::Sub1 | Self::Sub2 => 2,
        }
    }

    /// Whether entries of this type contain a nested heap.
    pub fn is_heap(self) -> bool {
        matches!(self, Self::Sub1 | Self::Sub2)
    }
}

/// A single entry of a CIFF heap.
#[derive(Debug, Clone)]
pub struct CiffEntry<'a> {
    tag: u16,
    ty: CiffDataType,
    count: u32,
    data: ByteStream<'a>,
    // Set for entries whose data lives in the value area of the heap.
    value_range: Option<Range>,
}

impl<'a> CiffEntry<'a> {
    /// Parse the 10-byte record at the cursor. `value_data` is the value area of the heap.
    pub(crate) fn parse(bs: &mut ByteStream<'a>, value_data: ByteStream<'a>) -> Result<Self> {
        let word = bs.get_u16()?;
        let tag = word & 0x3fff;
        let ty = CiffDataType::from_tag_word(word);

        let (data, value_range) = match word & 0xc000 {
            0x0000 => {
                let size = bs.get_u32()?;
                let offset = bs.get_u32()?;
                let data = value_data.get_sub_stream(offset, size)?;

                (data, Some(value_data.range_at(offset, size)))
            }
            0x4000 => (bs.get_stream(8)?, None),
            location => bail!(FormatError::UnknownDataLocation(location)),
        };

        Ok(Self {
            tag,
            ty,
            count: data.size() >> ty.shift(),
            data,
            value_range,
        })
    }

    /// The tag, including the type bits.
    pub fn tag(&self) -> u16 {
        self.tag
    }

    /// The data type.
    pub fn ty(&self) -> CiffDataType {
        self.ty
    }

    /// The number of elements.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// The raw data bytes.
    pub fn data(&self) -> &'a [u8] {
        self.data.peek_remaining()
    }

    /// A little-endian stream over the data.
    pub fn get_data(&self) -> ByteStream<'a> {
        self.data
    }

    pub(crate) fn value_range(&self) -> Option<Range> {
        self.value_range
    }

    /// Whether the entry holds integers.
    pub fn is_int(&self) -> bool {
        matches!(
            self.ty,
            CiffDataType::Byte | CiffDataType::Short | CiffDataType::Long
        )
    }

    /// Whether the entry holds a string.
    pub fn is_string(&self) -> bool {
        self.ty == CiffDataType::Ascii
    }

    pub(crate) fn wrong_type(&self) -> FormatError {
        FormatError::WrongEntryType {
            tag: self.tag,
            ty: match self.ty {
                CiffDataType::Byte => 0x0000,
                CiffDataType::Ascii => 0x0800,
                CiffDataType::Short => 0x1000,
                CiffDataType::Long => 0x1800,
                CiffDataType::Mix => 0x2000,
                CiffDataType::Sub1 => 0x2800,
                CiffDataType::Sub2 => 0x3000,
                CiffDataType::Reserved => 0x3800,
            },
        }
    }

    /// Read the `index`-th byte.
    pub fn get_u8(&self, index: u32) -> Result<u8> {
        if self.ty != CiffDataType::Byte {
            bail!(self.wrong_type());
        }

        self.data.buffer().read_u8(index)
    }

    /// Read the `index`-th 16-bit value. Byte entries are read as 16-bit values as well.
    pub fn get_u16(&self, index: u32) -> Result<u16> {
        if !matches!(self.ty, CiffDataType::Short | CiffDataType::Byte) {
            bail!(self.wrong_type());
        }

        self.data.buffer().read(0, index, Endianness::Little)
    }

    /// Read the `index`-th value of an integer entry, widened to 32 bits.
    pub fn get_u32(&self, index: u32) -> Result<u32> {
        match self.ty {
            CiffDataType::Byte => Ok(self.get_u8(index)? as u32),
            CiffDataType::Short => Ok(self.get_u16(index)? as u32),
            CiffDataType::Long => self.data.buffer().read(0, index, Endianness::Little),
            _ => bail!(self.wrong_type()),
        }
    }

    /// The first string of an ASCII entry.
    pub fn get_string(&self) -> Result<String> {
        Ok(self.get_strings()?.into_iter().next().unwrap_or_default())
    }

    /// All NUL-separated strings of an ASCII entry.
    ///
    /// The last byte is treated as a terminator, whatever its value.
    pub fn get_strings(&self) -> Result<Vec<String>> {
        if !self.is_string() {
            bail!(self.wrong_type());
        }

        let mut data = self.data().to_vec();

        if let Some(last) = data.last_mut() {
            *last = 0;
        }

        let mut strings: Vec<String> = data
            .split(|b| *b == 0)
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect();

        // Everything after the final terminator.
        strings.pop();

        Ok(strings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DecodeError;

    fn parse<'a>(record: &'a [u8], values: &'a [u8]) -> Result<CiffEntry<'a>> {
        let mut bs = ByteStream::from_slice(record, Endianness::Little)?;
        let values = ByteStream::from_slice(values, Endianness::Little)?;

        CiffEntry::parse(&mut bs, values)
    }

    #[test]
    fn value_area_entry() {
        let values = [0, 0, 0x34, 0x12, 0x78, 0x56];
        // Short entry 0x1031, four bytes at offset 2.
        let record = [0x31, 0x10, 4, 0, 0, 0, 2, 0, 0, 0];
        let entry = parse(&record, &values).unwrap();

        assert_eq!(entry.tag(), 0x1031);
        assert_eq!(entry.ty(), CiffDataType::Short);
        assert_eq!(entry.count(), 2);
        assert_eq!(entry.get_u16(1).unwrap(), 0x5678);
        assert_eq!(entry.get_u32(0).unwrap(), 0x1234);
        assert!(entry.get_u16(2).is_err());
        assert_eq!(
            entry.get_string().unwrap_err(),
            DecodeError::Format(FormatError::WrongEntryType {
                tag: 0x1031,
                ty: 0x1000
            })
        );
        assert_eq!(entry.value_range(), Some(Range::new(2, 4)));
    }

    #[test]
    fn inline_entry() {
        // Long entry 0x1835 with eight inline bytes.
        let record = [0x35, 0x58, 2, 0, 0, 0, 9, 0, 0, 0];
        let entry = parse(&record, &[]).unwrap();

        assert_eq!(entry.tag(), 0x1835);
        assert_eq!(entry.ty(), CiffDataType::Long);
        assert_eq!(entry.count(), 2);
        assert_eq!(entry.get_u32(0).unwrap(), 2);
        assert_eq!(entry.value_range(), None);
    }

    #[test]
    fn bad_records() {
        let record = [0x0a, 0x88, 0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(
            parse(&record, &[0; 4]).unwrap_err(),
            DecodeError::Format(FormatError::UnknownDataLocation(0x8000))
        );

        let record = [0x0a, 0x08, 8, 0, 0, 0, 0, 0, 0, 0];
        assert!(matches!(parse(&record, &[0; 4]), Err(DecodeError::Io(_))));
    }

    #[test]
    fn strings() {
        let values = b"Canon\0Canon EOS D60\0\0\0";
        let record = [0x0a, 0x08, values.len() as u8, 0, 0, 0, 0, 0, 0, 0];
        let entry = parse(&record, values).unwrap();

        assert_eq!(entry.get_strings().unwrap(), ["Canon", "Canon EOS D60", "", ""]);
        assert_eq!(entry.get_string().unwrap(), "Canon");
        assert_eq!(
            entry.get_u32(0).unwrap_err(),
            DecodeError::Format(FormatError::WrongEntryType {
                tag: 0x080a,
                ty: 0x0800
            })
        );
    }

    #[test]
    fn unterminated_string() {
        let values = b"Canon";
        let record = [0x0a, 0x08, 5, 0, 0, 0, 0, 0, 0, 0];
        let entry = parse(&record, values).unwrap();

        assert_eq!(entry.get_strings().unwrap(), ["Cano"]);
    }
}
