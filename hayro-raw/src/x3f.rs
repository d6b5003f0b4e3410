//! Sigma X3F containers.
//!
//! The file starts with an `FOVb` header. The last four bytes of the file point to a
//! `SECd` directory that lists the sections of the file: image sections (`SECi`), property
//! lists (`SECp`) and camera calibration data (`CAMF`). All values are little endian.

use std::collections::BTreeMap;

use crate::buffer::{Buffer, Endianness};
use crate::cursor::ByteStream;
use crate::error::{FormatError, IoError, Result, UnsupportedError, bail};
use crate::log::{ldebug, ltrace};
use crate::util::{fourcc, fourcc_to_string};

const FILE_MAGIC: &[u8; 4] = b"FOVb";
const DIRECTORY_MAGIC: &[u8; 4] = b"SECd";
const IMAGE_MAGIC: &[u8; 4] = b"SECi";
const PROPERTY_MAGIC: &[u8; 4] = b"SECp";

const IMAGE_HEADER_LEN: u32 = 28;
const DIRECTORY_ENTRY_LEN: u32 = 12;

/// Image sections of this type hold raw sensor data.
pub const IMAGE_TYPE_RAW: u32 = 1;
/// Image sections of this type hold an embedded preview.
pub const IMAGE_TYPE_PREVIEW: u32 = 2;
/// Image sections of this type hold raw sensor data of newer cameras.
pub const IMAGE_TYPE_RAW_HUFFMAN: u32 = 3;

/// The preview format that embeds a JPEG with an EXIF block.
pub const FORMAT_JPEG: u32 = 0x12;

/// An entry of the section directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct X3fDirectoryEntry {
    /// The file offset of the section.
    pub offset: u32,
    /// The length of the section in bytes.
    pub length: u32,
    /// The section type, for example `IMA2` or `PROP`.
    pub ty: u32,
}

/// An image section.
#[derive(Debug, Clone, Copy)]
pub struct X3fImage<'a> {
    /// The image type.
    pub ty: u32,
    /// The data format.
    pub format: u32,
    /// The width in pixels.
    pub width: u32,
    /// The height in pixels.
    pub height: u32,
    /// The row size in bytes, 0 for variable-length rows.
    pub row_size: u32,
    /// The payload after the section header.
    pub data: ByteStream<'a>,
}

impl X3fImage<'_> {
    /// Whether the section holds raw sensor data.
    pub fn is_raw(&self) -> bool {
        matches!(self.ty, IMAGE_TYPE_RAW | IMAGE_TYPE_RAW_HUFFMAN)
    }
}

/// A parsed X3F file.
#[derive(Debug, Clone)]
pub struct X3fFile<'a> {
    /// The file format version.
    pub version: u32,
    /// The section directory.
    pub directory: Vec<X3fDirectoryEntry>,
    /// The image sections, in directory order.
    pub images: Vec<X3fImage<'a>>,
    /// The properties of all property sections.
    pub properties: BTreeMap<String, String>,
}

impl<'a> X3fFile<'a> {
    /// Check whether the data looks like an X3F file.
    pub fn is_x3f(data: &[u8]) -> bool {
        data.starts_with(FILE_MAGIC)
    }

    /// Parse the directory and all image and property sections.
    pub fn parse(buffer: Buffer<'a>) -> Result<Self> {
        let mut bs = ByteStream::new(buffer, Endianness::Little);

        if !bs.skip_prefix(FILE_MAGIC) {
            bail!(FormatError::InvalidSignature("X3F"));
        }

        let version = bs.get_u32()?;

        let pointer = bs
            .size()
            .checked_sub(4)
            .ok_or(FormatError::Corrupt("X3F file is too small"))?;
        bs.set_position(pointer)?;
        let directory_offset = bs.get_u32()?;

        let mut dir = bs.get_sub_stream_from(directory_offset)?;

        if !dir.skip_prefix(DIRECTORY_MAGIC) {
            bail!(FormatError::InvalidSignature("X3F directory"));
        }

        let _directory_version = dir.get_u32()?;
        let count = dir.get_u32()?;
        dir.check_elements(count, DIRECTORY_ENTRY_LEN)?;

        let directory = (0..count)
            .map(|_| {
                Ok(X3fDirectoryEntry {
                    offset: dir.get_u32()?,
                    length: dir.get_u32()?,
                    ty: dir.get_u32()?.swap_bytes(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        ldebug!("x3f version 0x{:08x} with {} sections", version, count);

        let mut images = Vec::new();
        let mut properties = BTreeMap::new();

        for entry in &directory {
            let section = bs.get_sub_stream(entry.offset, entry.length)?;

            match entry.ty {
                t if t == fourcc(b"IMA2") || t == fourcc(b"IMAG") => {
                    images.push(parse_image(section)?);
                }
                t if t == fourcc(b"PROP") => parse_properties(section, &mut properties)?,
                t => ltrace!("ignoring x3f section '{}'", fourcc_to_string(t)),
            }
        }

        Ok(Self {
            version,
            directory,
            images,
            properties,
        })
    }

    /// The value of a property.
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    /// The first image section with raw sensor data.
    pub fn raw_image(&self) -> Option<&X3fImage<'a>> {
        self.images.iter().find(|i| i.is_raw())
    }
}

fn parse_image(mut bs: ByteStream<'_>) -> Result<X3fImage<'_>> {
    if !bs.skip_prefix(IMAGE_MAGIC) {
        bail!(FormatError::InvalidSignature("X3F image section"));
    }

    let _version = bs.get_u32()?;
    let ty = bs.get_u32()?;
    let format = bs.get_u32()?;
    let width = bs.get_u32()?;
    let height = bs.get_u32()?;
    let row_size = bs.get_u32()?;

    debug_assert_eq!(bs.position(), IMAGE_HEADER_LEN);

    ltrace!("x3f image type {}, format {}, {}x{}", ty, format, width, height);

    Ok(X3fImage {
        ty,
        format,
        width,
        height,
        row_size,
        data: bs.get_stream(bs.remain_size())?,
    })
}

fn parse_properties(mut bs: ByteStream<'_>, out: &mut BTreeMap<String, String>) -> Result<()> {
    if !bs.skip_prefix(PROPERTY_MAGIC) {
        bail!(FormatError::InvalidSignature("X3F property section"));
    }

    let _version = bs.get_u32()?;
    let count = bs.get_u32()?;

    if bs.get_u32()? != 0 {
        bail!(UnsupportedError::Feature("X3F property character encoding"));
    }

    // Reserved, then the total length of the character data.
    bs.skip_bytes(8)?;

    let mut offsets = bs.get_stream_elements(count, 8)?;
    let chars = bs.get_stream(bs.remain_size())?;

    for _ in 0..count {
        let name = read_utf16(chars, offsets.get_u32()?)?;
        let value = read_utf16(chars, offsets.get_u32()?)?;
        ltrace!("x3f property {} = {}", name, value);

        out.insert(name, value);
    }

    Ok(())
}

/// Read a NUL-terminated UTF-16 string starting at character `index`.
fn read_utf16(chars: ByteStream<'_>, index: u32) -> Result<String> {
    let mut bs = chars;
    bs.set_endianness(Endianness::Little);
    bs.set_position(index.checked_mul(2).ok_or(IoError::SizeOverflow)?)?;

    let mut units = Vec::new();

    loop {
        if bs.remain_size() < 2 {
            bail!(IoError::UnterminatedString);
        }

        match bs.get_u16()? {
            0 => break,
            unit => units.push(unit),
        }
    }

    Ok(String::from_utf16_lossy(&units))
}
