//! Canon-specific boxes of CR3 files.

use std::collections::BTreeMap;

use super::{BoxType, RawBox, SampleEntry, optional_single, read_boxes, single};
use crate::buffer::Endianness;
use crate::cursor::ByteStream;
use crate::error::{FormatError, Result, UnsupportedError, bail};
use crate::image::Rect;
use crate::log::ltrace;
use crate::tiff::TiffTree;

/// The Canon `uuid` box inside `moov`.
#[derive(Debug, Clone)]
pub struct CanonBox<'a> {
    /// The codec version string from `CNCV`.
    pub compressor_version: String,
    /// The payload of `CCTP`.
    pub cctp: ByteStream<'a>,
    /// The payload of `CTBO`.
    pub ctbo: ByteStream<'a>,
    /// The payload of `THMB`, if present.
    pub thumbnail: Option<ByteStream<'a>>,
    cmt: [ByteStream<'a>; 4],
}

impl<'a> CanonBox<'a> {
    pub(super) fn parse(b: &RawBox<'a>) -> Result<Self> {
        let children = b.children()?;

        for child in &children {
            if let BoxType::Other(ty) = child.ty {
                ltrace!("ignoring box 0x{:08x} in Canon box", ty);
            }
        }

        let mut cncv = single(&children, BoxType::Cncv)?.data;

        if cncv.remain_size() != 30 {
            bail!(FormatError::LayoutMismatch {
                expected: cncv.position() + 30,
                found: cncv.size(),
            });
        }

        let compressor_version = String::from_utf8_lossy(cncv.get_bytes(30)?).into_owned();

        let payload = |ty| -> Result<ByteStream<'a>> {
            let data = single(&children, ty)?.data;

            data.peek_stream(data.remain_size())
        };

        Ok(Self {
            compressor_version,
            cctp: payload(BoxType::Cctp)?,
            ctbo: payload(BoxType::Ctbo)?,
            thumbnail: optional_single(&children, BoxType::Thmb)?.map(|b| b.data),
            cmt: [
                payload(BoxType::Cmt1)?,
                payload(BoxType::Cmt2)?,
                payload(BoxType::Cmt3)?,
                payload(BoxType::Cmt4)?,
            ],
        })
    }

    /// Parse the TIFF payload of `CMT1` to `CMT4`.
    ///
    /// `CMT1` holds the main IFD, `CMT2` the EXIF IFD, `CMT3` the maker note and `CMT4` the
    /// GPS IFD.
    pub fn cmt(&self, index: usize) -> Result<TiffTree<'a>> {
        let data = index
            .checked_sub(1)
            .and_then(|i| self.cmt.get(i))
            .ok_or(FormatError::MissingBox(BoxType::Cmt1.fourcc()))?;

        TiffTree::parse(data.buffer())
    }
}

/// The `CMP1` box that describes the CRX encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs, reason = "fields follow the box layout")]
pub struct Cmp1Box {
    pub reserved1: u16,
    pub header_size: u16,
    pub version: i16,
    pub version_sub: i16,
    pub f_width: u32,
    pub f_height: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    pub n_bits: u8,
    pub n_planes: u8,
    pub cfa_layout: u8,
    pub enc_type: u8,
    pub image_levels: u8,
    pub has_tile_cols: u8,
    pub has_tile_rows: u8,
    pub mdat_hdr_size: u32,
    pub reserved2: i32,
    pub reserved3: [u8; 16],
}

impl Cmp1Box {
    /// Parse and validate the box.
    pub fn parse(b: &RawBox<'_>) -> Result<Self> {
        let mut data = b.data;
        data.set_position(8)?;

        let reserved1 = data.get_u16()?;
        let header_size = data.get_u16()?;
        let version = data.get_i16()?;
        let version_sub = data.get_i16()?;

        let mut dimension = || -> Result<u32> {
            u32::try_from(data.get_i32()?)
                .map_err(|_| FormatError::Corrupt("negative CMP1 dimension").into())
        };
        let f_width = dimension()?;
        let f_height = dimension()?;
        let tile_width = dimension()?;
        let tile_height = dimension()?;

        let n_bits = data.get_u8()?;
        let planes = data.get_u8()?;
        let encoding = data.get_u8()?;
        let tiles = data.get_u8()?;
        let mdat_hdr_size = data.get_u32()?;
        let reserved2 = data.get_i32()?;
        let mut reserved3 = [0; 16];
        reserved3.copy_from_slice(data.get_bytes(16)?);

        if data.position() != 60 {
            bail!(FormatError::LayoutMismatch {
                expected: 60,
                found: data.position(),
            });
        }

        // The header size counts everything after itself and the version fields.
        if header_size != 0x30 {
            bail!(FormatError::LayoutMismatch {
                expected: 0x30,
                found: header_size as u32,
            });
        }

        let cmp1 = Self {
            reserved1,
            header_size,
            version,
            version_sub,
            f_width,
            f_height,
            tile_width,
            tile_height,
            n_bits,
            n_planes: planes >> 4,
            cfa_layout: planes & 0xf,
            enc_type: encoding >> 4,
            image_levels: encoding & 0xf,
            has_tile_cols: tiles >> 7,
            has_tile_rows: tiles & 1,
            mdat_hdr_size,
            reserved2,
            reserved3,
        };
        cmp1.validate()?;

        Ok(cmp1)
    }

    fn validate(&self) -> Result<()> {
        let unsupported = UnsupportedError::Feature("CMP1 encoding parameters");

        if self.version != 0x100 && self.version != 0x200 {
            bail!(UnsupportedError::Feature("CMP1 version"));
        }

        if self.mdat_hdr_size == 0 {
            bail!(FormatError::Corrupt("CMP1 describes an empty mdat header"));
        }

        if self.enc_type == 1 {
            if self.n_bits > 15 {
                bail!(unsupported);
            }
        } else if !matches!(self.enc_type, 0 | 3) || self.n_bits > 14 {
            bail!(unsupported);
        }

        if self.n_planes == 1 {
            if self.cfa_layout != 0 || self.enc_type != 0 || self.n_bits != 8 {
                bail!(unsupported);
            }
        } else if self.n_planes != 4
            || self.f_width % 2 != 0
            || self.f_height % 2 != 0
            || self.tile_width % 2 != 0
            || self.tile_height % 2 != 0
            || self.cfa_layout > 3
            || self.n_bits == 8
        {
            bail!(unsupported);
        }

        if self.tile_width > self.f_width || self.tile_height > self.f_height {
            bail!(unsupported);
        }

        if self.image_levels > 3 || self.has_tile_cols > 1 || self.has_tile_rows > 1 {
            bail!(unsupported);
        }

        Ok(())
    }
}

/// The `IAD1` box with the sensor layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Iad1Box {
    /// The sensor width.
    pub sensor_width: u16,
    /// The sensor height.
    pub sensor_height: u16,
    crop: [u16; 4],
    left_optical_black: [u16; 4],
    top_optical_black: [u16; 4],
    active_area: [u16; 4],
}

impl Iad1Box {
    fn parse(b: &RawBox<'_>) -> Result<Self> {
        let mut b = *b;
        b.full_box_flags()?;
        let data = &mut b.data;

        let sensor_width = data.get_u16()?;
        let sensor_height = data.get_u16()?;
        let _reserved1 = data.get_u16()?;
        let ind = data.get_u16()?;
        let _reserved2 = data.get_u16()?;
        let _reserved3 = data.get_u16()?;

        // Small images use a different layout.
        if ind != 2 {
            bail!(UnsupportedError::Feature("IAD1 box for small images"));
        }

        let mut ltrb = || -> Result<[u16; 4]> {
            Ok([data.get_u16()?, data.get_u16()?, data.get_u16()?, data.get_u16()?])
        };

        let iad1 = Self {
            sensor_width,
            sensor_height,
            crop: ltrb()?,
            left_optical_black: ltrb()?,
            top_optical_black: ltrb()?,
            active_area: ltrb()?,
        };

        if sensor_width == 0 || sensor_height == 0 {
            bail!(FormatError::Corrupt("IAD1 sensor size is unknown"));
        }

        if !iad1.crop_rect().is_inside(&iad1.sensor_rect()) {
            bail!(FormatError::Corrupt("IAD1 crop is outside of the sensor"));
        }

        Ok(iad1)
    }

    fn rect([left, top, right, bottom]: [u16; 4]) -> Rect {
        let (left, top) = (left as i32, top as i32);

        Rect::new(left, top, right as i32 + 1 - left, bottom as i32 + 1 - top)
    }

    /// The whole sensor.
    pub fn sensor_rect(&self) -> Rect {
        Rect::new(0, 0, self.sensor_width as i32, self.sensor_height as i32)
    }

    /// The recommended crop.
    pub fn crop_rect(&self) -> Rect {
        Self::rect(self.crop)
    }

    /// The masked area on the left.
    pub fn left_optical_black_rect(&self) -> Rect {
        Self::rect(self.left_optical_black)
    }

    /// The masked area on the top.
    pub fn top_optical_black_rect(&self) -> Rect {
        Self::rect(self.top_optical_black)
    }

    /// The active area.
    pub fn active_area(&self) -> Rect {
        Self::rect(self.active_area)
    }
}

/// The `CRAW` sample entry of the raw track.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs, reason = "fields follow the box layout")]
pub struct CrawBox {
    pub width: u16,
    pub height: u16,
    pub x_resolution: u32,
    pub y_resolution: u32,
    pub bit_depth: u16,
    pub flags: u16,
    pub format_ind: u16,
    pub cmp1: Cmp1Box,
    pub iad1: Iad1Box,
}

impl CrawBox {
    /// Parse the sample entry of a raw track.
    pub fn parse(entry: &SampleEntry<'_>) -> Result<Self> {
        if entry.ty != BoxType::Craw {
            bail!(FormatError::UnexpectedBox {
                expected: BoxType::Craw.fourcc(),
                found: entry.ty.fourcc(),
            });
        }

        let mut data = entry.data;
        data.set_position(8)?;

        data.skip_bytes(6)?;
        let _data_reference_index = data.get_u16()?;
        data.skip_bytes(16)?;
        let width = data.get_u16()?;
        let height = data.get_u16()?;
        let x_resolution = (data.get_u16()? as u32) << 16 | data.get_u16()? as u32;
        let y_resolution = (data.get_u16()? as u32) << 16 | data.get_u16()? as u32;
        let _reserved3 = data.get_u32()?;
        let _reserved4 = data.get_u16()?;
        data.skip_bytes(32)?;
        let bit_depth = data.get_u16()?;
        let _reserved6 = data.get_u16()?;
        let flags = data.get_u16()?;
        let format_ind = data.get_u16()?;

        if data.position() != 90 {
            bail!(FormatError::LayoutMismatch {
                expected: 90,
                found: data.position(),
            });
        }

        // A `free` box usually follows `CDI1`.
        let children = read_boxes(data.peek_stream(data.remain_size())?)?;
        let cmp1 = Cmp1Box::parse(single(&children, BoxType::Cmp1)?)?;

        let mut cdi1 = *single(&children, BoxType::Cdi1)?;
        cdi1.full_box_flags()?;
        let iad1 = Iad1Box::parse(single(&cdi1.children()?, BoxType::Iad1)?)?;

        Ok(Self {
            width,
            height,
            x_resolution,
            y_resolution,
            bit_depth,
            flags,
            format_ind,
            cmp1,
            iad1,
        })
    }
}

/// The `CTMD` sample entry that lists the timed metadata records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtmdBox {
    /// `(type, size)` of each record.
    pub records: Vec<(u32, u32)>,
}

impl CtmdBox {
    /// Parse the sample entry of the metadata track.
    pub fn parse(entry: &SampleEntry<'_>) -> Result<Self> {
        let mut data = entry.data;
        data.set_position(8)?;
        data.skip_bytes(8)?;

        let count = data.get_u32()?;
        data.check_elements(count, 8)?;

        let records = (0..count)
            .map(|_| Ok((data.get_u32()?, data.get_u32()?)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { records })
    }
}

/// The records of a timed metadata chunk, keyed by record type.
#[derive(Debug, Clone)]
pub struct CanonTimedMetadata<'a> {
    /// The payload of each record.
    pub records: BTreeMap<u16, ByteStream<'a>>,
}

impl<'a> CanonTimedMetadata<'a> {
    /// Parse a chunk of the metadata track.
    pub fn parse(chunk: ByteStream<'a>) -> Result<Self> {
        let mut data = chunk;
        data.set_endianness(Endianness::Little);
        let mut records = BTreeMap::new();

        while !data.at_end() {
            let size = data.get_u32()?;
            let ty = data.get_u16()?;
            // Two bytes, then two 16-bit values, all reserved.
            data.skip_bytes(6)?;

            let payload_size = size
                .checked_sub(12)
                .ok_or(FormatError::Corrupt("timed metadata record is too small"))?;
            let payload = data.get_stream(payload_size)?;

            if records.insert(ty, payload).is_some() {
                bail!(FormatError::Corrupt("duplicate timed metadata record"));
            }
        }

        Ok(Self { records })
    }

    /// The embedded TIFF IFD of a record.
    ///
    /// The payload holds 8 bytes of record data followed by a TIFF header whose IFD
    /// pointers are not reliable, so only the IFD right after the header is read.
    pub fn record_ifd(&self, ty: u16) -> Result<TiffTree<'a>> {
        let record = self
            .records
            .get(&ty)
            .ok_or(FormatError::Corrupt("timed metadata record is missing"))?;
        let tiff = record.buffer().get_sub_view_from(8)?;

        TiffTree::parse_single_ifd(tiff, Endianness::Little, 8)
    }
}
